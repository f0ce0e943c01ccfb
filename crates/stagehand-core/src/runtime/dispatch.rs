//! Control-thread wait loop and deferred notification dispatch
//!
//! Everything here runs on the thread that owns the [`Session`]. `sleep`
//! multiplexes over the fatal latch, the deferred event queue, signaled
//! rings and the interrupt handle; `flush` drains pending notifications
//! without blocking. Handlers are invoked only from these two entry points,
//! never from a backend thread.

use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Select, Sender};

use crate::error::{Error, FatalError, Result};
use crate::events::{DeferredEvent, LatencyMode, Notification, SessionEventType, SessionReply};
use crate::types::{ClientKey, RingKey};

use super::Session;

/// Why [`Session::sleep`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The timeout expired
    TimedOut,
    /// A signaled ring received data
    RingReady(RingKey),
    /// An [`InterruptHandle`] was poked
    Interrupted,
}

/// Wakes a sleeping control thread from anywhere.
///
/// Interrupts coalesce: poking a handle that has already been poked since
/// the last wake is a no-op, and a poke delivered while the control thread
/// is awake is consumed by its next `sleep`.
#[derive(Clone)]
pub struct InterruptHandle {
    tx: Sender<()>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Per-client receiver for deferred backend notifications.
///
/// Every method has an empty default so handlers implement only what they
/// care about. The `&mut Session` argument allows control operations from
/// inside a callback; re-entering the dispatcher (`sleep`, `flush`) fails
/// with [`Error::NestedDispatch`].
#[allow(unused_variables)]
pub trait NotificationHandler {
    fn sample_rate(&mut self, session: &mut Session, client: ClientKey, rate: u32) {}

    fn xrun(&mut self, session: &mut Session, client: ClientKey) {}

    fn graph_order(&mut self, session: &mut Session, client: ClientKey) {}

    fn freewheel(&mut self, session: &mut Session, client: ClientKey, starting: bool) {}

    fn client_registration(
        &mut self,
        session: &mut Session,
        client: ClientKey,
        name: &str,
        registered: bool,
    ) {
    }

    fn port_registration(
        &mut self,
        session: &mut Session,
        client: ClientKey,
        name: &str,
        registered: bool,
    ) {
    }

    fn port_rename(&mut self, session: &mut Session, client: ClientKey, old: &str, new: &str) {}

    fn port_connect(
        &mut self,
        session: &mut Session,
        client: ClientKey,
        a: &str,
        b: &str,
        connected: bool,
    ) {
    }

    fn latency(&mut self, session: &mut Session, client: ClientKey, mode: LatencyMode) {}

    /// The backend is going away. After this callback returns the session
    /// latches [`FatalError::BackendShutdown`].
    fn shutdown(&mut self, session: &mut Session, client: ClientKey, reason: &str) {}

    /// A session manager event; the returned reply is forwarded to the
    /// backend.
    fn session_request(
        &mut self,
        session: &mut Session,
        client: ClientKey,
        event_type: SessionEventType,
        session_dir: &str,
    ) -> SessionReply {
        SessionReply::default()
    }
}

/// What a single pass over the select set produced
enum Wait {
    Fatal,
    Events,
    Ring(RingKey),
    Interrupted,
    TimedOut,
    Spurious,
}

impl Session {
    /// A handle that wakes [`sleep`](Self::sleep) from another thread
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            tx: self.interrupt_tx.clone(),
        }
    }

    /// Block until something needs the control thread.
    ///
    /// Deferred notifications are dispatched as they arrive without ending
    /// the sleep; the call returns for a timeout, a signaled ring or an
    /// interrupt. `None` sleeps until one of those happens. Once a fatal
    /// error is latched this returns it immediately, forever.
    pub fn sleep(&mut self, timeout: Option<Duration>) -> Result<Wakeup> {
        if self.in_dispatch {
            return Err(Error::NestedDispatch);
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            self.check_fatal()?;
            match self.wait_for_work(deadline) {
                Wait::Fatal | Wait::Spurious => {}
                Wait::Events => {
                    self.dispatch_pending();
                    self.collector.collect();
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Ok(Wakeup::TimedOut);
                    }
                }
                Wait::Ring(ring) => return Ok(Wakeup::RingReady(ring)),
                Wait::Interrupted => return Ok(Wakeup::Interrupted),
                Wait::TimedOut => return Ok(Wakeup::TimedOut),
            }
        }
    }

    /// Dispatch every notification queued so far and return how many were
    /// drained. Notifications emitted by the handlers themselves stay
    /// queued for the next pass.
    pub fn flush(&mut self) -> Result<usize> {
        if self.in_dispatch {
            return Err(Error::NestedDispatch);
        }
        self.check_fatal()?;
        let drained = self.dispatch_pending();
        self.collector.collect();
        Ok(drained)
    }

    fn check_fatal(&self) -> Result<()> {
        match self.shared.fatal.get() {
            Some(error) => {
                let _ = self.channels.fatal_rx.try_recv();
                Err(Error::Fatal(error))
            }
            None => Ok(()),
        }
    }

    /// One multiplexed wait over everything that can wake the control
    /// thread. Readiness is observed without consuming, so a tickle that
    /// lost its payload in the meantime comes back as `Spurious`.
    fn wait_for_work(&self, deadline: Option<Instant>) -> Wait {
        let fatal_rx = self.channels.fatal_rx.clone();
        let events_rx = self.channels.events_rx.clone();
        let interrupt_rx = self.interrupt_rx.clone();
        let rings: Vec<(RingKey, Receiver<()>)> = self
            .ring_signals
            .iter()
            .map(|(ring, rx)| (*ring, rx.clone()))
            .collect();

        let mut select = Select::new();
        let fatal_index = select.recv(&fatal_rx);
        let events_index = select.recv(&events_rx);
        let interrupt_index = select.recv(&interrupt_rx);
        let ring_indices: Vec<usize> = rings.iter().map(|(_, rx)| select.recv(rx)).collect();

        let ready = match select.try_ready() {
            Ok(index) => index,
            Err(_) => match deadline {
                Some(deadline) => match select.ready_deadline(deadline) {
                    Ok(index) => index,
                    Err(_) => return Wait::TimedOut,
                },
                None => select.ready(),
            },
        };

        if ready == fatal_index {
            let _ = fatal_rx.try_recv();
            return Wait::Fatal;
        }
        if ready == events_index {
            // Left unconsumed; dispatch_pending drains the queue itself.
            return Wait::Events;
        }
        if ready == interrupt_index {
            return if interrupt_rx.try_recv().is_ok() {
                Wait::Interrupted
            } else {
                Wait::Spurious
            };
        }
        match ring_indices.iter().position(|index| *index == ready) {
            Some(at) => {
                let (ring, rx) = &rings[at];
                if rx.try_recv().is_ok() {
                    Wait::Ring(*ring)
                } else {
                    Wait::Spurious
                }
            }
            None => Wait::Spurious,
        }
    }

    /// Drain the notifications queued at entry. The count is snapshotted
    /// first so handlers that emit new notifications cannot extend the
    /// pass.
    fn dispatch_pending(&mut self) -> usize {
        let events_rx = self.channels.events_rx.clone();
        let pending = events_rx.len();
        let mut drained = 0;
        self.in_dispatch = true;
        for _ in 0..pending {
            let Ok(event) = events_rx.try_recv() else {
                break;
            };
            self.dispatch_one(event);
            drained += 1;
        }
        self.in_dispatch = false;
        drained
    }

    fn dispatch_one(&mut self, event: DeferredEvent) {
        let client = event.client;
        if !self.control.contains_key(&client) {
            log::debug!("dropping notification for closed client: {event:?}");
            return;
        }
        match event.kind {
            Notification::SampleRate { rate } => {
                self.notify(client, |handler, session| {
                    handler.sample_rate(session, client, rate);
                });
            }
            Notification::Xrun => {
                self.notify(client, |handler, session| handler.xrun(session, client));
            }
            Notification::GraphOrder => {
                self.notify(client, |handler, session| {
                    handler.graph_order(session, client);
                });
            }
            Notification::Freewheel { starting } => {
                self.notify(client, |handler, session| {
                    handler.freewheel(session, client, starting);
                });
            }
            Notification::ClientRegistration { name, registered } => {
                self.notify(client, |handler, session| {
                    handler.client_registration(session, client, &name, registered);
                });
            }
            Notification::PortRegistration { name, registered } => {
                self.notify(client, |handler, session| {
                    handler.port_registration(session, client, &name, registered);
                });
            }
            Notification::PortRename { old, new } => {
                self.notify(client, |handler, session| {
                    handler.port_rename(session, client, &old, &new);
                });
            }
            Notification::PortConnect { a, b, connected } => {
                self.notify(client, |handler, session| {
                    handler.port_connect(session, client, &a, &b, connected);
                });
            }
            Notification::Latency { mode } => {
                self.notify(client, |handler, session| {
                    handler.latency(session, client, mode);
                });
            }
            Notification::Shutdown { reason } => {
                self.notify(client, |handler, session| {
                    handler.shutdown(session, client, &reason);
                });
                self.shared
                    .fatal
                    .raise(FatalError::BackendShutdown(reason));
            }
            Notification::Session {
                event_type,
                session_dir,
                reply,
            } => {
                let answer = self.notify_with(client, SessionReply::default(), |handler, session| {
                    handler.session_request(session, client, event_type, &session_dir)
                });
                if reply.send(answer).is_err() {
                    log::debug!("session reply receiver went away for client {client:?}");
                }
            }
        }
    }

    fn notify(&mut self, client: ClientKey, f: impl FnOnce(&mut dyn NotificationHandler, &mut Session)) {
        self.notify_with(client, (), |handler, session| f(handler, session));
    }

    /// Run `f` against the client's handler, if any. The handler is taken
    /// out for the call so it can replace itself through the session; a
    /// replacement installed during the callback wins over the put-back.
    fn notify_with<R>(
        &mut self,
        client: ClientKey,
        default: R,
        f: impl FnOnce(&mut dyn NotificationHandler, &mut Session) -> R,
    ) -> R {
        let Some(control) = self.control.get_mut(&client) else {
            return default;
        };
        let Some(mut handler) = control.handler.take() else {
            return default;
        };
        let result = f(handler.as_mut(), self);
        if let Some(control) = self.control.get_mut(&client) {
            if control.handler.is_none() {
                control.handler = Some(handler);
            }
        }
        result
    }
}
