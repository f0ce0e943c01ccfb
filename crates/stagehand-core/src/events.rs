//! Deferred notification queue between backend threads and the control loop
//!
//! Backends never call user code directly. Every notification is pushed
//! through a [`NotificationSink`] into one bounded queue owned by the
//! session; the control thread drains it inside `sleep`/`flush` and invokes
//! the client's handler there. The queue never blocks the sender: a full
//! queue or an oversized notification string latches a fatal error and the
//! event is dropped.

use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::FatalError;
use crate::runtime::SessionShared;
use crate::types::ClientKey;

/// Capacity of the deferred event queue
pub(crate) const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Longest string accepted in a notification field
pub(crate) const MAX_EVENT_STRING: usize = 1024;

/// Which latency values the backend recomputed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyMode {
    Capture,
    Playback,
}

/// How the session manager asked the client to save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventType {
    Save,
    SaveAndQuit,
    SaveTemplate,
}

/// Answer produced by the client for a session event
#[derive(Debug, Clone, Default)]
pub struct SessionReply {
    /// Command line the session manager should use to restart the client
    pub command_line: Option<String>,
    /// The save attempt failed
    pub save_error: bool,
    /// The restarted client needs a terminal
    pub need_terminal: bool,
}

/// One backend notification, delivered later on the control thread
#[derive(Debug, Clone)]
pub enum Notification {
    SampleRate {
        rate: u32,
    },
    Xrun,
    GraphOrder,
    Freewheel {
        starting: bool,
    },
    ClientRegistration {
        name: String,
        registered: bool,
    },
    PortRegistration {
        name: String,
        registered: bool,
    },
    PortRename {
        old: String,
        new: String,
    },
    PortConnect {
        a: String,
        b: String,
        connected: bool,
    },
    Latency {
        mode: LatencyMode,
    },
    Shutdown {
        reason: String,
    },
    Session {
        event_type: SessionEventType,
        session_dir: String,
        reply: Sender<SessionReply>,
    },
}

/// A queued notification addressed to one client
#[derive(Debug, Clone)]
pub(crate) struct DeferredEvent {
    pub(crate) client: ClientKey,
    pub(crate) kind: Notification,
}

/// Emission side of the deferred queue, handed to the backend when a client
/// is opened.
///
/// Sinks are cheap to clone and safe to use from any backend thread. Events
/// for a client that is no longer registered are dropped.
#[derive(Clone)]
pub struct NotificationSink {
    shared: Arc<SessionShared>,
    client: ClientKey,
}

impl NotificationSink {
    pub(crate) fn new(shared: Arc<SessionShared>, client: ClientKey) -> Self {
        Self { shared, client }
    }

    /// Client this sink reports for
    pub fn client(&self) -> ClientKey {
        self.client
    }

    /// The server changed the sample rate. Also refreshes the value the
    /// client reports synchronously.
    pub fn sample_rate(&self, rate: u32) {
        if let Some(client) = self.shared.clients.find(self.client) {
            client.set_sample_rate(rate);
        }
        self.push(Notification::SampleRate { rate });
    }

    pub fn xrun(&self) {
        self.push(Notification::Xrun);
    }

    pub fn graph_order(&self) {
        self.push(Notification::GraphOrder);
    }

    pub fn freewheel(&self, starting: bool) {
        self.push(Notification::Freewheel { starting });
    }

    pub fn client_registration(&self, name: &str, registered: bool) {
        if self.valid() && self.bounded(name) {
            self.push(Notification::ClientRegistration {
                name: name.to_string(),
                registered,
            });
        }
    }

    pub fn port_registration(&self, name: &str, registered: bool) {
        if self.valid() && self.bounded(name) {
            self.push(Notification::PortRegistration {
                name: name.to_string(),
                registered,
            });
        }
    }

    pub fn port_rename(&self, old: &str, new: &str) {
        if self.valid() && self.bounded(old) && self.bounded(new) {
            self.push(Notification::PortRename {
                old: old.to_string(),
                new: new.to_string(),
            });
        }
    }

    pub fn port_connect(&self, a: &str, b: &str, connected: bool) {
        if self.valid() && self.bounded(a) && self.bounded(b) {
            self.push(Notification::PortConnect {
                a: a.to_string(),
                b: b.to_string(),
                connected,
            });
        }
    }

    pub fn latency(&self, mode: LatencyMode) {
        self.push(Notification::Latency { mode });
    }

    /// The backend is going away. Marks the client unreachable so control
    /// operations stop talking to it, then queues the notification; dispatch
    /// turns it into the session's fatal error.
    pub fn shutdown(&self, reason: &str) {
        let Some(client) = self.shared.clients.find(self.client) else {
            return;
        };
        client.mark_backend_down();
        if self.bounded(reason) {
            self.push(Notification::Shutdown {
                reason: reason.to_string(),
            });
        }
    }

    /// Ask the client to save its state. The returned receiver yields the
    /// reply produced during dispatch; it reads as disconnected if the event
    /// could not be queued.
    pub fn session(&self, event_type: SessionEventType, session_dir: &str) -> Receiver<SessionReply> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        if self.valid() && self.bounded(session_dir) {
            self.push(Notification::Session {
                event_type,
                session_dir: session_dir.to_string(),
                reply: reply_tx,
            });
        }
        reply_rx
    }

    fn valid(&self) -> bool {
        self.shared.clients.contains(self.client)
    }

    /// Notification strings are capped; an oversized one poisons the session
    fn bounded(&self, s: &str) -> bool {
        if s.len() > MAX_EVENT_STRING {
            self.shared.fatal.raise(FatalError::EventStringTooLong {
                len: s.len(),
                cap: MAX_EVENT_STRING,
            });
            false
        } else {
            true
        }
    }

    fn push(&self, kind: Notification) {
        if !self.shared.clients.contains(self.client) {
            return;
        }
        let event = DeferredEvent {
            client: self.client,
            kind,
        };
        if self.shared.events_tx.try_send(event).is_err() {
            self.shared.fatal.raise(FatalError::EventQueueFull);
        }
    }
}
