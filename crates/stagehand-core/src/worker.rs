//! Client-owned worker threads
//!
//! A worker is a named thread that belongs to one client. It parks on a
//! condition variable and is poked awake by `signal`, which never blocks:
//! the signaler try-locks the worker's handshake mutex and silently drops
//! the signal when the worker is busy. A worker that is not waiting was
//! going to see fresh state on its own anyway, so delivery is at-most-once
//! by design and callers treat wakes as hints, not messages.
//!
//! The thread itself holds the handshake mutex for its entire life and only
//! releases it inside [`WorkerScope::wait`]. That is what makes the try-lock
//! test meaningful: it succeeds exactly when the worker is parked.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use basedrop::Shared;

use crate::error::{Error, FatalError, ReferenceKind, Result};
use crate::ring::Message;
use crate::runtime::SessionShared;
use crate::types::{ClientKey, RingKey, WorkerKey};

/// Where a worker is in its life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Thread exists but is parked until the creator publishes it
    Configuring,
    /// Creator finished publishing; the thread may proceed
    Ready,
    /// User body is executing
    Running,
    /// Body returned `Ok`
    Done,
    /// Body returned an error; the session fatal latch holds it
    Failed,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerState::Configuring,
            1 => WorkerState::Ready,
            2 => WorkerState::Running,
            3 => WorkerState::Done,
            _ => WorkerState::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Configuring => 0,
            WorkerState::Ready => 1,
            WorkerState::Running => 2,
            WorkerState::Done => 3,
            WorkerState::Failed => 4,
        }
    }
}

/// Why [`WorkerScope::wait`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Someone signaled this worker. Spurious wakes also land here, so
    /// treat it as "look around", not as a guaranteed event.
    Signal,
    /// The session is closing this worker; return from the body soon.
    Shutdown,
}

/// One worker thread as seen by every other thread
pub(crate) struct WorkerShared {
    client: ClientKey,
    name: String,
    state: AtomicU8,
    shutdown: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl WorkerShared {
    pub(crate) fn new(client: ClientKey, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
            state: AtomicU8::new(WorkerState::Configuring.as_u8()),
            shutdown: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn client(&self) -> ClientKey {
        self.client
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Publish the worker: the parked thread proceeds into the user body
    pub(crate) fn set_ready(&self) {
        self.set_state(WorkerState::Ready);
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }

    /// Poke the worker if it is parked. Never blocks: a busy worker keeps
    /// the handshake mutex, the try-lock fails and the signal is dropped.
    pub(crate) fn signal(&self) {
        if self.state() != WorkerState::Running {
            return;
        }
        match self.lock.try_lock() {
            Ok(_guard) => self.cond.notify_one(),
            Err(_) => log::debug!("worker '{}' is busy, signal dropped", self.name),
        }
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Ask the worker to return. Waits for the handshake mutex, so the
    /// notification cannot be lost; the flag is visible to `wait` even
    /// before the worker first parks.
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }
}

/// Execution context handed to a worker body.
///
/// The scope is the worker's identity: signaling and ring access go through
/// it, which is what lets `signal` reject self-signaling and foreign targets
/// without consulting thread-locals.
pub struct WorkerScope<'a> {
    session: Arc<SessionShared>,
    key: WorkerKey,
    worker: &'a WorkerShared,
    guard: Option<MutexGuard<'a, ()>>,
}

impl WorkerScope<'_> {
    /// Key of this worker
    pub fn worker(&self) -> WorkerKey {
        self.key
    }

    /// Client this worker belongs to
    pub fn client(&self) -> ClientKey {
        self.worker.client()
    }

    /// Park until signaled or asked to shut down.
    ///
    /// Releases the handshake mutex while parked; that window is the only
    /// time a signal can land. Spurious wakes surface as [`Wake::Signal`].
    pub fn wait(&mut self) -> Wake {
        if self.worker.shutdown_requested() {
            return Wake::Shutdown;
        }
        let guard = self
            .guard
            .take()
            .expect("worker scope holds its guard between waits");
        let guard = self
            .worker
            .cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner);
        self.guard = Some(guard);
        if self.worker.shutdown_requested() {
            Wake::Shutdown
        } else {
            Wake::Signal
        }
    }

    /// True once the session has asked this worker to return
    pub fn shutdown_requested(&self) -> bool {
        self.worker.shutdown_requested()
    }

    /// Request termination of the whole session.
    ///
    /// Latches [`FatalError::Terminated`]; the control thread sees it at its
    /// next `sleep`/`flush`. The worker still returns normally.
    pub fn terminate(&self, reason: impl Into<String>) {
        self.session
            .fatal
            .raise(FatalError::Terminated(reason.into()));
    }

    /// Signal a sibling worker of the same client
    pub fn signal(&self, worker: WorkerKey) -> Result<()> {
        if worker == self.key {
            return Err(Error::SelfSignal);
        }
        self.session.signal_worker(self.client(), worker)
    }

    /// Queue one tagged message on a ring buffer of this client
    pub fn ring_send(&self, ring: RingKey, tag: i32, data: &[u8]) -> Result<bool> {
        self.session.client_ring(self.client(), ring)?.send(tag, data)
    }

    /// Dequeue the next message from a ring buffer of this client
    pub fn ring_receive(&self, ring: RingKey) -> Result<Option<Message>> {
        self.session.client_ring(self.client(), ring)?.receive()
    }

    /// Bytes that currently fit into the ring
    pub fn ring_write_space(&self, ring: RingKey) -> Result<usize> {
        self.session.client_ring(self.client(), ring)?.write_space()
    }

    /// Bytes currently readable from the ring
    pub fn ring_read_space(&self, ring: RingKey) -> Result<usize> {
        self.session.client_ring(self.client(), ring)?.read_space()
    }
}

/// Start the thread for `worker`. It parks immediately and only enters
/// `body` once the creator calls [`WorkerShared::set_ready`].
pub(crate) fn spawn<F>(
    session: Arc<SessionShared>,
    key: WorkerKey,
    worker: Shared<WorkerShared>,
    body: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce(&mut WorkerScope<'_>) -> anyhow::Result<()> + Send + 'static,
{
    let thread_name = format!("worker-{}", worker.name());
    thread::Builder::new().name(thread_name).spawn(move || {
        let mut guard = worker.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while worker.state() == WorkerState::Configuring {
            guard = worker
                .cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        worker.set_state(WorkerState::Running);
        let mut scope = WorkerScope {
            session: session.clone(),
            key,
            worker: &worker,
            guard: Some(guard),
        };
        match body(&mut scope) {
            Ok(()) => {
                worker.set_state(WorkerState::Done);
                log::info!("worker '{}' finished", worker.name());
            }
            Err(error) => {
                worker.set_state(WorkerState::Failed);
                session.fatal.raise(FatalError::WorkerFailed {
                    name: worker.name().to_string(),
                    message: format!("{error:#}"),
                });
            }
        }
    })
}

/// Ownership-checked lookups used by scopes and the control surface
impl SessionShared {
    pub(crate) fn signal_worker(&self, client: ClientKey, worker: WorkerKey) -> Result<()> {
        let target = self
            .workers
            .find(worker)
            .ok_or(Error::InvalidReference(ReferenceKind::Worker))?;
        if target.client() != client {
            return Err(Error::NotOwner(ReferenceKind::Worker));
        }
        target.signal();
        Ok(())
    }

    pub(crate) fn client_ring(
        &self,
        client: ClientKey,
        ring: RingKey,
    ) -> Result<Shared<crate::ring::RingShared>> {
        let target = self
            .rings
            .find(ring)
            .ok_or(Error::InvalidReference(ReferenceKind::Ring))?;
        if target.client() != client {
            return Err(Error::NotOwner(ReferenceKind::Ring));
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientShared;
    use basedrop::Collector;
    use crossbeam::channel;
    use std::time::{Duration, Instant};

    fn harness() -> (Collector, Arc<SessionShared>, ClientKey) {
        let collector = Collector::new();
        let handle = collector.handle();
        let (shared, _channels) = SessionShared::new(&handle);
        let shared = Arc::new(shared);
        let (client, _) = shared.clients.insert(&handle, ClientShared::new("alpha"));
        (collector, shared, client)
    }

    #[test]
    fn workers_park_until_ready_and_run_to_done() {
        let (collector, shared, client) = harness();
        let (key, worker) = shared
            .workers
            .insert(&collector.handle(), WorkerShared::new(client, "pump"));

        let (tx, rx) = channel::bounded(1);
        let join = spawn(shared.clone(), key, worker.clone(), move |scope| {
            tx.send(scope.wait()).unwrap();
            Ok(())
        })
        .unwrap();

        // Still parked: the creator has not published it
        assert_eq!(worker.state(), WorkerState::Configuring);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        worker.set_ready();
        // Delivery is at-most-once, so keep poking until the wait window
        // catches one
        let deadline = Instant::now() + Duration::from_secs(5);
        let wake = loop {
            worker.signal();
            if let Ok(wake) = rx.recv_timeout(Duration::from_millis(5)) {
                break wake;
            }
            assert!(Instant::now() < deadline, "signal never landed");
        };
        assert_eq!(wake, Wake::Signal);

        join.join().unwrap();
        assert_eq!(worker.state(), WorkerState::Done);
        assert!(!shared.fatal.is_raised());
    }

    #[test]
    fn signal_returns_promptly_while_the_mutex_is_held() {
        let worker = WorkerShared::new(ClientKey(1), "busy");
        worker.set_state(WorkerState::Running);

        let guard = worker.lock.lock().unwrap();
        let begun = Instant::now();
        worker.signal();
        assert!(begun.elapsed() < Duration::from_millis(100));
        drop(guard);

        // Not running means not signalable at all
        worker.set_state(WorkerState::Done);
        worker.signal();
    }

    #[test]
    fn shutdown_wakes_a_waiting_worker() {
        let (collector, shared, client) = harness();
        let (key, worker) = shared
            .workers
            .insert(&collector.handle(), WorkerShared::new(client, "drain"));

        let join = spawn(shared.clone(), key, worker.clone(), |scope| {
            loop {
                match scope.wait() {
                    Wake::Shutdown => return Ok(()),
                    Wake::Signal => continue,
                }
            }
        })
        .unwrap();

        worker.set_ready();
        worker.request_shutdown();
        join.join().unwrap();
        assert_eq!(worker.state(), WorkerState::Done);
    }

    #[test]
    fn failing_bodies_latch_the_session_fatal() {
        let (collector, shared, client) = harness();
        let (key, worker) = shared
            .workers
            .insert(&collector.handle(), WorkerShared::new(client, "flaky"));

        let join = spawn(shared.clone(), key, worker.clone(), |_scope| {
            Err(anyhow::anyhow!("disk full"))
        })
        .unwrap();

        worker.set_ready();
        join.join().unwrap();
        assert_eq!(worker.state(), WorkerState::Failed);
        match shared.fatal.get() {
            Some(FatalError::WorkerFailed { name, message }) => {
                assert_eq!(name, "flaky");
                assert!(message.contains("disk full"));
            }
            other => panic!("unexpected latch state: {other:?}"),
        }
    }

    #[test]
    fn terminate_latches_without_failing_the_worker() {
        let (collector, shared, client) = harness();
        let (key, worker) = shared
            .workers
            .insert(&collector.handle(), WorkerShared::new(client, "quitter"));

        let join = spawn(shared.clone(), key, worker.clone(), |scope| {
            scope.terminate("job finished early");
            Ok(())
        })
        .unwrap();

        worker.set_ready();
        join.join().unwrap();
        assert_eq!(worker.state(), WorkerState::Done);
        assert_eq!(
            shared.fatal.get(),
            Some(FatalError::Terminated(String::from("job finished early")))
        );
    }

    #[test]
    fn scope_signal_rejects_self_and_foreign_targets() {
        let (collector, shared, client) = harness();
        let handle = collector.handle();
        let (other_client, _) = shared.clients.insert(&handle, ClientShared::new("beta"));
        let (foreign, _) = shared
            .workers
            .insert(&handle, WorkerShared::new(other_client, "theirs"));
        let (key, worker) = shared
            .workers
            .insert(&handle, WorkerShared::new(client, "mine"));

        let join = spawn(shared.clone(), key, worker.clone(), move |scope| {
            assert!(matches!(scope.signal(scope.worker()), Err(Error::SelfSignal)));
            assert!(matches!(
                scope.signal(foreign),
                Err(Error::NotOwner(ReferenceKind::Worker))
            ));
            assert!(matches!(
                scope.signal(WorkerKey(999)),
                Err(Error::InvalidReference(ReferenceKind::Worker))
            ));
            Ok(())
        })
        .unwrap();

        worker.set_ready();
        join.join().unwrap();
        assert_eq!(worker.state(), WorkerState::Done);
    }

    #[test]
    fn scopes_reach_only_rings_of_their_client() {
        let (collector, shared, client) = harness();
        let handle = collector.handle();
        let (other_client, _) = shared.clients.insert(&handle, ClientShared::new("beta"));

        let (mine, _rx) = crate::ring::RingShared::new(client, 64);
        let (ring, _) = shared.rings.insert(&handle, mine);
        let (theirs, _rx) = crate::ring::RingShared::new(other_client, 64);
        let (foreign_ring, _) = shared.rings.insert(&handle, theirs);

        let (key, worker) = shared
            .workers
            .insert(&handle, WorkerShared::new(client, "courier"));
        let join = spawn(shared.clone(), key, worker.clone(), move |scope| {
            assert!(scope.ring_send(ring, 7, b"abc")?);
            let msg = scope.ring_receive(ring)?.unwrap();
            assert_eq!(msg.tag, 7);
            assert_eq!(msg.data, b"abc");
            assert!(matches!(
                scope.ring_send(foreign_ring, 1, b""),
                Err(Error::NotOwner(ReferenceKind::Ring))
            ));
            Ok(())
        })
        .unwrap();

        worker.set_ready();
        join.join().unwrap();
        assert_eq!(worker.state(), WorkerState::Done);
        assert!(!shared.fatal.is_raised());
    }
}
