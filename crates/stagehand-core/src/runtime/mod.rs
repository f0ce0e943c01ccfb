//! Session: the single-threaded control surface
//!
//! A [`Session`] owns the backend connection, every client opened through
//! it, and the registries the other threads read. All control operations
//! happen on the thread that owns the `Session`; the real-time and worker
//! threads only ever see [`SessionShared`], which exposes lock-free
//! registry snapshots, the deferred event queue and the fatal latch.
//!
//! Memory reclamation runs through a [`basedrop`] collector owned by the
//! session. Objects removed from a registry stay alive for whoever still
//! holds them and are freed at the next quiescence point: a dispatch pass,
//! a flush, or a client close.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use basedrop::{Collector, Handle, Shared};
use crossbeam::channel::{self, Receiver, Sender};

use crate::backend::{Backend, BackendClient};
use crate::client::ClientShared;
use crate::config::OpenOptions;
use crate::error::{Error, ReferenceKind, Result};
use crate::events::{DeferredEvent, NotificationSink, EVENT_QUEUE_CAPACITY};
use crate::fatal::FatalLatch;
use crate::port::PortShared;
use crate::registry::Registry;
use crate::ring::{Message, RingShared};
use crate::rt::{ClientDriver, ProcessHandler};
use crate::stats::StatsSnapshot;
use crate::types::{ClientKey, PortKey, PortSpec, RingKey, WorkerKey};
use crate::worker::{self, WorkerScope, WorkerShared, WorkerState};

mod dispatch;

pub use dispatch::{InterruptHandle, NotificationHandler, Wakeup};

/// State reachable from threads other than the control thread
pub(crate) struct SessionShared {
    pub(crate) clients: Registry<ClientKey, ClientShared>,
    pub(crate) ports: Registry<PortKey, PortShared>,
    pub(crate) workers: Registry<WorkerKey, WorkerShared>,
    pub(crate) rings: Registry<RingKey, RingShared>,
    pub(crate) events_tx: Sender<DeferredEvent>,
    pub(crate) fatal: FatalLatch,
}

/// Receiving ends owned by the control thread
pub(crate) struct SessionChannels {
    pub(crate) events_rx: Receiver<DeferredEvent>,
    pub(crate) fatal_rx: Receiver<()>,
}

impl SessionShared {
    pub(crate) fn new(handle: &Handle) -> (Self, SessionChannels) {
        let (events_tx, events_rx) = channel::bounded(EVENT_QUEUE_CAPACITY);
        let (fatal, fatal_rx) = FatalLatch::new();
        let shared = Self {
            clients: Registry::new(handle),
            ports: Registry::new(handle),
            workers: Registry::new(handle),
            rings: Registry::new(handle),
            events_tx,
            fatal,
        };
        let channels = SessionChannels {
            events_rx,
            fatal_rx,
        };
        (shared, channels)
    }
}

/// Control-thread bookkeeping for one open client
struct ClientControl {
    backend: Box<dyn BackendClient>,
    shared: Shared<ClientShared>,
    handler: Option<Box<dyn NotificationHandler>>,
    active: bool,
    ports: Vec<PortKey>,
    rings: Vec<RingKey>,
    workers: Vec<(WorkerKey, JoinHandle<()>)>,
}

fn ensure_backend_up(control: &ClientControl) -> Result<()> {
    if control.shared.is_backend_down() {
        Err(Error::Backend(String::from(
            "client's backend has shut down",
        )))
    } else {
        Ok(())
    }
}

/// The embedding surface: owns clients, serializes control operations and
/// dispatches deferred notifications.
///
/// Every object handed out ([`ClientKey`], [`PortKey`], [`WorkerKey`],
/// [`RingKey`]) stays safe to present after the object is gone; operations
/// re-validate and fail with [`Error::InvalidReference`] instead of
/// touching stale state.
pub struct Session {
    backend: Box<dyn Backend>,
    shared: Arc<SessionShared>,
    channels: SessionChannels,
    collector: Collector,
    handle: Handle,
    control: BTreeMap<ClientKey, ClientControl>,
    ring_signals: BTreeMap<RingKey, Receiver<()>>,
    interrupt_tx: Sender<()>,
    interrupt_rx: Receiver<()>,
    in_dispatch: bool,
}

impl Session {
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        let collector = Collector::new();
        let handle = collector.handle();
        let (shared, channels) = SessionShared::new(&handle);
        let (interrupt_tx, interrupt_rx) = channel::bounded(1);
        Self {
            backend: Box::new(backend),
            shared: Arc::new(shared),
            channels,
            collector,
            handle,
            control: BTreeMap::new(),
            ring_signals: BTreeMap::new(),
            interrupt_tx,
            interrupt_rx,
            in_dispatch: false,
        }
    }

    fn control(&self, client: ClientKey) -> Result<&ClientControl> {
        self.control
            .get(&client)
            .ok_or(Error::InvalidReference(ReferenceKind::Client))
    }

    fn control_mut(&mut self, client: ClientKey) -> Result<&mut ClientControl> {
        self.control
            .get_mut(&client)
            .ok_or(Error::InvalidReference(ReferenceKind::Client))
    }

    fn ring(&self, ring: RingKey) -> Result<Shared<RingShared>> {
        self.shared
            .rings
            .find(ring)
            .ok_or(Error::InvalidReference(ReferenceKind::Ring))
    }

    /// Open a client on the backend. The key stays valid until
    /// [`close_client`](Self::close_client).
    pub fn open_client(&mut self, name: &str, options: &OpenOptions) -> Result<ClientKey> {
        let (key, shared) = self
            .shared
            .clients
            .insert(&self.handle, ClientShared::new(name));
        let sink = NotificationSink::new(self.shared.clone(), key);
        let backend = match self.backend.open_client(name, options, sink) {
            Ok(backend) => backend,
            Err(error) => {
                self.shared.clients.remove(&self.handle, key);
                return Err(error.into());
            }
        };
        shared.set_sample_rate(backend.sample_rate());
        shared.set_buffer_size(backend.buffer_size());
        log::info!(
            "opened client '{}' at {} Hz",
            backend.name(),
            backend.sample_rate()
        );
        self.control.insert(
            key,
            ClientControl {
                backend,
                shared,
                handler: None,
                active: false,
                ports: Vec::new(),
                rings: Vec::new(),
                workers: Vec::new(),
            },
        );
        Ok(key)
    }

    /// Tear one client down: deactivate, shut its workers down and join
    /// them, drop its rings, unregister its ports, close the backend side.
    /// Safe to call in any client state.
    pub fn close_client(&mut self, client: ClientKey) -> Result<()> {
        let mut control = self
            .control
            .remove(&client)
            .ok_or(Error::InvalidReference(ReferenceKind::Client))?;

        if control.active {
            if let Err(error) = control.backend.deactivate() {
                log::warn!("deactivate during close failed: {error}");
            }
            control.active = false;
        }

        // Ask every worker to return before joining any of them
        for (key, _) in &control.workers {
            if let Some(worker) = self.shared.workers.find(*key) {
                worker.request_shutdown();
            }
        }
        for (key, join) in control.workers.drain(..) {
            if join.join().is_err() {
                log::warn!("worker {} panicked during shutdown", key.raw());
            }
            self.shared.workers.remove(&self.handle, key);
        }

        for key in control.rings.drain(..) {
            self.ring_signals.remove(&key);
            self.shared.rings.remove(&self.handle, key);
        }

        for key in control.ports.drain(..) {
            if let Some(port) = self.shared.ports.find(key) {
                if let Err(error) = control.backend.unregister_port(port.backend_id()) {
                    log::warn!("unregister during close failed: {error}");
                }
            }
            self.shared.ports.remove(&self.handle, key);
        }

        if let Err(error) = control.backend.close() {
            log::warn!("backend close failed: {error}");
        }
        control.shared.mark_dead();
        self.shared.clients.remove(&self.handle, client);
        self.collector.collect();
        log::info!("closed client '{}'", control.shared.name());
        Ok(())
    }

    /// Close every remaining client, most recently opened first
    pub fn close_all(&mut self) {
        let clients: Vec<ClientKey> = self.control.keys().rev().copied().collect();
        for client in clients {
            if let Err(error) = self.close_client(client) {
                log::warn!("close failed: {error}");
            }
        }
        while self.channels.events_rx.try_recv().is_ok() {}
        self.collector.collect();
    }

    /// Install the notification handler for `client`, replacing any
    /// previous one. Notifications queued before this call still reach the
    /// new handler when they are dispatched.
    pub fn set_notification_handler(
        &mut self,
        client: ClientKey,
        handler: Box<dyn NotificationHandler>,
    ) -> Result<()> {
        self.control_mut(client)?.handler = Some(handler);
        Ok(())
    }

    /// Start processing: `handler` runs on the backend's cycle thread from
    /// now until [`deactivate`](Self::deactivate) or close.
    pub fn activate(&mut self, client: ClientKey, handler: Box<dyn ProcessHandler>) -> Result<()> {
        let shared = self.shared.clone();
        let control = self.control_mut(client)?;
        ensure_backend_up(control)?;
        if control.active {
            return Err(Error::AlreadyActive);
        }
        let driver = ClientDriver::new(shared, client, control.shared.clone(), handler);
        control.backend.activate(Box::new(driver))?;
        control.active = true;
        log::info!("activated client '{}'", control.shared.name());
        Ok(())
    }

    /// Stop the cycle callback. The handler is dropped by the backend.
    pub fn deactivate(&mut self, client: ClientKey) -> Result<()> {
        let control = self.control_mut(client)?;
        ensure_backend_up(control)?;
        if !control.active {
            return Err(Error::NotActive);
        }
        control.backend.deactivate()?;
        control.active = false;
        log::info!("deactivated client '{}'", control.shared.name());
        Ok(())
    }

    /// Register a port described by `spec` on `client`
    pub fn register_port(&mut self, client: ClientKey, spec: &PortSpec) -> Result<PortKey> {
        let control = self
            .control
            .get_mut(&client)
            .ok_or(Error::InvalidReference(ReferenceKind::Client))?;
        ensure_backend_up(control)?;
        let id = control.backend.register_port(spec)?;
        let (key, _) = self
            .shared
            .ports
            .insert(&self.handle, PortShared::new(client, spec, id));
        control.ports.push(key);
        log::info!(
            "registered {} {} port '{}'",
            spec.direction.name(),
            spec.kind.name(),
            spec.name
        );
        Ok(key)
    }

    /// Unregister a port; its key becomes invalid
    pub fn unregister_port(&mut self, port: PortKey) -> Result<()> {
        let shared = self
            .shared
            .ports
            .find(port)
            .ok_or(Error::InvalidReference(ReferenceKind::Port))?;
        let control = self
            .control
            .get_mut(&shared.client())
            .ok_or(Error::InvalidReference(ReferenceKind::Client))?;
        ensure_backend_up(control)?;
        control.backend.unregister_port(shared.backend_id())?;
        control.ports.retain(|key| *key != port);
        self.shared.ports.remove(&self.handle, port);
        Ok(())
    }

    /// Full `client:port` name of a registered port
    pub fn port_name(&self, port: PortKey) -> Result<String> {
        let shared = self
            .shared
            .ports
            .find(port)
            .ok_or(Error::InvalidReference(ReferenceKind::Port))?;
        let control = self.control(shared.client())?;
        Ok(format!("{}:{}", control.backend.name(), shared.name()))
    }

    /// Connect two ports by full name through `client`'s backend connection
    pub fn connect(&mut self, client: ClientKey, source: &str, destination: &str) -> Result<()> {
        let control = self.control_mut(client)?;
        ensure_backend_up(control)?;
        control.backend.connect(source, destination)?;
        Ok(())
    }

    /// Break a connection made through [`connect`](Self::connect)
    pub fn disconnect(&mut self, client: ClientKey, source: &str, destination: &str) -> Result<()> {
        let control = self.control_mut(client)?;
        ensure_backend_up(control)?;
        control.backend.disconnect(source, destination)?;
        Ok(())
    }

    /// Switch the backend in or out of freewheel mode
    pub fn set_freewheel(&mut self, client: ClientKey, enabled: bool) -> Result<()> {
        let control = self.control_mut(client)?;
        ensure_backend_up(control)?;
        control.backend.set_freewheel(enabled)?;
        Ok(())
    }

    /// Start a named worker thread for `client`. The body runs once; a
    /// returned error is fatal for the whole session.
    pub fn spawn_worker<F>(&mut self, client: ClientKey, name: &str, body: F) -> Result<WorkerKey>
    where
        F: FnOnce(&mut WorkerScope<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        let control = self
            .control
            .get_mut(&client)
            .ok_or(Error::InvalidReference(ReferenceKind::Client))?;
        let (key, worker) = self
            .shared
            .workers
            .insert(&self.handle, WorkerShared::new(client, name));
        match worker::spawn(self.shared.clone(), key, worker.clone(), body) {
            Ok(join) => {
                worker.set_ready();
                control.workers.push((key, join));
                log::info!(
                    "spawned worker '{name}' for client '{}'",
                    control.shared.name()
                );
                Ok(key)
            }
            Err(error) => {
                self.shared.workers.remove(&self.handle, key);
                Err(Error::Spawn(error))
            }
        }
    }

    /// Poke a worker owned by `client`; never blocks, and a busy worker
    /// simply misses the poke
    pub fn signal(&self, client: ClientKey, worker: WorkerKey) -> Result<()> {
        if !self.control.contains_key(&client) {
            return Err(Error::InvalidReference(ReferenceKind::Client));
        }
        self.shared.signal_worker(client, worker)
    }

    /// Where a worker currently is in its life cycle
    pub fn worker_state(&self, worker: WorkerKey) -> Result<WorkerState> {
        Ok(self
            .shared
            .workers
            .find(worker)
            .ok_or(Error::InvalidReference(ReferenceKind::Worker))?
            .state())
    }

    /// Create a ring buffer of `capacity` bytes owned by `client`.
    ///
    /// A `signaled` ring additionally wakes [`sleep`](Self::sleep) whenever
    /// a message lands in it.
    pub fn create_ring(&mut self, client: ClientKey, capacity: usize, signaled: bool) -> Result<RingKey> {
        let control = self
            .control
            .get_mut(&client)
            .ok_or(Error::InvalidReference(ReferenceKind::Client))?;
        let (ring, signal_rx) = RingShared::new(client, capacity);
        let (key, _) = self.shared.rings.insert(&self.handle, ring);
        if signaled {
            self.ring_signals.insert(key, signal_rx);
        }
        control.rings.push(key);
        log::info!(
            "created {capacity} byte ring for client '{}'",
            control.shared.name()
        );
        Ok(key)
    }

    /// Queue one tagged message; `false` means the ring is currently full
    pub fn ring_send(&self, ring: RingKey, tag: i32, data: &[u8]) -> Result<bool> {
        self.ring(ring)?.send(tag, data)
    }

    /// Dequeue the oldest message, or `None` when no complete message is in
    pub fn ring_receive(&self, ring: RingKey) -> Result<Option<Message>> {
        self.ring(ring)?.receive()
    }

    /// Copy the oldest message without consuming it
    pub fn ring_peek(&self, ring: RingKey) -> Result<Option<Message>> {
        self.ring(ring)?.peek_message()
    }

    /// Raw byte write, unframed; returns how many bytes fit
    pub fn ring_write(&self, ring: RingKey, bytes: &[u8]) -> Result<usize> {
        self.ring(ring)?.write(bytes)
    }

    /// Raw byte read, unframed
    pub fn ring_read(&self, ring: RingKey, buf: &mut [u8]) -> Result<usize> {
        self.ring(ring)?.read(buf)
    }

    /// Bytes that currently fit into the ring
    pub fn ring_write_space(&self, ring: RingKey) -> Result<usize> {
        self.ring(ring)?.write_space()
    }

    /// Bytes currently readable from the ring
    pub fn ring_read_space(&self, ring: RingKey) -> Result<usize> {
        self.ring(ring)?.read_space()
    }

    /// Discard everything currently readable from the ring
    pub fn ring_reset(&self, ring: RingKey) -> Result<()> {
        self.ring(ring)?.reset()
    }

    /// Name the backend actually assigned to the client
    pub fn client_name(&self, client: ClientKey) -> Result<String> {
        Ok(self.control(client)?.backend.name().to_string())
    }

    /// Sample rate as of the last change notification
    pub fn sample_rate(&self, client: ClientKey) -> Result<u32> {
        Ok(self.control(client)?.shared.sample_rate())
    }

    /// Maximum frames per cycle as currently known
    pub fn buffer_size(&self, client: ClientKey) -> Result<u32> {
        Ok(self.control(client)?.shared.buffer_size())
    }

    /// Frames in the cycle running right now, 0 between cycles
    pub fn cycle_frames(&self, client: ClientKey) -> Result<u32> {
        Ok(self.control(client)?.shared.cycle_frames())
    }

    /// Cycles whose process handler returned an error so far
    pub fn failed_cycles(&self, client: ClientKey) -> Result<u64> {
        Ok(self.control(client)?.shared.failed_cycles())
    }

    /// Turn per-cycle duration measurement on or off. Turning it on starts
    /// a fresh measurement.
    pub fn set_profiling(&self, client: ClientKey, enabled: bool) -> Result<()> {
        self.control(client)?.shared.set_profiling(enabled);
        Ok(())
    }

    /// Forget everything measured so far
    pub fn reset_profile(&self, client: ClientKey) -> Result<()> {
        self.control(client)?.shared.stats().reset();
        Ok(())
    }

    /// Snapshot of the cycle duration statistics, in seconds
    pub fn profile(&self, client: ClientKey) -> Result<StatsSnapshot> {
        Ok(self.control(client)?.shared.profile())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close_all();
    }
}
