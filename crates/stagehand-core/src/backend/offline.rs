//! In-process backend that drives cycles on demand
//!
//! No server and no real-time thread: the [`OfflineHandle`] runs processing
//! cycles and fires notifications from whatever thread the caller chooses.
//! Ports are plain memory, addressed by client and port name. Used by the
//! test suite and for offline rendering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam::channel::Receiver;

use super::{
    Backend, BackendClient, BackendError, BackendPortId, Cycle, CycleBuffers, CycleDriver,
    CycleOutcome, PortBuffer,
};
use crate::config::OpenOptions;
use crate::events::{LatencyMode, NotificationSink, SessionEventType, SessionReply};
use crate::types::{MidiEvent, PortDirection, PortKind, PortSpec, Sample};

/// Backend that runs entirely in-process
pub struct OfflineBackend {
    shared: Arc<OfflineShared>,
    sample_rate: u32,
    buffer_size: u32,
}

impl OfflineBackend {
    /// Backend plus the handle that drives it
    pub fn new(sample_rate: u32, buffer_size: u32) -> (Self, OfflineHandle) {
        let shared = Arc::new(OfflineShared::default());
        let handle = OfflineHandle {
            shared: shared.clone(),
        };
        let backend = Self {
            shared,
            sample_rate,
            buffer_size,
        };
        (backend, handle)
    }
}

impl Backend for OfflineBackend {
    fn open_client(
        &mut self,
        name: &str,
        _options: &OpenOptions,
        sink: NotificationSink,
    ) -> Result<Box<dyn BackendClient>, BackendError> {
        let mut clients = lock(&self.shared.clients);
        if clients.iter().any(|(n, _)| n == name) {
            return Err(BackendError::new(format!(
                "client name '{name}' is already in use"
            )));
        }
        let core = Arc::new(Mutex::new(ClientCore {
            name: name.to_string(),
            sample_rate: self.sample_rate,
            buffer_size: self.buffer_size,
            sink,
            next_port: 1,
            ports: HashMap::new(),
            driver: None,
            connections: Vec::new(),
            freewheel: false,
        }));
        clients.push((name.to_string(), core.clone()));
        Ok(Box::new(OfflineClient {
            name: name.to_string(),
            core,
            shared: self.shared.clone(),
        }))
    }
}

/// Drives an [`OfflineBackend`] from the outside: cycles, buffer contents
/// and backend-originated notifications.
#[derive(Clone)]
pub struct OfflineHandle {
    shared: Arc<OfflineShared>,
}

impl OfflineHandle {
    /// True while the backend knows a client by this name
    pub fn has_client(&self, client: &str) -> bool {
        self.shared.client(client).is_some()
    }

    pub fn is_active(&self, client: &str) -> bool {
        self.with_client(client, |core| core.driver.is_some())
            .unwrap_or(false)
    }

    /// Run one processing cycle of `frames` frames. Returns false when the
    /// client is missing or has no active driver.
    pub fn drive_cycle(&self, client: &str, frames: u32) -> bool {
        let Some(core) = self.shared.client(client) else {
            return false;
        };
        let mut guard = core.lock().unwrap_or_else(PoisonError::into_inner);
        let outcome = {
            let ClientCore { driver, ports, .. } = &mut *guard;
            let Some(driver) = driver.as_mut() else {
                return false;
            };
            let mut buffers = OfflineBuffers { ports };
            let mut cycle = Cycle::new(frames, &mut buffers);
            driver.run_cycle(&mut cycle)
        };
        if outcome == CycleOutcome::Stop {
            guard.driver = None;
        }
        true
    }

    /// Replace the readable content of an audio input port
    pub fn feed_audio(&self, client: &str, port: &str, samples: &[Sample]) -> bool {
        self.with_port(client, port, |store| match &mut store.storage {
            Storage::Audio(buf) => {
                buf.clear();
                buf.extend_from_slice(samples);
                true
            }
            _ => false,
        })
        .unwrap_or(false)
    }

    /// Current content of an audio port's buffer
    pub fn audio_output(&self, client: &str, port: &str) -> Option<Vec<Sample>> {
        self.with_port(client, port, |store| match &store.storage {
            Storage::Audio(buf) => Some(buf.clone()),
            _ => None,
        })
        .flatten()
    }

    /// Replace the incoming events of a MIDI input port
    pub fn feed_midi(&self, client: &str, port: &str, events: Vec<MidiEvent>) -> bool {
        self.with_port(client, port, |store| match &mut store.storage {
            Storage::Midi(queue) => {
                *queue = events;
                true
            }
            _ => false,
        })
        .unwrap_or(false)
    }

    /// Drain everything a MIDI output port queued
    pub fn take_midi(&self, client: &str, port: &str) -> Option<Vec<MidiEvent>> {
        self.with_port(client, port, |store| match &mut store.storage {
            Storage::Midi(queue) => Some(std::mem::take(queue)),
            _ => None,
        })
        .flatten()
    }

    /// Replace the readable content of a custom input port
    pub fn feed_custom(&self, client: &str, port: &str, bytes: &[u8]) -> bool {
        self.with_port(client, port, |store| match &mut store.storage {
            Storage::Custom(buf) => {
                buf.clear();
                buf.extend_from_slice(bytes);
                true
            }
            _ => false,
        })
        .unwrap_or(false)
    }

    /// Current content of a custom port's buffer
    pub fn custom_output(&self, client: &str, port: &str) -> Option<Vec<u8>> {
        self.with_port(client, port, |store| match &store.storage {
            Storage::Custom(buf) => Some(buf.clone()),
            _ => None,
        })
        .flatten()
    }

    /// Connections recorded through this client, in creation order
    pub fn connections(&self, client: &str) -> Vec<(String, String)> {
        self.with_client(client, |core| core.connections.clone())
            .unwrap_or_default()
    }

    pub fn is_freewheeling(&self, client: &str) -> bool {
        self.with_client(client, |core| core.freewheel)
            .unwrap_or(false)
    }

    /// Change the cycle length and tell the active driver
    pub fn set_buffer_size(&self, client: &str, frames: u32) -> bool {
        self.with_client(client, |core| {
            core.buffer_size = frames;
            if let Some(driver) = core.driver.as_mut() {
                driver.buffer_size_changed(frames);
            }
        })
        .is_some()
    }

    pub fn emit_xrun(&self, client: &str) -> bool {
        self.with_client(client, |core| core.sink.xrun()).is_some()
    }

    pub fn emit_sample_rate(&self, client: &str, rate: u32) -> bool {
        self.with_client(client, |core| {
            core.sample_rate = rate;
            core.sink.sample_rate(rate);
        })
        .is_some()
    }

    pub fn emit_graph_order(&self, client: &str) -> bool {
        self.with_client(client, |core| core.sink.graph_order())
            .is_some()
    }

    /// Report another client appearing on or leaving the server
    pub fn emit_client_registration(&self, client: &str, name: &str, registered: bool) -> bool {
        self.with_client(client, |core| core.sink.client_registration(name, registered))
            .is_some()
    }

    pub fn emit_port_rename(&self, client: &str, old: &str, new: &str) -> bool {
        self.with_client(client, |core| core.sink.port_rename(old, new))
            .is_some()
    }

    pub fn emit_latency(&self, client: &str, mode: LatencyMode) -> bool {
        self.with_client(client, |core| core.sink.latency(mode))
            .is_some()
    }

    pub fn emit_shutdown(&self, client: &str, reason: &str) -> bool {
        self.with_client(client, |core| core.sink.shutdown(reason))
            .is_some()
    }

    /// Fire a session event; the receiver yields the reply once the control
    /// thread has dispatched it.
    pub fn emit_session(
        &self,
        client: &str,
        event_type: SessionEventType,
        session_dir: &str,
    ) -> Option<Receiver<SessionReply>> {
        self.with_client(client, |core| core.sink.session(event_type, session_dir))
    }

    fn with_client<T>(&self, client: &str, f: impl FnOnce(&mut ClientCore) -> T) -> Option<T> {
        let core = self.shared.client(client)?;
        let mut guard = core.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut guard))
    }

    fn with_port<T>(
        &self,
        client: &str,
        port: &str,
        f: impl FnOnce(&mut PortStore) -> T,
    ) -> Option<T> {
        let core = self.shared.client(client)?;
        let mut guard = core.lock().unwrap_or_else(PoisonError::into_inner);
        let store = guard.ports.values_mut().find(|p| p.name == port)?;
        Some(f(store))
    }
}

#[derive(Default)]
struct OfflineShared {
    clients: Mutex<Vec<(String, Arc<Mutex<ClientCore>>)>>,
}

impl OfflineShared {
    fn client(&self, name: &str) -> Option<Arc<Mutex<ClientCore>>> {
        let clients = lock(&self.clients);
        clients
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, core)| core.clone())
    }

    fn remove_client(&self, name: &str) {
        lock(&self.clients).retain(|(n, _)| n != name);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ClientCore {
    name: String,
    sample_rate: u32,
    buffer_size: u32,
    sink: NotificationSink,
    next_port: u64,
    ports: HashMap<BackendPortId, PortStore>,
    driver: Option<Box<dyn CycleDriver>>,
    connections: Vec<(String, String)>,
    freewheel: bool,
}

struct PortStore {
    name: String,
    direction: PortDirection,
    record_size: usize,
    storage: Storage,
    lost: u32,
}

enum Storage {
    Audio(Vec<Sample>),
    Midi(Vec<MidiEvent>),
    Custom(Vec<u8>),
}

struct OfflineClient {
    name: String,
    core: Arc<Mutex<ClientCore>>,
    shared: Arc<OfflineShared>,
}

impl OfflineClient {
    fn core(&self) -> MutexGuard<'_, ClientCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BackendClient for OfflineClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.core().sample_rate
    }

    fn buffer_size(&self) -> u32 {
        self.core().buffer_size
    }

    fn register_port(&mut self, spec: &PortSpec) -> Result<BackendPortId, BackendError> {
        let mut core = self.core();
        if core.ports.values().any(|p| p.name == spec.name) {
            return Err(BackendError::new(format!(
                "port name '{}' is already in use",
                spec.name
            )));
        }
        let id = BackendPortId(core.next_port);
        core.next_port += 1;
        let storage = match spec.kind {
            PortKind::Audio => Storage::Audio(Vec::new()),
            PortKind::Midi => Storage::Midi(Vec::new()),
            PortKind::Custom => Storage::Custom(Vec::new()),
        };
        core.ports.insert(
            id,
            PortStore {
                name: spec.name.clone(),
                direction: spec.direction,
                record_size: spec.record_size,
                storage,
                lost: 0,
            },
        );
        let full = format!("{}:{}", core.name, spec.name);
        core.sink.port_registration(&full, true);
        Ok(id)
    }

    fn unregister_port(&mut self, id: BackendPortId) -> Result<(), BackendError> {
        let mut core = self.core();
        let Some(store) = core.ports.remove(&id) else {
            return Err(BackendError::new("unknown port"));
        };
        let full = format!("{}:{}", core.name, store.name);
        core.sink.port_registration(&full, false);
        Ok(())
    }

    fn connect(&mut self, source: &str, destination: &str) -> Result<(), BackendError> {
        let mut core = self.core();
        let pair = (source.to_string(), destination.to_string());
        if core.connections.contains(&pair) {
            return Err(BackendError::new(format!(
                "'{source}' and '{destination}' are already connected"
            )));
        }
        core.connections.push(pair);
        core.sink.port_connect(source, destination, true);
        Ok(())
    }

    fn disconnect(&mut self, source: &str, destination: &str) -> Result<(), BackendError> {
        let mut core = self.core();
        let pair = (source.to_string(), destination.to_string());
        let Some(at) = core.connections.iter().position(|p| *p == pair) else {
            return Err(BackendError::new(format!(
                "'{source}' and '{destination}' are not connected"
            )));
        };
        core.connections.remove(at);
        core.sink.port_connect(source, destination, false);
        Ok(())
    }

    fn set_freewheel(&mut self, enabled: bool) -> Result<(), BackendError> {
        let mut core = self.core();
        if core.freewheel != enabled {
            core.freewheel = enabled;
            core.sink.freewheel(enabled);
        }
        Ok(())
    }

    fn activate(&mut self, driver: Box<dyn CycleDriver>) -> Result<(), BackendError> {
        let mut core = self.core();
        if core.driver.is_some() {
            return Err(BackendError::new("client is already active"));
        }
        core.driver = Some(driver);
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), BackendError> {
        self.core().driver = None;
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.core().driver = None;
        self.shared.remove_client(&self.name);
        Ok(())
    }
}

/// Per-cycle buffer views over the port stores. The client mutex is held for
/// the whole cycle, so the raw pointers stay valid until the driver returns.
struct OfflineBuffers<'a> {
    ports: &'a mut HashMap<BackendPortId, PortStore>,
}

impl CycleBuffers for OfflineBuffers<'_> {
    fn buffer(&mut self, id: BackendPortId, frames: u32) -> Option<PortBuffer> {
        let store = self.ports.get_mut(&id)?;
        let frames = frames as usize;
        Some(match &mut store.storage {
            Storage::Audio(buf) => {
                buf.resize(frames, 0.0);
                PortBuffer::Audio {
                    ptr: buf.as_mut_ptr(),
                    frames,
                }
            }
            Storage::Midi(queue) => match store.direction {
                PortDirection::Input => PortBuffer::MidiIn {
                    events: queue.as_ptr(),
                    count: queue.len(),
                    lost: store.lost,
                },
                // A cycle of n frames accepts at most n queued events,
                // mirroring servers where the MIDI buffer is the port buffer
                PortDirection::Output => PortBuffer::MidiOut {
                    queue: queue as *mut Vec<MidiEvent>,
                    capacity: frames,
                },
            },
            Storage::Custom(buf) => {
                let bytes = frames * store.record_size;
                buf.resize(bytes, 0);
                PortBuffer::Custom {
                    ptr: buf.as_mut_ptr(),
                    bytes,
                }
            }
        })
    }
}
