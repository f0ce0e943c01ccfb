//! Backend abstraction over the audio server
//!
//! The session never talks to an audio server directly. A [`Backend`] opens
//! [`BackendClient`] connections; an active client drives a [`CycleDriver`]
//! once per processing cycle and reports everything else through the
//! [`NotificationSink`] it was given at open time. The in-process
//! [`offline::OfflineBackend`] drives cycles on demand from whatever thread
//! the caller chooses, which is what the tests run against.

use thiserror::Error;

use crate::config::OpenOptions;
use crate::error::Error;
use crate::events::NotificationSink;
use crate::types::{MidiEvent, PortSpec, Sample};

pub mod offline;

/// Identifier a backend assigns to a registered port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendPortId(pub u64);

/// Error reported by a backend driver
#[derive(Debug, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<BackendError> for Error {
    fn from(error: BackendError) -> Self {
        Error::Backend(error.0)
    }
}

/// Factory for client connections to an audio server
pub trait Backend {
    /// Open a client named `name`. Notifications for it flow through `sink`
    /// from whichever threads the backend uses.
    fn open_client(
        &mut self,
        name: &str,
        options: &OpenOptions,
        sink: NotificationSink,
    ) -> Result<Box<dyn BackendClient>, BackendError>;
}

/// One client connection, owned and called by the control thread
pub trait BackendClient: Send {
    /// Name the server actually assigned
    fn name(&self) -> &str;

    fn sample_rate(&self) -> u32;

    fn buffer_size(&self) -> u32;

    fn register_port(&mut self, spec: &PortSpec) -> Result<BackendPortId, BackendError>;

    fn unregister_port(&mut self, id: BackendPortId) -> Result<(), BackendError>;

    /// Connect two ports by full `client:port` name
    fn connect(&mut self, source: &str, destination: &str) -> Result<(), BackendError>;

    fn disconnect(&mut self, source: &str, destination: &str) -> Result<(), BackendError>;

    fn set_freewheel(&mut self, enabled: bool) -> Result<(), BackendError>;

    /// Start processing; `driver` runs once per cycle from now on
    fn activate(&mut self, driver: Box<dyn CycleDriver>) -> Result<(), BackendError>;

    /// Stop driving cycles. Safe to call when not active.
    fn deactivate(&mut self) -> Result<(), BackendError>;

    /// Tear the connection down. The client must not be used afterwards.
    fn close(&mut self) -> Result<(), BackendError>;
}

/// Whether the backend should keep driving cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    Stop,
}

/// Runs on the backend's processing thread, once per cycle
pub trait CycleDriver: Send {
    fn run_cycle(&mut self, cycle: &mut Cycle<'_>) -> CycleOutcome;

    /// The server changed the cycle length
    fn buffer_size_changed(&mut self, _frames: u32) {}
}

/// Buffer access for the duration of one cycle
pub trait CycleBuffers {
    /// View of a port's buffer for this cycle, sized for `frames`.
    ///
    /// The pointers inside the returned view stay valid until the driver's
    /// `run_cycle` returns, and must only be dereferenced from the cycle
    /// thread. Views of distinct ports never overlap.
    fn buffer(&mut self, id: BackendPortId, frames: u32) -> Option<PortBuffer>;
}

/// Raw view of one port's buffer, valid for the current cycle only
#[derive(Debug, Clone, Copy)]
pub enum PortBuffer {
    Audio {
        ptr: *mut Sample,
        frames: usize,
    },
    MidiIn {
        events: *const MidiEvent,
        count: usize,
        /// Events the backend had to drop before this cycle
        lost: u32,
    },
    MidiOut {
        queue: *mut Vec<MidiEvent>,
        capacity: usize,
    },
    Custom {
        ptr: *mut u8,
        bytes: usize,
    },
}

/// One processing cycle as handed to a [`CycleDriver`]
pub struct Cycle<'a> {
    frames: u32,
    buffers: &'a mut dyn CycleBuffers,
}

impl<'a> Cycle<'a> {
    pub fn new(frames: u32, buffers: &'a mut dyn CycleBuffers) -> Self {
        Self { frames, buffers }
    }

    /// Frames in this cycle
    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Backend view of `id` for this cycle
    pub fn buffer(&mut self, id: BackendPortId) -> Option<PortBuffer> {
        self.buffers.buffer(id, self.frames)
    }
}
