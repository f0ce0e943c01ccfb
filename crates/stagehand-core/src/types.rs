//! Common types for Stagehand
//!
//! This module contains the fundamental vocabulary shared across the crate:
//! the opaque handle types the embedding layer holds, and the port
//! classification types used by registration, buffer access and routing.

/// Audio sample type (32-bit float, the native format of the processing graph)
pub type Sample = f32;

/// Handle to a client in the session registry.
///
/// Handles are opaque, never reused, and remain safe to present after the
/// underlying object is gone: every operation re-validates them and fails
/// with [`Error::InvalidReference`](crate::error::Error::InvalidReference)
/// on a stale handle instead of touching freed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientKey(pub(crate) u64);

/// Handle to a registered port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortKey(pub(crate) u64);

/// Handle to a worker thread owned by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerKey(pub(crate) u64);

/// Handle to a message ring buffer owned by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingKey(pub(crate) u64);

impl ClientKey {
    /// Raw integer value of the handle (stable for the object's lifetime)
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl PortKey {
    /// Raw integer value of the handle
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl WorkerKey {
    /// Raw integer value of the handle
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl RingKey {
    /// Raw integer value of the handle
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Content kind carried by a port.
///
/// Buffer operations dispatch on the kind stored at registration time, never
/// on the type of data a caller happens to supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// Contiguous `f32` sample frames
    Audio,
    /// Discrete timestamped MIDI events
    Midi,
    /// Fixed-size opaque records (record size chosen at registration)
    Custom,
}

impl PortKind {
    /// Human-readable kind name, used in error messages and logs
    pub fn name(&self) -> &'static str {
        match self {
            PortKind::Audio => "audio",
            PortKind::Midi => "midi",
            PortKind::Custom => "custom",
        }
    }
}

/// Data direction of a port, from the graph's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    /// The port receives data from the graph
    Input,
    /// The port sends data into the graph
    Output,
}

impl PortDirection {
    /// Human-readable direction name
    pub fn name(&self) -> &'static str {
        match self {
            PortDirection::Input => "input",
            PortDirection::Output => "output",
        }
    }
}

/// Optional port properties forwarded to the backend at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortFlags {
    /// Data at this port terminates here (not passed through)
    pub terminal: bool,
    /// The port corresponds to a physical I/O connector
    pub physical: bool,
    /// The backend may monitor this port on request
    pub can_monitor: bool,
}

/// Everything needed to register a port with the backend.
#[derive(Debug, Clone)]
pub struct PortSpec {
    /// Port name, unique within the owning client
    pub name: String,
    /// Content kind (fixed for the port's lifetime)
    pub kind: PortKind,
    /// Data direction
    pub direction: PortDirection,
    /// Optional backend properties
    pub flags: PortFlags,
    /// Bytes per record for [`PortKind::Custom`] ports; ignored otherwise
    pub record_size: usize,
}

impl PortSpec {
    /// Spec for an audio port
    pub fn audio(name: impl Into<String>, direction: PortDirection) -> Self {
        Self {
            name: name.into(),
            kind: PortKind::Audio,
            direction,
            flags: PortFlags::default(),
            record_size: std::mem::size_of::<Sample>(),
        }
    }

    /// Spec for a MIDI port
    pub fn midi(name: impl Into<String>, direction: PortDirection) -> Self {
        Self {
            name: name.into(),
            kind: PortKind::Midi,
            direction,
            flags: PortFlags::default(),
            record_size: 0,
        }
    }

    /// Spec for a custom port carrying `record_size`-byte records
    pub fn custom(name: impl Into<String>, direction: PortDirection, record_size: usize) -> Self {
        Self {
            name: name.into(),
            kind: PortKind::Custom,
            direction,
            flags: PortFlags::default(),
            record_size: record_size.max(1),
        }
    }

    /// Set backend property flags
    pub fn with_flags(mut self, flags: PortFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A single timestamped MIDI event.
///
/// `time` is the frame offset within the cycle the event belongs to; events
/// in a buffer are ordered by non-decreasing time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    /// Frame offset within the cycle
    pub time: u32,
    /// Raw MIDI bytes (status byte first)
    pub bytes: Vec<u8>,
}

impl MidiEvent {
    /// Build an event from a frame offset and raw bytes
    pub fn new(time: u32, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            time,
            bytes: bytes.into(),
        }
    }
}
