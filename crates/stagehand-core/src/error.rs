//! Error types for the session, the processing cycle, and the fatal path
//!
//! Three families with different delivery rules:
//! - [`Error`] is returned synchronously to the control-thread caller.
//! - [`CycleError`] fails the current processing cycle only; per-cycle state
//!   is reset unconditionally at cycle end, so the next cycle starts clean.
//! - [`FatalError`] is raised from any thread through a first-writer-wins
//!   latch and surfaces as the control loop's `sleep`/`flush` error at the
//!   next wake. Only the control thread ever reports it to the user.

use thiserror::Error;

use crate::types::{PortDirection, PortKind};

/// Which registry a stale handle referred to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Client,
    Port,
    Worker,
    Ring,
}

impl ReferenceKind {
    /// Name used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            ReferenceKind::Client => "client",
            ReferenceKind::Port => "port",
            ReferenceKind::Worker => "worker",
            ReferenceKind::Ring => "ring buffer",
        }
    }
}

/// Errors reported synchronously to control-thread callers
#[derive(Error, Debug)]
pub enum Error {
    /// Handle does not name a live object (never retried; the handle stays dead)
    #[error("invalid {} reference", .0.name())]
    InvalidReference(ReferenceKind),

    /// A worker tried to signal itself
    #[error("a worker cannot signal itself")]
    SelfSignal,

    /// The object belongs to a different client
    #[error("{} is not owned by this client", .0.name())]
    NotOwner(ReferenceKind),

    /// The client already has an active process callback
    #[error("client is already active")]
    AlreadyActive,

    /// The client has no active process callback to stop
    #[error("client is not active")]
    NotActive,

    /// `sleep`/`flush` called from inside a dispatch handler
    #[error("sleep() and flush() cannot be called from a dispatch handler")]
    NestedDispatch,

    /// The contended side of a ring buffer is in use by another caller
    #[error("ring buffer side is busy")]
    RingBusy,

    /// Message can never fit the ring buffer, even when empty
    #[error("message of {len} bytes cannot fit in a ring buffer of {capacity} bytes")]
    MessageTooLong { len: usize, capacity: usize },

    /// The backend refused or failed an operation
    #[error("backend error: {0}")]
    Backend(String),

    /// Failed to spawn a worker thread
    #[error("failed to spawn worker thread")]
    Spawn(#[source] std::io::Error),

    /// A fatal condition was latched by a background thread
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Result type for control-thread operations
pub type Result<T> = std::result::Result<T, Error>;

/// Contract violations detected inside a processing cycle
///
/// Returning one of these from a process handler (or propagating it from a
/// buffer operation with `?`) fails that cycle; it does not stop the graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CycleError {
    /// The port buffer was already acquired this cycle
    #[error("port buffer already acquired this cycle")]
    BufferAlreadyAcquired,

    /// Operation needs `acquire` first
    #[error("port buffer not acquired")]
    NotAcquired,

    /// The port key does not name a live port
    #[error("invalid port reference")]
    InvalidPort,

    /// The port belongs to a different client than the running callback
    #[error("port is not owned by the client in this cycle")]
    ForeignPort,

    /// Operation and stored content kind disagree
    #[error("operation not valid for {} port", .0.name())]
    KindMismatch(PortKind),

    /// Operation needs the other port direction (reads want input ports,
    /// writes and clears want output ports)
    #[error("operation requires an {} port", .0.name())]
    DirectionMismatch(PortDirection),

    /// Seek target lies beyond the buffer extent
    #[error("position is out of range")]
    OutOfRange,

    /// The operation has no meaning for this content kind (clearing MIDI,
    /// copying custom records)
    #[error("operation not available for {} ports", .0.name())]
    Unsupported(PortKind),

    /// A MIDI event needs at least a status byte
    #[error("midi event must carry at least one byte")]
    EmptyMidi,

    /// Custom-port data must divide into whole records
    #[error("data of {len} bytes is not a whole number of {record}-byte records")]
    RecordSize { len: usize, record: usize },

    /// The handler reported its own failure for this cycle
    #[error("{0}")]
    Failed(String),
}

/// Result type for in-cycle operations
pub type CycleResult<T> = std::result::Result<T, CycleError>;

/// Ring and signal operations return [`Error`]; inside a process handler they
/// fail the cycle like any other in-cycle error.
impl From<Error> for CycleError {
    fn from(error: Error) -> Self {
        CycleError::Failed(error.to_string())
    }
}

/// Fatal conditions latched by background threads
///
/// First writer wins; duplicates are coalesced. The latched value is cloned
/// into the control thread's error at its next wake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// The deferred event queue is full (bounded, no backpressure)
    #[error("cannot queue callback event: queue is full")]
    EventQueueFull,

    /// A notification string exceeded the per-field cap
    #[error("callback event string too long ({len} > {cap} bytes)")]
    EventStringTooLong { len: usize, cap: usize },

    /// A worker thread finished with an error
    #[error("worker '{name}' failed: {message}")]
    WorkerFailed { name: String, message: String },

    /// The backend shut the client down from its side
    #[error("backend shut down: {0}")]
    BackendShutdown(String),

    /// A non-control thread requested termination
    #[error("termination requested: {0}")]
    Terminated(String),
}
