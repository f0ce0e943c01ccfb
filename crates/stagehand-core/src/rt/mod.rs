//! Real-time side: cycle drivers and in-cycle buffer access
//!
//! Code in this module runs on the backend's processing thread. The
//! [`ClientDriver`] bridges a backend cycle to the user's
//! [`ProcessHandler`]; the [`ProcessScope`] is the capability the handler
//! works through. Nothing here blocks on the control thread: shared state
//! is read through registry snapshots and try-locks.

mod driver;
mod scope;

pub use driver::ProcessHandler;
pub(crate) use driver::ClientDriver;
pub use scope::{Acquired, ProcessScope};
