//! Lock-free byte rings with a framed message layer
//!
//! A ring is a fixed-capacity SPSC byte queue usable from any pair of
//! threads: each side sits behind a try-lock cell, so callers on the
//! real-time path never block on the control thread or on each other.
//! On top of the raw byte transport, [`frame`] adds the tagged message
//! protocol spoken between the process callback, workers and the control
//! thread.

mod buffer;
mod frame;

pub(crate) use buffer::RingShared;
pub use frame::Message;
