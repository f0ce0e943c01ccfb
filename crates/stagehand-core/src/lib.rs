//! Stagehand Core - Embeddable realtime audio/MIDI client engine

pub mod backend;
mod client;
pub mod config;
pub mod error;
pub mod events;
mod fatal;
mod port;
mod registry;
pub mod ring;
pub mod rt;
pub mod runtime;
pub mod stats;
pub mod types;
pub mod worker;

pub use types::*;
