//! Per-client state shared between the control thread and backend threads

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::stats::{SharedStats, StatsSnapshot};

/// One opened client as seen by every thread.
///
/// The control thread owns the backend connection; this mirror carries the
/// values other threads are allowed to read without asking it.
pub(crate) struct ClientShared {
    name: String,
    sample_rate: AtomicU32,
    buffer_size: AtomicU32,
    cycle_frames: AtomicU32,
    alive: AtomicBool,
    backend_down: AtomicBool,
    profiling: AtomicBool,
    failed_cycles: AtomicU64,
    stats: SharedStats,
}

impl ClientShared {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sample_rate: AtomicU32::new(0),
            buffer_size: AtomicU32::new(0),
            cycle_frames: AtomicU32::new(0),
            alive: AtomicBool::new(true),
            backend_down: AtomicBool::new(false),
            profiling: AtomicBool::new(false),
            failed_cycles: AtomicU64::new(0),
            stats: SharedStats::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub(crate) fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Relaxed);
    }

    pub(crate) fn buffer_size(&self) -> u32 {
        self.buffer_size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_buffer_size(&self, frames: u32) {
        self.buffer_size.store(frames, Ordering::Relaxed);
    }

    /// Frames in the cycle currently running, nonzero exactly while this
    /// client's process handler is on stack
    pub(crate) fn cycle_frames(&self) -> u32 {
        self.cycle_frames.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cycle_frames(&self, frames: u32) {
        self.cycle_frames.store(frames, Ordering::Relaxed);
    }

    /// False once the control thread has started closing this client
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// True once the backend reported shutdown from its side
    pub(crate) fn is_backend_down(&self) -> bool {
        self.backend_down.load(Ordering::Acquire)
    }

    pub(crate) fn mark_backend_down(&self) {
        self.backend_down.store(true, Ordering::Release);
    }

    pub(crate) fn profiling_enabled(&self) -> bool {
        self.profiling.load(Ordering::Relaxed)
    }

    /// Turning profiling on starts a fresh measurement window
    pub(crate) fn set_profiling(&self, enabled: bool) {
        let was = self.profiling.swap(enabled, Ordering::Relaxed);
        if enabled && !was {
            self.stats.reset();
        }
    }

    /// Cycles whose process handler reported an error. The cycle state is
    /// reset and processing continues; this counter is the only trace.
    pub(crate) fn failed_cycles(&self) -> u64 {
        self.failed_cycles.load(Ordering::Relaxed)
    }

    pub(crate) fn record_failed_cycle(&self) {
        self.failed_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> &SharedStats {
        &self.stats
    }

    pub(crate) fn profile(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
