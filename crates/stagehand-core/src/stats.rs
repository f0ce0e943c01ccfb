//! Running statistics for process-callback profiling
//!
//! Welford's online algorithm: constant memory, one pass, numerically stable.
//! [`RunningStats`] is the plain accumulator; [`SharedStats`] mirrors it into
//! atomics so the real-time thread can record cycle durations while the
//! control thread reads a snapshot without locking.

use std::sync::atomic::{AtomicU64, Ordering};

/// Online accumulator for count, min, max, mean and variance
#[derive(Debug, Clone, Copy)]
pub struct RunningStats {
    n: u64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    /// Empty accumulator
    pub fn new() -> Self {
        Self {
            n: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            m2: 0.0,
        }
    }

    /// Fold one sample into the accumulator
    pub fn update(&mut self, x: f64) {
        self.n += 1;
        if x < self.min {
            self.min = x;
        }
        if x > self.max {
            self.max = x;
        }
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Number of samples seen
    pub fn count(&self) -> u64 {
        self.n
    }

    /// Smallest sample, or 0 before any sample
    pub fn min(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.min
        }
    }

    /// Largest sample, or 0 before any sample
    pub fn max(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.max
        }
    }

    /// Running mean
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (n-1 denominator); 0 with fewer than two samples
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            0.0
        } else {
            self.m2 / (self.n - 1) as f64
        }
    }

    /// Snapshot of all derived values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            n: self.count(),
            min: self.min(),
            max: self.max(),
            mean: self.mean(),
            variance: self.variance(),
        }
    }
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a [`RunningStats`] accumulator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    /// Number of samples
    pub n: u64,
    /// Smallest sample
    pub min: f64,
    /// Largest sample
    pub max: f64,
    /// Mean
    pub mean: f64,
    /// Sample variance (n-1 denominator)
    pub variance: f64,
}

/// Atomic mirror of [`RunningStats`] shared between the RT writer and
/// control-thread readers.
///
/// Exactly one thread calls [`SharedStats::update`]; readers may observe a
/// snapshot torn across fields mid-update, which is accepted for profiling
/// output. Floats travel as `to_bits` in `AtomicU64`s.
#[derive(Debug)]
pub(crate) struct SharedStats {
    n: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
    mean: AtomicU64,
    m2: AtomicU64,
}

impl SharedStats {
    pub(crate) fn new() -> Self {
        Self {
            n: AtomicU64::new(0),
            min: AtomicU64::new(f64::INFINITY.to_bits()),
            max: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
            mean: AtomicU64::new(0f64.to_bits()),
            m2: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Fold one sample in. Single-writer: only the owning RT thread calls this.
    pub(crate) fn update(&self, x: f64) {
        let mut local = self.load();
        local.update(x);
        self.n.store(local.n, Ordering::Relaxed);
        self.min.store(local.min.to_bits(), Ordering::Relaxed);
        self.max.store(local.max.to_bits(), Ordering::Relaxed);
        self.mean.store(local.mean.to_bits(), Ordering::Relaxed);
        self.m2.store(local.m2.to_bits(), Ordering::Relaxed);
    }

    /// Reset to the empty accumulator
    pub(crate) fn reset(&self) {
        self.n.store(0, Ordering::Relaxed);
        self.min.store(f64::INFINITY.to_bits(), Ordering::Relaxed);
        self.max.store(f64::NEG_INFINITY.to_bits(), Ordering::Relaxed);
        self.mean.store(0f64.to_bits(), Ordering::Relaxed);
        self.m2.store(0f64.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        self.load().snapshot()
    }

    fn load(&self) -> RunningStats {
        RunningStats {
            n: self.n.load(Ordering::Relaxed),
            min: f64::from_bits(self.min.load(Ordering::Relaxed)),
            max: f64::from_bits(self.max.load(Ordering::Relaxed)),
            mean: f64::from_bits(self.mean.load(Ordering::Relaxed)),
            m2: f64::from_bits(self.m2.load(Ordering::Relaxed)),
        }
    }
}
