//! Per-client cycle driver
//!
//! The driver is what a backend actually calls once per cycle. It wraps the
//! user's [`ProcessHandler`], builds a fresh [`ProcessScope`] for the cycle
//! and tears it down afterwards, so acquisitions can never outlive the
//! cycle they were made in. A handler error is recorded and logged, then
//! the driver carries on: one bad cycle does not take the client down.

use std::sync::Arc;
use std::time::Instant;

use basedrop::Shared;

use crate::backend::{Cycle, CycleDriver, CycleOutcome};
use crate::client::ClientShared;
use crate::error::CycleResult;
use crate::rt::ProcessScope;
use crate::runtime::SessionShared;
use crate::types::ClientKey;

/// Real-time half of a client.
///
/// Implementations run on the backend's processing thread. Everything they
/// may touch is reachable through the [`ProcessScope`]; blocking or
/// allocating in `process` is the caller's own latency to lose.
pub trait ProcessHandler: Send {
    /// One processing cycle. An error fails this cycle only; the next one
    /// starts clean.
    fn process(&mut self, scope: &mut ProcessScope<'_, '_>) -> CycleResult<()>;

    /// The server changed the maximum cycle length
    fn buffer_size(&mut self, _frames: u32) {}
}

/// Adapter between a backend's cycle callbacks and one client's handler
pub(crate) struct ClientDriver {
    session: Arc<SessionShared>,
    key: ClientKey,
    client: Shared<ClientShared>,
    handler: Box<dyn ProcessHandler>,
}

impl ClientDriver {
    pub(crate) fn new(
        session: Arc<SessionShared>,
        key: ClientKey,
        client: Shared<ClientShared>,
        handler: Box<dyn ProcessHandler>,
    ) -> Self {
        Self {
            session,
            key,
            client,
            handler,
        }
    }
}

impl CycleDriver for ClientDriver {
    fn run_cycle(&mut self, cycle: &mut Cycle<'_>) -> CycleOutcome {
        // Once the session has a fatal error pending, cycles idle until the
        // control thread deactivates the client.
        if self.session.fatal.is_raised() {
            return CycleOutcome::Continue;
        }
        if !self.client.is_alive() {
            return CycleOutcome::Stop;
        }

        let started = self.client.profiling_enabled().then(Instant::now);
        let frames = cycle.frames();
        self.client.set_cycle_frames(frames);
        self.client.set_buffer_size(frames);

        let ports = self.session.ports.snapshot();
        let result = {
            let mut scope = ProcessScope::new(self.key, &self.session, &ports, cycle);
            self.handler.process(&mut scope)
        };
        self.client.set_cycle_frames(0);

        if let Err(error) = result {
            self.client.record_failed_cycle();
            log::warn!("client '{}': cycle failed: {error}", self.client.name());
        }
        if let Some(begun) = started {
            self.client.stats().update(begun.elapsed().as_secs_f64());
        }
        CycleOutcome::Continue
    }

    fn buffer_size_changed(&mut self, frames: u32) {
        if !self.client.is_alive() {
            return;
        }
        self.client.set_buffer_size(frames);
        self.handler.buffer_size(frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::offline::{OfflineBackend, OfflineHandle};
    use crate::backend::{Backend, BackendClient};
    use crate::config::OpenOptions;
    use crate::error::{CycleError, FatalError};
    use crate::events::NotificationSink;
    use crate::port::PortShared;
    use crate::types::{PortDirection, PortKey, PortSpec};
    use basedrop::Collector;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

    struct Rig {
        _collector: Collector,
        shared: Arc<SessionShared>,
        key: ClientKey,
        client: Shared<ClientShared>,
        backend: Box<dyn BackendClient>,
        offline: OfflineHandle,
    }

    /// Open an offline client and register `specs`, the way the session
    /// control surface would
    fn rig(specs: &[PortSpec]) -> (Rig, Vec<PortKey>) {
        let collector = Collector::new();
        let handle = collector.handle();
        let (shared, _channels) = SessionShared::new(&handle);
        let shared = Arc::new(shared);
        let (key, client) = shared.clients.insert(&handle, ClientShared::new("alpha"));

        let (mut factory, offline) = OfflineBackend::new(48_000, 8);
        let sink = NotificationSink::new(shared.clone(), key);
        let mut backend = factory
            .open_client("alpha", &OpenOptions::default(), sink)
            .unwrap();

        let mut keys = Vec::new();
        for spec in specs {
            let id = backend.register_port(spec).unwrap();
            let (port, _) = shared.ports.insert(&handle, PortShared::new(key, spec, id));
            keys.push(port);
        }

        let rig = Rig {
            _collector: collector,
            shared,
            key,
            client,
            backend,
            offline,
        };
        (rig, keys)
    }

    fn activate(rig: &mut Rig, handler: Box<dyn ProcessHandler>) {
        let driver = ClientDriver::new(
            rig.shared.clone(),
            rig.key,
            rig.client.clone(),
            handler,
        );
        rig.backend.activate(Box::new(driver)).unwrap();
    }

    struct Mirror {
        client: Shared<ClientShared>,
        seen: Arc<AtomicU32>,
        cycles: Arc<AtomicU64>,
    }

    impl ProcessHandler for Mirror {
        fn process(&mut self, scope: &mut ProcessScope<'_, '_>) -> CycleResult<()> {
            assert_eq!(self.client.cycle_frames(), scope.frames());
            self.seen.store(scope.frames(), Ordering::SeqCst);
            self.cycles.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn cycle_frames_is_nonzero_exactly_while_processing() {
        let (mut rig, _) = rig(&[]);
        let seen = Arc::new(AtomicU32::new(0));
        let cycles = Arc::new(AtomicU64::new(0));
        let handler = Box::new(Mirror {
            client: rig.client.clone(),
            seen: seen.clone(),
            cycles: cycles.clone(),
        });
        activate(&mut rig, handler);

        assert_eq!(rig.client.cycle_frames(), 0);
        assert!(rig.offline.drive_cycle("alpha", 16));
        assert_eq!(seen.load(Ordering::SeqCst), 16);
        assert_eq!(rig.client.cycle_frames(), 0);
        // The cycle length also tracks the mirrored buffer size
        assert_eq!(rig.client.buffer_size(), 16);
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
    }

    struct Flaky {
        out: PortKey,
        fail: Arc<AtomicBool>,
    }

    impl ProcessHandler for Flaky {
        fn process(&mut self, scope: &mut ProcessScope<'_, '_>) -> CycleResult<()> {
            scope.acquire(self.out)?;
            if self.fail.load(Ordering::SeqCst) {
                return Err(CycleError::Failed(String::from("induced")));
            }
            let frames = scope.frames() as usize;
            scope.write_audio(self.out, &vec![0.25; frames])?;
            Ok(())
        }
    }

    #[test]
    fn a_failed_cycle_is_contained_and_the_next_starts_clean() {
        let (mut rig, keys) = rig(&[PortSpec::audio("out", PortDirection::Output)]);
        let fail = Arc::new(AtomicBool::new(false));
        let handler = Box::new(Flaky {
            out: keys[0],
            fail: fail.clone(),
        });
        activate(&mut rig, handler);

        assert!(rig.offline.drive_cycle("alpha", 8));
        assert_eq!(rig.client.failed_cycles(), 0);

        fail.store(true, Ordering::SeqCst);
        assert!(rig.offline.drive_cycle("alpha", 8));
        assert_eq!(rig.client.failed_cycles(), 1);

        // The failed cycle acquired the buffer; this one can acquire again
        fail.store(false, Ordering::SeqCst);
        assert!(rig.offline.drive_cycle("alpha", 8));
        assert_eq!(rig.client.failed_cycles(), 1);
        assert_eq!(
            rig.offline.audio_output("alpha", "out").unwrap(),
            vec![0.25; 8]
        );
    }

    #[test]
    fn profiling_counts_only_enabled_cycles() {
        let (mut rig, _) = rig(&[]);
        let handler = Box::new(Mirror {
            client: rig.client.clone(),
            seen: Arc::new(AtomicU32::new(0)),
            cycles: Arc::new(AtomicU64::new(0)),
        });
        activate(&mut rig, handler);

        rig.offline.drive_cycle("alpha", 8);
        assert_eq!(rig.client.profile().n, 0);

        rig.client.set_profiling(true);
        rig.offline.drive_cycle("alpha", 8);
        rig.offline.drive_cycle("alpha", 8);
        let stats = rig.client.profile();
        assert_eq!(stats.n, 2);
        assert!(stats.min <= stats.mean && stats.mean <= stats.max);
        assert!(stats.variance >= 0.0);

        rig.client.set_profiling(false);
        rig.offline.drive_cycle("alpha", 8);
        assert_eq!(rig.client.profile().n, 2);

        // Re-enabling starts a fresh measurement
        rig.client.set_profiling(true);
        rig.offline.drive_cycle("alpha", 8);
        assert_eq!(rig.client.profile().n, 1);
    }

    #[test]
    fn fatal_sessions_idle_without_running_the_handler() {
        let (mut rig, _) = rig(&[]);
        let cycles = Arc::new(AtomicU64::new(0));
        let handler = Box::new(Mirror {
            client: rig.client.clone(),
            seen: Arc::new(AtomicU32::new(0)),
            cycles: cycles.clone(),
        });
        activate(&mut rig, handler);

        rig.shared
            .fatal
            .raise(FatalError::Terminated(String::from("going down")));
        assert!(rig.offline.drive_cycle("alpha", 8));
        // The driver idled: the handler never ran
        assert_eq!(cycles.load(Ordering::SeqCst), 0);
        assert!(rig.offline.is_active("alpha"));
    }

    #[test]
    fn dead_clients_stop_the_driver() {
        let (mut rig, _) = rig(&[]);
        let cycles = Arc::new(AtomicU64::new(0));
        let handler = Box::new(Mirror {
            client: rig.client.clone(),
            seen: Arc::new(AtomicU32::new(0)),
            cycles: cycles.clone(),
        });
        activate(&mut rig, handler);

        rig.client.mark_dead();
        assert!(rig.offline.drive_cycle("alpha", 8));
        assert_eq!(cycles.load(Ordering::SeqCst), 0);
        // Stop unhooked the driver
        assert!(!rig.offline.is_active("alpha"));
        assert!(!rig.offline.drive_cycle("alpha", 8));
    }

    struct Resizer {
        resized: Arc<AtomicU32>,
    }

    impl ProcessHandler for Resizer {
        fn process(&mut self, _scope: &mut ProcessScope<'_, '_>) -> CycleResult<()> {
            Ok(())
        }

        fn buffer_size(&mut self, frames: u32) {
            self.resized.store(frames, Ordering::SeqCst);
        }
    }

    #[test]
    fn buffer_size_changes_reach_the_handler() {
        let (mut rig, _) = rig(&[]);
        let resized = Arc::new(AtomicU32::new(0));
        let handler = Box::new(Resizer {
            resized: resized.clone(),
        });
        activate(&mut rig, handler);

        assert!(rig.offline.set_buffer_size("alpha", 256));
        assert_eq!(resized.load(Ordering::SeqCst), 256);
        assert_eq!(rig.client.buffer_size(), 256);
    }
}
