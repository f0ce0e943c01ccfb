//! First-writer-wins latch for fatal conditions
//!
//! Threads off the control path (the process callback, workers, backend
//! notification contexts) cannot return errors to the caller. They latch the
//! first fatal condition here; the control thread observes it at its next
//! `sleep` or `flush` and unwinds. Later conditions are dropped, the first
//! one tells the story.

use std::sync::OnceLock;

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::FatalError;

pub(crate) struct FatalLatch {
    cell: OnceLock<FatalError>,
    signal_tx: Sender<()>,
}

impl FatalLatch {
    /// Latch plus the receiver the control loop selects on
    pub(crate) fn new() -> (Self, Receiver<()>) {
        let (signal_tx, signal_rx) = channel::bounded(1);
        let latch = Self {
            cell: OnceLock::new(),
            signal_tx,
        };
        (latch, signal_rx)
    }

    /// Record `error` unless a fatal condition is already latched, and wake
    /// the control thread. Losers are dropped silently.
    pub(crate) fn raise(&self, error: FatalError) {
        let reported = error.clone();
        if self.cell.set(error).is_ok() {
            log::error!("fatal: {reported}");
            let _ = self.signal_tx.try_send(());
        }
    }

    pub(crate) fn get(&self) -> Option<FatalError> {
        self.cell.get().cloned()
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.cell.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins() {
        let (latch, rx) = FatalLatch::new();
        assert!(!latch.is_raised());
        assert!(latch.get().is_none());

        latch.raise(FatalError::EventQueueFull);
        latch.raise(FatalError::Terminated(String::from("late")));

        assert!(latch.is_raised());
        assert_eq!(latch.get(), Some(FatalError::EventQueueFull));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn raising_from_another_thread_wakes_the_receiver() {
        let (latch, rx) = FatalLatch::new();
        let latch = std::sync::Arc::new(latch);
        let remote = latch.clone();

        let worker = std::thread::spawn(move || {
            remote.raise(FatalError::BackendShutdown(String::from("gone")));
        });
        worker.join().unwrap();

        assert!(rx.try_recv().is_ok());
        assert_eq!(
            latch.get(),
            Some(FatalError::BackendShutdown(String::from("gone")))
        );
    }
}
