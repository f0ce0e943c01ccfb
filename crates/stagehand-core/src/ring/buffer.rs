//! Raw byte transport over an SPSC ring
//!
//! The storage is an [`rtrb`] single-producer single-consumer ring of bytes.
//! Each side lives in an [`Exclusive`] cell: any thread may attempt an
//! operation, one holder at a time per side, and a contended side reports
//! [`Error::RingBusy`] instead of blocking.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::{self, Receiver, Sender};
use rtrb::chunks::ChunkError;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::error::{Error, Result};
use crate::types::ClientKey;

/// Single-holder cell around a value that is not itself `Sync`.
///
/// `try_lock` either hands out the sole guard or fails immediately, which is
/// the only acquire discipline allowed on the real-time path.
pub(super) struct Exclusive<T> {
    busy: AtomicBool,
    cell: UnsafeCell<T>,
}

// SAFETY: the compare-exchange in `try_lock` admits one guard at a time, so
// the `&mut T` reachable through a guard is never aliased. `T: Send` is
// required because whichever thread wins the cell gets the value.
unsafe impl<T: Send> Send for Exclusive<T> {}
unsafe impl<T: Send> Sync for Exclusive<T> {}

impl<T> Exclusive<T> {
    pub(super) fn new(value: T) -> Self {
        Self {
            busy: AtomicBool::new(false),
            cell: UnsafeCell::new(value),
        }
    }

    /// Take the cell, or `None` while another holder is inside
    pub(super) fn try_lock(&self) -> Option<ExclusiveGuard<'_, T>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(ExclusiveGuard { owner: self })
        } else {
            None
        }
    }
}

pub(super) struct ExclusiveGuard<'a, T> {
    owner: &'a Exclusive<T>,
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means holding the cell
        unsafe { &*self.owner.cell.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means holding the cell
        unsafe { &mut *self.owner.cell.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.busy.store(false, Ordering::Release);
    }
}

/// Shared state of one ring buffer
pub(crate) struct RingShared {
    client: ClientKey,
    capacity: usize,
    producer: Exclusive<Producer<u8>>,
    consumer: Exclusive<Consumer<u8>>,
    signal_tx: Sender<()>,
}

impl RingShared {
    /// Build a ring of `capacity` bytes. The returned receiver becomes ready
    /// whenever a message lands in the ring; it holds at most one pending
    /// tickle.
    pub(crate) fn new(client: ClientKey, capacity: usize) -> (Self, Receiver<()>) {
        let (producer, consumer) = RingBuffer::new(capacity);
        let (signal_tx, signal_rx) = channel::bounded(1);
        let ring = Self {
            client,
            capacity,
            producer: Exclusive::new(producer),
            consumer: Exclusive::new(consumer),
            signal_tx,
        };
        (ring, signal_rx)
    }

    pub(crate) fn client(&self) -> ClientKey {
        self.client
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(super) fn lock_producer(&self) -> Result<ExclusiveGuard<'_, Producer<u8>>> {
        self.producer.try_lock().ok_or(Error::RingBusy)
    }

    pub(super) fn lock_consumer(&self) -> Result<ExclusiveGuard<'_, Consumer<u8>>> {
        self.consumer.try_lock().ok_or(Error::RingBusy)
    }

    pub(super) fn notify_data_ready(&self) {
        let _ = self.signal_tx.try_send(());
    }

    /// Bytes that can be written right now
    pub(crate) fn write_space(&self) -> Result<usize> {
        Ok(self.lock_producer()?.slots())
    }

    /// Bytes that can be read right now
    pub(crate) fn read_space(&self) -> Result<usize> {
        Ok(self.lock_consumer()?.slots())
    }

    /// Write as many bytes as currently fit, returning how many were taken
    pub(crate) fn write(&self, bytes: &[u8]) -> Result<usize> {
        let mut producer = self.lock_producer()?;
        let n = producer.slots().min(bytes.len());
        if push_bytes(&mut producer, &bytes[..n]) {
            drop(producer);
            if n > 0 {
                self.notify_data_ready();
            }
            Ok(n)
        } else {
            Ok(0)
        }
    }

    /// Read up to `buf.len()` bytes, returning how many were copied
    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut consumer = self.lock_consumer()?;
        Ok(pull_bytes(&mut consumer, buf, true))
    }

    /// Copy up to `buf.len()` bytes without consuming them
    pub(crate) fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        let mut consumer = self.lock_consumer()?;
        Ok(pull_bytes(&mut consumer, buf, false))
    }

    /// Discard everything currently readable
    pub(crate) fn reset(&self) -> Result<()> {
        let mut consumer = self.lock_consumer()?;
        let n = consumer.slots();
        if n > 0 {
            if let Ok(chunk) = consumer.read_chunk(n) {
                chunk.commit_all();
            }
        }
        Ok(())
    }
}

/// Copy `bytes` into the ring. The caller has checked there is room; a full
/// ring leaves the transport untouched and returns false.
pub(super) fn push_bytes(producer: &mut Producer<u8>, bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return true;
    }
    match producer.write_chunk(bytes.len()) {
        Ok(mut chunk) => {
            let (a, b) = chunk.as_mut_slices();
            let split = a.len();
            a.copy_from_slice(&bytes[..split]);
            b.copy_from_slice(&bytes[split..]);
            chunk.commit_all();
            true
        }
        Err(ChunkError::TooFewSlots(_)) => false,
    }
}

/// Copy up to `buf.len()` readable bytes out, consuming them only when
/// `consume` is set
fn pull_bytes(consumer: &mut Consumer<u8>, buf: &mut [u8], consume: bool) -> usize {
    let n = consumer.slots().min(buf.len());
    if n == 0 {
        return 0;
    }
    match consumer.read_chunk(n) {
        Ok(chunk) => {
            let (a, b) = chunk.as_slices();
            buf[..a.len()].copy_from_slice(a);
            buf[a.len()..n].copy_from_slice(b);
            if consume {
                chunk.commit_all();
            }
            n
        }
        Err(ChunkError::TooFewSlots(_)) => 0,
    }
}
