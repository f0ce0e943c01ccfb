//! Tagged message framing over the byte ring
//!
//! Wire format: an 8-byte native-endian header, a 32-bit signed tag followed
//! by a 32-bit payload length, then the payload bytes. Sends are
//! all-or-nothing: nothing is written unless header and payload both fit, so
//! a reader never sees a torn payload. The header does become visible before
//! the payload; a ring holding a header but not yet the full payload reads as
//! empty until the rest arrives.

use rtrb::chunks::ChunkError;
use rtrb::Consumer;

use super::buffer::{push_bytes, RingShared};
use crate::error::{Error, Result};

/// Size of the tag + length preamble
pub(crate) const HEADER_LEN: usize = 8;

/// One framed message read from a ring buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Application-chosen tag
    pub tag: i32,
    /// Payload bytes
    pub data: Vec<u8>,
}

impl RingShared {
    /// Queue one tagged message. `Ok(false)` means the ring is too full right
    /// now and nothing was written.
    pub(crate) fn send(&self, tag: i32, data: &[u8]) -> Result<bool> {
        let total = HEADER_LEN + data.len();
        if total > self.capacity() {
            return Err(Error::MessageTooLong {
                len: data.len(),
                capacity: self.capacity(),
            });
        }
        let mut producer = self.lock_producer()?;
        if producer.slots() < total {
            return Ok(false);
        }
        // Header first, payload second; readers wait for the full frame
        let header = encode_header(tag, data.len() as u32);
        if !push_bytes(&mut producer, &header) || !push_bytes(&mut producer, data) {
            return Ok(false);
        }
        drop(producer);
        self.notify_data_ready();
        Ok(true)
    }

    /// Dequeue the next message, or `None` when no complete frame is ready
    pub(crate) fn receive(&self) -> Result<Option<Message>> {
        let mut consumer = self.lock_consumer()?;
        Ok(take_frame(&mut consumer, true))
    }

    /// Read the next message without consuming it
    pub(crate) fn peek_message(&self) -> Result<Option<Message>> {
        let mut consumer = self.lock_consumer()?;
        Ok(take_frame(&mut consumer, false))
    }
}

fn encode_header(tag: i32, len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&tag.to_ne_bytes());
    header[4..].copy_from_slice(&len.to_ne_bytes());
    header
}

fn decode_header(header: &[u8; HEADER_LEN]) -> (i32, u32) {
    let mut tag = [0u8; 4];
    let mut len = [0u8; 4];
    tag.copy_from_slice(&header[..4]);
    len.copy_from_slice(&header[4..]);
    (i32::from_ne_bytes(tag), u32::from_ne_bytes(len))
}

/// Decode one frame from the consumer side. With `consume` unset the ring is
/// left exactly as found.
fn take_frame(consumer: &mut Consumer<u8>, consume: bool) -> Option<Message> {
    let header = peek_header(consumer)?;
    let (tag, len) = decode_header(&header);
    let total = HEADER_LEN + len as usize;
    let chunk = match consumer.read_chunk(total) {
        Ok(chunk) => chunk,
        // Header is in, payload still on its way
        Err(ChunkError::TooFewSlots(_)) => return None,
    };
    let (a, b) = chunk.as_slices();
    let mut data = Vec::with_capacity(len as usize);
    if a.len() >= HEADER_LEN {
        data.extend_from_slice(&a[HEADER_LEN..]);
        data.extend_from_slice(b);
    } else {
        data.extend_from_slice(&b[HEADER_LEN - a.len()..]);
    }
    if consume {
        chunk.commit_all();
    }
    Some(Message { tag, data })
}

/// Copy the 8-byte header out without consuming it
fn peek_header(consumer: &mut Consumer<u8>) -> Option<[u8; HEADER_LEN]> {
    let chunk = match consumer.read_chunk(HEADER_LEN) {
        Ok(chunk) => chunk,
        Err(ChunkError::TooFewSlots(_)) => return None,
    };
    let (a, b) = chunk.as_slices();
    let mut header = [0u8; HEADER_LEN];
    header[..a.len()].copy_from_slice(a);
    header[a.len()..].copy_from_slice(b);
    // Dropping the chunk uncommitted leaves the bytes in place
    drop(chunk);
    Some(header)
}
