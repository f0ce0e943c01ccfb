//! Buffer access within one processing cycle
//!
//! A [`ProcessScope`] is handed to the process handler and is the only way
//! to touch port buffers. A buffer must be acquired before use and can be
//! acquired at most once per cycle; each acquisition carries a cursor that
//! transfer operations advance. Acquisitions and cursors die with the scope
//! at the end of the cycle, failed cycles included, so no state leaks from
//! one cycle into the next.
//!
//! Operations dispatch on the kind and direction a port was registered
//! with, never on the shape of the data a caller supplies. Transfers
//! truncate at whatever extent is left past the cursor instead of failing;
//! only out-of-range seeks and malformed records are errors.

use std::collections::BTreeMap;
use std::ptr;

use basedrop::Shared;

use crate::backend::{Cycle, PortBuffer};
use crate::error::{CycleError, CycleResult, Result};
use crate::port::PortShared;
use crate::ring::Message;
use crate::runtime::SessionShared;
use crate::types::{
    ClientKey, MidiEvent, PortDirection, PortKey, PortKind, RingKey, Sample, WorkerKey,
};

/// What [`ProcessScope::acquire`] found in the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// Audio frames or custom records reachable through the cursor
    Frames(u32),
    /// Readable MIDI events, plus events the backend dropped beforehand
    MidiIn { events: u32, lost: u32 },
    /// Writable MIDI event slots; the buffer was cleared on acquire
    MidiOut { space: u32 },
}

/// One acquired buffer and its cursor
struct PortState {
    port: Shared<PortShared>,
    view: PortBuffer,
    cursor: usize,
}

impl PortState {
    /// Units in the buffer: frames, events or records by kind
    fn extent(&self) -> usize {
        match self.view {
            PortBuffer::Audio { frames, .. } => frames,
            PortBuffer::MidiIn { count, .. } => count,
            PortBuffer::MidiOut { capacity, .. } => capacity,
            PortBuffer::Custom { bytes, .. } => bytes / self.port.record_size(),
        }
    }

    fn remaining(&self) -> usize {
        self.extent().saturating_sub(self.cursor)
    }

    fn require(&self, kind: PortKind, direction: PortDirection) -> CycleResult<()> {
        if self.port.kind() != kind {
            return Err(CycleError::KindMismatch(self.port.kind()));
        }
        if self.port.direction() != direction {
            return Err(CycleError::DirectionMismatch(direction));
        }
        Ok(())
    }

    fn audio(&self) -> CycleResult<(*mut Sample, usize)> {
        match self.view {
            PortBuffer::Audio { ptr, frames } => Ok((ptr, frames)),
            _ => Err(mismatched_view()),
        }
    }

    fn midi_in(&self) -> CycleResult<(*const MidiEvent, usize)> {
        match self.view {
            PortBuffer::MidiIn { events, count, .. } => Ok((events, count)),
            _ => Err(mismatched_view()),
        }
    }

    fn midi_out(&self) -> CycleResult<(*mut Vec<MidiEvent>, usize)> {
        match self.view {
            PortBuffer::MidiOut { queue, capacity } => Ok((queue, capacity)),
            _ => Err(mismatched_view()),
        }
    }

    fn custom(&self) -> CycleResult<*mut u8> {
        match self.view {
            PortBuffer::Custom { ptr, .. } => Ok(ptr),
            _ => Err(mismatched_view()),
        }
    }
}

fn mismatched_view() -> CycleError {
    CycleError::Failed(String::from("buffer view does not match the port kind"))
}

/// Execution context of one processing cycle.
///
/// Created by the session for each cycle and lent to the process handler.
/// Ring and signal operations are reachable from here as well, restricted
/// to objects of the client being processed.
pub struct ProcessScope<'a, 'b> {
    frames: u32,
    client: ClientKey,
    session: &'a SessionShared,
    ports: &'a BTreeMap<PortKey, Shared<PortShared>>,
    cycle: &'a mut Cycle<'b>,
    states: BTreeMap<PortKey, PortState>,
}

impl<'a, 'b> ProcessScope<'a, 'b> {
    pub(crate) fn new(
        client: ClientKey,
        session: &'a SessionShared,
        ports: &'a BTreeMap<PortKey, Shared<PortShared>>,
        cycle: &'a mut Cycle<'b>,
    ) -> Self {
        Self {
            frames: cycle.frames(),
            client,
            session,
            ports,
            cycle,
            states: BTreeMap::new(),
        }
    }

    /// Frames in this cycle
    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Client being processed
    pub fn client(&self) -> ClientKey {
        self.client
    }

    /// The port exists and belongs to the client being processed
    fn check_known(&self, key: PortKey) -> CycleResult<()> {
        let port = self.ports.get(&key).ok_or(CycleError::InvalidPort)?;
        if port.client() != self.client {
            return Err(CycleError::ForeignPort);
        }
        Ok(())
    }

    fn state(&self, key: PortKey) -> CycleResult<&PortState> {
        self.check_known(key)?;
        self.states.get(&key).ok_or(CycleError::NotAcquired)
    }

    fn state_mut(&mut self, key: PortKey) -> CycleResult<&mut PortState> {
        self.check_known(key)?;
        self.states.get_mut(&key).ok_or(CycleError::NotAcquired)
    }

    /// Take hold of a port's buffer for the rest of the cycle.
    ///
    /// Reports what the buffer holds: frames or records for audio and
    /// custom ports, readable events and the backend's lost-event count for
    /// MIDI inputs, free slots for MIDI outputs. A MIDI output buffer is
    /// cleared here, so whatever a previous cycle left behind is gone the
    /// moment the port is acquired.
    pub fn acquire(&mut self, key: PortKey) -> CycleResult<Acquired> {
        self.check_known(key)?;
        if self.states.contains_key(&key) {
            return Err(CycleError::BufferAlreadyAcquired);
        }
        let port = self
            .ports
            .get(&key)
            .cloned()
            .ok_or(CycleError::InvalidPort)?;
        let view = self
            .cycle
            .buffer(port.backend_id())
            .ok_or_else(|| CycleError::Failed(String::from("backend returned no buffer")))?;
        let acquired = match view {
            PortBuffer::Audio { frames, .. } => Acquired::Frames(frames as u32),
            PortBuffer::MidiIn { count, lost, .. } => Acquired::MidiIn {
                events: count as u32,
                lost,
            },
            PortBuffer::MidiOut { queue, capacity } => {
                // SAFETY: the view is valid for this cycle, and acquire-once
                // makes this the only handle to the queue.
                unsafe { (*queue).clear() };
                Acquired::MidiOut {
                    space: capacity as u32,
                }
            }
            PortBuffer::Custom { bytes, .. } => {
                Acquired::Frames((bytes / port.record_size()) as u32)
            }
        };
        self.states.insert(
            key,
            PortState {
                port,
                view,
                cursor: 0,
            },
        );
        Ok(acquired)
    }

    /// Cursor position of an acquired buffer, in frames, events or records
    pub fn position(&self, key: PortKey) -> CycleResult<usize> {
        Ok(self.state(key)?.cursor)
    }

    /// Units left between the cursor and the end of the buffer
    pub fn remaining(&self, key: PortKey) -> CycleResult<usize> {
        Ok(self.state(key)?.remaining())
    }

    /// Move the cursor to an absolute position.
    ///
    /// Positions up to and including the extent are valid; anything past it
    /// is [`CycleError::OutOfRange`]. On MIDI ports only the input side has
    /// a seekable cursor. Returns the units remaining after the move.
    pub fn seek(&mut self, key: PortKey, position: usize) -> CycleResult<usize> {
        let state = self.state_mut(key)?;
        if state.port.kind() == PortKind::Midi && state.port.direction() != PortDirection::Input {
            return Err(CycleError::DirectionMismatch(PortDirection::Input));
        }
        if position > state.extent() {
            return Err(CycleError::OutOfRange);
        }
        state.cursor = position;
        Ok(state.remaining())
    }

    /// Copy samples from an audio input, advancing the cursor.
    ///
    /// Truncates at whichever runs out first, `out` or the buffer; returns
    /// the number of samples copied.
    pub fn read_audio(&mut self, key: PortKey, out: &mut [Sample]) -> CycleResult<usize> {
        let state = self.state_mut(key)?;
        state.require(PortKind::Audio, PortDirection::Input)?;
        let (ptr, _) = state.audio()?;
        let n = state.remaining().min(out.len());
        // SAFETY: the view is valid for this cycle, `cursor + n` stays
        // within its extent, and `out` is a distinct allocation.
        unsafe { ptr::copy_nonoverlapping(ptr.add(state.cursor).cast_const(), out.as_mut_ptr(), n) };
        state.cursor += n;
        Ok(n)
    }

    /// Copy samples into an audio output, advancing the cursor.
    ///
    /// Truncates at the end of the buffer; returns the number of samples
    /// written.
    pub fn write_audio(&mut self, key: PortKey, samples: &[Sample]) -> CycleResult<usize> {
        let state = self.state_mut(key)?;
        state.require(PortKind::Audio, PortDirection::Output)?;
        let (ptr, _) = state.audio()?;
        let n = state.remaining().min(samples.len());
        // SAFETY: the view is valid for this cycle, `cursor + n` stays
        // within its extent, and `samples` is a distinct allocation.
        unsafe { ptr::copy_nonoverlapping(samples.as_ptr(), ptr.add(state.cursor), n) };
        state.cursor += n;
        Ok(n)
    }

    /// Zero part of an output buffer, advancing the cursor.
    ///
    /// `count` limits how many frames or records are cleared; `None` clears
    /// to the end of the buffer. Returns the units cleared. MIDI outputs
    /// are cleared by [`acquire`](Self::acquire) instead.
    pub fn clear(&mut self, key: PortKey, count: Option<usize>) -> CycleResult<usize> {
        let state = self.state_mut(key)?;
        match state.port.kind() {
            PortKind::Audio => {
                if state.port.direction() != PortDirection::Output {
                    return Err(CycleError::DirectionMismatch(PortDirection::Output));
                }
                let (ptr, _) = state.audio()?;
                let n = state.remaining().min(count.unwrap_or(usize::MAX));
                // SAFETY: zeroed f32 is 0.0 and `cursor + n` stays within
                // the view's extent.
                unsafe { ptr::write_bytes(ptr.add(state.cursor), 0, n) };
                state.cursor += n;
                Ok(n)
            }
            PortKind::Custom => {
                if state.port.direction() != PortDirection::Output {
                    return Err(CycleError::DirectionMismatch(PortDirection::Output));
                }
                let record = state.port.record_size();
                let ptr = state.custom()?;
                let n = state.remaining().min(count.unwrap_or(usize::MAX));
                // SAFETY: `cursor + n` records stay within the view's extent
                unsafe { ptr::write_bytes(ptr.add(state.cursor * record), 0, n * record) };
                state.cursor += n;
                Ok(n)
            }
            PortKind::Midi => Err(CycleError::Unsupported(PortKind::Midi)),
        }
    }

    /// Next event from a MIDI input, or `None` past the last one
    pub fn read_midi(&mut self, key: PortKey) -> CycleResult<Option<MidiEvent>> {
        let state = self.state_mut(key)?;
        state.require(PortKind::Midi, PortDirection::Input)?;
        let (events, count) = state.midi_in()?;
        if state.cursor >= count {
            return Ok(None);
        }
        // SAFETY: `cursor < count` keeps the read in bounds and the backend
        // keeps the events alive for the cycle.
        let event = unsafe { (*events.add(state.cursor)).clone() };
        state.cursor += 1;
        Ok(Some(event))
    }

    /// Append one event to a MIDI output.
    ///
    /// `time` is the frame offset within the cycle. Returns 1 when the
    /// event was queued and 0 when the buffer is full or `time` would break
    /// the non-decreasing order of the queue.
    pub fn write_midi(&mut self, key: PortKey, time: u32, bytes: &[u8]) -> CycleResult<usize> {
        if bytes.is_empty() {
            return Err(CycleError::EmptyMidi);
        }
        let state = self.state_mut(key)?;
        state.require(PortKind::Midi, PortDirection::Output)?;
        let (queue, capacity) = state.midi_out()?;
        // SAFETY: the view is valid for this cycle and acquire-once makes
        // this the only handle to the queue.
        let queue = unsafe { &mut *queue };
        if queue.len() >= capacity || queue.last().is_some_and(|last| last.time > time) {
            return Ok(0);
        }
        queue.push(MidiEvent::new(time, bytes));
        state.cursor += 1;
        Ok(1)
    }

    /// Copy whole records from a custom input, advancing the cursor.
    ///
    /// Truncates at whichever runs out first, `out` or the buffer; returns
    /// the number of records copied.
    pub fn read_custom(&mut self, key: PortKey, out: &mut [u8]) -> CycleResult<usize> {
        let state = self.state_mut(key)?;
        state.require(PortKind::Custom, PortDirection::Input)?;
        let record = state.port.record_size();
        let ptr = state.custom()?;
        let n = state.remaining().min(out.len() / record);
        // SAFETY: `cursor + n` records stay within the view's extent and
        // `out` holds at least `n * record` bytes.
        unsafe {
            ptr::copy_nonoverlapping(
                ptr.add(state.cursor * record).cast_const(),
                out.as_mut_ptr(),
                n * record,
            )
        };
        state.cursor += n;
        Ok(n)
    }

    /// Copy whole records into a custom output, advancing the cursor.
    ///
    /// `data` must be a whole number of records; the write truncates at the
    /// end of the buffer and returns the number of records written.
    pub fn write_custom(&mut self, key: PortKey, data: &[u8]) -> CycleResult<usize> {
        let state = self.state_mut(key)?;
        state.require(PortKind::Custom, PortDirection::Output)?;
        let record = state.port.record_size();
        if data.len() % record != 0 {
            return Err(CycleError::RecordSize {
                len: data.len(),
                record,
            });
        }
        let ptr = state.custom()?;
        let n = state.remaining().min(data.len() / record);
        // SAFETY: `cursor + n` records stay within the view's extent and
        // `data` is a distinct allocation.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(state.cursor * record), n * record) };
        state.cursor += n;
        Ok(n)
    }

    /// Move data from an acquired input to an acquired output of the same
    /// kind, advancing both cursors.
    ///
    /// The transfer is bounded by what is left past each cursor and by
    /// `count` when given; the number of units moved is returned. A MIDI
    /// copy additionally stops at the first event that would land out of
    /// order behind events already written. Custom ports have no backend
    /// copy path.
    pub fn copy(&mut self, dst: PortKey, src: PortKey, count: Option<usize>) -> CycleResult<usize> {
        let (dst_kind, dst_rem) = {
            let state = self.state(dst)?;
            if state.port.direction() != PortDirection::Output {
                return Err(CycleError::DirectionMismatch(PortDirection::Output));
            }
            (state.port.kind(), state.remaining())
        };
        let (src_kind, src_rem) = {
            let state = self.state(src)?;
            if state.port.direction() != PortDirection::Input {
                return Err(CycleError::DirectionMismatch(PortDirection::Input));
            }
            (state.port.kind(), state.remaining())
        };
        if src_kind != dst_kind {
            return Err(CycleError::KindMismatch(src_kind));
        }
        let n = dst_rem.min(src_rem).min(count.unwrap_or(usize::MAX));

        let moved = match dst_kind {
            PortKind::Audio => {
                let (src_ptr, src_cursor) = {
                    let state = self.state(src)?;
                    (state.audio()?.0, state.cursor)
                };
                let (dst_ptr, dst_cursor) = {
                    let state = self.state(dst)?;
                    (state.audio()?.0, state.cursor)
                };
                // SAFETY: both views are valid for this cycle, distinct
                // ports never overlap, and `n` fits past both cursors.
                unsafe {
                    ptr::copy_nonoverlapping(
                        src_ptr.add(src_cursor).cast_const(),
                        dst_ptr.add(dst_cursor),
                        n,
                    )
                };
                n
            }
            PortKind::Midi => {
                let (events, src_cursor) = {
                    let state = self.state(src)?;
                    (state.midi_in()?.0, state.cursor)
                };
                let queue = self.state(dst)?.midi_out()?.0;
                // SAFETY: the input events stay alive for the cycle and
                // acquire-once makes this the only handle to the queue.
                unsafe {
                    let queue = &mut *queue;
                    let mut copied = 0;
                    for offset in 0..n {
                        let event = (*events.add(src_cursor + offset)).clone();
                        if queue.last().is_some_and(|last| last.time > event.time) {
                            break;
                        }
                        queue.push(event);
                        copied += 1;
                    }
                    copied
                }
            }
            PortKind::Custom => return Err(CycleError::Unsupported(PortKind::Custom)),
        };

        self.state_mut(src)?.cursor += moved;
        self.state_mut(dst)?.cursor += moved;
        Ok(moved)
    }

    /// Poke a worker of the client being processed
    pub fn signal(&self, worker: WorkerKey) -> Result<()> {
        self.session.signal_worker(self.client, worker)
    }

    /// Queue one tagged message on a ring buffer of this client
    pub fn ring_send(&self, ring: RingKey, tag: i32, data: &[u8]) -> Result<bool> {
        self.session.client_ring(self.client, ring)?.send(tag, data)
    }

    /// Dequeue the next message from a ring buffer of this client
    pub fn ring_receive(&self, ring: RingKey) -> Result<Option<Message>> {
        self.session.client_ring(self.client, ring)?.receive()
    }

    /// Bytes that currently fit into the ring
    pub fn ring_write_space(&self, ring: RingKey) -> Result<usize> {
        self.session.client_ring(self.client, ring)?.write_space()
    }

    /// Bytes currently readable from the ring
    pub fn ring_read_space(&self, ring: RingKey) -> Result<usize> {
        self.session.client_ring(self.client, ring)?.read_space()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendPortId, CycleBuffers};
    use crate::client::ClientShared;
    use crate::types::PortSpec;
    use crate::worker::WorkerShared;
    use basedrop::Collector;
    use std::sync::Arc;

    enum TestStore {
        Audio(Vec<Sample>),
        MidiIn(Vec<MidiEvent>, u32),
        MidiOut(Vec<MidiEvent>),
        Custom(Vec<u8>),
    }

    struct TestBuffers {
        stores: BTreeMap<BackendPortId, TestStore>,
    }

    impl CycleBuffers for TestBuffers {
        fn buffer(&mut self, id: BackendPortId, frames: u32) -> Option<PortBuffer> {
            Some(match self.stores.get_mut(&id)? {
                TestStore::Audio(samples) => {
                    samples.resize(frames as usize, 0.0);
                    PortBuffer::Audio {
                        ptr: samples.as_mut_ptr(),
                        frames: frames as usize,
                    }
                }
                TestStore::MidiIn(events, lost) => PortBuffer::MidiIn {
                    events: events.as_ptr(),
                    count: events.len(),
                    lost: *lost,
                },
                TestStore::MidiOut(queue) => PortBuffer::MidiOut {
                    queue: queue as *mut Vec<MidiEvent>,
                    capacity: frames as usize,
                },
                TestStore::Custom(bytes) => PortBuffer::Custom {
                    ptr: bytes.as_mut_ptr(),
                    bytes: bytes.len(),
                },
            })
        }
    }

    fn harness(
        specs: Vec<(PortSpec, TestStore)>,
    ) -> (Collector, Arc<SessionShared>, ClientKey, Vec<PortKey>, TestBuffers) {
        let collector = Collector::new();
        let handle = collector.handle();
        let (shared, _channels) = SessionShared::new(&handle);
        let shared = Arc::new(shared);
        let (client, _) = shared.clients.insert(&handle, ClientShared::new("scope"));
        let mut stores = BTreeMap::new();
        let mut keys = Vec::new();
        for (index, (spec, store)) in specs.into_iter().enumerate() {
            let id = BackendPortId(index as u64 + 1);
            let (key, _) = shared.ports.insert(&handle, PortShared::new(client, &spec, id));
            stores.insert(id, store);
            keys.push(key);
        }
        (collector, shared, client, keys, TestBuffers { stores })
    }

    #[test]
    fn buffers_acquire_once_and_reset_every_cycle() {
        let (_collector, shared, client, keys, mut buffers) = harness(vec![(
            PortSpec::audio("out", PortDirection::Output),
            TestStore::Audio(Vec::new()),
        )]);
        let out = keys[0];
        let ports = shared.ports.snapshot();

        {
            let mut cycle = Cycle::new(8, &mut buffers);
            let mut scope = ProcessScope::new(client, &shared, &ports, &mut cycle);
            assert_eq!(scope.acquire(out).unwrap(), Acquired::Frames(8));
            assert!(matches!(
                scope.acquire(out),
                Err(CycleError::BufferAlreadyAcquired)
            ));
            assert_eq!(scope.write_audio(out, &[0.5; 3]).unwrap(), 3);
            assert_eq!(scope.position(out).unwrap(), 3);
        }

        // Next cycle starts from scratch
        let mut cycle = Cycle::new(8, &mut buffers);
        let mut scope = ProcessScope::new(client, &shared, &ports, &mut cycle);
        assert_eq!(scope.acquire(out).unwrap(), Acquired::Frames(8));
        assert_eq!(scope.position(out).unwrap(), 0);
    }

    #[test]
    fn audio_io_truncates_at_the_extent() {
        let (_collector, shared, client, keys, mut buffers) = harness(vec![
            (
                PortSpec::audio("in", PortDirection::Input),
                TestStore::Audio((0..8).map(|i| i as Sample).collect()),
            ),
            (
                PortSpec::audio("out", PortDirection::Output),
                TestStore::Audio(Vec::new()),
            ),
        ]);
        let (input, output) = (keys[0], keys[1]);
        let ports = shared.ports.snapshot();

        {
            let mut cycle = Cycle::new(8, &mut buffers);
            let mut scope = ProcessScope::new(client, &shared, &ports, &mut cycle);
            scope.acquire(input).unwrap();
            scope.acquire(output).unwrap();

            let mut samples = [0.0; 5];
            assert_eq!(scope.read_audio(input, &mut samples).unwrap(), 5);
            assert_eq!(samples, [0.0, 1.0, 2.0, 3.0, 4.0]);
            assert_eq!(scope.read_audio(input, &mut samples).unwrap(), 3);
            assert_eq!(&samples[..3], &[5.0, 6.0, 7.0]);
            assert_eq!(scope.read_audio(input, &mut samples).unwrap(), 0);

            assert_eq!(scope.write_audio(output, &[1.0; 6]).unwrap(), 6);
            assert_eq!(scope.write_audio(output, &[2.0; 6]).unwrap(), 2);
            assert_eq!(scope.remaining(output).unwrap(), 0);
            assert_eq!(scope.clear(output, None).unwrap(), 0);
        }

        let TestStore::Audio(written) = &buffers.stores[&BackendPortId(2)] else {
            panic!("store changed kind");
        };
        assert_eq!(written[..6], [1.0; 6]);
        assert_eq!(written[6..], [2.0; 2]);
    }

    #[test]
    fn seek_stays_inside_the_extent() {
        let (_collector, shared, client, keys, mut buffers) = harness(vec![(
            PortSpec::audio("out", PortDirection::Output),
            TestStore::Audio(Vec::new()),
        )]);
        let out = keys[0];
        let ports = shared.ports.snapshot();

        let mut cycle = Cycle::new(8, &mut buffers);
        let mut scope = ProcessScope::new(client, &shared, &ports, &mut cycle);
        scope.acquire(out).unwrap();

        assert_eq!(scope.seek(out, 5).unwrap(), 3);
        assert_eq!(scope.position(out).unwrap(), 5);
        assert_eq!(scope.seek(out, 8).unwrap(), 0);
        assert!(matches!(scope.seek(out, 9), Err(CycleError::OutOfRange)));
        // A failed seek leaves the cursor alone
        assert_eq!(scope.position(out).unwrap(), 8);
        assert_eq!(scope.clear(out, Some(4)).unwrap(), 0);
        assert_eq!(scope.seek(out, 0).unwrap(), 8);
        assert_eq!(scope.clear(out, Some(4)).unwrap(), 4);
    }

    #[test]
    fn copy_moves_the_overlap_of_both_cursors() {
        let (_collector, shared, client, keys, mut buffers) = harness(vec![
            (
                PortSpec::audio("in", PortDirection::Input),
                TestStore::Audio((0..8).map(|i| i as Sample).collect()),
            ),
            (
                PortSpec::audio("out", PortDirection::Output),
                TestStore::Audio(Vec::new()),
            ),
        ]);
        let (input, output) = (keys[0], keys[1]);
        let ports = shared.ports.snapshot();

        {
            let mut cycle = Cycle::new(8, &mut buffers);
            let mut scope = ProcessScope::new(client, &shared, &ports, &mut cycle);
            scope.acquire(input).unwrap();
            scope.acquire(output).unwrap();

            scope.seek(input, 5).unwrap();
            scope.seek(output, 3).unwrap();
            // 3 left at the source, 5 at the destination, 10 requested
            assert_eq!(scope.copy(output, input, Some(10)).unwrap(), 3);
            assert_eq!(scope.position(input).unwrap(), 8);
            assert_eq!(scope.position(output).unwrap(), 6);
        }

        let TestStore::Audio(written) = &buffers.stores[&BackendPortId(2)] else {
            panic!("store changed kind");
        };
        assert_eq!(written[3..6], [5.0, 6.0, 7.0]);
    }

    #[test]
    fn midi_events_flow_in_time_order() {
        let (_collector, shared, client, keys, mut buffers) = harness(vec![
            (
                PortSpec::midi("in", PortDirection::Input),
                TestStore::MidiIn(
                    vec![
                        MidiEvent::new(1, [0x90, 60, 100]),
                        MidiEvent::new(4, [0x80, 60, 0]),
                    ],
                    2,
                ),
            ),
            (
                PortSpec::midi("out", PortDirection::Output),
                TestStore::MidiOut(vec![MidiEvent::new(0, [0xf8])]),
            ),
        ]);
        let (input, output) = (keys[0], keys[1]);
        let ports = shared.ports.snapshot();

        {
            let mut cycle = Cycle::new(2, &mut buffers);
            let mut scope = ProcessScope::new(client, &shared, &ports, &mut cycle);
            assert_eq!(
                scope.acquire(input).unwrap(),
                Acquired::MidiIn { events: 2, lost: 2 }
            );
            // Acquire clears whatever the previous cycle left queued
            assert_eq!(
                scope.acquire(output).unwrap(),
                Acquired::MidiOut { space: 2 }
            );

            assert_eq!(scope.read_midi(input).unwrap().unwrap().time, 1);
            assert_eq!(scope.read_midi(input).unwrap().unwrap().bytes, [0x80, 60, 0]);
            assert!(scope.read_midi(input).unwrap().is_none());
            assert_eq!(scope.remaining(input).unwrap(), 0);

            assert!(matches!(
                scope.write_midi(output, 0, &[]),
                Err(CycleError::EmptyMidi)
            ));
            assert_eq!(scope.write_midi(output, 3, &[0xf8]).unwrap(), 1);
            // Earlier than the queue tail: refused
            assert_eq!(scope.write_midi(output, 1, &[0xfa]).unwrap(), 0);
            assert_eq!(scope.write_midi(output, 5, &[0xfb]).unwrap(), 1);
            // Full
            assert_eq!(scope.write_midi(output, 6, &[0xfc]).unwrap(), 0);
        }

        let TestStore::MidiOut(queue) = &buffers.stores[&BackendPortId(2)] else {
            panic!("store changed kind");
        };
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0], MidiEvent::new(3, [0xf8]));
        assert_eq!(queue[1], MidiEvent::new(5, [0xfb]));
    }

    #[test]
    fn custom_ports_move_whole_records() {
        let (_collector, shared, client, keys, mut buffers) = harness(vec![
            (
                PortSpec::custom("state-in", PortDirection::Input, 4),
                TestStore::Custom(vec![9, 9, 9, 9, 8, 8, 8, 8]),
            ),
            (
                PortSpec::custom("state-out", PortDirection::Output, 4),
                TestStore::Custom(vec![0; 16]),
            ),
        ]);
        let (input, output) = (keys[0], keys[1]);
        let ports = shared.ports.snapshot();

        {
            let mut cycle = Cycle::new(8, &mut buffers);
            let mut scope = ProcessScope::new(client, &shared, &ports, &mut cycle);
            assert_eq!(scope.acquire(input).unwrap(), Acquired::Frames(2));
            assert_eq!(scope.acquire(output).unwrap(), Acquired::Frames(4));

            assert!(matches!(
                scope.write_custom(output, &[1, 2, 3]),
                Err(CycleError::RecordSize { len: 3, record: 4 })
            ));
            assert_eq!(scope.write_custom(output, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap(), 2);
            assert_eq!(scope.remaining(output).unwrap(), 2);
            assert_eq!(scope.write_custom(output, &[7; 12]).unwrap(), 2);

            let mut out = [0u8; 12];
            assert_eq!(scope.read_custom(input, &mut out).unwrap(), 2);
            assert_eq!(&out[..8], &[9, 9, 9, 9, 8, 8, 8, 8]);

            assert!(matches!(
                scope.copy(output, input, None),
                Err(CycleError::Unsupported(PortKind::Custom))
            ));
        }

        let TestStore::Custom(bytes) = &buffers.stores[&BackendPortId(2)] else {
            panic!("store changed kind");
        };
        assert_eq!(&bytes[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[8..], &[7; 8]);
    }

    #[test]
    fn kind_and_direction_checks_come_from_registration() {
        let (_collector, shared, client, keys, mut buffers) = harness(vec![
            (
                PortSpec::audio("in", PortDirection::Input),
                TestStore::Audio(Vec::new()),
            ),
            (
                PortSpec::audio("out", PortDirection::Output),
                TestStore::Audio(Vec::new()),
            ),
            (
                PortSpec::midi("events", PortDirection::Output),
                TestStore::MidiOut(Vec::new()),
            ),
        ]);
        let (input, output, midi) = (keys[0], keys[1], keys[2]);
        let ports = shared.ports.snapshot();

        let mut cycle = Cycle::new(4, &mut buffers);
        let mut scope = ProcessScope::new(client, &shared, &ports, &mut cycle);
        scope.acquire(input).unwrap();
        scope.acquire(output).unwrap();
        scope.acquire(midi).unwrap();

        let mut samples = [0.0; 4];
        assert!(matches!(
            scope.read_audio(output, &mut samples),
            Err(CycleError::DirectionMismatch(PortDirection::Input))
        ));
        assert!(matches!(
            scope.write_audio(input, &samples),
            Err(CycleError::DirectionMismatch(PortDirection::Output))
        ));
        assert!(matches!(
            scope.write_midi(output, 0, &[0xf8]),
            Err(CycleError::KindMismatch(PortKind::Audio))
        ));
        assert!(matches!(
            scope.clear(midi, None),
            Err(CycleError::Unsupported(PortKind::Midi))
        ));
        assert!(matches!(
            scope.seek(midi, 0),
            Err(CycleError::DirectionMismatch(PortDirection::Input))
        ));
        assert!(matches!(
            scope.copy(midi, input, None),
            Err(CycleError::KindMismatch(PortKind::Audio))
        ));
    }

    #[test]
    fn unknown_foreign_and_unacquired_ports_are_told_apart() {
        let (collector, shared, client, keys, mut buffers) = harness(vec![(
            PortSpec::audio("mine", PortDirection::Output),
            TestStore::Audio(Vec::new()),
        )]);
        let mine = keys[0];
        let handle = collector.handle();
        let (other_client, _) = shared.clients.insert(&handle, ClientShared::new("beta"));
        let (foreign, _) = shared.ports.insert(
            &handle,
            PortShared::new(
                other_client,
                &PortSpec::audio("theirs", PortDirection::Output),
                BackendPortId(99),
            ),
        );
        let ports = shared.ports.snapshot();

        let mut cycle = Cycle::new(4, &mut buffers);
        let mut scope = ProcessScope::new(client, &shared, &ports, &mut cycle);

        assert!(matches!(
            scope.acquire(PortKey(777)),
            Err(CycleError::InvalidPort)
        ));
        assert!(matches!(scope.acquire(foreign), Err(CycleError::ForeignPort)));
        assert!(matches!(
            scope.write_audio(foreign, &[0.0]),
            Err(CycleError::ForeignPort)
        ));
        assert!(matches!(
            scope.write_audio(mine, &[0.0]),
            Err(CycleError::NotAcquired)
        ));
        assert!(matches!(
            scope.position(PortKey(777)),
            Err(CycleError::InvalidPort)
        ));
    }

    #[test]
    fn scope_ring_and_signal_ops_check_ownership() {
        let (collector, shared, client, _keys, mut buffers) = harness(Vec::new());
        let handle = collector.handle();
        let (other_client, _) = shared.clients.insert(&handle, ClientShared::new("beta"));

        let (ring, _rx) = crate::ring::RingShared::new(client, 64);
        let (mine, _) = shared.rings.insert(&handle, ring);
        let (ring, _rx) = crate::ring::RingShared::new(other_client, 64);
        let (foreign, _) = shared.rings.insert(&handle, ring);
        let (worker, _) = shared
            .workers
            .insert(&handle, WorkerShared::new(other_client, "theirs"));

        let ports = shared.ports.snapshot();
        let mut cycle = Cycle::new(4, &mut buffers);
        let scope = ProcessScope::new(client, &shared, &ports, &mut cycle);

        assert!(scope.ring_send(mine, 9, b"cue").unwrap());
        assert_eq!(scope.ring_read_space(mine).unwrap(), 8 + 3);
        let message = scope.ring_receive(mine).unwrap().unwrap();
        assert_eq!(message.tag, 9);
        assert!(scope.ring_write_space(mine).unwrap() >= 8 + 3);

        assert!(matches!(
            scope.ring_send(foreign, 0, b""),
            Err(crate::error::Error::NotOwner(
                crate::error::ReferenceKind::Ring
            ))
        ));
        assert!(matches!(
            scope.signal(worker),
            Err(crate::error::Error::NotOwner(
                crate::error::ReferenceKind::Worker
            ))
        ));
    }
}
