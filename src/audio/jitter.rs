//! Per-speaker jitter buffer
//!
//! Packets are admitted keyed by sequence number and released one at a
//! time, lowest key first. A release happens only while the output slot
//! is empty and one of these holds:
//!
//! - the store has reached the target depth
//! - an end-of-spurt packet is waiting (the speaker stopped talking)
//! - no packet arrived for the flush interval (input stalled)
//! - [`JitterBuffer::drain`] was called
//!
//! Packets older than what has already been released are dropped as late,
//! so consumers always see strictly ascending sequence numbers.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::constants::MIN_JITTER_DEPTH;

/// A sequence number this far below the release point means the sender restarted
pub const SEQUENCE_RESTART_WINDOW: u32 = 1000;

/// One admitted packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterEntry {
    pub sequence: u32,
    /// End of talk spurt
    pub last: bool,
    pub payload: Bytes,
}

/// Why [`JitterBuffer::add`] refused a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Accepted,
    Late,
    Duplicate,
    Closed,
}

struct JitterState {
    store: BTreeMap<u32, JitterEntry>,
    released: Option<JitterEntry>,
    target_depth: usize,
    /// Sequence of the last popped entry, cleared at the end of a spurt
    last_popped: Option<u32>,
    /// (previous popped + 1) - current popped
    missed: i64,
    pending_last: usize,
    last_add: Option<Instant>,
    draining: bool,
    closed: bool,
    stats: JitterStats,
}

impl JitterState {
    /// Nothing at or below this key may enter the store
    fn floor(&self) -> Option<u32> {
        self.released
            .as_ref()
            .map(|entry| entry.sequence)
            .or(self.last_popped)
    }

    fn reset(&mut self) {
        self.store.clear();
        self.released = None;
        self.last_popped = None;
        self.missed = 0;
        self.pending_last = 0;
        self.draining = false;
    }
}

/// Reordering buffer for one speaker
pub struct JitterBuffer {
    state: Mutex<JitterState>,
    ready: Condvar,
    flush_after: Duration,
}

impl JitterBuffer {
    /// `target_depth` below 2 is raised to 2
    pub fn new(target_depth: usize, flush_after: Duration) -> Self {
        Self {
            state: Mutex::new(JitterState {
                store: BTreeMap::new(),
                released: None,
                target_depth: target_depth.max(MIN_JITTER_DEPTH),
                last_popped: None,
                missed: 0,
                pending_last: 0,
                last_add: None,
                draining: false,
                closed: false,
                stats: JitterStats::default(),
            }),
            ready: Condvar::new(),
            flush_after,
        }
    }

    /// Admit a packet. Never blocks on the consumer.
    pub fn add(&self, sequence: u32, last: bool, payload: Bytes) -> AddOutcome {
        let mut state = self.state.lock();
        if state.closed {
            return AddOutcome::Closed;
        }

        if let Some(floor) = state.floor() {
            if sequence <= floor {
                if floor - sequence > SEQUENCE_RESTART_WINDOW {
                    tracing::debug!(sequence, floor, "sequence restart, resetting jitter buffer");
                    state.reset();
                } else {
                    state.stats.late += 1;
                    return AddOutcome::Late;
                }
            }
        }

        if state.store.contains_key(&sequence) {
            state.stats.duplicates += 1;
            return AddOutcome::Duplicate;
        }

        state.store.insert(
            sequence,
            JitterEntry {
                sequence,
                last,
                payload,
            },
        );
        if last {
            state.pending_last += 1;
        }
        state.last_add = Some(Instant::now());
        state.stats.received += 1;

        self.release_ready(&mut state, Instant::now());
        // a waiting pop re-arms its stall deadline even without a release
        self.ready.notify_one();
        AddOutcome::Accepted
    }

    /// Move the lowest entry to the output slot if the drain policy allows it
    fn release_ready(&self, state: &mut JitterState, now: Instant) -> bool {
        if state.released.is_some() || state.store.is_empty() {
            return false;
        }

        let stalled = state
            .last_add
            .map_or(false, |at| now.duration_since(at) >= self.flush_after);
        let full = state.store.len() >= state.target_depth;
        if !(full || stalled || state.draining || state.pending_last > 0) {
            return false;
        }

        if let Some((_, entry)) = state.store.pop_first() {
            if entry.last {
                state.pending_last -= 1;
            }
            if stalled && !full {
                state.stats.flushed += 1;
            }
            state.released = Some(entry);
        }
        if state.store.is_empty() {
            state.draining = false;
        }
        true
    }

    fn take_released(&self, state: &mut JitterState) -> Option<JitterEntry> {
        let entry = state.released.take()?;

        state.missed = match state.last_popped {
            Some(previous) => previous as i64 + 1 - entry.sequence as i64,
            None => 0,
        };
        if state.missed < 0 {
            state.stats.lost += state.missed.unsigned_abs();
        }
        state.last_popped = if entry.last { None } else { Some(entry.sequence) };
        state.stats.released += 1;

        self.release_ready(state, Instant::now());
        Some(entry)
    }

    /// Block until an entry is released. Returns `None` once closed.
    pub fn pop(&self) -> Option<JitterEntry> {
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = self.take_released(&mut state) {
                return Some(entry);
            }
            if state.closed {
                return None;
            }

            match state.last_add {
                Some(at) if !state.store.is_empty() => {
                    let deadline = at + self.flush_after;
                    self.ready.wait_until(&mut state, deadline);
                }
                _ => self.ready.wait(&mut state),
            }
            self.release_ready(&mut state, Instant::now());
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<JitterEntry> {
        let give_up = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = self.take_released(&mut state) {
                return Some(entry);
            }
            if state.closed || Instant::now() >= give_up {
                return None;
            }

            let deadline = match state.last_add {
                Some(at) if !state.store.is_empty() => give_up.min(at + self.flush_after),
                _ => give_up,
            };
            self.ready.wait_until(&mut state, deadline);
            self.release_ready(&mut state, Instant::now());
        }
    }

    /// Non-blocking pop; also applies the stall flush
    pub fn try_pop(&self) -> Option<JitterEntry> {
        let mut state = self.state.lock();
        self.release_ready(&mut state, Instant::now());
        self.take_released(&mut state)
    }

    /// Whether the last pop skipped over sequence numbers
    pub fn missed_packets(&self) -> bool {
        self.state.lock().missed != 0
    }

    /// Number of packets skipped by the last pop
    pub fn missed_count(&self) -> u32 {
        let missed = self.state.lock().missed;
        if missed < 0 {
            missed.unsigned_abs().min(u32::MAX as u64) as u32
        } else {
            0
        }
    }

    /// Set the target depth; values below 2 are raised to 2
    pub fn set_size(&self, target_depth: usize) {
        let mut state = self.state.lock();
        state.target_depth = target_depth.max(MIN_JITTER_DEPTH);
        if self.release_ready(&mut state, Instant::now()) {
            self.ready.notify_one();
        }
    }

    pub fn target_depth(&self) -> usize {
        self.state.lock().target_depth
    }

    /// Release everything currently stored regardless of depth
    pub fn drain(&self) {
        let mut state = self.state.lock();
        if state.store.is_empty() {
            return;
        }
        state.draining = true;
        if self.release_ready(&mut state, Instant::now()) {
            self.ready.notify_one();
        }
    }

    /// Stored plus released entries
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.store.len() + state.released.is_some() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget all entries and the loss baseline
    pub fn clear(&self) {
        self.state.lock().reset();
    }

    /// Wake blocked poppers; later adds are refused
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.ready.notify_all();
    }

    pub fn stats(&self) -> JitterStats {
        let state = self.state.lock();
        JitterStats {
            level: state.store.len() + state.released.is_some() as usize,
            ..state.stats.clone()
        }
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Default)]
pub struct JitterStats {
    pub level: usize,
    pub received: u64,
    pub released: u64,
    pub late: u64,
    pub duplicates: u64,
    pub lost: u64,
    /// Releases forced by the stall flush
    pub flushed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    const LONG: Duration = Duration::from_secs(60);

    fn payload(seq: u32) -> Bytes {
        Bytes::from(seq.to_be_bytes().to_vec())
    }

    #[test]
    fn test_holds_until_depth() {
        let jitter = JitterBuffer::new(3, LONG);
        jitter.add(2, false, payload(2));
        jitter.add(1, false, payload(1));
        assert!(jitter.try_pop().is_none());

        jitter.add(3, false, payload(3));
        let entry = jitter.try_pop().unwrap();
        assert_eq!(entry.sequence, 1);
        assert_eq!(entry.payload, payload(1));
    }

    #[test]
    fn test_gap_flagged_once() {
        let jitter = JitterBuffer::new(3, LONG);
        jitter.add(1, false, payload(1));
        jitter.add(2, false, payload(2));
        jitter.add(4, false, payload(4));
        jitter.drain();

        let mut gaps = Vec::new();
        for _ in 0..3 {
            let entry = jitter.try_pop().unwrap();
            gaps.push((entry.sequence, jitter.missed_packets()));
        }

        assert_eq!(gaps, vec![(1, false), (2, false), (4, true)]);
        assert_eq!(jitter.missed_count(), 1);
        assert_eq!(jitter.stats().lost, 1);
    }

    #[test]
    fn test_late_packet_dropped() {
        let jitter = JitterBuffer::new(2, LONG);
        jitter.add(5, false, payload(5));
        jitter.add(6, false, payload(6));
        assert_eq!(jitter.try_pop().unwrap().sequence, 5);

        assert_eq!(jitter.add(4, false, payload(4)), AddOutcome::Late);
        assert_eq!(jitter.add(6, false, payload(6)), AddOutcome::Duplicate);
        assert_eq!(jitter.stats().late, 1);
    }

    #[test]
    fn test_end_of_spurt_drains() {
        let jitter = JitterBuffer::new(10, LONG);
        jitter.add(1, false, payload(1));
        jitter.add(2, true, payload(2));

        assert_eq!(jitter.try_pop().unwrap().sequence, 1);
        let last = jitter.try_pop().unwrap();
        assert!(last.last);
        assert!(jitter.try_pop().is_none());

        // next spurt starts a fresh baseline, no gap reported
        jitter.add(40, true, payload(40));
        assert_eq!(jitter.try_pop().unwrap().sequence, 40);
        assert!(!jitter.missed_packets());
    }

    #[test]
    fn test_stall_flush() {
        let jitter = JitterBuffer::new(10, Duration::from_millis(20));
        jitter.add(7, false, payload(7));
        assert!(jitter.try_pop().is_none());

        let entry = jitter.pop_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(entry.sequence, 7);
        assert_eq!(jitter.stats().flushed, 1);
    }

    #[test]
    fn test_sequence_restart() {
        let jitter = JitterBuffer::new(2, LONG);
        jitter.add(999_998, false, payload(1));
        jitter.add(999_999, false, payload(2));
        assert_eq!(jitter.try_pop().unwrap().sequence, 999_998);

        assert_eq!(jitter.add(1, false, payload(3)), AddOutcome::Accepted);
        jitter.add(2, false, payload(4));
        assert_eq!(jitter.try_pop().unwrap().sequence, 1);
    }

    #[test]
    fn test_pop_blocks_until_release() {
        let jitter = Arc::new(JitterBuffer::new(2, LONG));
        let consumer = {
            let jitter = jitter.clone();
            thread::spawn(move || jitter.pop().map(|e| e.sequence))
        };

        thread::sleep(Duration::from_millis(20));
        jitter.add(11, false, payload(11));
        jitter.add(10, false, payload(10));

        assert_eq!(consumer.join().unwrap(), Some(10));
    }

    #[test]
    fn test_close_wakes_pop() {
        let jitter = Arc::new(JitterBuffer::new(2, LONG));
        let consumer = {
            let jitter = jitter.clone();
            thread::spawn(move || jitter.pop())
        };

        thread::sleep(Duration::from_millis(20));
        jitter.close();
        assert_eq!(consumer.join().unwrap(), None);
        assert_eq!(jitter.add(1, false, payload(1)), AddOutcome::Closed);
    }

    #[test]
    fn test_set_size_floor() {
        let jitter = JitterBuffer::new(5, LONG);
        jitter.set_size(1);
        assert_eq!(jitter.target_depth(), 2);
    }

    proptest! {
        #[test]
        fn prop_pops_strictly_ascending(
            keys in proptest::collection::hash_set(0u32..900, 1..40),
            depth in 2usize..8,
        ) {
            let jitter = JitterBuffer::new(depth, LONG);
            let mut popped = Vec::new();
            for (i, key) in keys.iter().enumerate() {
                jitter.add(*key, false, payload(*key));
                if i % 3 == 2 {
                    while let Some(entry) = jitter.try_pop() {
                        popped.push(entry.sequence);
                    }
                }
            }
            jitter.drain();
            while let Some(entry) = jitter.try_pop() {
                popped.push(entry.sequence);
            }

            prop_assert!(popped.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn prop_full_depth_returns_sorted(
            keys in proptest::collection::hash_set(0u32..900, 1..40),
        ) {
            let jitter = JitterBuffer::new(keys.len().max(2), LONG);
            for key in &keys {
                jitter.add(*key, false, payload(*key));
            }
            jitter.drain();

            let mut popped = Vec::new();
            while let Some(entry) = jitter.try_pop() {
                popped.push(entry.sequence);
            }

            let mut expected: Vec<u32> = keys.into_iter().collect();
            expected.sort_unstable();
            prop_assert_eq!(popped, expected);
        }
    }
}
