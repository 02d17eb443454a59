//! PCM buffers between decode, mix and the embedding application
//!
//! [`SpeakerPcm`] is a per-speaker FIFO with exactly one writer (the decode
//! worker) and one reader (the mixer). [`PcmPullBuffer`] collects mixed
//! output for consumers that poll instead of reading a file stream.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Growable sample FIFO for one speaker
#[derive(Clone, Default)]
pub struct SpeakerPcm {
    samples: Arc<Mutex<VecDeque<i16>>>,
}

impl SpeakerPcm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append decoded samples at the tail
    pub fn append(&self, pcm: &[i16]) {
        self.samples.lock().extend(pcm.iter().copied());
    }

    /// Remove exactly `len` samples from the head, or nothing if fewer are buffered
    pub fn pop_chunk(&self, len: usize) -> Option<Vec<i16>> {
        let mut samples = self.samples.lock();
        if samples.len() < len {
            return None;
        }
        Some(samples.drain(..len).collect())
    }

    /// Buffered sample count
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}

struct PullState {
    data: BytesMut,
    capacity: usize,
}

/// Byte buffer of mixed little-endian 16-bit PCM, read on demand
#[derive(Clone)]
pub struct PcmPullBuffer {
    state: Arc<Mutex<PullState>>,
}

impl Default for PcmPullBuffer {
    fn default() -> Self {
        Self::new(0)
    }
}

impl PcmPullBuffer {
    /// `capacity` only scales [`fill_percentage`](Self::fill_percentage); 0 leaves it unset
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PullState {
                data: BytesMut::new(),
                capacity,
            })),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.state.lock().capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Append samples as little-endian bytes
    pub fn push_samples(&self, samples: &[i16]) {
        let mut state = self.state.lock();
        state.data.reserve(samples.len() * 2);
        for sample in samples {
            state.data.put_i16_le(*sample);
        }
    }

    /// Take exactly `len` bytes from the head, or `None` if fewer are buffered
    pub fn read(&self, len: usize) -> Option<Bytes> {
        let mut state = self.state.lock();
        if state.data.len() < len {
            return None;
        }
        Some(state.data.split_to(len).freeze())
    }

    /// Fill level in percent of capacity, or the raw byte count when no capacity is set
    pub fn fill_percentage(&self) -> usize {
        let state = self.state.lock();
        if state.capacity > 0 {
            state.data.len() * 100 / state.capacity
        } else {
            state.data.len()
        }
    }

    /// Buffered byte count
    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speaker_pcm_fifo() {
        let pcm = SpeakerPcm::new();
        pcm.append(&[1, 2, 3]);
        pcm.append(&[4, 5]);

        assert_eq!(pcm.pop_chunk(6), None);
        assert_eq!(pcm.len(), 5);

        assert_eq!(pcm.pop_chunk(4), Some(vec![1, 2, 3, 4]));
        assert_eq!(pcm.len(), 1);
    }

    #[test]
    fn test_pull_buffer_read() {
        let buffer = PcmPullBuffer::new(0);
        buffer.push_samples(&[1, -1]);

        assert_eq!(buffer.read(5), None);
        let bytes = buffer.read(4).unwrap();
        assert_eq!(&bytes[..], &[0x01, 0x00, 0xff, 0xff]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pull_buffer_fill() {
        let buffer = PcmPullBuffer::new(0);
        buffer.push_samples(&[0; 50]);

        // no capacity: raw byte count
        assert_eq!(buffer.fill_percentage(), 100);

        buffer.set_capacity(400);
        assert_eq!(buffer.fill_percentage(), 25);
    }
}
