//! Bounded hand-off between the encode producer and the send consumer

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How often a blocked push or pop re-checks the running flag
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// One encoded codec frame awaiting a sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub payload: Bytes,
    /// Final frame of a bounded source
    pub last: bool,
}

/// Outcome of a blocking queue operation
#[derive(Debug, PartialEq, Eq)]
pub enum QueueStatus<T> {
    Ready(T),
    /// The running flag was cleared while waiting
    Stopped,
    /// The other side hung up
    Disconnected,
}

/// Producer half; a full queue blocks the producer, never drops
#[derive(Clone)]
pub struct SendQueue {
    tx: Sender<EncodedFrame>,
}

/// Consumer half
#[derive(Clone)]
pub struct SendQueueReceiver {
    rx: Receiver<EncodedFrame>,
}

impl SendQueue {
    pub fn bounded(capacity: usize) -> (SendQueue, SendQueueReceiver) {
        let (tx, rx) = bounded(capacity);
        (SendQueue { tx }, SendQueueReceiver { rx })
    }

    /// Block until there is room or `running` is cleared
    pub fn push(&self, frame: EncodedFrame, running: &AtomicBool) -> QueueStatus<()> {
        let mut frame = frame;
        loop {
            if !running.load(Ordering::Relaxed) {
                return QueueStatus::Stopped;
            }
            match self.tx.send_timeout(frame, WAIT_SLICE) {
                Ok(()) => return QueueStatus::Ready(()),
                Err(SendTimeoutError::Timeout(back)) => frame = back,
                Err(SendTimeoutError::Disconnected(_)) => return QueueStatus::Disconnected,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl SendQueueReceiver {
    /// Block until a frame arrives or `running` is cleared.
    ///
    /// Frames still queued after the producer hangs up are returned before
    /// `Disconnected`.
    pub fn pop(&self, running: &AtomicBool) -> QueueStatus<EncodedFrame> {
        loop {
            if !running.load(Ordering::Relaxed) {
                return QueueStatus::Stopped;
            }
            match self.rx.recv_timeout(WAIT_SLICE) {
                Ok(frame) => return QueueStatus::Ready(frame),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return QueueStatus::Disconnected,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
