//! Local PCM sources for the send path
//!
//! Mono signed 16-bit samples, read one encoder frame at a time. WAV files
//! are played in bounded mode; pipes and arbitrary readers stream
//! continuously until they hit end of file or playback is stopped.
//!
//! Raw readers are drained by a `voice-source` thread into a small channel.
//! A reader that blocks (a named pipe whose writer went quiet) then only
//! ever blocks that thread, and [`PcmSource::poll_frame`] waits on the
//! channel with a timeout. The thread ends at end of file, on a read error,
//! or at its next read once the source has been dropped.

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::AudioError;

/// Bytes per read on the source thread
const READ_CHUNK: usize = 4096;

/// Chunks buffered between the source thread and the encoder
const READ_AHEAD_CHUNKS: usize = 8;

/// How the encode pipeline drives a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackMode {
    /// Read, encode and send one frame at a time until exhausted
    Bounded,
    /// Independent producer and consumer until stopped
    Continuous,
}

/// Result of a bounded wait for the next frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePoll {
    Frame(Vec<i16>),
    /// No complete frame arrived in time
    Pending,
    Exhausted,
}

enum SourceKind {
    Wav(hound::WavIntoSamples<BufReader<File>, i16>),
    Raw(RawStream),
}

/// An open PCM source
pub struct PcmSource {
    kind: SourceKind,
    label: String,
    mode: PlaybackMode,
    /// Rate the samples were recorded at, when the source declares one
    sample_rate: Option<u32>,
}

impl PcmSource {
    /// Open a mono 16-bit WAV file recorded at `sample_rate`
    pub fn wav(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self, AudioError> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path).map_err(|e| AudioError::SourceOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let spec = reader.spec();
        if spec.channels != 1
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
        {
            return Err(AudioError::UnsupportedFormat(format!(
                "{}: expected mono 16-bit PCM, got {} channel(s) {}-bit {:?}",
                path.display(),
                spec.channels,
                spec.bits_per_sample,
                spec.sample_format
            )));
        }
        check_rate(&path.display().to_string(), spec.sample_rate, sample_rate)?;

        Ok(Self {
            kind: SourceKind::Wav(reader.into_samples::<i16>()),
            label: path.display().to_string(),
            mode: PlaybackMode::Bounded,
            sample_rate: Some(spec.sample_rate),
        })
    }

    /// Open a named pipe carrying raw little-endian samples
    pub fn pipe(path: impl AsRef<Path>) -> Result<Self, AudioError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| AudioError::SourceOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_reader(path.display().to_string(), file, PlaybackMode::Continuous)
    }

    /// Wrap any reader of raw little-endian samples
    pub fn from_reader(
        label: impl Into<String>,
        reader: impl Read + Send + 'static,
        mode: PlaybackMode,
    ) -> Result<Self, AudioError> {
        Ok(Self {
            kind: SourceKind::Raw(RawStream::spawn(Box::new(reader))?),
            label: label.into(),
            mode,
            sample_rate: None,
        })
    }

    /// Declare the rate a raw stream was recorded at
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    /// Fails if the source declares a rate other than `pipeline_rate`
    pub fn check_sample_rate(&self, pipeline_rate: u32) -> Result<(), AudioError> {
        match self.sample_rate {
            Some(rate) => check_rate(&self.label, rate, pipeline_rate),
            None => Ok(()),
        }
    }

    /// Read the next frame of `samples` samples, blocking as long as it takes.
    ///
    /// A short final frame is padded with silence. `None` means the source
    /// is exhausted.
    pub fn read_frame(&mut self, samples: usize) -> Result<Option<Vec<i16>>, AudioError> {
        match self.next_frame(samples, None)? {
            FramePoll::Frame(frame) => Ok(Some(frame)),
            FramePoll::Pending | FramePoll::Exhausted => Ok(None),
        }
    }

    /// Like [`read_frame`](Self::read_frame) but waits at most `timeout`.
    ///
    /// Samples that arrived before a [`FramePoll::Pending`] stay buffered
    /// for the next call.
    pub fn poll_frame(
        &mut self,
        samples: usize,
        timeout: Duration,
    ) -> Result<FramePoll, AudioError> {
        self.next_frame(samples, Some(timeout))
    }

    fn next_frame(
        &mut self,
        samples: usize,
        timeout: Option<Duration>,
    ) -> Result<FramePoll, AudioError> {
        let mut frame = match &mut self.kind {
            SourceKind::Wav(iter) => {
                let mut frame = Vec::with_capacity(samples);
                for sample in iter.by_ref().take(samples) {
                    frame.push(sample?);
                }
                frame
            }
            SourceKind::Raw(stream) => match stream.take(samples, timeout)? {
                Some(frame) => frame,
                None => return Ok(FramePoll::Pending),
            },
        };

        if frame.is_empty() {
            return Ok(FramePoll::Exhausted);
        }
        frame.resize(samples, 0);
        Ok(FramePoll::Frame(frame))
    }
}

fn check_rate(label: &str, rate: u32, pipeline_rate: u32) -> Result<(), AudioError> {
    if rate != pipeline_rate {
        return Err(AudioError::UnsupportedFormat(format!(
            "{}: sample rate {} Hz, pipeline runs at {} Hz",
            label, rate, pipeline_rate
        )));
    }
    Ok(())
}

/// Raw bytes arriving from the source thread
struct RawStream {
    chunks: Receiver<io::Result<Bytes>>,
    pending: BytesMut,
    closed: bool,
}

impl RawStream {
    fn spawn(mut reader: Box<dyn Read + Send>) -> Result<Self, AudioError> {
        let (tx, rx) = bounded(READ_AHEAD_CHUNKS);
        thread::Builder::new()
            .name("voice-source".into())
            .spawn(move || pump(reader.as_mut(), &tx))
            .map_err(|e| AudioError::WorkerSpawn(e.to_string()))?;

        Ok(Self {
            chunks: rx,
            pending: BytesMut::new(),
            closed: false,
        })
    }

    /// Up to `samples` samples, or `None` if `timeout` ran out first.
    ///
    /// Short (or empty) only once the reader has closed.
    fn take(
        &mut self,
        samples: usize,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<i16>>, AudioError> {
        let wanted = samples * 2;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        while self.pending.len() < wanted && !self.closed {
            let received = match deadline {
                Some(deadline) => match self.chunks.recv_deadline(deadline) {
                    Ok(chunk) => Some(chunk),
                    Err(RecvTimeoutError::Timeout) => return Ok(None),
                    Err(RecvTimeoutError::Disconnected) => None,
                },
                None => self.chunks.recv().ok(),
            };
            match received {
                Some(Ok(chunk)) => self.pending.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.closed = true;
                    return Err(AudioError::SourceRead(e.to_string()));
                }
                None => self.closed = true,
            }
        }

        let available = self.pending.len() - self.pending.len() % 2;
        let bytes = self.pending.split_to(wanted.min(available));
        Ok(Some(
            bytes
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        ))
    }
}

/// Source thread body: forward chunks until end of file, an error, or a dropped source
fn pump(reader: &mut dyn Read, chunks: &Sender<io::Result<Bytes>>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let chunk = match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => Err(e),
        };
        let failed = chunk.is_err();
        if chunks.send(chunk).is_err() || failed {
            return;
        }
    }
}
