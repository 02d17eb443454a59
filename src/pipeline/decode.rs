//! Speaker decode worker
//!
//! Owns one lazily built decoder per speaker. Each pass pops every released
//! jitter entry, conceals gaps, decodes and appends the PCM to the
//! speaker's accumulator. With nothing to do the worker parks on the wake
//! channel until the ingest side signals a new packet.

use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::{JitterBuffer, SpeakerPcm};
use crate::codec::{CodecProvider, VoiceDecoder};
use crate::config::OpusConfig;

/// Concealed frames per gap; longer gaps are mostly silence anyway
pub const MAX_CONCEALED_FRAMES: u32 = 5;

/// A speaker's ingest-to-mixer path
#[derive(Clone)]
pub struct SpeakerChannel {
    pub id: u32,
    pub jitter: Arc<JitterBuffer>,
    pub pcm: SpeakerPcm,
}

/// Roster changes sent by the ingest side
pub enum DecodeEvent {
    Joined(SpeakerChannel),
    Left(u32),
}

/// Decode counters
#[derive(Debug, Default)]
pub struct DecodeStats {
    pub frames_decoded: AtomicU64,
    pub frames_concealed: AtomicU64,
    pub decode_errors: AtomicU64,
}

struct SpeakerDecoder {
    channel: SpeakerChannel,
    decoder: Option<Box<dyn VoiceDecoder>>,
}

pub struct DecodeWorker {
    speakers: Vec<SpeakerDecoder>,
    codec: Arc<dyn CodecProvider>,
    config: OpusConfig,
    events: Receiver<DecodeEvent>,
    wake: Receiver<()>,
    /// Stall flush interval of the jitter buffers
    flush_after: Duration,
    stats: Arc<DecodeStats>,
}

impl DecodeWorker {
    pub fn new(
        codec: Arc<dyn CodecProvider>,
        config: OpusConfig,
        events: Receiver<DecodeEvent>,
        wake: Receiver<()>,
        flush_after: Duration,
        stats: Arc<DecodeStats>,
    ) -> Self {
        Self {
            speakers: Vec::new(),
            codec,
            config,
            events,
            wake,
            flush_after,
            stats,
        }
    }

    fn apply_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                DecodeEvent::Joined(channel) => {
                    tracing::debug!(speaker = channel.id, "decode: speaker joined");
                    self.speakers.push(SpeakerDecoder {
                        channel,
                        decoder: None,
                    });
                }
                DecodeEvent::Left(id) => {
                    // dropping the decoder releases its native state
                    self.speakers.retain(|speaker| speaker.channel.id != id);
                }
            }
        }
    }

    /// One pass over all speakers. Returns the number of frames decoded.
    pub fn pass(&mut self) -> usize {
        self.apply_events();

        let mut decoded = 0;
        for speaker in &mut self.speakers {
            if speaker.channel.jitter.is_empty() {
                continue;
            }
            // packets stay buffered until a decoder exists
            if speaker.decoder.is_none() {
                match self.codec.decoder(&self.config) {
                    Ok(decoder) => speaker.decoder = Some(decoder),
                    Err(e) => {
                        tracing::error!(speaker = speaker.channel.id, "decoder unavailable: {}", e);
                        self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
            }
            let Some(decoder) = speaker.decoder.as_mut() else {
                continue;
            };

            while let Some(entry) = speaker.channel.jitter.try_pop() {
                if speaker.channel.jitter.missed_packets() {
                    let missing = speaker.channel.jitter.missed_count().min(MAX_CONCEALED_FRAMES);
                    for _ in 0..missing {
                        match decoder.decode_missed() {
                            Ok(pcm) => {
                                speaker.channel.pcm.append(&pcm);
                                self.stats.frames_concealed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                tracing::debug!(
                                    speaker = speaker.channel.id,
                                    "concealment failed: {}",
                                    e
                                );
                                break;
                            }
                        }
                    }
                }

                match decoder.decode(&entry.payload) {
                    Ok(pcm) => {
                        speaker.channel.pcm.append(&pcm);
                        self.stats.frames_decoded.fetch_add(1, Ordering::Relaxed);
                        decoded += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            speaker = speaker.channel.id,
                            sequence = entry.sequence,
                            "dropping undecodable frame: {}",
                            e
                        );
                        self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        decoded
    }

    fn has_pending(&self) -> bool {
        self.speakers
            .iter()
            .any(|speaker| !speaker.channel.jitter.is_empty())
    }

    /// Loop until `running` is cleared or the wake channel closes
    pub fn run(mut self, running: Arc<AtomicBool>) {
        tracing::debug!("decode worker started");
        while running.load(Ordering::Relaxed) {
            if self.pass() > 0 {
                continue;
            }

            // held packets still need the stall flush; otherwise park until re-armed
            if self.has_pending() {
                match self.wake.recv_timeout(self.flush_after) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else if let Err(RecvError) = self.wake.recv() {
                break;
            }
        }
        tracing::debug!("decode worker stopped");
    }
}
