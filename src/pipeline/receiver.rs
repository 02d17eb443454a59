//! Receive pipeline
//!
//! Ingests relayed voice packets, routes them to per-speaker jitter
//! buffers and runs the decode worker and mixer threads.

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::jitter::AddOutcome;
use crate::audio::mixer::{MixOutput, MixerEvent, MixerStats};
use crate::audio::{JitterBuffer, JitterStats, Mixer, PcmPullBuffer, SpeakerPcm};
use crate::codec::CodecProvider;
use crate::config::{NormalizerMode, OpusConfig, OutputTarget, ReceiverConfig};
use crate::constants::MIN_JITTER_DEPTH;
use crate::error::{AudioError, Error, PacketError};
use crate::pipeline::decode::{DecodeEvent, DecodeStats, DecodeWorker, SpeakerChannel};
use crate::pipeline::recorder::Recorder;
use crate::protocol::InboundPacket;

/// Open the mixed PCM sink
fn open_sink(target: &OutputTarget) -> Result<Option<Box<dyn Write + Send>>, AudioError> {
    match target {
        OutputTarget::Discard => Ok(None),
        OutputTarget::Stdout => Ok(Some(Box::new(std::io::stdout()))),
        OutputTarget::File(path) => {
            let file = File::create(path)
                .map_err(|e| AudioError::Sink(format!("{}: {}", path.display(), e)))?;
            Ok(Some(Box::new(file)))
        }
    }
}

/// Receive-side snapshot
#[derive(Debug, Clone, Default)]
pub struct ReceiveStats {
    pub packets: u64,
    pub malformed: u64,
    pub speakers: usize,
    pub frames_decoded: u64,
    pub frames_concealed: u64,
    pub decode_errors: u64,
    pub mix_cycles: u64,
    pub chunks_mixed: u64,
    pub bytes_written: u64,
}

struct Counters {
    packets: AtomicU64,
    malformed: AtomicU64,
}

/// Multi-speaker receive pipeline
pub struct ReceivePipeline {
    /// Ingest-side routing table
    speakers: DashMap<u32, Arc<JitterBuffer>>,

    decode_events: Sender<DecodeEvent>,
    mixer_events: Sender<MixerEvent>,

    /// Re-arms the parked decode worker
    wake: Sender<()>,

    /// Current normalizer, shared with the mixer
    mode: Arc<AtomicU8>,

    jitter_depth: AtomicUsize,
    flush_after: Duration,
    codec: OpusConfig,
    recorder: Recorder,
    pull: PcmPullBuffer,
    counters: Counters,
    decode_stats: Arc<DecodeStats>,
    mixer_stats: Arc<MixerStats>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReceivePipeline {
    /// Open the output sink and start the decode and mixer threads
    pub fn new(
        config: &ReceiverConfig,
        codec_config: &OpusConfig,
        codec: Arc<dyn CodecProvider>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let sink = open_sink(&config.output)?;
        let pull = PcmPullBuffer::new(config.pcm_buffer_capacity);

        let (decode_tx, decode_rx) = unbounded();
        let (mixer_tx, mixer_rx) = unbounded();
        let (wake_tx, wake_rx) = bounded(1);
        let mode = Arc::new(AtomicU8::new(config.normalizer.to_u8()));
        let flush_after = Duration::from_millis(config.jitter_flush_ms);
        let decode_stats = Arc::new(DecodeStats::default());
        let mixer_stats = Arc::new(MixerStats::default());
        let running = Arc::new(AtomicBool::new(true));

        let worker = DecodeWorker::new(
            codec,
            codec_config.clone(),
            decode_rx,
            wake_rx,
            flush_after,
            decode_stats.clone(),
        );
        let mixer = Mixer::new(
            codec_config.samples_per_frame(),
            config,
            mode.clone(),
            MixOutput::new(sink, pull.clone()),
            mixer_rx,
            mixer_stats.clone(),
        );

        let mut workers = Vec::with_capacity(2);
        let decode_running = running.clone();
        workers.push(
            thread::Builder::new()
                .name("voice-decode".into())
                .spawn(move || worker.run(decode_running))
                .map_err(|e| AudioError::WorkerSpawn(e.to_string()))?,
        );
        let mixer_running = running.clone();
        let spawned = thread::Builder::new()
            .name("voice-mixer".into())
            .spawn(move || mixer.run(mixer_running));
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                for handle in workers {
                    let _ = handle.join();
                }
                return Err(AudioError::WorkerSpawn(e.to_string()).into());
            }
        }

        tracing::info!(
            normalizer = ?config.normalizer,
            jitter_depth = config.jitter_depth,
            "Receive pipeline started"
        );

        Ok(Self {
            speakers: DashMap::new(),
            decode_events: decode_tx,
            mixer_events: mixer_tx,
            wake: wake_tx,
            mode,
            jitter_depth: AtomicUsize::new(config.jitter_depth),
            flush_after,
            codec: codec_config.clone(),
            recorder: Recorder::new(),
            pull,
            counters: Counters {
                packets: AtomicU64::new(0),
                malformed: AtomicU64::new(0),
            },
            decode_stats,
            mixer_stats,
            running,
            workers: Mutex::new(workers),
        })
    }

    /// Ingest one tunnel payload (header byte first).
    ///
    /// Malformed packets are dropped and reported; the pipeline keeps going.
    pub fn process_tunnel(&self, data: Bytes) -> Result<(), PacketError> {
        self.counters.packets.fetch_add(1, Ordering::Relaxed);
        self.recorder.write(&data);

        if !self.normalizer().decodes() {
            return Ok(());
        }

        let inbound = match InboundPacket::decode(&data) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping malformed voice packet: {}", e);
                return Err(e);
            }
        };

        let jitter = self.speaker(inbound.source);
        let packet = inbound.packet;
        match jitter.add(packet.sequence, packet.last, packet.payload) {
            AddOutcome::Accepted => {}
            outcome => {
                tracing::trace!(
                    speaker = inbound.source,
                    sequence = packet.sequence,
                    "packet not buffered: {:?}",
                    outcome
                );
            }
        }

        let _ = self.wake.try_send(());
        Ok(())
    }

    /// Jitter buffer for `id`, creating the speaker's path on first sight
    fn speaker(&self, id: u32) -> Arc<JitterBuffer> {
        self.speakers
            .entry(id)
            .or_insert_with(|| {
                let jitter = Arc::new(JitterBuffer::new(
                    self.jitter_depth.load(Ordering::Relaxed),
                    self.flush_after,
                ));
                let pcm = SpeakerPcm::new();
                let _ = self.mixer_events.send(MixerEvent::Joined(id, pcm.clone()));
                let _ = self.decode_events.send(DecodeEvent::Joined(SpeakerChannel {
                    id,
                    jitter: jitter.clone(),
                    pcm,
                }));
                tracing::info!(speaker = id, "New speaker");
                jitter
            })
            .clone()
    }

    /// Drop a speaker's jitter buffer, decoder and accumulator
    pub fn reset_speaker(&self, id: u32) -> bool {
        let Some((_, jitter)) = self.speakers.remove(&id) else {
            return false;
        };
        jitter.close();
        let _ = self.decode_events.send(DecodeEvent::Left(id));
        let _ = self.mixer_events.send(MixerEvent::Left(id));
        tracing::debug!(speaker = id, "Speaker reset");
        true
    }

    /// Known speaker ids, unordered
    pub fn speakers(&self) -> Vec<u32> {
        self.speakers.iter().map(|entry| *entry.key()).collect()
    }

    pub fn jitter_stats(&self, id: u32) -> Option<JitterStats> {
        self.speakers.get(&id).map(|jitter| jitter.stats())
    }

    pub fn set_normalizer(&self, mode: NormalizerMode) {
        let previous = NormalizerMode::from_u8(self.mode.swap(mode.to_u8(), Ordering::SeqCst));
        if previous != mode {
            tracing::info!("Normalizer {:?} -> {:?}", previous, mode);
        }
    }

    pub fn normalizer(&self) -> NormalizerMode {
        NormalizerMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    /// Set the jitter depth for existing and future speakers; values below 2 are ignored
    pub fn set_jitter_depth(&self, depth: usize) {
        if depth < MIN_JITTER_DEPTH {
            tracing::debug!(depth, "ignoring jitter depth below minimum");
            return;
        }
        self.jitter_depth.store(depth, Ordering::Relaxed);
        for entry in self.speakers.iter() {
            entry.value().set_size(depth);
        }
    }

    pub fn jitter_depth(&self) -> usize {
        self.jitter_depth.load(Ordering::Relaxed)
    }

    /// Returns `false` if a recording was already running
    pub fn start_recording(&self, path: impl AsRef<Path>) -> Result<bool, Error> {
        self.recorder.start(path, &self.codec)
    }

    /// Returns `false` if nothing was being recorded
    pub fn stop_recording(&self) -> Result<bool, Error> {
        self.recorder.stop()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    /// Pull buffer filled in buffer-only mode
    pub fn pcm_buffer(&self) -> &PcmPullBuffer {
        &self.pull
    }

    pub fn set_pcm_buffer_capacity(&self, capacity: usize) {
        self.pull.set_capacity(capacity);
    }

    /// Read exactly `len` bytes of mixed PCM, or `None` if fewer are buffered
    pub fn read_pcm(&self, len: usize) -> Option<Bytes> {
        self.pull.read(len)
    }

    pub fn pcm_fill(&self) -> usize {
        self.pull.fill_percentage()
    }

    pub fn stats(&self) -> ReceiveStats {
        ReceiveStats {
            packets: self.counters.packets.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            speakers: self.speakers.len(),
            frames_decoded: self.decode_stats.frames_decoded.load(Ordering::Relaxed),
            frames_concealed: self.decode_stats.frames_concealed.load(Ordering::Relaxed),
            decode_errors: self.decode_stats.decode_errors.load(Ordering::Relaxed),
            mix_cycles: self.mixer_stats.cycles.load(Ordering::Relaxed),
            chunks_mixed: self.mixer_stats.chunks_mixed.load(Ordering::Relaxed),
            bytes_written: self.mixer_stats.bytes_written.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the worker threads and close the recording
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for entry in self.speakers.iter() {
            entry.value().close();
        }
        let _ = self.wake.try_send(());

        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        if let Err(e) = self.recorder.stop() {
            tracing::warn!("Closing recording failed: {}", e);
        }
        tracing::info!("Receive pipeline stopped");
    }
}

impl Drop for ReceivePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
