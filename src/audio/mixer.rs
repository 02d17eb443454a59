//! Multi-speaker mixing
//!
//! Every cycle takes one frame-sized chunk from each speaker that has a
//! full one buffered, sums them into 32-bit samples and hands the sum to
//! the selected normalization policy.

use bytes::{BufMut, BytesMut};
use crossbeam_channel::Receiver;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio::buffer::{PcmPullBuffer, SpeakerPcm};
use crate::config::{NormalizerMode, ReceiverConfig};

/// Limiter gain recovers by this much per sample
pub const LIMITER_RECOVERY_STEP: f64 = 0.000001;

/// Recovery stops once the gain reaches this level
pub const LIMITER_RECOVERY_CEILING: f64 = 0.999990;

/// Sum equally sized chunks sample-wise.
///
/// Returns `None` when there are no chunks.
pub fn mix_chunks<'a, I>(chunks: I) -> Option<Vec<i32>>
where
    I: IntoIterator<Item = &'a [i16]>,
{
    let mut mix: Option<Vec<i32>> = None;
    for chunk in chunks {
        match mix.as_mut() {
            None => mix = Some(chunk.iter().map(|&s| s as i32).collect()),
            Some(sum) => {
                debug_assert_eq!(sum.len(), chunk.len());
                for (acc, &sample) in sum.iter_mut().zip(chunk) {
                    *acc += sample as i32;
                }
            }
        }
    }
    mix
}

/// Clamp every sample to the 16-bit range
pub fn hard_limit(mix: &[i32]) -> Vec<i16> {
    mix.iter()
        .map(|&s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
        .collect()
}

/// Gain state of the soft normalizer. Persists across mix cycles.
#[derive(Debug, Clone)]
pub struct Limiter {
    level: f64,
}

impl Default for Limiter {
    fn default() -> Self {
        Self { level: 1.0 }
    }
}

impl Limiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current gain
    pub fn level(&self) -> f64 {
        self.level
    }

    /// Drop the gain instantly on overflow, let it creep back otherwise
    pub fn normalize(&mut self, mix: &[i32]) -> Vec<i16> {
        mix.iter()
            .map(|&sample| {
                let magnitude = (sample as i64).abs();
                if magnitude >= i16::MAX as i64 {
                    self.level = i16::MAX as f64 / magnitude as f64;
                } else if self.level < LIMITER_RECOVERY_CEILING {
                    self.level += LIMITER_RECOVERY_STEP;
                }

                let scaled = (sample as f64 * self.level) as i64;
                scaled.clamp(i16::MIN as i64, i16::MAX as i64) as i16
            })
            .collect()
    }
}

/// Sleep before a mix cycle, shrinking as the backlog grows
#[derive(Debug, Clone)]
pub struct Pacing {
    /// Sleep with an empty backlog
    pub base: Duration,
    /// Backlog at which the sleep reaches zero
    pub zero_at: usize,
    /// Above this backlog pacing is skipped
    pub ceiling: usize,
}

impl Pacing {
    pub fn from_config(config: &ReceiverConfig) -> Self {
        Self {
            base: Duration::from_millis(config.pacing_base_ms),
            zero_at: config.pacing_zero_samples.max(1),
            ceiling: config.pacing_ceiling_samples,
        }
    }

    /// Delay for a backlog of `backlog` samples
    pub fn delay(&self, backlog: usize) -> Duration {
        if backlog > self.ceiling || backlog >= self.zero_at {
            return Duration::ZERO;
        }
        let nanos = self.base.as_nanos() * (self.zero_at - backlog) as u128 / self.zero_at as u128;
        Duration::from_nanos(nanos as u64)
    }
}

/// Mixer roster changes, sent by the ingest side
pub enum MixerEvent {
    Joined(u32, SpeakerPcm),
    Left(u32),
}

/// Mixer counters
#[derive(Debug, Default)]
pub struct MixerStats {
    pub cycles: AtomicU64,
    pub chunks_mixed: AtomicU64,
    pub bytes_written: AtomicU64,
}

/// Where mixed chunks go
pub struct MixOutput {
    sink: Option<Box<dyn Write + Send>>,
    pull: PcmPullBuffer,
}

impl MixOutput {
    pub fn new(sink: Option<Box<dyn Write + Send>>, pull: PcmPullBuffer) -> Self {
        Self { sink, pull }
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let Some(sink) = self.sink.as_mut() else {
            return 0;
        };
        match sink.write_all(bytes).and_then(|_| sink.flush()) {
            Ok(()) => bytes.len(),
            Err(e) => {
                tracing::error!("Output sink failed, mixed audio is now discarded: {}", e);
                self.sink = None;
                0
            }
        }
    }
}

/// Mixer loop state; owned by the mixer thread
pub struct Mixer {
    speakers: Vec<(u32, SpeakerPcm)>,
    limiter: Limiter,
    output: MixOutput,
    mode: Arc<AtomicU8>,
    chunk: usize,
    pacing: Pacing,
    tick: Duration,
    events: Receiver<MixerEvent>,
    stats: Arc<MixerStats>,
}

impl Mixer {
    pub fn new(
        chunk: usize,
        config: &ReceiverConfig,
        mode: Arc<AtomicU8>,
        output: MixOutput,
        events: Receiver<MixerEvent>,
        stats: Arc<MixerStats>,
    ) -> Self {
        Self {
            speakers: Vec::new(),
            limiter: Limiter::new(),
            output,
            mode,
            chunk,
            pacing: Pacing::from_config(config),
            tick: Duration::from_millis(config.mixer_tick_ms),
            events,
            stats,
        }
    }

    fn apply_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                MixerEvent::Joined(id, pcm) => {
                    tracing::debug!(speaker = id, "mixer: speaker joined");
                    self.speakers.push((id, pcm));
                }
                MixerEvent::Left(id) => {
                    tracing::debug!(speaker = id, "mixer: speaker left");
                    self.speakers.retain(|(speaker, _)| *speaker != id);
                }
            }
        }
    }

    /// Largest per-speaker backlog in samples
    pub fn backlog(&self) -> usize {
        self.speakers
            .iter()
            .map(|(_, pcm)| pcm.len())
            .max()
            .unwrap_or(0)
    }

    /// Pop, sum and emit one chunk. Returns whether anything was emitted.
    pub fn mix_once(&mut self) -> bool {
        self.apply_events();

        let chunks: Vec<Vec<i16>> = self
            .speakers
            .iter()
            .filter_map(|(_, pcm)| pcm.pop_chunk(self.chunk))
            .collect();

        let Some(mix) = mix_chunks(chunks.iter().map(Vec::as_slice)) else {
            return false;
        };
        self.stats
            .chunks_mixed
            .fetch_add(chunks.len() as u64, Ordering::Relaxed);

        let written = match NormalizerMode::from_u8(self.mode.load(Ordering::Relaxed)) {
            NormalizerMode::Off => return false,
            NormalizerMode::RawMerge => {
                let mut bytes = BytesMut::with_capacity(mix.len() * 4);
                for sample in &mix {
                    bytes.put_i32_le(*sample);
                }
                self.output.write(&bytes)
            }
            NormalizerMode::SoftNormalize => {
                let pcm = self.limiter.normalize(&mix);
                self.output.write(&samples_to_bytes(&pcm))
            }
            NormalizerMode::HardLimit => {
                let pcm = hard_limit(&mix);
                self.output.write(&samples_to_bytes(&pcm))
            }
            NormalizerMode::BufferOnly => {
                let pcm = self.limiter.normalize(&mix);
                self.output.pull.push_samples(&pcm);
                0
            }
        };
        self.stats
            .bytes_written
            .fetch_add(written as u64, Ordering::Relaxed);
        true
    }

    /// Loop until `running` is cleared
    pub fn run(mut self, running: Arc<AtomicBool>) {
        tracing::debug!(chunk = self.chunk, "mixer started");
        while running.load(Ordering::Relaxed) {
            self.apply_events();

            let delay = self.pacing.delay(self.backlog());
            if !delay.is_zero() {
                thread::sleep(delay);
            }

            self.mix_once();
            self.stats.cycles.fetch_add(1, Ordering::Relaxed);
            thread::sleep(self.tick);
        }
        tracing::debug!("mixer stopped");
    }
}

fn samples_to_bytes(samples: &[i16]) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.put_i16_le(*sample);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn mixer(
        mode: NormalizerMode,
        sink: SharedSink,
        chunk: usize,
    ) -> (Mixer, crossbeam_channel::Sender<MixerEvent>) {
        let (tx, rx) = unbounded();
        let mixer = Mixer::new(
            chunk,
            &ReceiverConfig::default(),
            Arc::new(AtomicU8::new(mode.to_u8())),
            MixOutput::new(Some(Box::new(sink)), PcmPullBuffer::default()),
            rx,
            Arc::new(MixerStats::default()),
        );
        (mixer, tx)
    }

    #[test]
    fn test_soft_normalize_full_scale_is_stable() {
        let mut limiter = Limiter::new();
        for _ in 0..1000 {
            assert_eq!(limiter.normalize(&[32767]), vec![32767]);
        }
        assert_eq!(limiter.level(), 1.0);
    }

    #[test]
    fn test_soft_normalize_overflow() {
        let mut limiter = Limiter::new();
        assert_eq!(limiter.normalize(&[40000]), vec![32767]);
        assert_eq!(limiter.level(), 32767.0 / 40000.0);

        // recovery is slow: the next quiet sample is still attenuated
        let out = limiter.normalize(&[10000]);
        assert!(out[0] < 10000);
        assert!(limiter.level() > 32767.0 / 40000.0);
    }

    #[test]
    fn test_soft_normalize_negative_overflow() {
        let mut limiter = Limiter::new();
        let out = limiter.normalize(&[-40000]);
        assert_eq!(out, vec![-32767]);
    }

    #[test]
    fn test_limiter_recovery_stops_below_one() {
        let mut limiter = Limiter { level: 0.99998 };
        limiter.normalize(&[0; 100]);
        assert!(limiter.level() >= LIMITER_RECOVERY_CEILING);
        assert!(limiter.level() < LIMITER_RECOVERY_CEILING + 2.0 * LIMITER_RECOVERY_STEP);
    }

    #[test]
    fn test_hard_limit() {
        assert_eq!(hard_limit(&[40000, -40000, 100]), vec![32767, -32768, 100]);
    }

    #[test]
    fn test_mix_commutative() {
        let a: Vec<i16> = (0..960).map(|i| (i * 31 % 20000) as i16).collect();
        let b: Vec<i16> = (0..960).map(|i| -((i * 17 % 30000) as i16)).collect();

        let ab = mix_chunks([a.as_slice(), b.as_slice()]).unwrap();
        let ba = mix_chunks([b.as_slice(), a.as_slice()]).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab[1], a[1] as i32 + b[1] as i32);
    }

    #[test]
    fn test_mix_widens() {
        let loud = vec![30000i16; 4];
        let mix = mix_chunks([loud.as_slice(), loud.as_slice()]).unwrap();
        assert_eq!(mix, vec![60000; 4]);
        assert!(mix_chunks(std::iter::empty::<&[i16]>()).is_none());
    }

    #[test]
    fn test_pacing() {
        let pacing = Pacing {
            base: Duration::from_millis(50),
            zero_at: 24_000,
            ceiling: 48_000,
        };
        assert_eq!(pacing.delay(0), Duration::from_millis(50));
        assert_eq!(pacing.delay(12_000), Duration::from_millis(25));
        assert_eq!(pacing.delay(24_000), Duration::ZERO);
        assert_eq!(pacing.delay(100_000), Duration::ZERO);
    }

    #[test]
    fn test_mix_once_skips_short_speakers() {
        let sink = SharedSink::default();
        let (mut mixer, events) = mixer(NormalizerMode::HardLimit, sink.clone(), 4);

        let full = SpeakerPcm::new();
        full.append(&[1, 2, 3, 4, 5]);
        let short = SpeakerPcm::new();
        short.append(&[100, 100]);
        events.send(MixerEvent::Joined(1, full.clone())).unwrap();
        events.send(MixerEvent::Joined(2, short.clone())).unwrap();

        assert!(mixer.mix_once());
        assert_eq!(sink.0.lock().as_slice(), &[1, 0, 2, 0, 3, 0, 4, 0]);
        assert_eq!(full.len(), 1);
        assert_eq!(short.len(), 2);

        // nobody has a full chunk left
        assert!(!mixer.mix_once());
    }

    #[test]
    fn test_raw_merge_writes_i32() {
        let sink = SharedSink::default();
        let (mut mixer, events) = mixer(NormalizerMode::RawMerge, sink.clone(), 1);

        let a = SpeakerPcm::new();
        a.append(&[30000]);
        let b = SpeakerPcm::new();
        b.append(&[30000]);
        events.send(MixerEvent::Joined(1, a)).unwrap();
        events.send(MixerEvent::Joined(2, b)).unwrap();

        assert!(mixer.mix_once());
        assert_eq!(sink.0.lock().as_slice(), &60000i32.to_le_bytes());
    }

    #[test]
    fn test_buffer_only_fills_pull_buffer() {
        let (tx, rx) = unbounded();
        let pull = PcmPullBuffer::default();
        let mut mixer = Mixer::new(
            2,
            &ReceiverConfig::default(),
            Arc::new(AtomicU8::new(NormalizerMode::BufferOnly.to_u8())),
            MixOutput::new(None, pull.clone()),
            rx,
            Arc::new(MixerStats::default()),
        );

        let pcm = SpeakerPcm::new();
        pcm.append(&[7, -7]);
        tx.send(MixerEvent::Joined(3, pcm)).unwrap();

        assert!(mixer.mix_once());
        assert_eq!(pull.read(4).unwrap().as_ref(), &[7, 0, 0xf9, 0xff]);
    }

    #[test]
    fn test_speaker_left() {
        let sink = SharedSink::default();
        let (mut mixer, events) = mixer(NormalizerMode::HardLimit, sink, 1);
        let pcm = SpeakerPcm::new();
        pcm.append(&[1, 2]);
        events.send(MixerEvent::Joined(5, pcm)).unwrap();
        events.send(MixerEvent::Left(5)).unwrap();

        assert!(!mixer.mix_once());
        assert_eq!(mixer.backlog(), 0);
    }
}
