//! Audio player: the send-side encode pipeline
//!
//! Reads local PCM one encoder frame at a time, applies software volume,
//! encodes and hands framed, sequence-numbered packets to the transport.
//!
//! A bounded source (WAV file) is driven by a single thread that encodes
//! and sends each frame in turn and stops the player when the file runs
//! out. A continuous source (named pipe) gets a producer thread feeding
//! the bounded send queue and a consumer thread draining it.
//!
//! The encoder and the open source are owned by whichever thread drives
//! them; joining the threads hands both back to the player.

use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::{FramePoll, PcmSource, PlaybackMode};
use crate::codec::{CodecKind, CodecProvider, VoiceEncoder};
use crate::config::{OpusConfig, PlayerConfig};
use crate::error::{AudioError, Error};
use crate::network::VoiceTransport;
use crate::pipeline::queue::{EncodedFrame, QueueStatus, SendQueue, SendQueueReceiver};
use crate::protocol::{encode_outbound, header_byte, VoicePacket};

/// Longest a worker waits on its source before re-checking the stop flag
const SOURCE_WAIT: Duration = Duration::from_millis(10);

/// Scale samples by `volume` percent, truncating toward zero.
///
/// 100 and above leave the samples untouched.
pub fn apply_volume(pcm: &mut [i16], volume: u8) {
    if volume >= 100 {
        return;
    }
    let factor = volume as f64 / 100.0;
    for sample in pcm.iter_mut() {
        *sample = (*sample as f64 * factor) as i16;
    }
}

/// Send-side counters
#[derive(Debug, Default)]
pub struct PlayerStats {
    pub frames_encoded: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub encode_errors: AtomicU64,
    pub send_errors: AtomicU64,
}

/// State shared with the worker threads
struct Shared {
    transport: Arc<dyn VoiceTransport>,

    /// Last sequence number handed out, 0 before the first packet
    sequence: AtomicU32,
    sequence_modulus: u32,

    volume: AtomicU8,
    playing: AtomicBool,
    stats: PlayerStats,
}

impl Shared {
    fn next_sequence(&self) -> u32 {
        let modulus = self.sequence_modulus;
        let (Ok(previous) | Err(previous)) =
            self.sequence
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |previous| {
                    Some(previous % modulus + 1)
                });
        previous % modulus + 1
    }

    fn encode(&self, encoder: &mut dyn VoiceEncoder, mut pcm: Vec<i16>) -> Option<Bytes> {
        apply_volume(&mut pcm, self.volume.load(Ordering::Relaxed));
        match encoder.encode(&pcm) {
            Ok(payload) => {
                self.stats.frames_encoded.fetch_add(1, Ordering::Relaxed);
                Some(payload)
            }
            Err(e) => {
                tracing::warn!("Encoding failed, frame dropped: {}", e);
                self.stats.encode_errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Assign the next sequence number, frame and send
    fn send(&self, header: u8, frame: EncodedFrame) {
        let sequence = self.next_sequence();
        let packet = match VoicePacket::new(sequence, frame.payload, frame.last) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(sequence, "Cannot frame encoded audio: {}", e);
                self.stats.encode_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let data = encode_outbound(header, &packet);
        let len = data.len() as u64;
        match self.transport.send_packet(data) {
            Ok(()) => {
                self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(sequence, "Voice packet send failed: {}", e);
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// What a worker hands back when joined
struct EncodeSession {
    encoder: Box<dyn VoiceEncoder>,
    /// `None` once the source is exhausted
    source: Option<PcmSource>,
    /// Frame read ahead by the bounded driver but not yet sent
    lookahead: Option<Vec<i16>>,
}

/// An interrupted playback that can be resumed
struct Resume {
    source: PcmSource,
    lookahead: Option<Vec<i16>>,
}

/// Send-side encode pipeline
pub struct AudioPlayer {
    codec: Arc<dyn CodecProvider>,
    config: PlayerConfig,
    opus: OpusConfig,
    shared: Arc<Shared>,

    /// Present while idle; moved into the driving thread while playing
    encoder: Option<Box<dyn VoiceEncoder>>,

    /// Stop flag of the current workers
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<Option<EncodeSession>>>,
}

impl AudioPlayer {
    /// Build the encoder up front; an unsupported codec fails here
    pub fn new(
        codec: Arc<dyn CodecProvider>,
        transport: Arc<dyn VoiceTransport>,
        config: PlayerConfig,
        opus: OpusConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        opus.validate()?;
        let encoder = codec.encoder(config.codec, &opus)?;

        tracing::debug!(
            codec = config.codec.name(),
            sample_rate = opus.sample_rate,
            bitrate = opus.bitrate,
            "Audio player created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                sequence: AtomicU32::new(0),
                sequence_modulus: config.sequence_modulus,
                volume: AtomicU8::new(config.volume.min(100)),
                playing: AtomicBool::new(false),
                stats: PlayerStats::default(),
            }),
            codec,
            config,
            opus,
            encoder: Some(encoder),
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        })
    }

    pub fn volume(&self) -> u8 {
        self.shared.volume.load(Ordering::Relaxed)
    }

    /// Volume in percent, clamped to 100; applies to the next frame
    pub fn set_volume(&self, volume: u8) {
        self.shared.volume.store(volume.min(100), Ordering::Relaxed);
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    pub fn codec(&self) -> CodecKind {
        self.config.codec
    }

    pub fn opus_config(&self) -> &OpusConfig {
        &self.opus
    }

    pub fn stats(&self) -> &PlayerStats {
        &self.shared.stats
    }

    /// Play a mono 16-bit WAV file until it ends or [`stop`](Self::stop) is called
    pub fn play_file(&mut self, path: impl AsRef<Path>) -> Result<bool, Error> {
        if self.is_playing() {
            return Ok(false);
        }
        let source = PcmSource::wav(path, self.opus.sample_rate)?;
        self.play(source)
    }

    /// Stream raw samples from a named pipe until stopped
    pub fn stream_named_pipe(&mut self, path: impl AsRef<Path>) -> Result<bool, Error> {
        if self.is_playing() {
            return Ok(false);
        }
        let source = PcmSource::pipe(path)?;
        self.play(source)
    }

    /// Start playing `source`. Returns `false` if already playing.
    pub fn play(&mut self, source: PcmSource) -> Result<bool, Error> {
        if self.is_playing() {
            return Ok(false);
        }
        source.check_sample_rate(self.opus.sample_rate)?;
        // a bounded source that ran out left its thread behind
        self.join_workers();

        tracing::info!(source = source.label(), mode = ?source.mode(), "Playback started");
        self.start(source, None)?;
        Ok(true)
    }

    /// Stop the workers, reset the encoder and close the source
    pub fn stop(&mut self) {
        let was_playing = self.is_playing();
        if let Some(resume) = self.halt() {
            drop(resume.source);
        }
        if let Some(encoder) = self.encoder.as_mut() {
            if let Err(e) = encoder.reset() {
                tracing::warn!("Encoder reset failed: {}", e);
            }
        }
        if was_playing {
            tracing::info!("Playback stopped");
        }
    }

    /// Switch codec; restarts playback with the new encoder if playing
    pub fn set_codec(&mut self, kind: CodecKind) -> Result<(), Error> {
        let opus = self.opus.clone();
        self.reconfigure(kind, opus)
    }

    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), Error> {
        let opus = OpusConfig {
            bitrate,
            ..self.opus.clone()
        };
        self.reconfigure(self.config.codec, opus)
    }

    /// Change the sample rate; the frame size keeps its duration
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<(), Error> {
        let duration_ms = self.opus.frame_duration_ms();
        let opus = OpusConfig {
            sample_rate,
            frame_size: OpusConfig::frame_size_from_ms(sample_rate, duration_ms),
            ..self.opus.clone()
        };
        opus.validate()?;
        self.reconfigure(self.config.codec, opus)
    }

    /// Next send sequence number, 1 through the configured modulus
    pub fn next_sequence(&self) -> u32 {
        self.shared.next_sequence()
    }

    /// Build the new encoder, then tear down and restart around it
    fn reconfigure(&mut self, kind: CodecKind, opus: OpusConfig) -> Result<(), Error> {
        let encoder = self.codec.encoder(kind, &opus)?;
        let resume = self.halt();

        self.encoder = Some(encoder);
        self.config.codec = kind;
        self.opus = opus;
        tracing::info!(
            codec = kind.name(),
            sample_rate = self.opus.sample_rate,
            bitrate = self.opus.bitrate,
            "Encoder rebuilt"
        );

        if let Some(resume) = resume {
            if let Err(e) = resume.source.check_sample_rate(self.opus.sample_rate) {
                tracing::warn!("Playback stopped, source no longer matches: {}", e);
                self.stop();
                return Ok(());
            }
            self.start(resume.source, resume.lookahead)?;
        }
        Ok(())
    }

    /// Stop and join the workers, reclaiming the encoder.
    ///
    /// Returns the source if playback was interrupted before it ran out.
    fn halt(&mut self) -> Option<Resume> {
        self.running.store(false, Ordering::SeqCst);
        let resume = self.join_workers();
        self.shared.playing.store(false, Ordering::SeqCst);
        resume
    }

    fn join_workers(&mut self) -> Option<Resume> {
        let mut resume = None;
        for handle in self.workers.drain(..) {
            match handle.join() {
                Ok(Some(session)) => {
                    self.encoder = Some(session.encoder);
                    if let Some(source) = session.source {
                        resume = Some(Resume {
                            source,
                            lookahead: session.lookahead,
                        });
                    }
                }
                Ok(None) => {}
                Err(_) => tracing::error!("Encode worker panicked"),
            }
        }
        resume
    }

    fn start(&mut self, source: PcmSource, lookahead: Option<Vec<i16>>) -> Result<(), Error> {
        let encoder = match self.encoder.take() {
            Some(encoder) => encoder,
            None => self.codec.encoder(self.config.codec, &self.opus)?,
        };

        let running = Arc::new(AtomicBool::new(true));
        self.running = running.clone();
        self.shared.playing.store(true, Ordering::SeqCst);

        let header = header_byte(self.config.codec.message_type());
        let mode = source.mode();
        let session = EncodeSession {
            encoder,
            source: Some(source),
            lookahead,
        };

        let result = match mode {
            PlaybackMode::Bounded => {
                let shared = self.shared.clone();
                thread::Builder::new()
                    .name("voice-play".into())
                    .spawn(move || run_bounded(session, shared, header, running))
                    .map(|handle| self.workers.push(handle))
            }
            PlaybackMode::Continuous => self.spawn_continuous(session, header, running),
        };

        if let Err(e) = result {
            self.halt();
            return Err(AudioError::WorkerSpawn(e.to_string()).into());
        }
        Ok(())
    }

    fn spawn_continuous(
        &mut self,
        session: EncodeSession,
        header: u8,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<()> {
        let (queue, receiver) = SendQueue::bounded(self.config.queue_capacity);

        let shared = self.shared.clone();
        let producer_running = running.clone();
        let producer = thread::Builder::new()
            .name("voice-encode".into())
            .spawn(move || run_producer(session, shared, queue, producer_running))?;
        self.workers.push(producer);

        let shared = self.shared.clone();
        let consumer = thread::Builder::new()
            .name("voice-send".into())
            .spawn(move || run_consumer(receiver, shared, header, running))?;
        self.workers.push(consumer);
        Ok(())
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.halt();
    }
}

enum NextFrame {
    Ready(Vec<i16>),
    Exhausted,
    /// The stop flag was cleared while waiting on the source
    Stopped,
}

/// Wait for the next frame in short slices so a silent source never outlives a stop
fn next_frame(source: &mut PcmSource, samples: usize, running: &AtomicBool) -> NextFrame {
    while running.load(Ordering::Relaxed) {
        match source.poll_frame(samples, SOURCE_WAIT) {
            Ok(FramePoll::Frame(frame)) => return NextFrame::Ready(frame),
            Ok(FramePoll::Pending) => {}
            Ok(FramePoll::Exhausted) => return NextFrame::Exhausted,
            Err(e) => {
                tracing::warn!(
                    source = source.label(),
                    "Source read failed, ending playback: {}",
                    e
                );
                return NextFrame::Exhausted;
            }
        }
    }
    NextFrame::Stopped
}

/// Read, encode and send frame by frame; the frame read ahead decides `last`
fn run_bounded(
    mut session: EncodeSession,
    shared: Arc<Shared>,
    header: u8,
    running: Arc<AtomicBool>,
) -> Option<EncodeSession> {
    let samples = session.encoder.samples_per_frame();
    let mut source = session.source.take()?;
    let mut next = match session.lookahead.take() {
        Some(frame) => Some(frame),
        None => match next_frame(&mut source, samples, &running) {
            NextFrame::Ready(frame) => Some(frame),
            NextFrame::Exhausted => None,
            NextFrame::Stopped => {
                session.source = Some(source);
                return Some(session);
            }
        },
    };

    while running.load(Ordering::Relaxed) {
        let Some(pcm) = next.take() else {
            break;
        };
        let last = match next_frame(&mut source, samples, &running) {
            NextFrame::Ready(frame) => {
                next = Some(frame);
                false
            }
            NextFrame::Exhausted => true,
            NextFrame::Stopped => {
                // not sent yet; resumes as the read-ahead frame
                next = Some(pcm);
                break;
            }
        };

        if let Some(payload) = shared.encode(session.encoder.as_mut(), pcm) {
            shared.send(header, EncodedFrame { payload, last });
        }
    }

    if next.is_some() {
        session.source = Some(source);
        session.lookahead = next;
        return Some(session);
    }

    tracing::info!(source = source.label(), "Source exhausted, playback finished");
    drop(source);
    if let Err(e) = session.encoder.reset() {
        tracing::warn!("Encoder reset failed: {}", e);
    }
    shared.playing.store(false, Ordering::SeqCst);
    Some(session)
}

fn run_producer(
    mut session: EncodeSession,
    shared: Arc<Shared>,
    queue: SendQueue,
    running: Arc<AtomicBool>,
) -> Option<EncodeSession> {
    let samples = session.encoder.samples_per_frame();
    let mut source = session.source.take()?;

    let mut exhausted = false;
    while running.load(Ordering::Relaxed) {
        let pcm = match next_frame(&mut source, samples, &running) {
            NextFrame::Ready(frame) => frame,
            NextFrame::Exhausted => {
                exhausted = true;
                break;
            }
            NextFrame::Stopped => break,
        };
        let Some(payload) = shared.encode(session.encoder.as_mut(), pcm) else {
            continue;
        };
        match queue.push(EncodedFrame { payload, last: false }, &running) {
            QueueStatus::Ready(()) => {}
            QueueStatus::Stopped | QueueStatus::Disconnected => break,
        }
    }

    if exhausted {
        tracing::info!(source = source.label(), "Stream closed by writer");
        if let Err(e) = session.encoder.reset() {
            tracing::warn!("Encoder reset failed: {}", e);
        }
    } else {
        session.source = Some(source);
    }
    Some(session)
}

/// Drains the queue; once the producer is gone and the queue is empty the player goes idle
fn run_consumer(
    receiver: SendQueueReceiver,
    shared: Arc<Shared>,
    header: u8,
    running: Arc<AtomicBool>,
) -> Option<EncodeSession> {
    loop {
        match receiver.pop(&running) {
            QueueStatus::Ready(frame) => shared.send(header, frame),
            QueueStatus::Stopped => break,
            QueueStatus::Disconnected => {
                shared.playing.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OpusCodec;
    use crate::error::CodecError;
    use crate::network::ChannelTransport;
    use crate::protocol::FRAME_HEADER_LEN;
    use std::io::Cursor;
    use std::time::Duration;

    fn player(config: PlayerConfig) -> (AudioPlayer, crossbeam_channel::Receiver<Bytes>) {
        let (transport, rx) = ChannelTransport::pair();
        let player = AudioPlayer::new(
            Arc::new(OpusCodec),
            Arc::new(transport),
            config,
            OpusConfig::default(),
        )
        .unwrap();
        (player, rx)
    }

    fn raw_source(frames: usize, mode: PlaybackMode) -> PcmSource {
        let bytes: Vec<u8> = (0..frames * 960)
            .flat_map(|i| (((i * 37) % 8000) as i16 - 4000).to_le_bytes())
            .collect();
        PcmSource::from_reader("test", Cursor::new(bytes), mode).unwrap()
    }

    fn wait_idle(player: &AudioPlayer) {
        for _ in 0..500 {
            if !player.is_playing() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("player did not stop");
    }

    #[test]
    fn test_apply_volume() {
        let mut pcm = vec![1000, -1000, 3, -3, i16::MAX, i16::MIN];
        apply_volume(&mut pcm, 50);
        assert_eq!(pcm, vec![500, -500, 1, -1, 16383, -16384]);

        let mut loud = vec![1234, -1234];
        apply_volume(&mut loud, 100);
        assert_eq!(loud, vec![1234, -1234]);
    }

    #[test]
    fn test_celt_fails_fast() {
        let (transport, _rx) = ChannelTransport::pair();
        let config = PlayerConfig {
            codec: CodecKind::CeltBeta,
            ..PlayerConfig::default()
        };
        let result = AudioPlayer::new(
            Arc::new(OpusCodec),
            Arc::new(transport),
            config,
            OpusConfig::default(),
        );
        assert!(matches!(result, Err(Error::Codec(CodecError::Unsupported(_)))));
    }

    #[test]
    fn test_sequence_wraps() {
        let (player, _rx) = player(PlayerConfig {
            sequence_modulus: 3,
            ..PlayerConfig::default()
        });
        let sequences: Vec<u32> = (0..5).map(|_| player.next_sequence()).collect();
        assert_eq!(sequences, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn test_bounded_playback_stops_itself() {
        let (mut player, rx) = player(PlayerConfig::default());
        assert!(player.play(raw_source(3, PlaybackMode::Bounded)).unwrap());
        wait_idle(&player);

        let packets: Vec<Bytes> = rx.try_iter().collect();
        assert_eq!(packets.len(), 3);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet[0], 0x80);
            let frame = VoicePacket::from_slice(&packet[1..]).unwrap();
            assert_eq!(frame.sequence, i as u32 + 1);
            assert_eq!(frame.last, i == 2);
            assert_eq!(packet.len(), 1 + FRAME_HEADER_LEN + frame.payload.len());
        }

        // idle again: a new source plays and numbering continues
        assert!(player.play(raw_source(1, PlaybackMode::Bounded)).unwrap());
        wait_idle(&player);
        let packet = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(VoicePacket::from_slice(&packet[1..]).unwrap().sequence, 4);
    }

    #[test]
    fn test_play_while_playing_is_noop() {
        let (mut player, _rx) = player(PlayerConfig::default());
        // a continuous reader that never ends
        let endless =
            PcmSource::from_reader("zeros", std::io::repeat(0), PlaybackMode::Continuous).unwrap();
        assert!(player.play(endless).unwrap());
        assert!(!player.play(raw_source(1, PlaybackMode::Bounded)).unwrap());

        player.stop();
        assert!(!player.is_playing());
    }

    #[test]
    fn test_continuous_stream_drains_queue() {
        let (mut player, rx) = player(PlayerConfig::default());
        assert!(player.play(raw_source(5, PlaybackMode::Continuous)).unwrap());
        wait_idle(&player);

        let sequences: Vec<u32> = rx
            .try_iter()
            .map(|packet| VoicePacket::from_slice(&packet[1..]).unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert_eq!(player.stats().packets_sent.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_set_codec_rejects_celt_and_keeps_state() {
        let (mut player, _rx) = player(PlayerConfig::default());
        assert!(player.set_codec(CodecKind::CeltAlpha).is_err());
        assert_eq!(player.codec(), CodecKind::Opus);

        player.set_bitrate(24_000).unwrap();
        assert_eq!(player.opus_config().bitrate, 24_000);

        player.set_sample_rate(16_000).unwrap();
        assert_eq!(player.opus_config().frame_size, 320);
    }
}
