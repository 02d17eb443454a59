//! Pipeline configuration
//!
//! Loaded from a TOML file. Every section carries defaults, so a partial
//! file (or none at all) yields a working configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::CodecKind;
use crate::constants::*;
use crate::error::Error;

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Codec parameters shared by both directions
    pub codec: OpusConfig,
    /// Receive path (jitter buffer, mixer, output)
    pub receiver: ReceiverConfig,
    /// Send path (encode pipeline)
    pub player: PlayerConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load_or_default() -> Result<Self, Error> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Platform config path, e.g. `~/.config/voice-pipeline/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "voice-pipeline")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), Error> {
        self.codec.validate()?;
        self.receiver.validate()?;
        self.player.validate()?;
        Ok(())
    }
}

/// Opus signal type hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpusSignal {
    Auto,
    Voice,
    Music,
}

/// Opus codec configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count (the wire format carries mono voice)
    pub channels: u16,
    /// Frame size in samples per channel
    pub frame_size: usize,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Variable bitrate; `false` selects CBR
    pub vbr: bool,
    /// Signal type hint
    pub signal: OpusSignal,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_size: DEFAULT_FRAME_SIZE,
            bitrate: DEFAULT_BITRATE,
            vbr: false,
            signal: OpusSignal::Music,
        }
    }
}

impl OpusConfig {
    /// Frame size in samples for a duration in milliseconds
    pub fn frame_size_from_ms(sample_rate: u32, ms: f32) -> usize {
        (sample_rate as f32 * ms / 1000.0) as usize
    }

    /// Frame duration in milliseconds
    pub fn frame_duration_ms(&self) -> f32 {
        self.frame_size as f32 * 1000.0 / self.sample_rate as f32
    }

    /// Samples per frame across all channels
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !matches!(self.sample_rate, 8000 | 12000 | 16000 | 24000 | 48000) {
            return Err(Error::Config(format!(
                "unsupported sample rate: {}",
                self.sample_rate
            )));
        }
        if !matches!(self.channels, 1 | 2) {
            return Err(Error::Config(format!(
                "unsupported channel count: {}",
                self.channels
            )));
        }
        // Opus accepts 2.5, 5, 10, 20, 40 and 60 ms frames
        let allowed = [2.5f32, 5.0, 10.0, 20.0, 40.0, 60.0];
        let valid_frame = allowed
            .iter()
            .any(|ms| Self::frame_size_from_ms(self.sample_rate, *ms) == self.frame_size);
        if !valid_frame {
            return Err(Error::Config(format!(
                "frame size {} is not a valid Opus frame at {} Hz",
                self.frame_size, self.sample_rate
            )));
        }
        Ok(())
    }
}

/// How the mixer treats the summed speaker chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NormalizerMode {
    /// Incoming voice is not decoded at all
    #[default]
    Off,
    /// 32-bit sums written unmodified
    RawMerge,
    /// Limiter with slow recovery, 16-bit output
    SoftNormalize,
    /// Plain clamp to the 16-bit range
    HardLimit,
    /// Soft-normalize into the pull buffer instead of the sink
    BufferOnly,
}

impl NormalizerMode {
    /// Whether incoming packets are decoded under this mode
    pub fn decodes(self) -> bool {
        self != NormalizerMode::Off
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            NormalizerMode::Off => 0,
            NormalizerMode::RawMerge => 1,
            NormalizerMode::SoftNormalize => 2,
            NormalizerMode::HardLimit => 3,
            NormalizerMode::BufferOnly => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => NormalizerMode::RawMerge,
            2 => NormalizerMode::SoftNormalize,
            3 => NormalizerMode::HardLimit,
            4 => NormalizerMode::BufferOnly,
            _ => NormalizerMode::Off,
        }
    }
}

/// Destination of the mixed PCM stream
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputTarget {
    /// Mixed audio is dropped
    #[default]
    Discard,
    /// Standard output
    Stdout,
    /// A file, truncated on open
    File(PathBuf),
}

impl OutputTarget {
    /// `"-"` selects stdout, anything else is a file path
    pub fn from_path(path: &str) -> Self {
        if path == "-" {
            OutputTarget::Stdout
        } else {
            OutputTarget::File(PathBuf::from(path))
        }
    }
}

/// Receive path configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Jitter buffer target depth in packets (>= 2)
    pub jitter_depth: usize,
    /// Release a short buffer after this long without new packets
    pub jitter_flush_ms: u64,
    /// Mixing policy
    pub normalizer: NormalizerMode,
    /// Mixed PCM destination
    pub output: OutputTarget,
    /// Pull buffer capacity in bytes, 0 = unset
    pub pcm_buffer_capacity: usize,
    /// Minimum mixer tick
    pub mixer_tick_ms: u64,
    /// Pacing sleep with an empty backlog
    pub pacing_base_ms: u64,
    /// Backlog (samples) at which the pacing sleep reaches zero
    pub pacing_zero_samples: usize,
    /// Backlog (samples) above which pacing is skipped
    pub pacing_ceiling_samples: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            jitter_depth: DEFAULT_JITTER_DEPTH,
            jitter_flush_ms: DEFAULT_JITTER_FLUSH_MS,
            normalizer: NormalizerMode::Off,
            output: OutputTarget::Discard,
            pcm_buffer_capacity: 0,
            mixer_tick_ms: 1,
            pacing_base_ms: 50,
            pacing_zero_samples: 24_000,
            pacing_ceiling_samples: 48_000,
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.jitter_depth < MIN_JITTER_DEPTH {
            return Err(Error::Config(format!(
                "jitter depth must be at least {}, got {}",
                MIN_JITTER_DEPTH, self.jitter_depth
            )));
        }
        if self.pacing_zero_samples == 0 {
            return Err(Error::Config("pacing_zero_samples must be non-zero".into()));
        }
        Ok(())
    }
}

/// Send path configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Codec announced in the packet header
    pub codec: CodecKind,
    /// Software volume in percent (0-100)
    pub volume: u8,
    /// Encoded frames buffered between producer and consumer
    pub queue_capacity: usize,
    /// Send sequence numbers wrap at this value
    pub sequence_modulus: u32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            codec: CodecKind::Opus,
            volume: 100,
            queue_capacity: SEND_QUEUE_CAPACITY,
            sequence_modulus: SEQUENCE_MODULUS,
        }
    }
}

impl PlayerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.volume > 100 {
            return Err(Error::Config(format!("volume must be 0-100, got {}", self.volume)));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be non-zero".into()));
        }
        if self.sequence_modulus == 0 {
            return Err(Error::Config("sequence_modulus must be non-zero".into()));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Include module targets in output
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            with_target: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.codec.frame_size, 960);
        assert!((config.codec.frame_duration_ms() - 20.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [receiver]
            jitter_depth = 4
            normalizer = "hard-limit"
            output = { file = "/tmp/mix.raw" }

            [player]
            volume = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.receiver.jitter_depth, 4);
        assert_eq!(config.receiver.normalizer, NormalizerMode::HardLimit);
        assert_eq!(
            config.receiver.output,
            OutputTarget::File(PathBuf::from("/tmp/mix.raw"))
        );
        assert_eq!(config.player.volume, 50);
        assert_eq!(config.codec.sample_rate, 48000);
    }

    #[test]
    fn test_rejects_shallow_jitter() {
        let mut config = AppConfig::default();
        config.receiver.jitter_depth = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_frame_size() {
        let mut config = OpusConfig::default();
        config.frame_size = 1000;
        assert!(config.validate().is_err());

        config.frame_size = 480;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.player.volume = 75;
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.player.volume, 75);
    }

    #[test]
    fn test_output_target_from_path() {
        assert_eq!(OutputTarget::from_path("-"), OutputTarget::Stdout);
        assert_eq!(
            OutputTarget::from_path("out.raw"),
            OutputTarget::File(PathBuf::from("out.raw"))
        );
    }
}
