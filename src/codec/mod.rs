//! Codec capability
//!
//! The pipeline only sees the [`VoiceEncoder`] / [`VoiceDecoder`] traits;
//! [`OpusCodec`] is the bundled provider.

pub mod decoder;
pub mod encoder;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::OpusConfig;
use crate::error::CodecError;

/// Codecs the wire protocol can announce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodecKind {
    CeltAlpha,
    CeltBeta,
    #[default]
    Opus,
}

impl CodecKind {
    /// Message type carried in the top bits of the packet header
    pub fn message_type(self) -> u8 {
        match self {
            CodecKind::CeltAlpha => 0,
            CodecKind::CeltBeta => 3,
            CodecKind::Opus => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecKind::CeltAlpha => "celt-alpha",
            CodecKind::CeltBeta => "celt-beta",
            CodecKind::Opus => "opus",
        }
    }
}

/// Turns PCM frames into codec frames
pub trait VoiceEncoder: Send {
    /// Encode exactly one frame of interleaved 16-bit PCM
    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError>;

    /// Drop internal prediction state
    fn reset(&mut self) -> Result<(), CodecError>;

    /// Samples per channel in one frame
    fn frame_size(&self) -> usize;

    /// Samples across all channels in one frame
    fn samples_per_frame(&self) -> usize;
}

/// Turns codec frames into PCM; dropping it releases the native state
pub trait VoiceDecoder: Send {
    /// Decode one codec frame
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>, CodecError>;

    /// Synthesize a frame for a packet that never arrived
    fn decode_missed(&mut self) -> Result<Vec<i16>, CodecError>;
}

/// Builds encoders and decoders once the codec has been negotiated
pub trait CodecProvider: Send + Sync {
    fn encoder(
        &self,
        kind: CodecKind,
        config: &OpusConfig,
    ) -> Result<Box<dyn VoiceEncoder>, CodecError>;

    fn decoder(&self, config: &OpusConfig) -> Result<Box<dyn VoiceDecoder>, CodecError>;
}

/// libopus-backed provider; CELT is not available
#[derive(Debug, Clone, Copy, Default)]
pub struct OpusCodec;

impl CodecProvider for OpusCodec {
    fn encoder(
        &self,
        kind: CodecKind,
        config: &OpusConfig,
    ) -> Result<Box<dyn VoiceEncoder>, CodecError> {
        match kind {
            CodecKind::Opus => Ok(Box::new(OpusEncoder::new(config.clone())?)),
            other => Err(CodecError::Unsupported(other.name().to_string())),
        }
    }

    fn decoder(&self, config: &OpusConfig) -> Result<Box<dyn VoiceDecoder>, CodecError> {
        Ok(Box::new(OpusDecoder::new(
            config.sample_rate,
            config.channels,
            config.frame_size,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_types() {
        assert_eq!(CodecKind::Opus.message_type(), 4);
        assert_eq!(CodecKind::CeltAlpha.message_type(), 0);
        assert_eq!(CodecKind::CeltBeta.message_type(), 3);
    }

    #[test]
    fn test_celt_unsupported() {
        let result = OpusCodec.encoder(CodecKind::CeltAlpha, &OpusConfig::default());
        assert!(matches!(result, Err(CodecError::Unsupported(name)) if name == "celt-alpha"));
    }
}
