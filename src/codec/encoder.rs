//! Opus encoder wrapper
//!
//! Encodes mono 16-bit voice frames. Output is capped so every frame fits
//! the 7-bit length field of the voice packet.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::codec::VoiceEncoder;
use crate::config::{OpusConfig, OpusSignal};
use crate::constants::MAX_PAYLOAD_LEN;
use crate::error::CodecError;

/// Opus encoder wrapper
pub struct OpusEncoder {
    encoder: Encoder,
    config: OpusConfig,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
}

impl OpusEncoder {
    /// Create a new Opus encoder with the specified configuration
    pub fn new(config: OpusConfig) -> Result<Self, CodecError> {
        let channels = match config.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported channel count: {}",
                    config.channels
                )))
            }
        };

        // The signal hint selects the application profile
        let application = match config.signal {
            OpusSignal::Voice => Application::Voip,
            OpusSignal::Music | OpusSignal::Auto => Application::Audio,
        };

        let mut encoder = Encoder::new(config.sample_rate, channels, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Self::configure_encoder(&mut encoder, &config)?;

        Ok(Self {
            encoder,
            config,
            encode_buffer: vec![0u8; MAX_PAYLOAD_LEN],
        })
    }

    fn configure_encoder(encoder: &mut Encoder, config: &OpusConfig) -> Result<(), CodecError> {
        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(config.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        Ok(())
    }
}

impl VoiceEncoder for OpusEncoder {
    /// Input must be interleaved samples with length = frame_size * channels
    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError> {
        if pcm.len() != self.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }

        let size = self
            .encoder
            .encode(pcm, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.encoder
            .reset_state()
            .map_err(|e| CodecError::EncoderInit(e.to_string()))
    }

    fn frame_size(&self) -> usize {
        self.config.frame_size
    }

    fn samples_per_frame(&self) -> usize {
        self.config.samples_per_frame()
    }
}
