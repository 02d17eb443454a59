//! Opus decoder wrapper
//!
//! Provides Opus decoding with packet loss concealment.

use opus::{Channels, Decoder};

use crate::codec::VoiceDecoder;
use crate::error::CodecError;

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    channels: u16,
    frame_size: usize,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
}

impl OpusDecoder {
    /// Create a new Opus decoder
    pub fn new(sample_rate: u32, channels: u16, frame_size: usize) -> Result<Self, CodecError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::DecoderInit(format!(
                    "Unsupported channel count: {}",
                    channels
                )))
            }
        };

        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        // 120 ms is the longest Opus frame
        let decode_buffer = vec![0i16; sample_rate as usize * channels as usize * 120 / 1000];

        Ok(Self {
            decoder,
            channels,
            frame_size,
            decode_buffer,
        })
    }

    fn run(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError> {
        // Concealment synthesizes as many samples as there is room for
        let room = if data.is_empty() {
            self.frame_size * self.channels as usize
        } else {
            self.decode_buffer.len()
        };

        let samples = self
            .decoder
            .decode(data, &mut self.decode_buffer[..room], false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        let total_samples = samples * self.channels as usize;
        Ok(self.decode_buffer[..total_samples].to_vec())
    }
}

impl VoiceDecoder for OpusDecoder {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>, CodecError> {
        self.run(frame)
    }

    /// An empty packet asks libopus for concealment
    fn decode_missed(&mut self) -> Result<Vec<i16>, CodecError> {
        self.run(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{OpusEncoder, VoiceEncoder};
    use crate::config::OpusConfig;

    #[test]
    fn test_decoder_creation() {
        assert!(OpusDecoder::new(48000, 1, 960).is_ok());
        assert!(OpusDecoder::new(48000, 3, 960).is_err());
    }

    #[test]
    fn test_encode_decode() {
        let mut encoder = OpusEncoder::new(OpusConfig::default()).unwrap();
        let mut decoder = OpusDecoder::new(48000, 1, encoder.frame_size()).unwrap();

        let samples: Vec<i16> = (0..960)
            .map(|i| {
                let t = i as f32 / 48000.0;
                ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16
            })
            .collect();

        let encoded = encoder.encode(&samples).unwrap();
        let decoded = decoder.decode(&encoded).unwrap();

        assert_eq!(decoded.len(), 960);
        assert!(decoded.iter().any(|&s| s != 0));
    }

    #[test]
    fn test_plc() {
        let mut decoder = OpusDecoder::new(48000, 1, 960).unwrap();

        let mut encoder = OpusEncoder::new(OpusConfig::default()).unwrap();
        let encoded = encoder.encode(&vec![0i16; 960]).unwrap();
        decoder.decode(&encoded).unwrap();

        let concealed = decoder.decode_missed().unwrap();
        assert_eq!(concealed.len(), 960);
    }
}
