//! Test codecs with predictable output

#![allow(dead_code)]

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io::Read;
use std::time::{Duration, Instant};
use voice_pipeline::codec::{CodecKind, CodecProvider, VoiceDecoder, VoiceEncoder};
use voice_pipeline::config::OpusConfig;
use voice_pipeline::error::CodecError;

/// Two-byte payload `[hi, lo]` decodes to a frame filled with that value
pub struct LevelDecoder {
    samples: usize,
}

impl VoiceDecoder for LevelDecoder {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>, CodecError> {
        match frame {
            [hi, lo] => Ok(vec![i16::from_be_bytes([*hi, *lo]); self.samples]),
            _ => Err(CodecError::DecodingFailed(format!("{} byte frame", frame.len()))),
        }
    }

    fn decode_missed(&mut self) -> Result<Vec<i16>, CodecError> {
        Ok(vec![0; self.samples])
    }
}

/// Encodes samples as big-endian bytes, verbatim
pub struct PassthroughEncoder {
    config: OpusConfig,
}

impl VoiceEncoder for PassthroughEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError> {
        if pcm.len() != self.config.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }
        Ok(pcm.iter().flat_map(|s| s.to_be_bytes()).collect())
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn frame_size(&self) -> usize {
        self.config.frame_size
    }

    fn samples_per_frame(&self) -> usize {
        self.config.samples_per_frame()
    }
}

pub struct TestCodec;

impl CodecProvider for TestCodec {
    fn encoder(
        &self,
        kind: CodecKind,
        config: &OpusConfig,
    ) -> Result<Box<dyn VoiceEncoder>, CodecError> {
        match kind {
            CodecKind::Opus => Ok(Box::new(PassthroughEncoder {
                config: config.clone(),
            })),
            other => Err(CodecError::Unsupported(other.name().into())),
        }
    }

    fn decoder(&self, config: &OpusConfig) -> Result<Box<dyn VoiceDecoder>, CodecError> {
        Ok(Box::new(LevelDecoder {
            samples: config.samples_per_frame(),
        }))
    }
}

/// Reader fed by hand: blocks until bytes are sent, end of file once the sender drops
pub struct FeedReader(Receiver<Vec<u8>>);

impl FeedReader {
    pub fn pair() -> (Sender<Vec<u8>>, FeedReader) {
        let (tx, rx) = unbounded();
        (tx, FeedReader(rx))
    }
}

impl Read for FeedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.0.recv() {
            Ok(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Err(_) => Ok(0),
        }
    }
}

pub fn level(value: i16) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// Poll `check` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}
