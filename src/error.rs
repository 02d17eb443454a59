//! Error types for the voice pipeline

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local audio source and output sink errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Failed to open source {path}: {reason}")]
    SourceOpen { path: String, reason: String },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Source read failed: {0}")]
    SourceRead(String),

    #[error("Output sink failed: {0}")]
    Sink(String),

    #[error("Worker spawn failed: {0}")]
    WorkerSpawn(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unsupported codec: {0}")]
    Unsupported(String),

    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Wire framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Malformed packet: need {needed} bytes, have {available}")]
    Malformed { needed: usize, available: usize },

    #[error("Payload too large: {0} bytes (max 127)")]
    PayloadTooLarge(usize),

    #[error("Empty packet")]
    Empty,
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,
}

impl From<hound::Error> for AudioError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) => AudioError::SourceRead(e.to_string()),
            hound::Error::Unsupported => {
                AudioError::UnsupportedFormat("unsupported WAV layout".to_string())
            }
            other => AudioError::UnsupportedFormat(other.to_string()),
        }
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
