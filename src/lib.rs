//! # Voice Pipeline
//!
//! Real-time voice media pipeline for a voice-chat client: the send path
//! turns local PCM into sequence-numbered Opus packets, the receive path
//! turns per-speaker packets arriving out of order into one mixed,
//! loss-concealed PCM stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── SEND PATH ─────────────────────────────────┐
//! │  ┌────────────┐   ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌───────┐  │
//! │  │ WAV / pipe │──▶│  volume  │──▶│   Opus   │──▶│ send queue│──▶│framer │──▶ transport
//! │  │   source   │   │  scaling │   │ encoder  │   │  (100)    │   │ seq++ │  │
//! │  └────────────┘   └──────────┘   └──────────┘   └───────────┘   └───────┘  │
//! │        producer thread ───────────────────┘           consumer thread      │
//! └────────────────────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────── RECEIVE PATH ───────────────────────────────┐
//! │ transport ──▶ process_tunnel ──┬──▶ recorder (raw frames, optional)         │
//! │                                ▼                                           │
//! │              ┌──────────┐ ┌──────────┐ ┌──────────┐                        │
//! │              │ Jitter 1 │ │ Jitter 2 │ │ Jitter N │   one per speaker       │
//! │              └────┬─────┘ └────┬─────┘ └────┬─────┘                        │
//! │                   ▼            ▼            ▼                              │
//! │              ┌──────────────────────────────────┐                          │
//! │              │ decode worker (lazy decoders,    │                          │
//! │              │ loss concealment on gaps)        │                          │
//! │              └────┬────────────┬────────────┬───┘                          │
//! │                   ▼            ▼            ▼                              │
//! │              ┌────────┐   ┌────────┐   ┌────────┐                          │
//! │              │ PCM 1  │   │ PCM 2  │   │ PCM N  │   speaker accumulators    │
//! │              └───┬────┘   └───┬────┘   └───┬────┘                          │
//! │                  └────────────┼────────────┘                               │
//! │                               ▼                                            │
//! │                  mixer thread (sum → normalize) ──▶ file / stdout / pull   │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod pipeline;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Crate-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Voice is carried as mono
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 32_000;

    /// Default frame size in samples (20 ms at 48 kHz)
    pub const DEFAULT_FRAME_SIZE: usize = 960;

    /// Largest encoded frame the length byte can describe
    pub const MAX_PAYLOAD_LEN: usize = 127;

    /// Default jitter buffer depth in packets
    pub const DEFAULT_JITTER_DEPTH: usize = 25;

    /// Smallest useful jitter buffer depth
    pub const MIN_JITTER_DEPTH: usize = 2;

    /// Idle time after which a short jitter buffer is flushed
    pub const DEFAULT_JITTER_FLUSH_MS: u64 = 60;

    /// Encoded frames buffered between encode and send
    pub const SEND_QUEUE_CAPACITY: usize = 100;

    /// Send-side sequence numbers wrap at this value
    pub const SEQUENCE_MODULUS: u32 = 1_000_000;

    /// Maximum datagram size for UDP
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers
}
