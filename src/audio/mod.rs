//! Audio subsystem module

pub mod buffer;
pub mod jitter;
pub mod mixer;
pub mod source;

pub use buffer::{PcmPullBuffer, SpeakerPcm};
pub use jitter::{JitterBuffer, JitterEntry, JitterStats};
pub use mixer::{hard_limit, mix_chunks, Limiter, Mixer};
pub use source::{FramePoll, PcmSource, PlaybackMode};
