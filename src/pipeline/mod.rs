//! Send and receive pipelines
//!
//! - [`AudioPlayer`]: local PCM to sequence-numbered packets
//! - [`ReceivePipeline`]: relayed packets to one mixed PCM stream

pub mod decode;
pub mod player;
pub mod queue;
pub mod receiver;
pub mod recorder;

pub use decode::{DecodeStats, DecodeWorker, SpeakerChannel};
pub use player::{apply_volume, AudioPlayer, PlayerStats};
pub use queue::{EncodedFrame, SendQueue};
pub use receiver::{ReceivePipeline, ReceiveStats};
pub use recorder::Recorder;
