//! Network subsystem: the packet send capability and its implementations

pub mod transport;
pub mod udp;

pub use transport::{ChannelTransport, VoiceTransport};
pub use udp::{create_socket, UdpTransport};
