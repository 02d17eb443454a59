//! Send capability used by the encode pipeline

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::NetworkError;

/// Delivers framed voice packets to the server
pub trait VoiceTransport: Send + Sync {
    fn send_packet(&self, data: Bytes) -> Result<(), NetworkError>;
}

/// In-process transport backed by a channel
#[derive(Clone)]
pub struct ChannelTransport {
    tx: Sender<Bytes>,
}

impl ChannelTransport {
    /// Transport plus the receiving end of its packets
    pub fn pair() -> (Self, Receiver<Bytes>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl VoiceTransport for ChannelTransport {
    fn send_packet(&self, data: Bytes) -> Result<(), NetworkError> {
        self.tx.send(data).map_err(|_| NetworkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_transport() {
        let (transport, rx) = ChannelTransport::pair();
        transport.send_packet(Bytes::from_static(b"abc")).unwrap();
        assert_eq!(rx.recv().unwrap(), Bytes::from_static(b"abc"));

        drop(rx);
        assert!(matches!(
            transport.send_packet(Bytes::new()),
            Err(NetworkError::Closed)
        ));
    }
}
