//! UDP voice transport
//!
//! One socket per session. Outbound packets go to the server address;
//! inbound datagrams from that address are handed to a callback on a
//! dedicated receive thread.

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;
use crate::network::VoiceTransport;

/// Socket buffer size; a few hundred voice packets
const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// How often the receive thread checks its stop flag
const RECV_POLL: Duration = Duration::from_millis(100);

/// Create a bound UDP socket with enlarged buffers
pub fn create_socket(bind: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let domain = if bind.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_send_buffer_size(SOCKET_BUFFER_SIZE)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&bind.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", bind, e)))?;

    Ok(socket.into())
}

/// Transport counters
#[derive(Debug, Default)]
pub struct UdpStats {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub foreign_packets: AtomicU64,
}

/// Voice transport over a UDP socket
pub struct UdpTransport {
    socket: UdpSocket,
    server: SocketAddr,
    stats: Arc<UdpStats>,
}

impl UdpTransport {
    pub fn new(bind: SocketAddr, server: SocketAddr) -> Result<Self, NetworkError> {
        let socket = create_socket(bind)?;
        tracing::info!("UDP voice transport {} -> {}", bind, server);
        Ok(Self {
            socket,
            server,
            stats: Arc::new(UdpStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))
    }

    pub fn stats(&self) -> Arc<UdpStats> {
        self.stats.clone()
    }

    /// Receive datagrams from the server until `running` is cleared
    pub fn spawn_inbound<F>(
        &self,
        running: Arc<AtomicBool>,
        mut on_packet: F,
    ) -> Result<JoinHandle<()>, NetworkError>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        let socket = self
            .socket
            .try_clone()
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;
        socket
            .set_read_timeout(Some(RECV_POLL))
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;
        let server = self.server;
        let stats = self.stats.clone();

        thread::Builder::new()
            .name("udp-voice-recv".into())
            .spawn(move || {
                let mut buf = vec![0u8; MAX_PACKET_SIZE];
                while running.load(Ordering::Relaxed) {
                    match socket.recv_from(&mut buf) {
                        Ok((len, from)) if from == server => {
                            stats.packets_received.fetch_add(1, Ordering::Relaxed);
                            on_packet(Bytes::copy_from_slice(&buf[..len]));
                        }
                        Ok((_, from)) => {
                            stats.foreign_packets.fetch_add(1, Ordering::Relaxed);
                            tracing::trace!("ignoring datagram from {}", from);
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            tracing::warn!("UDP receive failed: {}", e);
                        }
                    }
                }
                tracing::debug!("UDP receive loop stopped");
            })
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))
    }
}

impl VoiceTransport for UdpTransport {
    fn send_packet(&self, data: Bytes) -> Result<(), NetworkError> {
        let sent = self
            .socket
            .send_to(&data, self.server)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        Ok(())
    }
}
