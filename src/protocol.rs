//! Voice packet wire format
//!
//! Outbound (client to server):
//!
//! ```text
//! ┌────────┬──────────────┬────────────┬─────────────────────┐
//! │ header │ sequence u32 │ len | last │ payload (len bytes) │
//! │ 1 byte │ big endian   │ 1 byte     │ opaque codec frame  │
//! └────────┴──────────────┴────────────┴─────────────────────┘
//! ```
//!
//! Inbound packets carry the speaker's session id between the header and
//! the sequence number. The header's top three bits hold the message type
//! (the codec), the low five bits the voice target. Anything after the
//! payload (positional audio) is ignored.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_PAYLOAD_LEN;
use crate::error::PacketError;

/// High bit of the length byte marks the end of a talk spurt
pub const LAST_FLAG: u8 = 0x80;

/// Bytes in front of the payload: sequence + length byte
pub const FRAME_HEADER_LEN: usize = 5;

/// Pack a message type into the header byte
pub fn header_byte(message_type: u8) -> u8 {
    message_type << 5
}

/// Message type stored in a header byte
pub fn message_type(header: u8) -> u8 {
    header >> 5
}

/// Voice target stored in a header byte
pub fn voice_target(header: u8) -> u8 {
    header & 0x1f
}

/// One framed codec frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePacket {
    pub sequence: u32,
    /// End of talk spurt
    pub last: bool,
    pub payload: Bytes,
}

impl VoicePacket {
    /// Build a packet, rejecting payloads the length byte cannot describe
    pub fn new(sequence: u32, payload: Bytes, last: bool) -> Result<Self, PacketError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            sequence,
            last,
            payload,
        })
    }

    /// Size on the wire without the header byte
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    fn length_byte(&self) -> u8 {
        let len = self.payload.len() as u8;
        if self.last {
            len | LAST_FLAG
        } else {
            len
        }
    }

    /// Append `[sequence][length byte][payload]`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32(self.sequence);
        buf.put_u8(self.length_byte());
        buf.put_slice(&self.payload);
    }

    /// Encode to a fresh buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode one packet from the front of `buf`, advancing past it.
    ///
    /// Fails without consuming anything when fewer bytes are available than
    /// the header or the declared length require.
    pub fn decode(buf: &mut Bytes) -> Result<Self, PacketError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(PacketError::Malformed {
                needed: FRAME_HEADER_LEN,
                available: buf.len(),
            });
        }

        let length_byte = buf[4];
        let len = (length_byte & !LAST_FLAG) as usize;
        let needed = FRAME_HEADER_LEN + len;
        if buf.len() < needed {
            return Err(PacketError::Malformed {
                needed,
                available: buf.len(),
            });
        }

        let sequence = buf.get_u32();
        buf.advance(1);
        let payload = buf.split_to(len);

        Ok(Self {
            sequence,
            last: length_byte & LAST_FLAG != 0,
            payload,
        })
    }

    /// Decode from a slice; trailing bytes are ignored
    pub fn from_slice(data: &[u8]) -> Result<Self, PacketError> {
        let mut buf = Bytes::copy_from_slice(data);
        Self::decode(&mut buf)
    }
}

/// Frame an outbound packet behind its header byte
pub fn encode_outbound(header: u8, packet: &VoicePacket) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + packet.encoded_len());
    buf.put_u8(header);
    packet.encode_into(&mut buf);
    buf.freeze()
}

/// A voice packet as relayed by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub header: u8,
    /// Speaker session id
    pub source: u32,
    pub packet: VoicePacket,
}

impl InboundPacket {
    /// Parse a tunnel payload (header byte included)
    pub fn decode(data: &Bytes) -> Result<Self, PacketError> {
        if data.is_empty() {
            return Err(PacketError::Empty);
        }
        let mut buf = data.slice(1..);
        if buf.len() < 4 {
            return Err(PacketError::Malformed {
                needed: 4,
                available: buf.len(),
            });
        }
        let source = buf.get_u32();
        let packet = VoicePacket::decode(&mut buf)?;

        Ok(Self {
            header: data[0],
            source,
            packet,
        })
    }

    /// Serialize in relayed form
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + self.packet.encoded_len());
        buf.put_u8(self.header);
        buf.put_u32(self.source);
        self.packet.encode_into(&mut buf);
        buf.freeze()
    }
}
