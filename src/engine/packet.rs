//! Packet encoding and decoding for the datagram engine.
//!
//! Every packet starts with the same header:
//!
//! ```text
//! +--------+--------+------------------+------------------+
//! | Type   | Flags  | Destination ID   | Source ID        |
//! | 1 byte | 1 byte | 4 bytes (BE32)   | 4 bytes (BE32)   |
//! +--------+--------+------------------+------------------+
//! ```
//!
//! A destination of zero addresses the listener of the receiving endpoint
//! (handshake requests only).

use std::fmt;
use std::ops::BitOr;

use thiserror::Error;

/// Size constants of the packet format.
pub mod sizes {
    /// Socket identifier size.
    pub const SOCKET_ID_SIZE: usize = 4;
    /// Common header size (type + flags + destination + source).
    pub const HEADER_SIZE: usize = 1 + 1 + SOCKET_ID_SIZE + SOCKET_ID_SIZE;
    /// Sequence number size.
    pub const SEQ_SIZE: usize = 4;
    /// Data packet overhead before the payload.
    pub const DATA_HEADER_SIZE: usize = HEADER_SIZE + SEQ_SIZE;
}

/// Identifier of a socket within its transport context.
///
/// Identifiers are never reused while the context lives; zero is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u32);

impl SocketId {
    /// Unassigned identifier.
    pub(crate) const NONE: Self = Self(0);

    pub(crate) fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Packet type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub(crate) enum PacketType {
    /// Connection request carrying the stream identifier.
    Handshake = 0x01,
    /// Connection accepted.
    HandshakeAck = 0x02,
    /// Payload fragment.
    Data = 0x03,
    /// Cumulative acknowledgement.
    Ack = 0x04,
    /// Loss report.
    Nak = 0x05,
    /// Liveness check while idle.
    Keepalive = 0x06,
    /// Graceful close.
    Shutdown = 0x07,
    /// Connection refused.
    Reject = 0x08,
}

impl PacketType {
    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::HandshakeAck),
            0x03 => Some(Self::Data),
            0x04 => Some(Self::Ack),
            0x05 => Some(Self::Nak),
            0x06 => Some(Self::Keepalive),
            0x07 => Some(Self::Shutdown),
            0x08 => Some(Self::Reject),
            _ => None,
        }
    }

    pub(crate) fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Flags of a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct PacketFlags(u8);

impl PacketFlags {
    pub(crate) const NONE: Self = Self(0);
    /// First fragment of a message.
    pub(crate) const FIRST: Self = Self(0x01);
    /// Last fragment of a message.
    pub(crate) const LAST: Self = Self(0x02);
    /// A message carried in a single packet.
    pub(crate) const SOLO: Self = Self(0x03);
    /// Packet is a retransmission.
    pub(crate) const RETRANSMITTED: Self = Self(0x04);

    pub(crate) fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub(crate) fn as_byte(self) -> u8 {
        self.0
    }

    fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn is_first(self) -> bool {
        self.contains(Self::FIRST)
    }

    pub(crate) fn is_last(self) -> bool {
        self.contains(Self::LAST)
    }

    pub(crate) fn is_retransmitted(self) -> bool {
        self.contains(Self::RETRANSMITTED)
    }

    pub(crate) fn with_retransmitted(self) -> Self {
        self | Self::RETRANSMITTED
    }

    /// Reserved bits must be zero.
    pub(crate) fn is_valid(self) -> bool {
        self.0 & !(Self::SOLO.0 | Self::RETRANSMITTED.0) == 0
    }
}

impl BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Reason carried by a reject packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RejectReason {
    /// Nobody is listening on the endpoint.
    NoListener = 0x01,
    /// The listener backlog is full.
    BacklogFull = 0x02,
    /// The listener's admission filter refused the caller.
    Refused = 0x03,
    /// The handshake was malformed.
    BadRequest = 0x04,
}

impl RejectReason {
    pub(crate) fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::NoListener,
            0x02 => Self::BacklogFull,
            0x03 => Self::Refused,
            _ => Self::BadRequest,
        }
    }

    pub(crate) fn describe(self) -> &'static str {
        match self {
            Self::NoListener => "no listener at the remote address",
            Self::BacklogFull => "listener backlog is full",
            Self::Refused => "connection refused by the listener",
            Self::BadRequest => "malformed connection request",
        }
    }
}

/// Common packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PacketHeader {
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub dest: SocketId,
    pub src: SocketId,
}

impl PacketHeader {
    pub(crate) fn to_bytes(&self) -> [u8; sizes::HEADER_SIZE] {
        let mut buf = [0u8; sizes::HEADER_SIZE];
        buf[0] = self.packet_type.as_byte();
        buf[1] = self.flags.as_byte();
        buf[2..6].copy_from_slice(&self.dest.0.to_be_bytes());
        buf[6..10].copy_from_slice(&self.src.0.to_be_bytes());
        buf
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < sizes::HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: sizes::HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let packet_type =
            PacketType::from_byte(bytes[0]).ok_or(PacketError::InvalidType(bytes[0]))?;
        let flags = PacketFlags::from_byte(bytes[1]);
        if !flags.is_valid() {
            return Err(PacketError::InvalidFlags(bytes[1]));
        }

        Ok(Self {
            packet_type,
            flags,
            dest: SocketId(read_u32(&bytes[2..6])),
            src: SocketId(read_u32(&bytes[6..10])),
        })
    }
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Packet {
    Handshake {
        src: SocketId,
        version: u16,
        stream_id: Option<String>,
    },
    HandshakeAck {
        dest: SocketId,
        src: SocketId,
    },
    Data {
        dest: SocketId,
        src: SocketId,
        flags: PacketFlags,
        seq: u32,
        payload: Vec<u8>,
    },
    /// Acknowledges every sequence number below `next`.
    Ack {
        dest: SocketId,
        src: SocketId,
        next: u32,
    },
    /// Reports the inclusive range `from..=to` as missing.
    Nak {
        dest: SocketId,
        src: SocketId,
        from: u32,
        to: u32,
    },
    Keepalive {
        dest: SocketId,
        src: SocketId,
    },
    /// Graceful close; `final_seq` is one past the last data sequence
    /// number the sender will ever use.
    Shutdown {
        dest: SocketId,
        src: SocketId,
        final_seq: u32,
    },
    Reject {
        dest: SocketId,
        reason: RejectReason,
    },
}

impl Packet {
    pub(crate) fn header(&self) -> PacketHeader {
        let (packet_type, flags, dest, src) = match self {
            Self::Handshake { src, .. } => {
                (PacketType::Handshake, PacketFlags::NONE, SocketId::NONE, *src)
            }
            Self::HandshakeAck { dest, src } => {
                (PacketType::HandshakeAck, PacketFlags::NONE, *dest, *src)
            }
            Self::Data {
                dest, src, flags, ..
            } => (PacketType::Data, *flags, *dest, *src),
            Self::Ack { dest, src, .. } => (PacketType::Ack, PacketFlags::NONE, *dest, *src),
            Self::Nak { dest, src, .. } => (PacketType::Nak, PacketFlags::NONE, *dest, *src),
            Self::Keepalive { dest, src } => {
                (PacketType::Keepalive, PacketFlags::NONE, *dest, *src)
            }
            Self::Shutdown { dest, src, .. } => {
                (PacketType::Shutdown, PacketFlags::NONE, *dest, *src)
            }
            Self::Reject { dest, .. } => {
                (PacketType::Reject, PacketFlags::NONE, *dest, SocketId::NONE)
            }
        };
        PacketHeader {
            packet_type,
            flags,
            dest,
            src,
        }
    }

    /// Serialize the packet into a datagram.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(sizes::DATA_HEADER_SIZE + self.payload_len());
        buf.extend_from_slice(&self.header().to_bytes());
        match self {
            Self::Handshake {
                version, stream_id, ..
            } => {
                buf.extend_from_slice(&version.to_be_bytes());
                if let Some(stream_id) = stream_id {
                    buf.extend_from_slice(stream_id.as_bytes());
                }
            }
            Self::Data { seq, payload, .. } => {
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Self::Ack { next, .. } => buf.extend_from_slice(&next.to_be_bytes()),
            Self::Nak { from, to, .. } => {
                buf.extend_from_slice(&from.to_be_bytes());
                buf.extend_from_slice(&to.to_be_bytes());
            }
            Self::Shutdown { final_seq, .. } => buf.extend_from_slice(&final_seq.to_be_bytes()),
            Self::Reject { reason, .. } => buf.push(*reason as u8),
            Self::HandshakeAck { .. } | Self::Keepalive { .. } => {}
        }
        buf
    }

    /// Parse a received datagram.
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let header = PacketHeader::from_bytes(bytes)?;
        let body = &bytes[sizes::HEADER_SIZE..];
        let (dest, src) = (header.dest, header.src);

        let packet = match header.packet_type {
            PacketType::Handshake => {
                require(body, 2)?;
                let version = u16::from_be_bytes([body[0], body[1]]);
                let stream_id = match &body[2..] {
                    [] => None,
                    raw => Some(
                        std::str::from_utf8(raw)
                            .map_err(|_| PacketError::InvalidStreamId)?
                            .to_string(),
                    ),
                };
                Self::Handshake {
                    src,
                    version,
                    stream_id,
                }
            }
            PacketType::HandshakeAck => Self::HandshakeAck { dest, src },
            PacketType::Data => {
                require(body, sizes::SEQ_SIZE)?;
                Self::Data {
                    dest,
                    src,
                    flags: header.flags,
                    seq: read_u32(&body[..4]),
                    payload: body[4..].to_vec(),
                }
            }
            PacketType::Ack => {
                require(body, 4)?;
                Self::Ack {
                    dest,
                    src,
                    next: read_u32(&body[..4]),
                }
            }
            PacketType::Nak => {
                require(body, 8)?;
                Self::Nak {
                    dest,
                    src,
                    from: read_u32(&body[..4]),
                    to: read_u32(&body[4..8]),
                }
            }
            PacketType::Keepalive => Self::Keepalive { dest, src },
            PacketType::Shutdown => {
                require(body, 4)?;
                Self::Shutdown {
                    dest,
                    src,
                    final_seq: read_u32(&body[..4]),
                }
            }
            PacketType::Reject => {
                require(body, 1)?;
                Self::Reject {
                    dest,
                    reason: RejectReason::from_byte(body[0]),
                }
            }
        };
        Ok(packet)
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Data { payload, .. } => payload.len(),
            Self::Handshake { stream_id, .. } => stream_id.as_ref().map_or(0, String::len),
            _ => 0,
        }
    }
}

fn require(body: &[u8], expected: usize) -> Result<(), PacketError> {
    if body.len() < expected {
        return Err(PacketError::TooShort {
            expected: sizes::HEADER_SIZE + expected,
            actual: sizes::HEADER_SIZE + body.len(),
        });
    }
    Ok(())
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Errors that can occur during packet parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum PacketError {
    /// Packet is too short.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Unknown packet type.
    #[error("invalid packet type: 0x{0:02x}")]
    InvalidType(u8),

    /// Reserved flag bits set.
    #[error("invalid flags: 0x{0:02x} (reserved bits must be 0)")]
    InvalidFlags(u8),

    /// Handshake stream identifier is not UTF-8.
    #[error("stream identifier is not valid UTF-8")]
    InvalidStreamId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_bytes() {
        for t in [
            PacketType::Handshake,
            PacketType::HandshakeAck,
            PacketType::Data,
            PacketType::Ack,
            PacketType::Nak,
            PacketType::Keepalive,
            PacketType::Shutdown,
            PacketType::Reject,
        ] {
            assert_eq!(PacketType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(PacketType::from_byte(0x00), None);
        assert_eq!(PacketType::from_byte(0xFF), None);
    }

    #[test]
    fn test_packet_flags() {
        assert!(PacketFlags::SOLO.is_first());
        assert!(PacketFlags::SOLO.is_last());
        assert!(!PacketFlags::FIRST.is_last());
        assert_eq!(PacketFlags::FIRST | PacketFlags::LAST, PacketFlags::SOLO);

        let flags = PacketFlags::LAST.with_retransmitted();
        assert!(flags.is_retransmitted());
        assert!(flags.is_last());
        assert!(flags.is_valid());

        assert!(!PacketFlags::from_byte(0x08).is_valid());
    }

    #[test]
    fn test_header_layout() {
        let packet = Packet::Ack {
            dest: SocketId::new(0x01020304),
            src: SocketId::new(7),
            next: 42,
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), sizes::HEADER_SIZE + 4);
        assert_eq!(bytes[0], 0x04);
        assert_eq!(&bytes[2..6], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_data_packet() {
        let packet = Packet::Data {
            dest: SocketId::new(2),
            src: SocketId::new(1),
            flags: PacketFlags::FIRST,
            seq: 9,
            payload: b"data from client".to_vec(),
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), sizes::DATA_HEADER_SIZE + 16);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_handshake_stream_id() {
        let packet = Packet::Handshake {
            src: SocketId::new(5),
            version: 1,
            stream_id: Some("#!::r=live".into()),
        };
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.header().dest.is_none());

        let bare = Packet::Handshake {
            src: SocketId::new(5),
            version: 1,
            stream_id: None,
        };
        assert_eq!(Packet::decode(&bare.encode()).unwrap(), bare);
    }

    #[test]
    fn test_shutdown_carries_final_seq() {
        let packet = Packet::Shutdown {
            dest: SocketId::new(4),
            src: SocketId::new(6),
            final_seq: 0x0A0B0C0D,
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), sizes::HEADER_SIZE + 4);
        assert_eq!(&bytes[sizes::HEADER_SIZE..], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);

        assert!(matches!(
            Packet::decode(&bytes[..sizes::HEADER_SIZE]),
            Err(PacketError::TooShort { .. })
        ));
    }

    #[test]
    fn test_reject_reason() {
        let packet = Packet::Reject {
            dest: SocketId::new(3),
            reason: RejectReason::BacklogFull,
        };
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
        assert_eq!(RejectReason::from_byte(0x7F), RejectReason::BadRequest);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(
            Packet::decode(&[0x03, 0x00, 0, 0]),
            Err(PacketError::TooShort { .. })
        ));

        let mut truncated = Packet::Nak {
            dest: SocketId::new(1),
            src: SocketId::new(2),
            from: 1,
            to: 2,
        }
        .encode();
        truncated.truncate(sizes::HEADER_SIZE + 6);
        assert!(matches!(
            Packet::decode(&truncated),
            Err(PacketError::TooShort { .. })
        ));
    }

    #[test]
    fn test_decode_invalid_type() {
        let mut bytes = [0u8; sizes::HEADER_SIZE];
        bytes[0] = 0xEE;
        assert_eq!(Packet::decode(&bytes), Err(PacketError::InvalidType(0xEE)));
    }

    #[test]
    fn test_decode_invalid_stream_id() {
        let mut bytes = Packet::Handshake {
            src: SocketId::new(1),
            version: 1,
            stream_id: None,
        }
        .encode();
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        assert_eq!(Packet::decode(&bytes), Err(PacketError::InvalidStreamId));
    }
}
