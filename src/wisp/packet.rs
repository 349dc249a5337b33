//! Wisp packet codec
//!
//! One Wisp packet per WebSocket binary frame: a 5-byte header (packet type,
//! little-endian stream id) followed by a type-specific payload. There is no
//! length field; the frame boundary delimits the packet.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Header size: 1-byte type + 4-byte stream id.
pub const PACKET_HEADER_SIZE: usize = 5;

/// Codec errors. Malformed frames are reported, never panicked on; the
/// session ignores them.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet too small: {0} bytes")]
    TooSmall(usize),

    #[error("unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    #[error("connect payload too small: {0} bytes")]
    ConnectTooSmall(usize),

    #[error("unknown stream type: {0:#04x}")]
    UnknownStreamType(u8),

    #[error("hostname is not valid UTF-8")]
    InvalidHostname(#[from] std::str::Utf8Error),
}

/// Wisp packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 0x01,
    Data = 0x02,
    Continue = 0x03,
    Close = 0x04,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, PacketError> {
        match value {
            0x01 => Ok(Self::Connect),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::Continue),
            0x04 => Ok(Self::Close),
            other => Err(PacketError::UnknownPacketType(other)),
        }
    }
}

/// Stream kinds a CONNECT may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamType {
    Tcp = 0x01,
    Udp = 0x02,
}

impl TryFrom<u8> for StreamType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, PacketError> {
        match value {
            0x01 => Ok(Self::Tcp),
            0x02 => Ok(Self::Udp),
            other => Err(PacketError::UnknownStreamType(other)),
        }
    }
}

/// Close reasons carried in the CLOSE payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    /// Catch-all; also used for session teardown.
    Unspecified = 0x01,
    /// Clean close: remote EOF, or the client asked.
    Voluntary = 0x02,
    /// I/O error on the outbound socket.
    NetworkError = 0x03,
    /// DATA for an unknown stream, malformed stream info.
    InvalidInfo = 0x41,
    Unreachable = 0x42,
    Timeout = 0x43,
    ConnectionRefused = 0x44,
    TcpTimeout = 0x47,
    /// Hostname blacklisted, whitelist miss, or UDP disabled.
    Blocked = 0x48,
    Throttled = 0x49,
    /// Client-side failure; the server only ever logs it.
    ClientError = 0x81,
}

/// A decoded (or to-be-encoded) Wisp packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            packet_type: PacketType::Data,
            stream_id,
            payload,
        }
    }

    /// CONTINUE advertising `buffer_remaining` further DATA packets.
    pub fn continue_grant(stream_id: u32, buffer_remaining: u32) -> Self {
        Self {
            packet_type: PacketType::Continue,
            stream_id,
            payload: Bytes::copy_from_slice(&buffer_remaining.to_le_bytes()),
        }
    }

    pub fn close(stream_id: u32, reason: CloseReason) -> Self {
        Self {
            packet_type: PacketType::Close,
            stream_id,
            payload: Bytes::copy_from_slice(&[reason as u8]),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.packet_type as u8);
        buf.put_u32_le(self.stream_id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(frame: Bytes) -> Result<Self, PacketError> {
        if frame.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::TooSmall(frame.len()));
        }

        let packet_type = PacketType::try_from(frame[0])?;
        let stream_id = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);

        Ok(Self {
            packet_type,
            stream_id,
            payload: frame.slice(PACKET_HEADER_SIZE..),
        })
    }
}

/// Parsed CONNECT payload: `stream_type:u8 | port:u16 LE | hostname`.
/// The hostname is the remaining bytes, neither length-prefixed nor
/// null-terminated.
#[derive(Debug, Clone)]
pub struct ConnectPayload {
    pub stream_type: StreamType,
    pub port: u16,
    pub hostname: String,
}

impl ConnectPayload {
    pub fn parse(payload: &[u8]) -> Result<Self, PacketError> {
        if payload.len() < 3 {
            return Err(PacketError::ConnectTooSmall(payload.len()));
        }

        let stream_type = StreamType::try_from(payload[0])?;
        let port = u16::from_le_bytes([payload[1], payload[2]]);
        let hostname = std::str::from_utf8(&payload[3..])?.to_string();

        Ok(Self {
            stream_type,
            port,
            hostname,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_continue_initial_handshake() {
        // CONTINUE, stream 0, buffer_remaining=255
        let packet = Packet::continue_grant(0, 255);
        assert_eq!(
            packet.encode().as_ref(),
            &[0x03, 0x00, 0x00, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn encode_data() {
        let packet = Packet::data(1, Bytes::from_static(b"hi"));
        assert_eq!(
            packet.encode().as_ref(),
            &[0x02, 0x01, 0x00, 0x00, 0x00, 0x68, 0x69]
        );
    }

    #[test]
    fn encode_close_blocked() {
        let packet = Packet::close(5, CloseReason::Blocked);
        assert_eq!(
            packet.encode().as_ref(),
            &[0x04, 0x05, 0x00, 0x00, 0x00, 0x48]
        );
    }

    #[test]
    fn decode_connect_round_trip() {
        let mut frame = vec![0x01, 0x01, 0x00, 0x00, 0x00];
        frame.push(0x01); // TCP
        frame.extend_from_slice(&80u16.to_le_bytes());
        frame.extend_from_slice(b"example.com");

        let packet = Packet::decode(Bytes::from(frame)).unwrap();
        assert_eq!(packet.packet_type, PacketType::Connect);
        assert_eq!(packet.stream_id, 1);

        let connect = ConnectPayload::parse(&packet.payload).unwrap();
        assert_eq!(connect.stream_type, StreamType::Tcp);
        assert_eq!(connect.port, 80);
        assert_eq!(connect.hostname, "example.com");
    }

    #[test]
    fn decode_stream_id_little_endian() {
        let frame = Bytes::from_static(&[0x02, 0x09, 0x00, 0x00, 0x00, 0xAA]);
        let packet = Packet::decode(frame).unwrap();
        assert_eq!(packet.stream_id, 9);
        assert_eq!(packet.payload.as_ref(), &[0xAA]);
    }

    #[test]
    fn decode_rejects_short_frames() {
        for len in 0..PACKET_HEADER_SIZE {
            let frame = Bytes::from(vec![0x02; len]);
            assert!(matches!(
                Packet::decode(frame),
                Err(PacketError::TooSmall(_))
            ));
        }
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let frame = Bytes::from_static(&[0x7F, 0x01, 0x00, 0x00, 0x00]);
        assert!(matches!(
            Packet::decode(frame),
            Err(PacketError::UnknownPacketType(0x7F))
        ));
    }

    #[test]
    fn connect_payload_too_small() {
        assert!(matches!(
            ConnectPayload::parse(&[0x01, 0x50]),
            Err(PacketError::ConnectTooSmall(2))
        ));
    }

    #[test]
    fn connect_payload_unknown_stream_type() {
        assert!(matches!(
            ConnectPayload::parse(&[0x03, 0x50, 0x00]),
            Err(PacketError::UnknownStreamType(0x03))
        ));
    }

    #[test]
    fn connect_payload_empty_hostname() {
        let connect = ConnectPayload::parse(&[0x02, 0x35, 0x00]).unwrap();
        assert_eq!(connect.stream_type, StreamType::Udp);
        assert_eq!(connect.port, 53);
        assert_eq!(connect.hostname, "");
    }
}
