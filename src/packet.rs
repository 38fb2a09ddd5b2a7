//! # Packets and Framing
//!
//! Wire formats used below the envelope layer.
//!
//! ## Frame Format
//!
//! ```text
//! +-----------+--------------------+
//! | Length    | Payload            |
//! | 4 bytes LE| `Length` bytes     |
//! +-----------+--------------------+
//! ```
//!
//! ## Packet Format (frame payload)
//!
//! ```text
//! +--------+-----------+-------------------+
//! | Kind   | Length    | Content           |
//! | 1 byte | 4 bytes LE| `Length` bytes    |
//! +--------+-----------+-------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};

/// Size of the little-endian length prefix on every frame
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Packet header size: kind(1) + length(4)
pub const PACKET_HEADER_SIZE: usize = 5;

/// Default upper bound for one frame (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Packet kinds exchanged between crypto managers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Application data (encrypted once a key exists)
    Normal = 0,
    /// Application data sent alongside a key switch
    NormalEnc = 1,
    /// Key exchange request, sent by the host only
    NewKey = 2,
    /// Key exchange response
    ReplyExchange = 3,
    /// Acknowledges a response; the new key is live
    NotifyEnc = 4,
    /// Responder could not derive a usable key
    KeyResponseError = 5,
    /// Initial greeting
    Greet = 6,
}

impl PacketKind {
    pub const ALL: [PacketKind; 7] = [
        PacketKind::Normal,
        PacketKind::NormalEnc,
        PacketKind::NewKey,
        PacketKind::ReplyExchange,
        PacketKind::NotifyEnc,
        PacketKind::KeyResponseError,
        PacketKind::Greet,
    ];
}

impl TryFrom<u8> for PacketKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketKind::Normal),
            1 => Ok(PacketKind::NormalEnc),
            2 => Ok(PacketKind::NewKey),
            3 => Ok(PacketKind::ReplyExchange),
            4 => Ok(PacketKind::NotifyEnc),
            5 => Ok(PacketKind::KeyResponseError),
            6 => Ok(PacketKind::Greet),
            other => Err(ProtocolError::UnknownPacketKind(other)),
        }
    }
}

/// One hop of crypto-manager traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub content: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, content: impl Into<Bytes>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    /// A packet with no content (acknowledgements, errors)
    pub fn empty(kind: PacketKind) -> Self {
        Self::new(kind, Bytes::new())
    }

    /// Serialize as `kind || u32_le(len) || content`
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.content.len());
        buf.put_u8(self.kind as u8);
        put_prefixed(&mut buf, &self.content);
        buf
    }

    /// Parse a complete packet; trailing bytes are rejected
    pub fn from_bytes(data: &[u8]) -> ProtocolResult<Self> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::MalformedPacket(format!(
                "Packet too short: {} < {}",
                data.len(),
                PACKET_HEADER_SIZE
            )));
        }

        let mut cursor = data;
        let kind = PacketKind::try_from(cursor.get_u8())?;
        let content = take_prefixed(&mut cursor)?;

        if !cursor.is_empty() {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} trailing bytes after packet content",
                cursor.len()
            )));
        }

        Ok(Self {
            kind,
            content: Bytes::copy_from_slice(content),
        })
    }
}

/// Write `u32_le(len) || data`
pub fn put_prefixed(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

/// Read a little-endian u32 from the front of `data`
pub fn take_u32_le(data: &mut &[u8]) -> ProtocolResult<u32> {
    if data.remaining() < 4 {
        return Err(ProtocolError::MalformedPacket(format!(
            "Expected 4 length bytes, {} available",
            data.remaining()
        )));
    }
    Ok(data.get_u32_le())
}

/// Read `u32_le(len) || data` from the front of `data`
pub fn take_prefixed<'a>(data: &mut &'a [u8]) -> ProtocolResult<&'a [u8]> {
    let len = take_u32_le(data)? as usize;
    take_exact(data, len)
}

/// Split exactly `len` bytes off the front of `data`
pub fn take_exact<'a>(data: &mut &'a [u8], len: usize) -> ProtocolResult<&'a [u8]> {
    if data.len() < len {
        return Err(ProtocolError::MalformedPacket(format!(
            "Declared length {} exceeds remaining {} bytes",
            len,
            data.len()
        )));
    }
    let (head, tail) = data.split_at(len);
    *data = tail;
    Ok(head)
}

/// Prefix a payload with its little-endian length
pub fn encode_frame(payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_SIZE + payload.len());
    put_prefixed(&mut buf, payload);
    buf
}

/// Reassembles length-prefixed frames from arbitrary socket reads
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Length of the frame being assembled once its prefix is complete
    pending_len: Option<usize>,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            pending_len: None,
            max_frame_size,
        }
    }

    /// Add data to the buffer
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next complete frame
    pub fn decode(&mut self) -> ProtocolResult<Option<Bytes>> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if self.buffer.len() < FRAME_PREFIX_SIZE {
                    return Ok(None);
                }
                let len = self.buffer.get_u32_le() as usize;
                if len > self.max_frame_size {
                    return Err(ProtocolError::FrameTooLarge {
                        size: len,
                        max: self.max_frame_size,
                    });
                }
                self.pending_len = Some(len);
                len
            }
        };

        if self.buffer.len() < len {
            return Ok(None);
        }

        self.pending_len = None;
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    /// Get remaining buffered data length
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let packet = Packet::new(PacketKind::ReplyExchange, Bytes::from_static(b"response"));
        let bytes = packet.to_bytes();

        assert_eq!(bytes[0], PacketKind::ReplyExchange as u8);
        assert_eq!(&bytes[1..5], &8u32.to_le_bytes());

        let parsed = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_empty_packet() {
        let packet = Packet::empty(PacketKind::NotifyEnc);
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_unknown_kind() {
        let mut bytes = Packet::empty(PacketKind::Normal).to_bytes();
        bytes[0] = 0x42;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(ProtocolError::UnknownPacketKind(0x42))
        ));
    }

    #[test]
    fn test_truncated_content() {
        let bytes = Packet::new(PacketKind::Normal, Bytes::from_static(b"abcdef")).to_bytes();
        assert!(matches!(
            Packet::from_bytes(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_frame_decoder_partial_reads() {
        let first = encode_frame(b"First message");
        let second = encode_frame(b"Second");

        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);

        let mut decoder = FrameDecoder::default();

        // Split inside the length prefix
        decoder.push(&stream[..2]);
        assert!(decoder.decode().unwrap().is_none());

        // Prefix complete, payload partial
        decoder.push(&stream[2..9]);
        assert!(decoder.decode().unwrap().is_none());

        decoder.push(&stream[9..]);
        assert_eq!(decoder.decode().unwrap().unwrap(), Bytes::from_static(b"First message"));
        assert_eq!(decoder.decode().unwrap().unwrap(), Bytes::from_static(b"Second"));
        assert!(decoder.decode().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_frame_decoder_rejects_oversized() {
        let mut decoder = FrameDecoder::new(16);
        decoder.push(&1024u32.to_le_bytes());
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::FrameTooLarge { size: 1024, max: 16 })
        ));
    }

    #[test]
    fn test_zero_length_frame() {
        let mut decoder = FrameDecoder::default();
        decoder.push(&encode_frame(b""));
        assert_eq!(decoder.decode().unwrap().unwrap().len(), 0);
    }
}
