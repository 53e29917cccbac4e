//! Packet model: header layout, flags, priority, transport, raw packets,
//! and the `PacketBody` capability every concrete packet implements.
//!
//! ```text
//! 12-byte header, little-endian:
//! ┌────────────┬─────────────┬────────────┬───────┬──────────┬───────────┬──────────┐
//! │ Length (2) │ Magic (4)   │ OpCode (2) │ Flags │ Priority │ Transport │ Reserved │
//! └────────────┴─────────────┴────────────┴───────┴──────────┴───────────┴──────────┘
//!   offset 0     offset 2      offset 6      8         9          10          11
//! ```
//!
//! `Length` covers header plus payload and never exceeds 65535. The reserved
//! byte must be zero on the wire.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Header size in bytes.
pub const HEADER_LEN: usize = 12;

/// Largest packet the 2-byte length prefix can express.
pub const MAX_PACKET_LEN: usize = u16::MAX as usize;

/// Framework-reserved magic numbers (handshake, control, text/binary,
/// directive, time-sync). Application packets must register outside this
/// range.
pub mod magic {
    pub const RESERVED_MIN: u32 = 0x0000_A000;
    pub const RESERVED_MAX: u32 = 0x0000_AFFF;

    pub const HANDSHAKE: u32 = 0x0000_A001;
    pub const CONTROL: u32 = 0x0000_A002;
    pub const DIRECTIVE: u32 = 0x0000_A003;
    pub const TIME_SYNC: u32 = 0x0000_A004;

    pub const TEXT256: u32 = 0x0000_A010;
    pub const TEXT512: u32 = 0x0000_A011;
    pub const TEXT1024: u32 = 0x0000_A012;

    pub const BINARY128: u32 = 0x0000_A020;
    pub const BINARY256: u32 = 0x0000_A021;
    pub const BINARY512: u32 = 0x0000_A022;
    pub const BINARY1024: u32 = 0x0000_A023;

    /// True for magics the framework reserves for itself.
    pub const fn is_reserved(m: u32) -> bool {
        m >= RESERVED_MIN && m <= RESERVED_MAX
    }
}

bitflags! {
    /// Transport-visible packet properties.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        const COMPRESSED = 1 << 0;
        const ENCRYPTED = 1 << 1;
    }
}

/// Dispatch priority, highest first out of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    pub const COUNT: usize = 4;

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::Urgent),
            _ => None,
        }
    }

    pub fn from_index(i: usize) -> Option<Self> {
        Self::from_u8(i as u8)
    }

    /// Queue level index: Low = 0 .. Urgent = 3.
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Transport the packet travelled (or should travel) on.
///
/// Values match the IANA protocol numbers for TCP and UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportProtocol {
    None = 0,
    Tcp = 6,
    Udp = 17,
}

impl TransportProtocol {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TransportProtocol::None),
            6 => Some(TransportProtocol::Tcp),
            17 => Some(TransportProtocol::Udp),
            _ => None,
        }
    }
}

impl Default for TransportProtocol {
    fn default() -> Self {
        TransportProtocol::None
    }
}

/// Decoded 12-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: u16,
    pub magic: u32,
    pub opcode: u16,
    pub flags: PacketFlags,
    pub priority: Priority,
    pub transport: TransportProtocol,
}

impl PacketHeader {
    /// Writes the header at the current position; always 12 bytes.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16_le(self.length);
        dst.put_u32_le(self.magic);
        dst.put_u16_le(self.opcode);
        dst.put_u8(self.flags.bits());
        dst.put_u8(self.priority as u8);
        dst.put_u8(self.transport as u8);
        dst.put_u8(0);
    }

    /// Decodes and validates the first 12 bytes of `src`.
    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Err(ProtocolError::Malformed("truncated header"));
        }
        let length = u16::from_le_bytes([src[0], src[1]]);
        if (length as usize) < HEADER_LEN {
            return Err(ProtocolError::Malformed("length below header size"));
        }
        let magic = u32::from_le_bytes([src[2], src[3], src[4], src[5]]);
        let opcode = u16::from_le_bytes([src[6], src[7]]);
        let flags = PacketFlags::from_bits(src[8])
            .ok_or(ProtocolError::Malformed("unknown flag bits"))?;
        let priority =
            Priority::from_u8(src[9]).ok_or(ProtocolError::Malformed("invalid priority"))?;
        let transport = TransportProtocol::from_u8(src[10])
            .ok_or(ProtocolError::Malformed("invalid transport"))?;
        if src[11] != 0 {
            return Err(ProtocolError::Malformed("reserved byte set"));
        }
        Ok(PacketHeader {
            length,
            magic,
            opcode,
            flags,
            priority,
            transport,
        })
    }

    /// Reads the length prefix without validating the rest of the header.
    pub fn peek_length(src: &[u8]) -> Option<u16> {
        if src.len() < 2 {
            return None;
        }
        Some(u16::from_le_bytes([src[0], src[1]]))
    }

    /// Reads the magic number at offset 2 without further validation.
    pub fn peek_magic(src: &[u8]) -> Option<u32> {
        if src.len() < 6 {
            return None;
        }
        Some(u32::from_le_bytes([src[2], src[3], src[4], src[5]]))
    }
}

/// A framed packet: validated header plus payload bytes.
///
/// This is the unit the middleware pipeline operates on. Transformations
/// (compression, encryption) replace the payload and keep
/// `header.length == HEADER_LEN + payload.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl RawPacket {
    /// Decodes one packet from the front of `src`, copying the payload.
    ///
    /// Fails if the buffer is shorter than the header, the declared length
    /// exceeds the buffer, or the header itself is invalid.
    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        let header = PacketHeader::decode(src)?;
        let total = header.length as usize;
        if total > src.len() {
            return Err(ProtocolError::Malformed("length exceeds buffer"));
        }
        Ok(RawPacket {
            header,
            payload: Bytes::copy_from_slice(&src[HEADER_LEN..total]),
        })
    }

    /// Zero-copy variant of [`RawPacket::decode`] for an owned frame.
    pub fn decode_frame(frame: Bytes) -> Result<Self, ProtocolError> {
        let header = PacketHeader::decode(&frame)?;
        let total = header.length as usize;
        if total > frame.len() {
            return Err(ProtocolError::Malformed("length exceeds buffer"));
        }
        Ok(RawPacket {
            header,
            payload: frame.slice(HEADER_LEN..total),
        })
    }

    /// Serializes header and payload into one wire buffer.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.header.length as usize);
        self.encode_into(&mut dst);
        dst.freeze()
    }

    /// Serializes into a caller-provided scratch buffer, clearing it first.
    /// The buffer can go back to its pool once the bytes are on the wire.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        debug_assert_eq!(self.header.length as usize, HEADER_LEN + self.payload.len());
        dst.clear();
        dst.reserve(self.header.length as usize);
        self.header.encode(dst);
        dst.put_slice(&self.payload);
    }

    /// Replaces the payload and fixes up the length field.
    pub fn set_payload(&mut self, payload: Bytes) -> Result<(), ProtocolError> {
        let total = HEADER_LEN + payload.len();
        if total > MAX_PACKET_LEN {
            return Err(ProtocolError::Malformed("payload too large for frame"));
        }
        self.header.length = total as u16;
        self.payload = payload;
        Ok(())
    }

    pub fn is_compressed(&self) -> bool {
        self.header.flags.contains(PacketFlags::COMPRESSED)
    }

    pub fn is_encrypted(&self) -> bool {
        self.header.flags.contains(PacketFlags::ENCRYPTED)
    }
}

/// Capability implemented by every concrete packet type.
///
/// Field order inside `encode_payload`/`decode_payload` is the declared
/// wire order; the header occupies offsets 0–11 and the first payload field
/// starts at offset 12.
pub trait PacketBody: Sized + Send {
    const MAGIC: u32;
    const NAME: &'static str;

    fn opcode(&self) -> u16;

    fn encode_payload(&self, dst: &mut BytesMut) -> Result<(), ProtocolError>;

    fn decode_payload(opcode: u16, src: &[u8]) -> Result<Self, ProtocolError>;

    /// Expected average payload size, used to presize scratch buffers for
    /// dynamic-size fields.
    fn payload_size_hint(&self) -> usize {
        64
    }

    /// Decodes a typed packet out of a raw frame after magic validation.
    fn decode(raw: &RawPacket) -> Result<Self, ProtocolError> {
        if raw.header.magic != Self::MAGIC {
            return Err(ProtocolError::Malformed("magic does not match packet type"));
        }
        Self::decode_payload(raw.header.opcode, &raw.payload)
    }

    /// Frames the packet with explicit priority and transport.
    fn to_raw(
        &self,
        priority: Priority,
        transport: TransportProtocol,
    ) -> Result<RawPacket, ProtocolError> {
        let mut dst = BytesMut::with_capacity(self.payload_size_hint());
        self.encode_payload(&mut dst)?;
        let total = HEADER_LEN + dst.len();
        if total > MAX_PACKET_LEN {
            return Err(ProtocolError::Malformed("payload too large for frame"));
        }
        Ok(RawPacket {
            header: PacketHeader {
                length: total as u16,
                magic: Self::MAGIC,
                opcode: self.opcode(),
                flags: PacketFlags::empty(),
                priority,
                transport,
            },
            payload: dst.freeze(),
        })
    }

    /// Frames the packet with default priority on TCP.
    fn into_raw(self) -> Result<RawPacket, ProtocolError> {
        self.to_raw(Priority::Normal, TransportProtocol::Tcp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> PacketHeader {
        PacketHeader {
            length: 16,
            magic: 0x0001_0001,
            opcode: 1000,
            flags: PacketFlags::COMPRESSED,
            priority: Priority::High,
            transport: TransportProtocol::Tcp,
        }
    }

    #[test]
    fn header_encodes_to_exact_offsets() {
        let mut dst = BytesMut::new();
        sample_header().encode(&mut dst);
        assert_eq!(dst.len(), HEADER_LEN);
        assert_eq!(&dst[0..2], &16u16.to_le_bytes());
        assert_eq!(&dst[2..6], &0x0001_0001u32.to_le_bytes());
        assert_eq!(&dst[6..8], &1000u16.to_le_bytes());
        assert_eq!(dst[8], PacketFlags::COMPRESSED.bits());
        assert_eq!(dst[9], Priority::High as u8);
        assert_eq!(dst[10], TransportProtocol::Tcp as u8);
        assert_eq!(dst[11], 0);
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header();
        let mut dst = BytesMut::new();
        header.encode(&mut dst);
        assert_eq!(PacketHeader::decode(&dst).unwrap(), header);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(matches!(
            PacketHeader::decode(&[0u8; 11]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn length_below_header_is_rejected() {
        let mut dst = BytesMut::new();
        let mut header = sample_header();
        header.length = 11;
        header.encode(&mut dst);
        assert!(PacketHeader::decode(&dst).is_err());
    }

    #[test]
    fn reserved_byte_must_be_zero() {
        let mut dst = BytesMut::new();
        sample_header().encode(&mut dst);
        dst[11] = 1;
        assert!(PacketHeader::decode(&dst).is_err());
    }

    #[test]
    fn raw_packet_rejects_length_past_buffer() {
        let mut dst = BytesMut::new();
        let mut header = sample_header();
        header.length = 50; // claims 50, buffer has 12
        header.encode(&mut dst);
        assert!(RawPacket::decode(&dst).is_err());
    }

    #[test]
    fn raw_packet_slices_payload() {
        let mut dst = BytesMut::new();
        let mut header = sample_header();
        header.length = (HEADER_LEN + 4) as u16;
        header.encode(&mut dst);
        dst.put_slice(&[1, 2, 3, 4]);

        let raw = RawPacket::decode(&dst).unwrap();
        assert_eq!(&raw.payload[..], &[1, 2, 3, 4]);
        assert!(raw.is_compressed());
        assert!(!raw.is_encrypted());
    }

    #[test]
    fn set_payload_fixes_length() {
        let mut dst = BytesMut::new();
        sample_header().encode(&mut dst);
        dst.put_slice(&[0u8; 4]);
        let mut raw = RawPacket::decode(&dst).unwrap();

        raw.set_payload(Bytes::from_static(b"abcdef")).unwrap();
        assert_eq!(raw.header.length as usize, HEADER_LEN + 6);
        assert_eq!(raw.encode().len(), HEADER_LEN + 6);
    }

    #[test]
    fn reserved_magic_range() {
        assert!(magic::is_reserved(magic::HANDSHAKE));
        assert!(magic::is_reserved(0x0000_AFFF));
        assert!(!magic::is_reserved(0x0000_9FFF));
        assert!(!magic::is_reserved(0x0001_0000));
    }
}
