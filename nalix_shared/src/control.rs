//! Framework control packets.
//!
//! Everything in the reserved magic range except handshake and time-sync
//! (which live in their own modules): the `Control` packet carrying a
//! reason code and message, fixed-capacity text and binary packets, and the
//! `Directive` command packet. Also home to [`ProtocolReason`],
//! [`ControlFlags`], and [`PermissionLevel`].

use bitflags::bitflags;
use bytes::BytesMut;

use crate::error::ProtocolError;
use crate::packet::{magic, PacketBody};
use crate::pool::Poolable;
use crate::wire;

/// Opcode used by error/control responses the framework originates.
pub const OP_ERROR: u16 = 0x0000;

/// Outcome and error codes carried by control packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ProtocolReason {
    None = 0,
    Success = 1,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    RateLimited = 429,
    PermissionDenied = 460,
    InternalError = 500,
    Timeout = 504,
    AuthenticationError = 511,
}

impl ProtocolReason {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(ProtocolReason::None),
            1 => Some(ProtocolReason::Success),
            400 => Some(ProtocolReason::BadRequest),
            401 => Some(ProtocolReason::Unauthorized),
            403 => Some(ProtocolReason::Forbidden),
            404 => Some(ProtocolReason::NotFound),
            429 => Some(ProtocolReason::RateLimited),
            460 => Some(ProtocolReason::PermissionDenied),
            500 => Some(ProtocolReason::InternalError),
            504 => Some(ProtocolReason::Timeout),
            511 => Some(ProtocolReason::AuthenticationError),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            ProtocolReason::None | ProtocolReason::Success
        )
    }

    pub fn message(&self) -> &'static str {
        match self {
            ProtocolReason::None => "no status",
            ProtocolReason::Success => "success",
            ProtocolReason::BadRequest => "bad request",
            ProtocolReason::Unauthorized => "unauthorized",
            ProtocolReason::Forbidden => "forbidden",
            ProtocolReason::NotFound => "not found",
            ProtocolReason::RateLimited => "rate limited",
            ProtocolReason::PermissionDenied => "permission denied",
            ProtocolReason::InternalError => "internal error",
            ProtocolReason::Timeout => "timeout",
            ProtocolReason::AuthenticationError => "authentication error",
        }
    }
}

bitflags! {
    /// Qualifiers that may accompany a reason code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControlFlags: u8 {
        const IS_TRANSIENT = 1 << 0;
        const IS_AUTH_RELATED = 1 << 1;
        const HAS_REDIRECT = 1 << 2;
        const SLOW_DOWN = 1 << 3;
    }
}

/// Authorization tier compared against a handler's requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PermissionLevel {
    Guest = 0,
    User = 1,
    Admin = 2,
}

impl PermissionLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PermissionLevel::Guest),
            1 => Some(PermissionLevel::User),
            2 => Some(PermissionLevel::Admin),
            _ => None,
        }
    }
}

impl Default for PermissionLevel {
    fn default() -> Self {
        PermissionLevel::Guest
    }
}

/// Control packet: reason code, qualifier flags, and a short message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub opcode: u16,
    pub reason: ProtocolReason,
    pub flags: ControlFlags,
    pub message: String,
}

impl ControlPacket {
    pub fn new(opcode: u16, reason: ProtocolReason, message: impl Into<String>) -> Self {
        ControlPacket {
            opcode,
            reason,
            flags: ControlFlags::empty(),
            message: message.into(),
        }
    }

    /// Error response on the framework error opcode.
    pub fn error(reason: ProtocolReason, message: impl Into<String>) -> Self {
        Self::new(OP_ERROR, reason, message)
    }

    pub fn with_flags(mut self, flags: ControlFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl Default for ControlPacket {
    fn default() -> Self {
        ControlPacket {
            opcode: OP_ERROR,
            reason: ProtocolReason::None,
            flags: ControlFlags::empty(),
            message: String::new(),
        }
    }
}

impl PacketBody for ControlPacket {
    const MAGIC: u32 = magic::CONTROL;
    const NAME: &'static str = "Control";

    fn opcode(&self) -> u16 {
        self.opcode
    }

    fn encode_payload(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(&(self.reason as u16).to_le_bytes());
        dst.extend_from_slice(&[self.flags.bits()]);
        wire::write_string(dst, &self.message)
    }

    fn decode_payload(opcode: u16, mut src: &[u8]) -> Result<Self, ProtocolError> {
        let reason = ProtocolReason::from_u16(wire::read_u16(&mut src)?)
            .ok_or(ProtocolError::Malformed("unknown reason code"))?;
        let flags = ControlFlags::from_bits(wire::read_u8(&mut src)?)
            .ok_or(ProtocolError::Malformed("unknown control flag bits"))?;
        let message = wire::read_string(&mut src)?;
        Ok(ControlPacket {
            opcode,
            reason,
            flags,
            message,
        })
    }

    fn payload_size_hint(&self) -> usize {
        5 + self.message.len()
    }
}

impl Poolable for ControlPacket {
    fn reset_for_pool(&mut self) {
        self.opcode = OP_ERROR;
        self.reason = ProtocolReason::None;
        self.flags = ControlFlags::empty();
        self.message.clear();
    }
}

macro_rules! text_packet {
    ($name:ident, $cap:expr, $magic:expr) => {
        /// UTF-8 text packet with a fixed content capacity in bytes.
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            pub opcode: u16,
            pub content: String,
        }

        impl $name {
            pub const CAPACITY: usize = $cap;

            pub fn new(opcode: u16, content: impl Into<String>) -> Result<Self, ProtocolError> {
                let content = content.into();
                if content.len() > Self::CAPACITY {
                    return Err(ProtocolError::Malformed("text exceeds packet capacity"));
                }
                Ok($name { opcode, content })
            }
        }

        impl PacketBody for $name {
            const MAGIC: u32 = $magic;
            const NAME: &'static str = stringify!($name);

            fn opcode(&self) -> u16 {
                self.opcode
            }

            fn encode_payload(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
                if self.content.len() > Self::CAPACITY {
                    return Err(ProtocolError::Malformed("text exceeds packet capacity"));
                }
                wire::write_string(dst, &self.content)
            }

            fn decode_payload(opcode: u16, mut src: &[u8]) -> Result<Self, ProtocolError> {
                let content = wire::read_string(&mut src)?;
                if content.len() > Self::CAPACITY {
                    return Err(ProtocolError::Malformed("text exceeds packet capacity"));
                }
                Ok($name { opcode, content })
            }

            fn payload_size_hint(&self) -> usize {
                2 + self.content.len()
            }
        }

        impl Poolable for $name {
            fn reset_for_pool(&mut self) {
                self.opcode = 0;
                self.content.clear();
            }
        }
    };
}

macro_rules! binary_packet {
    ($name:ident, $cap:expr, $magic:expr) => {
        /// Raw byte packet with a fixed data capacity.
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            pub opcode: u16,
            pub data: Vec<u8>,
        }

        impl $name {
            pub const CAPACITY: usize = $cap;

            pub fn new(opcode: u16, data: impl Into<Vec<u8>>) -> Result<Self, ProtocolError> {
                let data = data.into();
                if data.len() > Self::CAPACITY {
                    return Err(ProtocolError::Malformed("data exceeds packet capacity"));
                }
                Ok($name { opcode, data })
            }
        }

        impl PacketBody for $name {
            const MAGIC: u32 = $magic;
            const NAME: &'static str = stringify!($name);

            fn opcode(&self) -> u16 {
                self.opcode
            }

            fn encode_payload(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
                if self.data.len() > Self::CAPACITY {
                    return Err(ProtocolError::Malformed("data exceeds packet capacity"));
                }
                wire::write_blob(dst, &self.data)
            }

            fn decode_payload(opcode: u16, mut src: &[u8]) -> Result<Self, ProtocolError> {
                let data = wire::read_blob(&mut src)?;
                if data.len() > Self::CAPACITY {
                    return Err(ProtocolError::Malformed("data exceeds packet capacity"));
                }
                Ok($name { opcode, data })
            }

            fn payload_size_hint(&self) -> usize {
                2 + self.data.len()
            }
        }

        impl Poolable for $name {
            fn reset_for_pool(&mut self) {
                self.opcode = 0;
                self.data.clear();
            }
        }
    };
}

text_packet!(Text256, 256, magic::TEXT256);
text_packet!(Text512, 512, magic::TEXT512);
text_packet!(Text1024, 1024, magic::TEXT1024);

binary_packet!(Binary128, 128, magic::BINARY128);
binary_packet!(Binary256, 256, magic::BINARY256);
binary_packet!(Binary512, 512, magic::BINARY512);
binary_packet!(Binary1024, 1024, magic::BINARY1024);

/// Maximum argument count a directive may carry.
pub const DIRECTIVE_MAX_ARGS: usize = 16;

/// Command invocation packet: a verb plus positional arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectivePacket {
    pub opcode: u16,
    pub command: String,
    pub args: Vec<String>,
}

impl DirectivePacket {
    pub fn new(
        opcode: u16,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Result<Self, ProtocolError> {
        if args.len() > DIRECTIVE_MAX_ARGS {
            return Err(ProtocolError::Malformed("too many directive arguments"));
        }
        Ok(DirectivePacket {
            opcode,
            command: command.into(),
            args,
        })
    }
}

impl PacketBody for DirectivePacket {
    const MAGIC: u32 = magic::DIRECTIVE;
    const NAME: &'static str = "Directive";

    fn opcode(&self) -> u16 {
        self.opcode
    }

    fn encode_payload(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.args.len() > DIRECTIVE_MAX_ARGS {
            return Err(ProtocolError::Malformed("too many directive arguments"));
        }
        wire::write_string(dst, &self.command)?;
        dst.extend_from_slice(&[self.args.len() as u8]);
        for arg in &self.args {
            wire::write_string(dst, arg)?;
        }
        Ok(())
    }

    fn decode_payload(opcode: u16, mut src: &[u8]) -> Result<Self, ProtocolError> {
        let command = wire::read_string(&mut src)?;
        let argc = wire::read_u8(&mut src)? as usize;
        if argc > DIRECTIVE_MAX_ARGS {
            return Err(ProtocolError::Malformed("too many directive arguments"));
        }
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(wire::read_string(&mut src)?);
        }
        Ok(DirectivePacket {
            opcode,
            command,
            args,
        })
    }

    fn payload_size_hint(&self) -> usize {
        32 + self.args.iter().map(|a| a.len() + 2).sum::<usize>()
    }
}

impl Poolable for DirectivePacket {
    fn reset_for_pool(&mut self) {
        self.opcode = 0;
        self.command.clear();
        self.args.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RawPacket;

    #[test]
    fn control_roundtrip() {
        let packet = ControlPacket::error(ProtocolReason::RateLimited, "slow down")
            .with_flags(ControlFlags::SLOW_DOWN | ControlFlags::IS_TRANSIENT);
        let raw = packet.clone().into_raw().unwrap();
        let back = ControlPacket::decode(&raw).unwrap();
        assert_eq!(back, packet);
        assert!(back.reason.is_error());
    }

    #[test]
    fn unknown_reason_code_is_rejected() {
        let packet = ControlPacket::error(ProtocolReason::Success, "ok");
        let raw = packet.into_raw().unwrap();
        let mut bytes = raw.encode().to_vec();
        // Corrupt the reason field (first payload bytes).
        bytes[12] = 0xFF;
        bytes[13] = 0xFF;
        let raw = RawPacket::decode(&bytes).unwrap();
        assert!(ControlPacket::decode(&raw).is_err());
    }

    #[test]
    fn text_capacity_is_enforced() {
        assert!(Text256::new(1, "a".repeat(256)).is_ok());
        assert!(Text256::new(1, "a".repeat(257)).is_err());
    }

    #[test]
    fn text_roundtrip() {
        let packet = Text256::new(1000, "hello").unwrap();
        let raw = packet.clone().into_raw().unwrap();
        assert_eq!(raw.header.opcode, 1000);
        assert_eq!(Text256::decode(&raw).unwrap(), packet);
    }

    #[test]
    fn oversized_text_on_the_wire_is_rejected() {
        // A Text512 frame decoded as Text256 carries too much content.
        let packet = Text512::new(5, "b".repeat(400)).unwrap();
        let mut raw = packet.into_raw().unwrap();
        raw.header.magic = Text256::MAGIC;
        assert!(Text256::decode(&raw).is_err());
    }

    #[test]
    fn binary_roundtrip() {
        let packet = Binary512::new(7, vec![1u8; 300]).unwrap();
        let raw = packet.clone().into_raw().unwrap();
        assert_eq!(Binary512::decode(&raw).unwrap(), packet);
    }

    #[test]
    fn directive_roundtrip() {
        let packet = DirectivePacket::new(
            12,
            "kick",
            vec!["player-1".to_string(), "idle".to_string()],
        )
        .unwrap();
        let raw = packet.clone().into_raw().unwrap();
        assert_eq!(DirectivePacket::decode(&raw).unwrap(), packet);
    }

    #[test]
    fn permission_levels_are_ordered() {
        assert!(PermissionLevel::Guest < PermissionLevel::User);
        assert!(PermissionLevel::User < PermissionLevel::Admin);
    }

    #[test]
    fn reset_for_pool_restores_defaults() {
        let mut packet = ControlPacket::error(ProtocolReason::Timeout, "late");
        packet.reset_for_pool();
        assert_eq!(packet, ControlPacket::default());
    }
}
