//! Packet catalog: magic number → deserializer + transformer.
//!
//! Built once at startup through [`CatalogBuilder`], then frozen behind an
//! `Arc`; all lookups after that are plain map reads. The builder rejects
//! duplicate magics and application packets inside the framework-reserved
//! range.
//!
//! Packet polymorphism is capability composition: each registered type
//! contributes a deserializer (`PacketBody::decode` behind a fn pointer)
//! and a [`Transformer`], the compress/decompress and encrypt/decrypt
//! delegate set applied to its frames. Most types share
//! [`Transformer::STANDARD`]; the table exists so a type can override it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::compress;
use crate::control::{Binary1024, Binary128, Binary256, Binary512, ControlPacket, DirectivePacket};
use crate::control::{Text1024, Text256, Text512};
use crate::crypto::{self, CipherKind, KEY_LEN};
use crate::error::ProtocolError;
use crate::handshake::HandshakePacket;
use crate::packet::{magic, PacketBody, PacketFlags, PacketHeader, RawPacket};
use crate::timesync::TimeSyncPacket;

/// A deserialized packet of a registered type, downcast by the caller.
pub type AnyPacket = Box<dyn Any + Send>;

/// Deserializer delegate for one packet type.
pub type Deserializer = fn(&RawPacket) -> Result<AnyPacket, ProtocolError>;

/// Compress/decompress + encrypt/decrypt delegate set for one packet type.
///
/// Every delegate rewrites the payload in place, fixes the length field,
/// and toggles the corresponding header flag. Delegates are idempotent: a
/// frame already in the target state passes through untouched.
#[derive(Clone, Copy)]
pub struct Transformer {
    pub compress: fn(&mut RawPacket) -> Result<(), ProtocolError>,
    pub decompress: fn(&mut RawPacket, usize) -> Result<(), ProtocolError>,
    pub encrypt: fn(&mut RawPacket, &[u8; KEY_LEN], CipherKind) -> Result<(), ProtocolError>,
    pub decrypt: fn(&mut RawPacket, &[u8; KEY_LEN], CipherKind) -> Result<(), ProtocolError>,
}

impl Transformer {
    /// Deflate compression and whole-payload encryption.
    pub const STANDARD: Transformer = Transformer {
        compress: standard_compress,
        decompress: standard_decompress,
        encrypt: standard_encrypt,
        decrypt: standard_decrypt,
    };
}

fn standard_compress(packet: &mut RawPacket) -> Result<(), ProtocolError> {
    if packet.is_compressed() {
        return Ok(());
    }
    let packed = compress::deflate(&packet.payload)?;
    packet.set_payload(packed.into())?;
    packet.header.flags |= PacketFlags::COMPRESSED;
    Ok(())
}

fn standard_decompress(packet: &mut RawPacket, max_len: usize) -> Result<(), ProtocolError> {
    if !packet.is_compressed() {
        return Ok(());
    }
    let plain = compress::inflate(&packet.payload, max_len)?;
    packet.set_payload(plain.into())?;
    packet.header.flags.remove(PacketFlags::COMPRESSED);
    Ok(())
}

fn standard_encrypt(
    packet: &mut RawPacket,
    key: &[u8; KEY_LEN],
    cipher: CipherKind,
) -> Result<(), ProtocolError> {
    if packet.is_encrypted() {
        return Ok(());
    }
    let sealed = crypto::encrypt(&packet.payload, key, cipher)?;
    packet.set_payload(sealed.into())?;
    packet.header.flags |= PacketFlags::ENCRYPTED;
    Ok(())
}

fn standard_decrypt(
    packet: &mut RawPacket,
    key: &[u8; KEY_LEN],
    cipher: CipherKind,
) -> Result<(), ProtocolError> {
    if !packet.is_encrypted() {
        return Ok(());
    }
    let plain = crypto::decrypt(&packet.payload, key, cipher)?;
    packet.set_payload(plain.into())?;
    packet.header.flags.remove(PacketFlags::ENCRYPTED);
    Ok(())
}

/// Per-magic entry: name for diagnostics, deserializer, transformer.
#[derive(Clone, Copy)]
pub struct PacketVtable {
    pub magic: u32,
    pub name: &'static str,
    pub deserialize: Deserializer,
    pub transformer: Transformer,
}

fn deserialize_as<T: PacketBody + Any>(raw: &RawPacket) -> Result<AnyPacket, ProtocolError> {
    T::decode(raw).map(|packet| Box::new(packet) as AnyPacket)
}

/// Frozen magic-number registry.
pub struct Catalog {
    by_magic: HashMap<u32, PacketVtable>,
}

impl Catalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder {
            by_magic: HashMap::new(),
        }
    }

    /// Catalog pre-loaded with every framework packet, ready for direct
    /// use when an application adds no packet types of its own.
    pub fn with_framework_packets() -> Arc<Catalog> {
        Arc::new(Self::framework_builder().build())
    }

    /// Builder seeded with the framework packet set.
    pub fn framework_builder() -> CatalogBuilder {
        let mut builder = Catalog::builder();
        builder.register_reserved::<HandshakePacket>();
        builder.register_reserved::<ControlPacket>();
        builder.register_reserved::<DirectivePacket>();
        builder.register_reserved::<TimeSyncPacket>();
        builder.register_reserved::<Text256>();
        builder.register_reserved::<Text512>();
        builder.register_reserved::<Text1024>();
        builder.register_reserved::<Binary128>();
        builder.register_reserved::<Binary256>();
        builder.register_reserved::<Binary512>();
        builder.register_reserved::<Binary1024>();
        builder
    }

    pub fn contains(&self, magic: u32) -> bool {
        self.by_magic.contains_key(&magic)
    }

    pub fn get(&self, magic: u32) -> Option<&PacketVtable> {
        self.by_magic.get(&magic)
    }

    pub fn transformer_for(&self, magic: u32) -> Option<Transformer> {
        self.by_magic.get(&magic).map(|vt| vt.transformer)
    }

    /// Reads the magic at offset 2 and dispatches to the registered
    /// deserializer. Returns `None` without allocating when the magic is
    /// unknown or the buffer is too short to carry one.
    pub fn try_deserialize(&self, src: &[u8]) -> Option<Result<AnyPacket, ProtocolError>> {
        let magic = PacketHeader::peek_magic(src)?;
        let vtable = self.by_magic.get(&magic)?;
        Some(RawPacket::decode(src).and_then(|raw| (vtable.deserialize)(&raw)))
    }

    /// Validates the frame against the catalog without materializing a
    /// typed packet; the pipeline works on the returned [`RawPacket`].
    pub fn try_frame(&self, frame: bytes::Bytes) -> Option<Result<RawPacket, ProtocolError>> {
        let magic = PacketHeader::peek_magic(&frame)?;
        if !self.by_magic.contains_key(&magic) {
            return None;
        }
        Some(RawPacket::decode_frame(frame))
    }
}

/// Accumulates registrations, then freezes into a [`Catalog`].
pub struct CatalogBuilder {
    by_magic: HashMap<u32, PacketVtable>,
}

impl CatalogBuilder {
    /// Registers an application packet type with the standard transformer.
    pub fn register<T: PacketBody + Any>(mut self) -> Result<Self, ProtocolError> {
        if magic::is_reserved(T::MAGIC) {
            return Err(ProtocolError::Config(
                "application packet magic inside the reserved range",
            ));
        }
        self.insert::<T>(Transformer::STANDARD)?;
        Ok(self)
    }

    /// Registers an application packet type with an overriding transformer.
    pub fn register_with<T: PacketBody + Any>(
        mut self,
        transformer: Transformer,
    ) -> Result<Self, ProtocolError> {
        if magic::is_reserved(T::MAGIC) {
            return Err(ProtocolError::Config(
                "application packet magic inside the reserved range",
            ));
        }
        self.insert::<T>(transformer)?;
        Ok(self)
    }

    fn register_reserved<T: PacketBody + Any>(&mut self) {
        // Framework packets are registered before any application type and
        // never collide; a collision here is a programming error.
        let _ = self.insert::<T>(Transformer::STANDARD);
    }

    fn insert<T: PacketBody + Any>(&mut self, transformer: Transformer) -> Result<(), ProtocolError> {
        let vtable = PacketVtable {
            magic: T::MAGIC,
            name: T::NAME,
            deserialize: deserialize_as::<T>,
            transformer,
        };
        if self.by_magic.insert(T::MAGIC, vtable).is_some() {
            return Err(ProtocolError::Config("duplicate magic registration"));
        }
        Ok(())
    }

    /// Freezes the registrations. Conflicts were already rejected at
    /// registration time, so the build itself cannot fail.
    pub fn build(self) -> Catalog {
        tracing::debug!(packets = self.by_magic.len(), "packet catalog frozen");
        Catalog {
            by_magic: self.by_magic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn framework_packets_are_registered() {
        let catalog = Catalog::with_framework_packets();
        assert!(catalog.contains(magic::HANDSHAKE));
        assert!(catalog.contains(magic::CONTROL));
        assert!(catalog.contains(magic::TEXT256));
        assert!(catalog.contains(magic::BINARY1024));
        assert!(catalog.contains(magic::TIME_SYNC));
        assert!(!catalog.contains(0xDEAD_BEEF));
    }

    #[test]
    fn try_deserialize_returns_none_on_unknown_magic() {
        let catalog = Catalog::with_framework_packets();
        let mut frame = Text256::new(1, "x").unwrap().into_raw().unwrap().encode().to_vec();
        // Overwrite the magic with an unregistered value.
        frame[2..6].copy_from_slice(&0x0102_0304u32.to_le_bytes());
        assert!(catalog.try_deserialize(&frame).is_none());
    }

    #[test]
    fn try_deserialize_returns_none_on_short_buffer() {
        let catalog = Catalog::with_framework_packets();
        assert!(catalog.try_deserialize(&[0u8; 5]).is_none());
    }

    #[test]
    fn try_deserialize_produces_typed_packet() {
        let catalog = Catalog::with_framework_packets();
        let frame = Text256::new(9, "ping").unwrap().into_raw().unwrap().encode();
        let any = catalog.try_deserialize(&frame).unwrap().unwrap();
        let text = any.downcast::<Text256>().unwrap();
        assert_eq!(text.content, "ping");
        assert_eq!(text.opcode, 9);
    }

    #[test]
    fn compress_then_decompress_restores_payload() {
        let text = Text1024::new(4, "z".repeat(900)).unwrap();
        let mut raw = text.into_raw().unwrap();
        let original = raw.payload.clone();
        let transformer = Transformer::STANDARD;

        (transformer.compress)(&mut raw).unwrap();
        assert!(raw.is_compressed());
        assert!(raw.payload.len() < original.len());

        (transformer.decompress)(&mut raw, 64 * 1024).unwrap();
        assert!(!raw.is_compressed());
        assert_eq!(raw.payload, original);
    }

    #[test]
    fn encrypt_then_decrypt_restores_payload() {
        let key = [9u8; KEY_LEN];
        let mut raw = Text256::new(2, "secret").unwrap().into_raw().unwrap();
        let original = raw.payload.clone();
        let transformer = Transformer::STANDARD;

        (transformer.encrypt)(&mut raw, &key, CipherKind::Xtea).unwrap();
        assert!(raw.is_encrypted());
        assert_ne!(raw.payload, original);

        (transformer.decrypt)(&mut raw, &key, CipherKind::Xtea).unwrap();
        assert!(!raw.is_encrypted());
        assert_eq!(raw.payload, original);
    }

    #[test]
    fn transforms_are_idempotent_on_flagged_frames() {
        let mut raw = Text256::new(2, "abc").unwrap().into_raw().unwrap();
        (Transformer::STANDARD.compress)(&mut raw).unwrap();
        let once = raw.clone();
        (Transformer::STANDARD.compress)(&mut raw).unwrap();
        assert_eq!(raw, once);
    }

    #[test]
    fn reserved_range_rejected_for_applications() {
        #[derive(Debug, Default, Clone)]
        struct Rogue;
        impl PacketBody for Rogue {
            const MAGIC: u32 = magic::RESERVED_MIN + 0x0F0;
            const NAME: &'static str = "Rogue";
            fn opcode(&self) -> u16 {
                0
            }
            fn encode_payload(&self, _dst: &mut BytesMut) -> Result<(), ProtocolError> {
                Ok(())
            }
            fn decode_payload(_opcode: u16, _src: &[u8]) -> Result<Self, ProtocolError> {
                Ok(Rogue)
            }
        }

        assert!(Catalog::builder().register::<Rogue>().is_err());
    }

    #[test]
    fn duplicate_magic_fails_the_build() {
        #[derive(Debug, Default, Clone)]
        struct AppPacket;
        impl PacketBody for AppPacket {
            const MAGIC: u32 = 0x0001_0001;
            const NAME: &'static str = "AppPacket";
            fn opcode(&self) -> u16 {
                0
            }
            fn encode_payload(&self, _dst: &mut BytesMut) -> Result<(), ProtocolError> {
                Ok(())
            }
            fn decode_payload(_opcode: u16, _src: &[u8]) -> Result<Self, ProtocolError> {
                Ok(AppPacket)
            }
        }

        let builder = Catalog::builder().register::<AppPacket>().unwrap();
        assert!(builder.register::<AppPacket>().is_err());
    }
}
