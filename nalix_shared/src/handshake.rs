//! X25519 key exchange.
//!
//! Each endpoint generates an ephemeral keypair, exchanges 32-byte public
//! keys inside a [`HandshakePacket`], and derives the connection key as
//! `SHA-256(X25519(sk, pk_peer))`. Both sides end up with the same 32-byte
//! key; the packet never carries secret material.

use bytes::BytesMut;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::KEY_LEN;
use crate::error::ProtocolError;
use crate::packet::{magic, PacketBody};
use crate::pool::Poolable;

/// X25519 public key length on the wire.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Opcode initiating (and answering) the key exchange.
pub const OP_START_HANDSHAKE: u16 = 0xA001;

/// Ephemeral keypair for one handshake.
pub struct EphemeralKeys {
    secret: StaticSecret,
    public: [u8; PUBLIC_KEY_LEN],
}

impl EphemeralKeys {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret).to_bytes();
        EphemeralKeys { secret, public }
    }

    pub fn public(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public
    }

    /// Derives the 32-byte session key from the peer's public key.
    pub fn derive_session_key(&self, peer_public: &[u8; PUBLIC_KEY_LEN]) -> [u8; KEY_LEN] {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        Sha256::digest(shared.as_bytes()).into()
    }
}

/// Key-exchange control packet: exactly one 32-byte public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePacket {
    pub opcode: u16,
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

impl HandshakePacket {
    pub fn new(public_key: [u8; PUBLIC_KEY_LEN]) -> Self {
        HandshakePacket {
            opcode: OP_START_HANDSHAKE,
            public_key,
        }
    }
}

impl Default for HandshakePacket {
    fn default() -> Self {
        HandshakePacket {
            opcode: OP_START_HANDSHAKE,
            public_key: [0u8; PUBLIC_KEY_LEN],
        }
    }
}

impl PacketBody for HandshakePacket {
    const MAGIC: u32 = magic::HANDSHAKE;
    const NAME: &'static str = "Handshake";

    fn opcode(&self) -> u16 {
        self.opcode
    }

    fn encode_payload(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(&self.public_key);
        Ok(())
    }

    fn decode_payload(opcode: u16, src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() != PUBLIC_KEY_LEN {
            return Err(ProtocolError::Handshake("key payload must be 32 bytes"));
        }
        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(src);
        Ok(HandshakePacket { opcode, public_key })
    }

    fn payload_size_hint(&self) -> usize {
        PUBLIC_KEY_LEN
    }
}

impl Poolable for HandshakePacket {
    fn reset_for_pool(&mut self) {
        self.opcode = OP_START_HANDSHAKE;
        self.public_key = [0u8; PUBLIC_KEY_LEN];
    }
}
