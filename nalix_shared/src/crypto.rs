//! Symmetric payload encryption.
//!
//! The pipeline only needs `encrypt`/`decrypt` over a payload, a 32-byte
//! key, and a [`CipherKind`]; the cipher itself is pluggable per
//! connection. Implemented here: XTEA in counter mode (the default) and
//! ChaCha20-Poly1305 (authenticated). The remaining variants name ciphers
//! an embedding can supply and return an unsupported-cipher error.
//!
//! Wire shape: an 8-byte (XTEA) or 12-byte (ChaCha20-Poly1305) random
//! nonce prefix followed by the ciphertext. Keys come from the handshake
//! and are always [`KEY_LEN`] bytes.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Symmetric key length, fixed by the handshake derivation.
pub const KEY_LEN: usize = 32;

const XTEA_NONCE_LEN: usize = 8;
const XTEA_ROUNDS: u32 = 32;
const XTEA_DELTA: u32 = 0x9E37_79B9;

const CHACHA_NONCE_LEN: usize = 12;
const CHACHA_TAG_LEN: usize = 16;

/// Per-connection symmetric algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherKind {
    Xtea,
    ChaCha20Poly1305,
    Salsa20,
    TwofishCbc,
    Blowfish,
    Speck,
}

impl CipherKind {
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Xtea => "xtea",
            CipherKind::ChaCha20Poly1305 => "chacha20-poly1305",
            CipherKind::Salsa20 => "salsa20",
            CipherKind::TwofishCbc => "twofish-cbc",
            CipherKind::Blowfish => "blowfish",
            CipherKind::Speck => "speck",
        }
    }
}

impl Default for CipherKind {
    fn default() -> Self {
        CipherKind::Xtea
    }
}

/// Encrypts `plain` under `key`, prefixing the nonce.
pub fn encrypt(plain: &[u8], key: &[u8; KEY_LEN], kind: CipherKind) -> Result<Vec<u8>, ProtocolError> {
    match kind {
        CipherKind::Xtea => Ok(xtea_seal(plain, key)),
        CipherKind::ChaCha20Poly1305 => chacha_seal(plain, key),
        other => Err(ProtocolError::UnsupportedCipher(other.name())),
    }
}

/// Decrypts a nonce-prefixed ciphertext produced by [`encrypt`].
pub fn decrypt(sealed: &[u8], key: &[u8; KEY_LEN], kind: CipherKind) -> Result<Vec<u8>, ProtocolError> {
    match kind {
        CipherKind::Xtea => xtea_open(sealed, key),
        CipherKind::ChaCha20Poly1305 => chacha_open(sealed, key),
        other => Err(ProtocolError::UnsupportedCipher(other.name())),
    }
}

// XTEA uses the first 16 key bytes as four little-endian words.
fn xtea_schedule(key: &[u8; KEY_LEN]) -> [u32; 4] {
    let mut k = [0u32; 4];
    for (i, word) in k.iter_mut().enumerate() {
        let off = i * 4;
        *word = u32::from_le_bytes([key[off], key[off + 1], key[off + 2], key[off + 3]]);
    }
    k
}

fn xtea_encipher(k: &[u32; 4], mut v0: u32, mut v1: u32) -> (u32, u32) {
    let mut sum: u32 = 0;
    for _ in 0..XTEA_ROUNDS {
        v0 = v0.wrapping_add(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1)) ^ (sum.wrapping_add(k[(sum & 3) as usize])),
        );
        sum = sum.wrapping_add(XTEA_DELTA);
        v1 = v1.wrapping_add(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(k[((sum >> 11) & 3) as usize])),
        );
    }
    (v0, v1)
}

/// Applies the XTEA-CTR keystream in place; symmetric for both directions.
fn xtea_keystream(k: &[u32; 4], nonce: u64, data: &mut [u8]) {
    for (block_index, chunk) in data.chunks_mut(8).enumerate() {
        let counter = nonce.wrapping_add(block_index as u64);
        let (s0, s1) = xtea_encipher(k, (counter >> 32) as u32, counter as u32);
        let mut ks = [0u8; 8];
        ks[..4].copy_from_slice(&s0.to_le_bytes());
        ks[4..].copy_from_slice(&s1.to_le_bytes());
        for (byte, key_byte) in chunk.iter_mut().zip(ks.iter()) {
            *byte ^= key_byte;
        }
    }
}

fn xtea_seal(plain: &[u8], key: &[u8; KEY_LEN]) -> Vec<u8> {
    let k = xtea_schedule(key);
    let nonce = OsRng.next_u64();
    let mut out = Vec::with_capacity(XTEA_NONCE_LEN + plain.len());
    out.extend_from_slice(&nonce.to_le_bytes());
    out.extend_from_slice(plain);
    xtea_keystream(&k, nonce, &mut out[XTEA_NONCE_LEN..]);
    out
}

fn xtea_open(sealed: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, ProtocolError> {
    if sealed.len() < XTEA_NONCE_LEN {
        return Err(ProtocolError::Crypto("ciphertext shorter than nonce"));
    }
    let k = xtea_schedule(key);
    let nonce = u64::from_le_bytes(
        sealed[..XTEA_NONCE_LEN]
            .try_into()
            .map_err(|_| ProtocolError::Crypto("bad nonce"))?,
    );
    let mut out = sealed[XTEA_NONCE_LEN..].to_vec();
    xtea_keystream(&k, nonce, &mut out);
    Ok(out)
}

fn chacha_seal(plain: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, ProtocolError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; CHACHA_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|_| ProtocolError::Crypto("aead seal failed"))?;
    let mut out = Vec::with_capacity(CHACHA_NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn chacha_open(sealed: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, ProtocolError> {
    if sealed.len() < CHACHA_NONCE_LEN + CHACHA_TAG_LEN {
        return Err(ProtocolError::Crypto("ciphertext shorter than nonce and tag"));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let (nonce, body) = sealed.split_at(CHACHA_NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| ProtocolError::Crypto("aead open failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; KEY_LEN] {
        let mut k = [0u8; KEY_LEN];
        for (i, b) in k.iter_mut().enumerate() {
            *b = i as u8;
        }
        k
    }

    #[test]
    fn xtea_roundtrip() {
        let plain = b"the quick brown fox jumps over the lazy dog";
        let sealed = encrypt(plain, &key(), CipherKind::Xtea).unwrap();
        assert_ne!(&sealed[XTEA_NONCE_LEN..], plain.as_slice());
        let opened = decrypt(&sealed, &key(), CipherKind::Xtea).unwrap();
        assert_eq!(opened, plain);
    }

    #[test]
    fn xtea_handles_non_block_aligned_input() {
        let plain = [7u8; 13];
        let sealed = encrypt(&plain, &key(), CipherKind::Xtea).unwrap();
        assert_eq!(decrypt(&sealed, &key(), CipherKind::Xtea).unwrap(), plain);
    }

    #[test]
    fn chacha_roundtrip() {
        let plain = b"payload under test";
        let sealed = encrypt(plain, &key(), CipherKind::ChaCha20Poly1305).unwrap();
        let opened = decrypt(&sealed, &key(), CipherKind::ChaCha20Poly1305).unwrap();
        assert_eq!(opened, plain);
    }

    #[test]
    fn chacha_detects_tampering() {
        let mut sealed = encrypt(b"integrity", &key(), CipherKind::ChaCha20Poly1305).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(decrypt(&sealed, &key(), CipherKind::ChaCha20Poly1305).is_err());
    }

    #[test]
    fn wrong_key_fails_aead_open() {
        let sealed = encrypt(b"secret", &key(), CipherKind::ChaCha20Poly1305).unwrap();
        let mut other = key();
        other[0] ^= 0xFF;
        assert!(decrypt(&sealed, &other, CipherKind::ChaCha20Poly1305).is_err());
    }

    #[test]
    fn unimplemented_ciphers_are_reported() {
        assert!(matches!(
            encrypt(b"x", &key(), CipherKind::Blowfish),
            Err(ProtocolError::UnsupportedCipher("blowfish"))
        ));
    }

    #[test]
    fn short_ciphertexts_are_rejected() {
        assert!(decrypt(&[1, 2, 3], &key(), CipherKind::Xtea).is_err());
        assert!(decrypt(&[0u8; 20], &key(), CipherKind::ChaCha20Poly1305).is_err());
    }
}
