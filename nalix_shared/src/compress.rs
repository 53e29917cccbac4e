//! Payload compression.
//!
//! Raw deflate over the packet payload. Outbound compression is applied
//! only above a per-transport threshold (see `ServerConfig`); inbound
//! inflation is capped so a hostile peer cannot expand a small frame into
//! unbounded memory.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::ProtocolError;

/// Compresses `data` with deflate.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(data.len() / 2 + 16),
        Compression::default(),
    );
    encoder
        .write_all(data)
        .map_err(|_| ProtocolError::Compression("deflate write failed"))?;
    encoder
        .finish()
        .map_err(|_| ProtocolError::Compression("deflate finish failed"))
}

/// Inflates `data`, refusing output above `max_len` bytes.
pub fn inflate(data: &[u8], max_len: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    let mut decoder = DeflateDecoder::new(data).take(max_len as u64 + 1);
    decoder
        .read_to_end(&mut out)
        .map_err(|_| ProtocolError::Compression("inflate failed"))?;
    if out.len() > max_len {
        return Err(ProtocolError::Compression("inflated size exceeds limit"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let data = b"hello hello hello hello hello hello hello hello".repeat(8);
        let packed = deflate(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(inflate(&packed, 64 * 1024).unwrap(), data);
    }

    #[test]
    fn garbage_input_fails() {
        assert!(inflate(&[0xFF, 0x00, 0xAB, 0xCD], 1024).is_err());
    }

    #[test]
    fn inflation_cap_is_enforced() {
        let data = vec![0u8; 4096];
        let packed = deflate(&data).unwrap();
        assert!(inflate(&packed, 100).is_err());
        assert!(inflate(&packed, 4096).is_ok());
    }
}
