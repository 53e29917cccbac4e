//! Serialization core.
//!
//! Little-endian field codec used by every packet body. Readers take a
//! `&mut &[u8]` cursor and check remaining length before every access, so a
//! truncated buffer surfaces as [`ProtocolError::Malformed`] instead of a
//! panic, and no partial state escapes a failed decode.
//!
//! On-wire field shapes:
//! - integers and enums: little-endian, fixed width
//! - bool: one byte, 0 or 1
//! - string: u16 length prefix + UTF-8 bytes
//! - blob: u16 length prefix + raw bytes

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

/// Length-prefixed fields are capped by their 2-byte prefix.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

#[inline]
fn ensure(len: usize, needed: usize) -> Result<(), ProtocolError> {
    if len < needed {
        Err(ProtocolError::Malformed("field overruns buffer"))
    } else {
        Ok(())
    }
}

#[inline]
pub fn read_u8(src: &mut &[u8]) -> Result<u8, ProtocolError> {
    ensure(src.len(), 1)?;
    Ok(src.get_u8())
}

#[inline]
pub fn read_u16(src: &mut &[u8]) -> Result<u16, ProtocolError> {
    ensure(src.len(), 2)?;
    Ok(src.get_u16_le())
}

#[inline]
pub fn read_u32(src: &mut &[u8]) -> Result<u32, ProtocolError> {
    ensure(src.len(), 4)?;
    Ok(src.get_u32_le())
}

#[inline]
pub fn read_i64(src: &mut &[u8]) -> Result<i64, ProtocolError> {
    ensure(src.len(), 8)?;
    Ok(src.get_i64_le())
}

pub fn read_bool(src: &mut &[u8]) -> Result<bool, ProtocolError> {
    match read_u8(src)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ProtocolError::Malformed("bool must be 0 or 1")),
    }
}

/// Reads a u16-length-prefixed UTF-8 string.
pub fn read_string(src: &mut &[u8]) -> Result<String, ProtocolError> {
    let bytes = read_blob(src)?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::Malformed("string is not valid utf-8"))
}

/// Reads a u16-length-prefixed byte array.
pub fn read_blob(src: &mut &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = read_u16(src)? as usize;
    ensure(src.len(), len)?;
    let mut out = vec![0u8; len];
    src.copy_to_slice(&mut out);
    Ok(out)
}

/// Reads a fixed 32-byte array (key material).
pub fn read_array32(src: &mut &[u8]) -> Result<[u8; 32], ProtocolError> {
    ensure(src.len(), 32)?;
    let mut out = [0u8; 32];
    src.copy_to_slice(&mut out);
    Ok(out)
}

#[inline]
pub fn write_bool(dst: &mut BytesMut, v: bool) {
    dst.put_u8(u8::from(v));
}

/// Writes a u16-length-prefixed UTF-8 string.
pub fn write_string(dst: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    write_blob(dst, s.as_bytes())
}

/// Writes a u16-length-prefixed byte array.
pub fn write_blob(dst: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() > MAX_FIELD_LEN {
        return Err(ProtocolError::Malformed("field exceeds u16 length prefix"));
    }
    dst.put_u16_le(data.len() as u16);
    dst.put_slice(data);
    Ok(())
}
