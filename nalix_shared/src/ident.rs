//! 32-bit framework identifiers.
//!
//! An `Ident` packs the kind of object it names and the machine that minted
//! it, so an id appearing in a log line or on the wire can be traced back
//! without a lookup table.
//!
//! ```text
//! 32-bit Ident layout:
//! ┌──────────┬──────────────┬───────────────┐
//! │ Kind (4) │ Machine (12) │ Sequence (16) │
//! └──────────┴──────────────┴───────────────┘
//! ```
//!
//! Rendering: lowercase hex (`{:08x}`) and Base36 for compact log output.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

const KIND_SHIFT: u32 = 28;
const MACHINE_SHIFT: u32 = 16;
const MACHINE_MASK: u32 = 0x0FFF;
const SEQUENCE_MASK: u32 = 0xFFFF;

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// What an identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IdentKind {
    Unknown = 0,
    Connection = 1,
    Session = 2,
    Packet = 3,
    Directive = 4,
}

impl IdentKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(IdentKind::Unknown),
            1 => Some(IdentKind::Connection),
            2 => Some(IdentKind::Session),
            3 => Some(IdentKind::Packet),
            4 => Some(IdentKind::Directive),
            _ => None,
        }
    }
}

/// A 32-bit identifier with embedded kind and machine id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ident(u32);

impl Ident {
    pub const NIL: Ident = Ident(0);

    /// Packs kind, machine id (low 12 bits kept), and sequence.
    pub const fn new(kind: IdentKind, machine: u16, sequence: u16) -> Self {
        let raw = ((kind as u32) << KIND_SHIFT)
            | (((machine as u32) & MACHINE_MASK) << MACHINE_SHIFT)
            | (sequence as u32 & SEQUENCE_MASK);
        Ident(raw)
    }

    pub const fn from_u32(raw: u32) -> Self {
        Ident(raw)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Extracts the kind tag; `None` for tags minted by a newer peer.
    pub fn kind(&self) -> Option<IdentKind> {
        IdentKind::from_u8((self.0 >> KIND_SHIFT) as u8)
    }

    pub const fn machine(&self) -> u16 {
        ((self.0 >> MACHINE_SHIFT) & MACHINE_MASK) as u16
    }

    pub const fn sequence(&self) -> u16 {
        (self.0 & SEQUENCE_MASK) as u16
    }

    /// Lowercase hex, fixed width.
    pub fn to_hex(&self) -> String {
        format!("{:08x}", self.0)
    }

    /// Base36 rendering (1..=7 chars, lowercase).
    pub fn to_base36(&self) -> String {
        let mut v = self.0;
        if v == 0 {
            return "0".to_string();
        }
        let mut out = [0u8; 7];
        let mut i = out.len();
        while v > 0 {
            i -= 1;
            out[i] = BASE36_ALPHABET[(v % 36) as usize];
            v /= 36;
        }
        String::from_utf8_lossy(&out[i..]).into_owned()
    }

    /// Parses the Base36 rendering back into an identifier.
    pub fn parse_base36(s: &str) -> Option<Self> {
        u32::from_str_radix(s, 36).ok().map(Ident)
    }
}

impl fmt::Debug for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "Ident({:?}/{}#{})", kind, self.machine(), self.sequence()),
            None => write!(f, "Ident({:#010x})", self.0),
        }
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base36())
    }
}

/// Mints sequential identifiers for one machine.
///
/// The sequence wraps at 16 bits; identifiers are unique as long as fewer
/// than 65536 objects of one kind are alive at once.
pub struct IdentAllocator {
    machine: u16,
    counter: AtomicU32,
}

impl IdentAllocator {
    pub fn new(machine: u16) -> Self {
        IdentAllocator {
            machine,
            counter: AtomicU32::new(1),
        }
    }

    pub fn next(&self, kind: IdentKind) -> Ident {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) as u16;
        Ident::new(kind, self.machine, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let id = Ident::new(IdentKind::Connection, 0x0ABC, 0x1234);
        assert_eq!(id.kind(), Some(IdentKind::Connection));
        assert_eq!(id.machine(), 0x0ABC);
        assert_eq!(id.sequence(), 0x1234);
    }

    #[test]
    fn machine_id_is_masked_to_12_bits() {
        let id = Ident::new(IdentKind::Session, 0xFFFF, 1);
        assert_eq!(id.machine(), 0x0FFF);
    }

    #[test]
    fn base36_roundtrip() {
        let id = Ident::new(IdentKind::Packet, 42, 999);
        let rendered = id.to_base36();
        assert_eq!(Ident::parse_base36(&rendered), Some(id));
    }

    #[test]
    fn hex_rendering_is_fixed_width() {
        assert_eq!(Ident::from_u32(0x1F).to_hex(), "0000001f");
    }

    #[test]
    fn allocator_mints_distinct_sequences() {
        let alloc = IdentAllocator::new(7);
        let a = alloc.next(IdentKind::Connection);
        let b = alloc.next(IdentKind::Connection);
        assert_ne!(a, b);
        assert_eq!(a.machine(), 7);
        assert_eq!(b.sequence(), a.sequence().wrapping_add(1));
    }
}
