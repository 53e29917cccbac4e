//! `nalix_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - One wire contract (12-byte header, little-endian fields) everywhere.
//! - Clear separation of concerns (wire, packet, catalog, crypto, queue).
//! - Capability traits at the seams; no class hierarchies.
//! - No `unsafe`.

pub mod catalog;
pub mod clock;
pub mod compress;
pub mod config;
pub mod control;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod ident;
pub mod packet;
pub mod pool;
pub mod queue;
pub mod timesync;
pub mod wire;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::catalog::{Catalog, CatalogBuilder, Transformer};
    pub use crate::config::{ClientConfig, ServerConfig};
    pub use crate::control::*;
    pub use crate::crypto::CipherKind;
    pub use crate::error::{DisconnectReason, ProtocolError};
    pub use crate::handshake::{EphemeralKeys, HandshakePacket, OP_START_HANDSHAKE};
    pub use crate::ident::{Ident, IdentAllocator, IdentKind};
    pub use crate::packet::{
        PacketBody, PacketFlags, PacketHeader, Priority, RawPacket, TransportProtocol,
    };
    pub use crate::queue::PriorityQueue;
    pub use crate::timesync::{ClockSample, TimeSyncPacket, OP_TIME_SYNC};
}
