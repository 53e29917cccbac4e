//! `nalix_client`
//!
//! Client-side systems:
//! - Connection management over a framed TCP stream
//! - X25519 handshake and per-session encryption
//! - Typed packet exchange with transparent compression
//! - Time synchronization against the server clock

pub mod client;

pub use client::{PacketClient, SendOptions};
