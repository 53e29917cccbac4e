//! `nalix_server`
//!
//! Server-side systems:
//! - Connection lifecycle (receive loop, serialized send path, events)
//! - Firewall (per-IP connection and request limits)
//! - Dispatch registry (opcode → precompiled invoker)
//! - Middleware pipeline (decompress → decrypt → authorize → rate-limit →
//!   concurrency → dispatch, plus outbound compress/encrypt)
//! - Listener and UDP endpoint
//!
//! Networking model:
//! - TCP: framed packet streams with per-connection state
//! - UDP: one full packet per datagram

pub mod connection;
pub mod datagram;
pub mod firewall;
pub mod listener;
pub mod middleware;
pub mod registry;
pub mod server;

pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use registry::{DispatchRegistry, HandlerAttrs, PacketContext, RegistryBuilder};
pub use server::PacketServer;
