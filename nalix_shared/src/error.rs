//! Error taxonomy for the packet pipeline.
//!
//! Library code returns [`ProtocolError`]; binaries wrap it in `anyhow` at
//! the edges. Framing and transport errors close the connection, everything
//! else is answered with a control packet and the connection survives.

use std::fmt;

use thiserror::Error;

/// Errors produced by the packet pipeline.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Structural framing or field decoding failure.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Encryption or decryption failure.
    #[error("crypto failure: {0}")]
    Crypto(&'static str),

    /// The selected cipher has no implementation on this build.
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(&'static str),

    /// Compression or decompression failure.
    #[error("compression failure: {0}")]
    Compression(&'static str),

    /// Key exchange failed (wrong length, timeout, peer error).
    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    /// The request limiter rejected the packet.
    #[error("rate limited")]
    RateLimited,

    /// The connection limiter rejected the socket.
    #[error("connection limit reached")]
    ConnectionLimited,

    /// A dispatch queue level is at capacity.
    #[error("dispatch queue full")]
    QueueFull,

    /// No handler registered for the opcode.
    #[error("no handler for opcode {0}")]
    UnknownOpcode(u16),

    /// Handler exceeded its declared timeout.
    #[error("handler timed out")]
    Timeout,

    /// Handler returned an application error.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The connection is already disconnected.
    #[error("connection closed")]
    Closed,

    /// Socket read/write failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Invalid configuration or registration (fails fast at startup).
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

/// Why a connection was moved to the `Disconnected` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Orderly shutdown requested by either endpoint.
    Graceful,
    /// A frame declared a length above the configured maximum.
    DataTooLarge,
    /// A frame failed structural validation (bad length, unknown magic).
    DataMismatch,
    /// Handshake or decryption failed on the handshake path.
    AuthenticationError,
    /// Socket read/write error or EOF.
    Transport,
    /// Server is shutting down.
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "graceful",
            DisconnectReason::DataTooLarge => "data too large",
            DisconnectReason::DataMismatch => "data mismatch",
            DisconnectReason::AuthenticationError => "authentication error",
            DisconnectReason::Transport => "transport error",
            DisconnectReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
