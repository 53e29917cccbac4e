//! Client implementation.
//!
//! The client maintains one framed TCP stream to the server:
//! - connect (with timeout) and optional X25519 handshake
//! - typed packet send with outbound compression/encryption
//! - typed packet receive with inbound decryption/decompression
//! - request/response and time-sync helpers
//!
//! Sends and receives are sequential on the client; this mirrors a
//! request/response session rather than the server's concurrent pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use nalix_shared::catalog::{Catalog, Transformer};
use nalix_shared::clock;
use nalix_shared::config::ClientConfig;
use nalix_shared::crypto::KEY_LEN;
use nalix_shared::error::ProtocolError;
use nalix_shared::handshake::{EphemeralKeys, HandshakePacket};
use nalix_shared::packet::{
    PacketBody, PacketHeader, Priority, RawPacket, TransportProtocol, HEADER_LEN,
};
use nalix_shared::timesync::{ClockSample, TimeSyncPacket};

/// Per-send knobs; the default is a plain Normal-priority TCP packet.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub priority: Priority,
    /// Encrypt with the session key (requires a completed handshake).
    pub encrypt: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            priority: Priority::Normal,
            encrypt: false,
        }
    }
}

impl SendOptions {
    pub fn encrypted() -> Self {
        SendOptions {
            encrypt: true,
            ..SendOptions::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Connected packet client.
pub struct PacketClient {
    cfg: ClientConfig,
    catalog: Arc<Catalog>,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    buf: BytesMut,
    key: Option<[u8; KEY_LEN]>,
    sequence: u32,
}

impl PacketClient {
    /// Connects with the framework packet catalog.
    pub async fn connect(cfg: ClientConfig) -> Result<Self, ProtocolError> {
        Self::connect_with_catalog(cfg, Catalog::with_framework_packets()).await
    }

    /// Connects with an application catalog (framework packets included by
    /// the caller).
    pub async fn connect_with_catalog(
        cfg: ClientConfig,
        catalog: Arc<Catalog>,
    ) -> Result<Self, ProtocolError> {
        let addr: SocketAddr = cfg
            .server_addr
            .parse()
            .map_err(|_| ProtocolError::Config("invalid server address"))?;

        info!(server = %addr, "connecting");
        let stream = timeout(
            Duration::from_millis(cfg.connect_timeout_ms),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| ProtocolError::Handshake("connect timed out"))??;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        Ok(PacketClient {
            cfg,
            catalog,
            reader,
            writer,
            buf: BytesMut::with_capacity(16 * 1024),
            key: None,
            sequence: 0,
        })
    }

    /// Session key after a successful handshake.
    pub fn encryption_key(&self) -> Option<[u8; KEY_LEN]> {
        self.key
    }

    /// Runs the X25519 exchange and stores the derived session key.
    ///
    /// Any failure (wrong payload length, timeout, socket error) leaves
    /// the client without a key; callers should drop the connection.
    pub async fn handshake(&mut self) -> Result<(), ProtocolError> {
        let keys = EphemeralKeys::generate();
        self.send_packet(&HandshakePacket::new(keys.public()), SendOptions::default())
            .await?;

        let reply = timeout(
            Duration::from_millis(self.cfg.request_timeout_ms),
            self.recv_raw(),
        )
        .await
        .map_err(|_| ProtocolError::Handshake("handshake timed out"))??;

        if reply.header.magic != HandshakePacket::MAGIC {
            return Err(ProtocolError::Handshake("unexpected handshake reply"));
        }
        // Decoding enforces the 32-byte key payload.
        let response = HandshakePacket::decode(&reply)?;
        self.key = Some(keys.derive_session_key(&response.public_key));
        debug!("handshake complete");
        Ok(())
    }

    /// Frames and sends one typed packet, applying outbound compression
    /// above the configured threshold and encryption when requested.
    pub async fn send_packet<T: PacketBody>(
        &mut self,
        packet: &T,
        opts: SendOptions,
    ) -> Result<(), ProtocolError> {
        let mut raw = packet.to_raw(opts.priority, TransportProtocol::Tcp)?;
        let transformer = self
            .catalog
            .transformer_for(T::MAGIC)
            .unwrap_or(Transformer::STANDARD);

        if raw.payload.len() > self.cfg.compression_threshold_bytes {
            (transformer.compress)(&mut raw)?;
        }
        if opts.encrypt {
            let key = self
                .key
                .ok_or(ProtocolError::Crypto("no session key; handshake first"))?;
            (transformer.encrypt)(&mut raw, &key, self.cfg.cipher)?;
        }
        self.send_raw(&raw).await
    }

    /// Sends an already-framed packet as-is.
    pub async fn send_raw(&mut self, raw: &RawPacket) -> Result<(), ProtocolError> {
        self.writer.write_all(&raw.encode()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receives the next frame, undoing inbound encryption and
    /// compression.
    pub async fn recv_raw(&mut self) -> Result<RawPacket, ProtocolError> {
        loop {
            if let Some(length) = PacketHeader::peek_length(&self.buf) {
                let length = length as usize;
                if length < HEADER_LEN {
                    return Err(ProtocolError::Malformed("length below header size"));
                }
                if length > self.cfg.max_packet_size {
                    return Err(ProtocolError::Malformed("oversized frame"));
                }
                if self.buf.len() >= length {
                    let frame = self.buf.split_to(length).freeze();
                    let mut raw = RawPacket::decode_frame(frame)?;
                    let transformer = self
                        .catalog
                        .transformer_for(raw.header.magic)
                        .unwrap_or(Transformer::STANDARD);
                    if raw.is_encrypted() {
                        let key = self
                            .key
                            .ok_or(ProtocolError::Crypto("encrypted frame without a session key"))?;
                        (transformer.decrypt)(&mut raw, &key, self.cfg.cipher)?;
                    }
                    if raw.is_compressed() {
                        (transformer.decompress)(&mut raw, self.cfg.max_packet_size)?;
                    }
                    return Ok(raw);
                }
            }
            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(ProtocolError::Closed);
            }
        }
    }

    /// Receives and decodes the next frame as a concrete packet type.
    pub async fn recv_packet<T: PacketBody>(&mut self) -> Result<T, ProtocolError> {
        let raw = self.recv_raw().await?;
        T::decode(&raw)
    }

    /// Sends a packet and awaits the typed reply within the request
    /// timeout.
    pub async fn request<T: PacketBody, R: PacketBody>(
        &mut self,
        packet: &T,
        opts: SendOptions,
    ) -> Result<R, ProtocolError> {
        self.send_packet(packet, opts).await?;
        timeout(
            Duration::from_millis(self.cfg.request_timeout_ms),
            self.recv_packet::<R>(),
        )
        .await
        .map_err(|_| ProtocolError::Timeout)?
    }

    /// One NTP-style exchange; returns the estimated clock offset and
    /// round-trip delay.
    pub async fn time_sync(&mut self) -> Result<ClockSample, ProtocolError> {
        self.sequence = self.sequence.wrapping_add(1);
        let request = TimeSyncPacket::request(self.sequence);
        let response: TimeSyncPacket = self.request(&request, SendOptions::default()).await?;
        if response.sequence != request.sequence {
            return Err(ProtocolError::Malformed("time-sync sequence mismatch"));
        }
        Ok(ClockSample::from_exchange(
            &response,
            clock::unix_millis_now(),
        ))
    }

    /// Graceful close of the write side.
    pub async fn disconnect(mut self) -> Result<(), ProtocolError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
