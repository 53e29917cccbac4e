//! Connection lifecycle.
//!
//! A `Connection` wraps an accepted socket: it owns the split stream, a
//! send mutex serializing writes, the one-way state machine
//! (Connecting → Connected → Authenticated → Disconnected), the
//! per-connection symmetric key, and an ordered event channel.
//!
//! The receive loop accumulates bytes until a full length-prefixed frame
//! is buffered, then emits it as a `Received` event. Frames are `Bytes`
//! slices of the read buffer: consumers own them from delivery on, and
//! anything retained beyond the event must already be a copy. Bytes arrive
//! at the consumer in strict FIFO order; sends on one connection are
//! serialized, sends on different connections are independent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use nalix_shared::control::PermissionLevel;
use nalix_shared::crypto::{CipherKind, KEY_LEN};
use nalix_shared::error::{DisconnectReason, ProtocolError};
use nalix_shared::ident::Ident;
use nalix_shared::packet::{PacketHeader, RawPacket, HEADER_LEN};
use nalix_shared::pool::BufferPool;

/// One-way connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Authenticated = 2,
    Disconnected = 3,
}

/// Lifecycle events, delivered in per-connection FIFO order.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// One complete wire frame (header + payload).
    Received(Bytes),
    State(ConnectionState),
    Error(ProtocolError),
    /// Fired exactly once; no further events follow.
    Closed(DisconnectReason),
}

/// Server-side connection handle; shared via `Arc`.
pub struct Connection {
    id: Ident,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    max_packet_size: usize,
    state: RwLock<ConnectionState>,
    permission: RwLock<PermissionLevel>,
    key: RwLock<Option<[u8; KEY_LEN]>>,
    cipher: RwLock<CipherKind>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: parking_lot::Mutex<Option<OwnedReadHalf>>,
    buffers: Arc<BufferPool>,
    events: mpsc::Sender<ConnectionEvent>,
    cancel: CancellationToken,
    receive_started: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    /// Wraps an accepted stream. The returned receiver is the connection's
    /// event stream; dropping it eventually stops the receive loop.
    pub fn new(
        id: Ident,
        stream: TcpStream,
        peer: SocketAddr,
        max_packet_size: usize,
        event_capacity: usize,
        buffers: Arc<BufferPool>,
    ) -> (Arc<Self>, mpsc::Receiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(event_capacity);
        let (reader, writer) = stream.into_split();
        let conn = Arc::new(Connection {
            id,
            peer,
            connected_at: Utc::now(),
            max_packet_size,
            state: RwLock::new(ConnectionState::Connecting),
            permission: RwLock::new(PermissionLevel::default()),
            key: RwLock::new(None),
            cipher: RwLock::new(CipherKind::default()),
            writer: Mutex::new(Some(writer)),
            reader: parking_lot::Mutex::new(Some(reader)),
            buffers,
            events: events_tx,
            cancel: CancellationToken::new(),
            receive_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        (conn, events_rx)
    }

    pub fn id(&self) -> Ident {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// 32-byte symmetric key; `None` until the handshake completes.
    pub fn encryption_key(&self) -> Option<[u8; KEY_LEN]> {
        *self.key.read()
    }

    /// Set exactly once by the handshake handler.
    pub fn set_encryption_key(&self, key: [u8; KEY_LEN]) {
        *self.key.write() = Some(key);
    }

    /// Symmetric algorithm in use on this connection.
    pub fn encryption(&self) -> CipherKind {
        *self.cipher.read()
    }

    pub fn set_encryption(&self, cipher: CipherKind) {
        *self.cipher.write() = cipher;
    }

    pub fn permission(&self) -> PermissionLevel {
        *self.permission.read()
    }

    pub fn set_permission(&self, level: PermissionLevel) {
        *self.permission.write() = level;
    }

    /// Cancellation token observed by the receive loop and any in-flight
    /// dispatch for this connection.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Moves the state machine forward; backward transitions are ignored.
    pub fn advance_state(&self, next: ConnectionState) -> bool {
        {
            let mut state = self.state.write();
            if next <= *state {
                return false;
            }
            *state = next;
        }
        let _ = self.events.try_send(ConnectionEvent::State(next));
        true
    }

    /// Starts the receive loop. Safe to call more than once; only the
    /// first call has an effect.
    pub fn begin_receive(self: &Arc<Self>) {
        if self.receive_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(reader) = self.reader.lock().take() else {
            return;
        };
        self.advance_state(ConnectionState::Connected);
        let conn = Arc::clone(self);
        tokio::spawn(receive_loop(conn, reader));
    }

    /// Writes the full buffer atomically under the send mutex and returns
    /// the number of bytes written. Concurrent sends are serialized; the
    /// write is never split across other sends.
    pub async fn send(&self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        let mut writer = self.writer.lock().await;
        let Some(half) = writer.as_mut() else {
            return Err(ProtocolError::Closed);
        };
        half.write_all(bytes).await?;
        half.flush().await?;
        Ok(bytes.len())
    }

    /// Serializes and sends one packet through a pooled scratch buffer.
    pub async fn send_packet(&self, packet: &RawPacket) -> Result<usize, ProtocolError> {
        let mut buf = self.buffers.get();
        packet.encode_into(&mut buf);
        let written = self.send(&buf).await;
        self.buffers.put(buf);
        written
    }

    /// Transitions to Disconnected, cancels the receive loop, closes the
    /// socket, and fires `Closed` exactly once. Idempotent.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.advance_state(ConnectionState::Disconnected);
        self.cancel.cancel();
        {
            let mut writer = self.writer.lock().await;
            if let Some(mut half) = writer.take() {
                let _ = half.shutdown().await;
            }
        }
        let _ = self.events.send(ConnectionEvent::Closed(reason)).await;
        debug!(id = %self.id, peer = %self.peer, reason = %reason, "connection disconnected");
    }

    // Pulls one complete frame off the accumulation buffer, or reports why
    // the connection must close.
    fn extract_frame(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, DisconnectReason> {
        let Some(length) = PacketHeader::peek_length(buf) else {
            return Ok(None);
        };
        let length = length as usize;
        if length < HEADER_LEN {
            return Err(DisconnectReason::DataMismatch);
        }
        if length > self.max_packet_size {
            return Err(DisconnectReason::DataTooLarge);
        }
        if buf.len() < length {
            buf.reserve(length - buf.len());
            return Ok(None);
        }
        Ok(Some(buf.split_to(length).freeze()))
    }
}

async fn receive_loop(conn: Arc<Connection>, mut reader: OwnedReadHalf) {
    let mut buf = BytesMut::with_capacity(conn.max_packet_size.min(16 * 1024));
    let reason = loop {
        match conn.extract_frame(&mut buf) {
            Ok(Some(frame)) => {
                trace!(id = %conn.id, len = frame.len(), "frame received");
                if conn.events.send(ConnectionEvent::Received(frame)).await.is_err() {
                    break DisconnectReason::Shutdown;
                }
                continue;
            }
            Ok(None) => {}
            Err(reason) => break reason,
        }

        tokio::select! {
            _ = conn.cancel.cancelled() => break DisconnectReason::Graceful,
            read = reader.read_buf(&mut buf) => match read {
                // EOF mid-frame means the peer walked away from a truncated
                // packet; a clean EOF is a graceful close.
                Ok(0) if buf.is_empty() => break DisconnectReason::Graceful,
                Ok(0) => break DisconnectReason::DataMismatch,
                Ok(_) => {}
                Err(e) => {
                    let _ = conn.events.try_send(ConnectionEvent::Error(e.into()));
                    break DisconnectReason::Transport;
                }
            }
        }
    };
    conn.disconnect(reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalix_shared::control::Text256;
    use nalix_shared::ident::{IdentAllocator, IdentKind};
    use nalix_shared::packet::PacketBody;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn new_connection(stream: TcpStream) -> (Arc<Connection>, mpsc::Receiver<ConnectionEvent>) {
        let peer = stream.peer_addr().unwrap();
        let id = IdentAllocator::new(1).next(IdentKind::Connection);
        let buffers = Arc::new(BufferPool::new(4096, 8));
        Connection::new(id, stream, peer, 4096, 16, buffers)
    }

    #[tokio::test]
    async fn frames_are_delivered_in_fifo_order() {
        let (mut client, server) = socket_pair().await;
        let (conn, mut events) = new_connection(server);
        conn.begin_receive();

        let first = Text256::new(1, "first").unwrap().into_raw().unwrap().encode();
        let second = Text256::new(2, "second").unwrap().into_raw().unwrap().encode();

        // Split the second frame across two writes to exercise accumulation.
        client.write_all(&first).await.unwrap();
        client.write_all(&second[..5]).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        client.write_all(&second[5..]).await.unwrap();
        client.flush().await.unwrap();

        let mut opcodes = Vec::new();
        while opcodes.len() < 2 {
            match events.recv().await.unwrap() {
                ConnectionEvent::Received(frame) => {
                    let raw = RawPacket::decode(&frame).unwrap();
                    opcodes.push(raw.header.opcode);
                }
                ConnectionEvent::State(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(opcodes, vec![1, 2]);
    }

    #[tokio::test]
    async fn oversized_length_closes_with_data_too_large() {
        let (mut client, server) = socket_pair().await;
        let (conn, mut events) = new_connection(server);
        conn.begin_receive();

        // Length prefix far above the 4096-byte limit.
        client.write_all(&50_000u16.to_le_bytes()).await.unwrap();
        client.flush().await.unwrap();

        loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::Closed(reason) => {
                    assert_eq!(reason, DisconnectReason::DataTooLarge);
                    break;
                }
                ConnectionEvent::State(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(conn.is_disconnected());
    }

    #[tokio::test]
    async fn truncated_frame_then_eof_closes_with_data_mismatch() {
        let (mut client, server) = socket_pair().await;
        let (conn, mut events) = new_connection(server);
        conn.begin_receive();

        let frame = Text256::new(1, "partial").unwrap().into_raw().unwrap().encode();
        client.write_all(&frame[..frame.len() - 3]).await.unwrap();
        client.flush().await.unwrap();
        drop(client);

        loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::Closed(reason) => {
                    assert_eq!(reason, DisconnectReason::DataMismatch);
                    break;
                }
                ConnectionEvent::State(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        let _ = conn;
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_closes_once() {
        let (_client, server) = socket_pair().await;
        let (conn, mut events) = new_connection(server);
        conn.begin_receive();

        conn.disconnect(DisconnectReason::Graceful).await;
        conn.disconnect(DisconnectReason::Transport).await;

        // Exactly one Closed event, carrying the first reason.
        loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::Closed(reason) => {
                    assert_eq!(reason, DisconnectReason::Graceful);
                    break;
                }
                ConnectionEvent::State(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(events.try_recv().is_err());
        assert!(conn.send(b"x").await.is_err());
    }

    #[tokio::test]
    async fn state_machine_is_one_way() {
        let (_client, server) = socket_pair().await;
        let (conn, _events) = new_connection(server);

        assert!(conn.advance_state(ConnectionState::Connected));
        assert!(conn.advance_state(ConnectionState::Authenticated));
        assert!(!conn.advance_state(ConnectionState::Connected));
        assert_eq!(conn.state(), ConnectionState::Authenticated);
    }

    #[tokio::test]
    async fn begin_receive_is_single_shot() {
        let (_client, server) = socket_pair().await;
        let (conn, _events) = new_connection(server);
        conn.begin_receive();
        // Second call is a no-op rather than a second loop.
        conn.begin_receive();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }
}
