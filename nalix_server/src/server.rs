//! Server assembly.
//!
//! `PacketServer` binds the listener, gates new sockets through the
//! firewall, pumps each connection's events into the priority queue, and
//! drains the queue with a pool of dispatch workers running the middleware
//! pipeline. The handshake and time-sync handlers are registered
//! automatically on their reserved opcodes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nalix_shared::catalog::Catalog;
use nalix_shared::config::ServerConfig;
use nalix_shared::control::{ControlFlags, ControlPacket, PermissionLevel, ProtocolReason};
use nalix_shared::error::{DisconnectReason, ProtocolError};
use nalix_shared::handshake::{EphemeralKeys, HandshakePacket, OP_START_HANDSHAKE};
use nalix_shared::ident::{IdentAllocator, IdentKind};
use nalix_shared::packet::{PacketBody, Priority};
use nalix_shared::pool::BufferPool;
use nalix_shared::queue::{LevelSnapshot, PriorityQueue};
use nalix_shared::timesync::{TimeSyncPacket, OP_TIME_SYNC};

use crate::connection::{Connection, ConnectionEvent, ConnectionState};
use crate::firewall::Firewall;
use crate::listener::Listener;
use crate::middleware::{Pipeline, PipelineDeps};
use crate::registry::{DispatchRegistry, HandlerAttrs, PacketContext, RegistryBuilder};

/// Adds the framework handlers (handshake, time-sync) to a route set.
///
/// Fails if the application claimed one of the reserved opcodes.
fn register_framework_handlers(builder: RegistryBuilder) -> Result<RegistryBuilder, ProtocolError> {
    let builder = builder.route(
        OP_START_HANDSHAKE,
        HandlerAttrs::default().with_close_on_error(),
        |ctx: PacketContext| async move {
            let request: HandshakePacket = ctx.decode()?;
            let keys = EphemeralKeys::generate();
            let session_key = keys.derive_session_key(&request.public_key);
            ctx.connection.set_encryption_key(session_key);
            ctx.connection.advance_state(ConnectionState::Authenticated);
            ctx.connection.set_permission(PermissionLevel::User);
            debug!(id = %ctx.connection.id(), "handshake complete");
            Ok::<_, ProtocolError>(HandshakePacket::new(keys.public()))
        },
    )?;
    builder.route(
        OP_TIME_SYNC,
        HandlerAttrs::default(),
        |ctx: PacketContext| async move {
            let request: TimeSyncPacket = ctx.decode()?;
            // t1/mono1 were stamped when the frame was decoded; t2/mono2
            // are stamped inside `respond`, right before the send path.
            Ok::<_, ProtocolError>(TimeSyncPacket::respond(
                &request,
                ctx.received_unix_ms,
                ctx.received_mono_ticks,
            ))
        },
    )
}

/// The assembled packet server.
pub struct PacketServer {
    cfg: Arc<ServerConfig>,
    catalog: Arc<Catalog>,
    registry: Arc<DispatchRegistry>,
    firewall: Arc<Firewall>,
    queue: Arc<PriorityQueue<PacketContext>>,
    pipeline: Arc<Pipeline>,
    listener: Listener,
    buffers: Arc<BufferPool>,
    cancel: CancellationToken,
    idents: IdentAllocator,
}

impl PacketServer {
    /// Binds to the configured address with the given application routes.
    pub async fn bind(
        cfg: ServerConfig,
        routes: RegistryBuilder,
        catalog: Arc<Catalog>,
    ) -> Result<Arc<Self>, ProtocolError> {
        cfg.validate()?;
        Self::bind_inner(cfg, routes, catalog).await
    }

    /// Binds to an OS-assigned port; helper for tests. Everything except
    /// the port is still validated.
    pub async fn bind_ephemeral(
        cfg: ServerConfig,
        routes: RegistryBuilder,
        catalog: Arc<Catalog>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let mut cfg = cfg;
        cfg.port = 0;
        let mut check = cfg.clone();
        check.port = 1;
        check.validate()?;
        Self::bind_inner(cfg, routes, catalog).await
    }

    async fn bind_inner(
        cfg: ServerConfig,
        routes: RegistryBuilder,
        catalog: Arc<Catalog>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let registry = Arc::new(register_framework_handlers(routes)?.build());
        let cfg = Arc::new(cfg);
        let firewall = Arc::new(Firewall::from_config(&cfg));
        let queue = Arc::new(PriorityQueue::new(
            cfg.queue_capacity_per_level,
            cfg.age_boost_threshold_ms.map(Duration::from_millis),
        ));
        let pipeline = Arc::new(Pipeline::standard(PipelineDeps {
            catalog: Arc::clone(&catalog),
            limiter: Arc::clone(&firewall.requests),
            config: Arc::clone(&cfg),
        }));
        let listener = Listener::bind(&cfg).await?;
        let machine = listener.local_addr()?.port() & 0x0FFF;
        // Scratch buffers sized for typical frames; oversized packets fall
        // back to a fresh allocation inside BytesMut.
        let buffers = Arc::new(BufferPool::new(cfg.max_packet_size.min(16 * 1024), 256));

        Ok(Arc::new(PacketServer {
            cfg,
            catalog,
            registry,
            firewall,
            queue,
            pipeline,
            listener,
            buffers,
            cancel: CancellationToken::new(),
            idents: IdentAllocator::new(machine),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        self.listener.local_addr()
    }

    pub fn firewall(&self) -> &Firewall {
        &self.firewall
    }

    pub fn queue_stats(&self, priority: Priority) -> LevelSnapshot {
        self.queue.stats(priority)
    }

    /// Stops accepting and cancels the worker pool; existing connections
    /// are not forcibly closed.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the accept loop until shutdown. Spawns the firewall sweeper
    /// and the dispatch worker pool.
    pub async fn run(self: Arc<Self>) -> Result<(), ProtocolError> {
        info!(addr = %self.local_addr()?, "server listening");

        {
            let firewall = Arc::clone(&self.firewall);
            let queue = Arc::clone(&self.queue);
            let cancel = self.cancel.clone();
            let metrics = self.cfg.enable_metrics;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(60));
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            firewall.sweep();
                            if metrics {
                                for priority in [Priority::Low, Priority::Normal, Priority::High, Priority::Urgent] {
                                    let stats = queue.stats(priority);
                                    debug!(?priority, ?stats, "queue level stats");
                                }
                            }
                        }
                    }
                }
            });
        }

        for worker_id in 0..self.cfg.dispatch_workers {
            let queue = Arc::clone(&self.queue);
            let pipeline = Arc::clone(&self.pipeline);
            let cancel = self.cancel.clone();
            tokio::spawn(dispatch_worker(worker_id, queue, pipeline, cancel));
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }

        info!("listener stopped");
        Ok(())
    }

    // Firewall gate, then connection construction and event pump spawn.
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if !self.firewall.connections.is_connection_allowed(peer.ip()) {
            // Close immediately without a response to avoid amplification.
            debug!(%peer, "connection rejected by limiter");
            drop(stream);
            return;
        }

        let id = self.idents.next(IdentKind::Connection);
        let (conn, events) = Connection::new(
            id,
            stream,
            peer,
            self.cfg.max_packet_size,
            self.cfg.event_channel_capacity,
            Arc::clone(&self.buffers),
        );
        conn.begin_receive();
        info!(%peer, id = %id, "connection accepted");

        let server = Arc::clone(self);
        tokio::spawn(server.pump(conn, events));
    }

    // Consumes one connection's event stream in FIFO order.
    async fn pump(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut events: mpsc::Receiver<ConnectionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Received(frame) => self.on_frame(&conn, frame).await,
                ConnectionEvent::State(state) => {
                    debug!(id = %conn.id(), ?state, "connection state changed");
                }
                ConnectionEvent::Error(e) => {
                    debug!(id = %conn.id(), error = %e, "connection error");
                }
                ConnectionEvent::Closed(reason) => {
                    self.firewall.connections.connection_closed(conn.peer().ip());
                    info!(id = %conn.id(), peer = %conn.peer(), %reason, "connection closed");
                    break;
                }
            }
        }
    }

    // Frame → catalog validation → descriptor lookup → queue.
    async fn on_frame(&self, conn: &Arc<Connection>, frame: Bytes) {
        let raw = match self.catalog.try_frame(frame) {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => {
                warn!(id = %conn.id(), error = %e, "malformed frame");
                Self::disconnect_from_pump(conn, DisconnectReason::DataMismatch);
                return;
            }
            None => {
                warn!(id = %conn.id(), "frame with unknown magic");
                Self::disconnect_from_pump(conn, DisconnectReason::DataMismatch);
                return;
            }
        };

        let opcode = raw.header.opcode;
        let Some(descriptor) = self.registry.get(opcode) else {
            debug!(id = %conn.id(), opcode, "no handler for opcode");
            self.reply(conn, ControlPacket::error(ProtocolReason::NotFound, "no handler for opcode"))
                .await;
            return;
        };

        let priority = raw.header.priority;
        let deadline = descriptor.attrs.timeout.map(|t| Instant::now() + t);
        let ctx = PacketContext::new(raw, Arc::clone(conn), descriptor);
        if self
            .queue
            .enqueue_with_deadline(priority, ctx, deadline)
            .is_err()
        {
            self.reply(
                conn,
                ControlPacket::error(ProtocolReason::RateLimited, "server busy")
                    .with_flags(ControlFlags::SLOW_DOWN | ControlFlags::IS_TRANSIENT),
            )
            .await;
        }
    }

    // The pump is the event consumer, so it must not await `disconnect`
    // (which delivers the Closed event) or it can deadlock on a full
    // channel. Run it from its own task instead.
    fn disconnect_from_pump(conn: &Arc<Connection>, reason: DisconnectReason) {
        let conn = Arc::clone(conn);
        tokio::spawn(async move { conn.disconnect(reason).await });
    }

    async fn reply(&self, conn: &Connection, packet: ControlPacket) {
        if let Ok(raw) = packet.into_raw() {
            if let Err(e) = conn.send_packet(&raw).await {
                debug!(id = %conn.id(), error = %e, "control reply failed");
            }
        }
    }
}

async fn dispatch_worker(
    worker_id: usize,
    queue: Arc<PriorityQueue<PacketContext>>,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "dispatch worker started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = queue.dequeue() => {
                let (_, mut ctx) = item;
                if ctx.connection.is_disconnected() {
                    continue;
                }
                if let Err(e) = pipeline.run(&mut ctx).await {
                    warn!(
                        worker_id,
                        opcode = ctx.packet.header.opcode,
                        error = %e,
                        "pipeline failed"
                    );
                }
            }
        }
    }
    debug!(worker_id, "dispatch worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_ephemeral_and_shutdown() {
        let server = PacketServer::bind_ephemeral(
            ServerConfig::default(),
            DispatchRegistry::builder(),
            Catalog::with_framework_packets(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let handle = tokio::spawn(Arc::clone(&server).run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reserved_opcode_collision_fails_bind() {
        let routes = DispatchRegistry::builder()
            .route(OP_START_HANDSHAKE, HandlerAttrs::default(), |_ctx| async {})
            .unwrap();
        let result = PacketServer::bind_ephemeral(
            ServerConfig::default(),
            routes,
            Catalog::with_framework_packets(),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Config(_))));
    }

    #[tokio::test]
    async fn invalid_config_fails_bind() {
        let cfg = ServerConfig {
            dispatch_workers: 0,
            ..ServerConfig::default()
        };
        let result = PacketServer::bind_ephemeral(
            cfg,
            DispatchRegistry::builder(),
            Catalog::with_framework_packets(),
        )
        .await;
        assert!(result.is_err());
    }
}
