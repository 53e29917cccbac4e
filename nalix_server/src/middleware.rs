//! Middleware pipeline.
//!
//! A fixed, ordered chain of `(ctx, next)` elements around the handler
//! call. Inbound order: decompress → decrypt → authorize → rate-limit →
//! concurrency gate → dispatch (terminal). A middleware that
//! short-circuits sends exactly one control packet and does not call
//! `next`.
//!
//! Outbound transforms run when the dispatcher serializes a return value:
//! compress when the payload exceeds the configured threshold, then
//! encrypt when the handler attributes require it. Control replies are
//! recycled through a packet pool.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use nalix_shared::catalog::{Catalog, Transformer};
use nalix_shared::config::ServerConfig;
use nalix_shared::control::{
    Binary1024, Binary128, Binary256, Binary512, ControlFlags, ControlPacket, ProtocolReason,
    Text1024, Text256, Text512, OP_ERROR,
};
use nalix_shared::error::{DisconnectReason, ProtocolError};
use nalix_shared::handshake::OP_START_HANDSHAKE;
use nalix_shared::packet::{PacketBody, Priority, RawPacket, TransportProtocol};
use nalix_shared::pool::Pool;

use crate::connection::Connection;
use crate::firewall::RequestLimiter;
use crate::registry::{ConcurrencyPolicy, PacketContext, ReturnValue};

/// One pipeline element.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &mut PacketContext, next: Next<'_>) -> Result<(), ProtocolError>;
}

/// Continuation over the remaining chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut PacketContext) -> Result<(), ProtocolError> {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(ctx, Next { chain: rest }).await,
            None => Ok(()),
        }
    }
}

/// Sends short-circuit control replies through a recycled packet pool.
#[derive(Clone)]
pub struct ControlReplies {
    pool: Arc<Pool<ControlPacket>>,
}

impl ControlReplies {
    pub fn new(pool_cap: usize) -> Self {
        ControlReplies {
            pool: Arc::new(Pool::new(pool_cap)),
        }
    }

    /// Frames and sends one control packet; the instance goes back to the
    /// pool afterwards. Send failures are logged, not fatal.
    async fn send(
        &self,
        connection: &Connection,
        reason: ProtocolReason,
        flags: ControlFlags,
        message: &str,
    ) {
        let mut packet = self.pool.get();
        packet.opcode = OP_ERROR;
        packet.reason = reason;
        packet.flags = flags;
        packet.message.push_str(message);

        match packet.to_raw(Priority::Normal, TransportProtocol::Tcp) {
            Ok(raw) => {
                if let Err(e) = connection.send_packet(&raw).await {
                    debug!(peer = %connection.peer(), error = %e, "control reply failed");
                }
            }
            Err(e) => debug!(error = %e, "control reply could not be framed"),
        }
        self.pool.put(packet);
    }
}

/// The assembled chain; cheap to share across dispatch workers.
pub struct Pipeline {
    chain: Vec<Arc<dyn Middleware>>,
}

/// Shared collaborators the standard chain needs.
pub struct PipelineDeps {
    pub catalog: Arc<Catalog>,
    pub limiter: Arc<RequestLimiter>,
    pub config: Arc<ServerConfig>,
}

impl Pipeline {
    pub fn new(chain: Vec<Arc<dyn Middleware>>) -> Self {
        Pipeline { chain }
    }

    /// The standard inbound chain in contract order.
    pub fn standard(deps: PipelineDeps) -> Self {
        let replies = ControlReplies::new(32);
        Pipeline::new(vec![
            Arc::new(Decompress {
                catalog: Arc::clone(&deps.catalog),
                max_inflated: deps.config.max_packet_size,
                replies: replies.clone(),
            }),
            Arc::new(Decrypt {
                catalog: Arc::clone(&deps.catalog),
                max_inflated: deps.config.max_packet_size,
                replies: replies.clone(),
            }),
            Arc::new(Authorize {
                replies: replies.clone(),
            }),
            Arc::new(RateLimit {
                limiter: Arc::clone(&deps.limiter),
                replies: replies.clone(),
            }),
            Arc::new(ConcurrencyGate {
                replies: replies.clone(),
            }),
            Arc::new(Dispatch {
                catalog: deps.catalog,
                config: deps.config,
                replies,
            }),
        ])
    }

    pub async fn run(&self, ctx: &mut PacketContext) -> Result<(), ProtocolError> {
        Next { chain: &self.chain }.run(ctx).await
    }
}

/// Inflates compressed frames before anything downstream reads them.
///
/// Frames that are still encrypted are left alone here; decryption
/// restores the compressed payload and finishes the job.
pub struct Decompress {
    catalog: Arc<Catalog>,
    max_inflated: usize,
    replies: ControlReplies,
}

#[async_trait]
impl Middleware for Decompress {
    fn name(&self) -> &'static str {
        "decompress"
    }

    async fn handle(&self, ctx: &mut PacketContext, next: Next<'_>) -> Result<(), ProtocolError> {
        if ctx.packet.is_compressed() && !ctx.packet.is_encrypted() {
            let transformer = self
                .catalog
                .transformer_for(ctx.packet.header.magic)
                .unwrap_or(Transformer::STANDARD);
            if let Err(e) = (transformer.decompress)(&mut ctx.packet, self.max_inflated) {
                warn!(
                    peer = %ctx.connection.peer(),
                    opcode = ctx.packet.header.opcode,
                    error = %e,
                    "inbound decompression failed"
                );
                self.replies
                    .send(
                        &ctx.connection,
                        ProtocolReason::BadRequest,
                        ControlFlags::empty(),
                        "Packet decompress failed!",
                    )
                    .await;
                return Ok(());
            }
        }
        next.run(ctx).await
    }
}

/// Decrypts encrypted frames with the connection key, then finishes any
/// pending decompression of the restored payload.
pub struct Decrypt {
    catalog: Arc<Catalog>,
    max_inflated: usize,
    replies: ControlReplies,
}

#[async_trait]
impl Middleware for Decrypt {
    fn name(&self) -> &'static str {
        "decrypt"
    }

    async fn handle(&self, ctx: &mut PacketContext, next: Next<'_>) -> Result<(), ProtocolError> {
        if ctx.packet.is_encrypted() {
            let on_handshake_path = ctx.packet.header.opcode == OP_START_HANDSHAKE;
            let transformer = self
                .catalog
                .transformer_for(ctx.packet.header.magic)
                .unwrap_or(Transformer::STANDARD);

            let outcome = match ctx.connection.encryption_key() {
                Some(key) => {
                    (transformer.decrypt)(&mut ctx.packet, &key, ctx.connection.encryption())
                }
                None => Err(ProtocolError::Crypto("no session key established")),
            };

            if let Err(e) = outcome {
                warn!(
                    peer = %ctx.connection.peer(),
                    opcode = ctx.packet.header.opcode,
                    error = %e,
                    "inbound decryption failed"
                );
                self.replies
                    .send(
                        &ctx.connection,
                        ProtocolReason::AuthenticationError,
                        ControlFlags::IS_AUTH_RELATED,
                        "Packet decoding failed!",
                    )
                    .await;
                if on_handshake_path {
                    ctx.connection
                        .disconnect(DisconnectReason::AuthenticationError)
                        .await;
                }
                return Ok(());
            }

            if ctx.packet.is_compressed() {
                if let Err(e) = (transformer.decompress)(&mut ctx.packet, self.max_inflated) {
                    warn!(peer = %ctx.connection.peer(), error = %e, "inbound decompression failed");
                    self.replies
                        .send(
                            &ctx.connection,
                            ProtocolReason::BadRequest,
                            ControlFlags::empty(),
                            "Packet decompress failed!",
                        )
                        .await;
                    return Ok(());
                }
            }
        }
        next.run(ctx).await
    }
}

/// Compares the handler's permission requirement with the connection.
pub struct Authorize {
    replies: ControlReplies,
}

#[async_trait]
impl Middleware for Authorize {
    fn name(&self) -> &'static str {
        "authorize"
    }

    async fn handle(&self, ctx: &mut PacketContext, next: Next<'_>) -> Result<(), ProtocolError> {
        let required = ctx.attrs().permission;
        if ctx.connection.permission() < required {
            debug!(
                peer = %ctx.connection.peer(),
                opcode = ctx.packet.header.opcode,
                "permission denied"
            );
            self.replies
                .send(
                    &ctx.connection,
                    ProtocolReason::PermissionDenied,
                    ControlFlags::IS_AUTH_RELATED,
                    "permission denied",
                )
                .await;
            return Ok(());
        }
        next.run(ctx).await
    }
}

/// Consults the request limiter with the connection's peer address.
pub struct RateLimit {
    limiter: Arc<RequestLimiter>,
    replies: ControlReplies,
}

#[async_trait]
impl Middleware for RateLimit {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn handle(&self, ctx: &mut PacketContext, next: Next<'_>) -> Result<(), ProtocolError> {
        if ctx.attrs().rate_limited && !self.limiter.is_allowed(ctx.connection.peer().ip()) {
            self.replies
                .send(
                    &ctx.connection,
                    ProtocolReason::RateLimited,
                    ControlFlags::SLOW_DOWN | ControlFlags::IS_TRANSIENT,
                    "rate limited",
                )
                .await;
            return Ok(());
        }
        next.run(ctx).await
    }
}

/// Gates entry by the handler's semaphore when a concurrency limit is
/// declared; the permit is held for the rest of the chain.
pub struct ConcurrencyGate {
    replies: ControlReplies,
}

#[async_trait]
impl Middleware for ConcurrencyGate {
    fn name(&self) -> &'static str {
        "concurrency"
    }

    async fn handle(&self, ctx: &mut PacketContext, next: Next<'_>) -> Result<(), ProtocolError> {
        let Some(gate) = ctx.descriptor.gate() else {
            return next.run(ctx).await;
        };
        let policy = ctx
            .attrs()
            .concurrency
            .map(|limit| limit.policy)
            .unwrap_or(ConcurrencyPolicy::Wait);

        let permit = match policy {
            ConcurrencyPolicy::Reject => match gate.try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.replies
                        .send(
                            &ctx.connection,
                            ProtocolReason::RateLimited,
                            ControlFlags::SLOW_DOWN | ControlFlags::IS_TRANSIENT,
                            "handler saturated",
                        )
                        .await;
                    return Ok(());
                }
            },
            ConcurrencyPolicy::Wait => gate
                .acquire_owned()
                .await
                .map_err(|_| ProtocolError::Closed)?,
        };

        let result = next.run(ctx).await;
        drop(permit);
        result
    }
}

/// Terminal element: runs the invoker (racing its timeout), adapts the
/// return value, and writes the response through the outbound transforms.
pub struct Dispatch {
    catalog: Arc<Catalog>,
    config: Arc<ServerConfig>,
    replies: ControlReplies,
}

#[async_trait]
impl Middleware for Dispatch {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    async fn handle(&self, ctx: &mut PacketContext, _next: Next<'_>) -> Result<(), ProtocolError> {
        let descriptor = Arc::clone(&ctx.descriptor);
        let attrs = &descriptor.attrs;

        let invocation = descriptor.invoke(ctx.clone());
        let outcome = match attrs.timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::Timeout),
            },
            None => invocation.await,
        };

        match outcome {
            Ok(value) => {
                if let Err(e) = self.send_return(ctx, value).await {
                    warn!(
                        peer = %ctx.connection.peer(),
                        opcode = ctx.packet.header.opcode,
                        error = %e,
                        "response send failed"
                    );
                }
            }
            Err(ProtocolError::Timeout) => {
                warn!(
                    peer = %ctx.connection.peer(),
                    opcode = ctx.packet.header.opcode,
                    "handler timed out"
                );
                self.replies
                    .send(
                        &ctx.connection,
                        ProtocolReason::Timeout,
                        ControlFlags::IS_TRANSIENT,
                        "handler timed out",
                    )
                    .await;
            }
            Err(e) => {
                error!(
                    peer = %ctx.connection.peer(),
                    opcode = ctx.packet.header.opcode,
                    magic = ctx.packet.header.magic,
                    error = %e,
                    "handler failed"
                );
                self.replies
                    .send(
                        &ctx.connection,
                        ProtocolReason::InternalError,
                        ControlFlags::empty(),
                        "internal error",
                    )
                    .await;
                if attrs.close_on_error {
                    ctx.connection
                        .disconnect(DisconnectReason::AuthenticationError)
                        .await;
                }
            }
        }
        Ok(())
    }
}

impl Dispatch {
    async fn send_return(
        &self,
        ctx: &PacketContext,
        value: ReturnValue,
    ) -> Result<(), ProtocolError> {
        let opcode = ctx.packet.header.opcode;
        let raw = match value {
            ReturnValue::None => return Ok(()),
            ReturnValue::Packet(raw) => raw,
            ReturnValue::Text(text) => text_response(opcode, text)?,
            ReturnValue::Bytes(bytes) => binary_response(opcode, bytes)?,
        };
        finalize_and_send(
            &ctx.connection,
            raw,
            ctx.attrs().requires_encryption,
            &self.catalog,
            self.config.compression_threshold_bytes,
        )
        .await
        .map(|_| ())
    }
}

/// Applies outbound transforms (compress above threshold, then encrypt when
/// required) and writes the frame to the connection.
pub async fn finalize_and_send(
    connection: &Connection,
    mut raw: RawPacket,
    encrypt: bool,
    catalog: &Catalog,
    compression_threshold: usize,
) -> Result<usize, ProtocolError> {
    let transformer = catalog
        .transformer_for(raw.header.magic)
        .unwrap_or(Transformer::STANDARD);
    if raw.payload.len() > compression_threshold {
        (transformer.compress)(&mut raw)?;
    }
    if encrypt {
        let Some(key) = connection.encryption_key() else {
            return Err(ProtocolError::Crypto("no session key for encrypted response"));
        };
        (transformer.encrypt)(&mut raw, &key, connection.encryption())?;
    }
    connection.send_packet(&raw).await
}

/// Wraps a string in the smallest text packet that fits.
fn text_response(opcode: u16, text: String) -> Result<RawPacket, ProtocolError> {
    if text.len() <= Text256::CAPACITY {
        Text256::new(opcode, text)?.into_raw()
    } else if text.len() <= Text512::CAPACITY {
        Text512::new(opcode, text)?.into_raw()
    } else if text.len() <= Text1024::CAPACITY {
        Text1024::new(opcode, text)?.into_raw()
    } else {
        Err(ProtocolError::Malformed("text return exceeds 1024 bytes"))
    }
}

/// Wraps bytes in the smallest binary packet that fits.
fn binary_response(opcode: u16, data: Vec<u8>) -> Result<RawPacket, ProtocolError> {
    if data.len() <= Binary128::CAPACITY {
        Binary128::new(opcode, data)?.into_raw()
    } else if data.len() <= Binary256::CAPACITY {
        Binary256::new(opcode, data)?.into_raw()
    } else if data.len() <= Binary512::CAPACITY {
        Binary512::new(opcode, data)?.into_raw()
    } else if data.len() <= Binary1024::CAPACITY {
        Binary1024::new(opcode, data)?.into_raw()
    } else {
        Err(ProtocolError::Malformed("binary return exceeds 1024 bytes"))
    }
}
