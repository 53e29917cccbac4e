//! Dispatch registry.
//!
//! Handlers are registered through [`RegistryBuilder::route`] together with
//! their [`HandlerAttrs`] metadata (timeout, permission, encryption, rate
//! and concurrency limits). Registration monomorphizes each handler into a
//! boxed async invoker, so the hot path is one frozen map lookup and a
//! virtual call, with no per-dispatch reflection. Duplicate opcodes fail
//! the build.
//!
//! A handler is any `async fn(PacketContext) -> R` where `R` converts into
//! a [`ReturnValue`]: unit sends nothing, packets are serialized, strings
//! become text packets, byte vectors become binary packets.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use nalix_shared::clock;
use nalix_shared::control::PermissionLevel;
use nalix_shared::error::ProtocolError;
use nalix_shared::packet::{PacketBody, RawPacket};

use crate::connection::Connection;

/// What happens when a concurrency-limited handler is already saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Answer a RateLimited control packet without waiting.
    Reject,
    /// Queue on the handler's semaphore until a slot frees up.
    Wait,
}

/// Per-opcode concurrency gate.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimit {
    pub max: usize,
    pub policy: ConcurrencyPolicy,
}

/// Declarative handler metadata, fixed at registration.
#[derive(Debug, Clone)]
pub struct HandlerAttrs {
    /// Wall-clock bound on the invoker; `None` means unbounded.
    pub timeout: Option<Duration>,
    /// Minimum connection permission admitted to this handler.
    pub permission: PermissionLevel,
    /// Encrypt the response before it leaves the socket.
    pub requires_encryption: bool,
    /// Consult the request limiter before dispatch.
    pub rate_limited: bool,
    pub concurrency: Option<ConcurrencyLimit>,
    /// Close the connection when the handler fails (handshake path).
    pub close_on_error: bool,
}

impl Default for HandlerAttrs {
    fn default() -> Self {
        HandlerAttrs {
            timeout: None,
            permission: PermissionLevel::Guest,
            requires_encryption: false,
            rate_limited: true,
            concurrency: None,
            close_on_error: false,
        }
    }
}

impl HandlerAttrs {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_permission(mut self, permission: PermissionLevel) -> Self {
        self.permission = permission;
        self
    }

    pub fn require_encryption(mut self) -> Self {
        self.requires_encryption = true;
        self
    }

    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limited = false;
        self
    }

    pub fn with_concurrency(mut self, max: usize, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = Some(ConcurrencyLimit { max, policy });
        self
    }

    pub fn with_close_on_error(mut self) -> Self {
        self.close_on_error = true;
        self
    }
}

/// Per-request context ferried through the middleware chain to the handler.
///
/// Middleware mutate the packet in place (decompress, decrypt) and may
/// leave string properties for later stages; the context lives for the
/// duration of one inbound request.
#[derive(Clone)]
pub struct PacketContext {
    pub packet: RawPacket,
    pub connection: Arc<Connection>,
    pub descriptor: Arc<HandlerDescriptor>,
    /// Cancelled when the connection goes away.
    pub cancel: CancellationToken,
    /// Wall-clock stamp taken when the frame was decoded.
    pub received_unix_ms: i64,
    /// Monotonic stamp taken when the frame was decoded.
    pub received_mono_ticks: i64,
    props: HashMap<String, String>,
}

impl PacketContext {
    pub fn new(
        packet: RawPacket,
        connection: Arc<Connection>,
        descriptor: Arc<HandlerDescriptor>,
    ) -> Self {
        let cancel = connection.cancel_token();
        PacketContext {
            packet,
            connection,
            descriptor,
            cancel,
            received_unix_ms: clock::unix_millis_now(),
            received_mono_ticks: clock::mono_ticks_now(),
            props: HashMap::new(),
        }
    }

    pub fn attrs(&self) -> &HandlerAttrs {
        &self.descriptor.attrs
    }

    /// Decodes the current packet as a concrete type.
    pub fn decode<T: PacketBody>(&self) -> Result<T, ProtocolError> {
        T::decode(&self.packet)
    }

    /// Inter-middleware scratch value.
    pub fn set_prop(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.props.insert(key.into(), value.into());
    }

    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }
}

/// What a handler produced, before outbound serialization.
#[derive(Debug)]
pub enum ReturnValue {
    /// Send nothing.
    None,
    /// Serialize and send this frame.
    Packet(RawPacket),
    /// Wrap in the smallest binary packet that fits.
    Bytes(Vec<u8>),
    /// Wrap in the smallest text packet that fits.
    Text(String),
}

/// Adapts handler return types into [`ReturnValue`].
pub trait IntoReturnValue: Send {
    fn into_return_value(self) -> Result<ReturnValue, ProtocolError>;
}

impl IntoReturnValue for () {
    fn into_return_value(self) -> Result<ReturnValue, ProtocolError> {
        Ok(ReturnValue::None)
    }
}

impl IntoReturnValue for ReturnValue {
    fn into_return_value(self) -> Result<ReturnValue, ProtocolError> {
        Ok(self)
    }
}

impl IntoReturnValue for RawPacket {
    fn into_return_value(self) -> Result<ReturnValue, ProtocolError> {
        Ok(ReturnValue::Packet(self))
    }
}

impl IntoReturnValue for Vec<u8> {
    fn into_return_value(self) -> Result<ReturnValue, ProtocolError> {
        Ok(ReturnValue::Bytes(self))
    }
}

impl IntoReturnValue for Bytes {
    fn into_return_value(self) -> Result<ReturnValue, ProtocolError> {
        Ok(ReturnValue::Bytes(self.to_vec()))
    }
}

impl IntoReturnValue for String {
    fn into_return_value(self) -> Result<ReturnValue, ProtocolError> {
        Ok(ReturnValue::Text(self))
    }
}

impl IntoReturnValue for &'static str {
    fn into_return_value(self) -> Result<ReturnValue, ProtocolError> {
        Ok(ReturnValue::Text(self.to_string()))
    }
}

impl<T: IntoReturnValue> IntoReturnValue for Option<T> {
    fn into_return_value(self) -> Result<ReturnValue, ProtocolError> {
        match self {
            Some(value) => value.into_return_value(),
            None => Ok(ReturnValue::None),
        }
    }
}

impl<T: IntoReturnValue> IntoReturnValue for Result<T, ProtocolError> {
    fn into_return_value(self) -> Result<ReturnValue, ProtocolError> {
        self.and_then(IntoReturnValue::into_return_value)
    }
}

macro_rules! impl_packet_return {
    ($($packet:ty),+ $(,)?) => {
        $(
            impl IntoReturnValue for $packet {
                fn into_return_value(self) -> Result<ReturnValue, ProtocolError> {
                    self.into_raw().map(ReturnValue::Packet)
                }
            }
        )+
    };
}

impl_packet_return!(
    nalix_shared::control::ControlPacket,
    nalix_shared::control::DirectivePacket,
    nalix_shared::control::Text256,
    nalix_shared::control::Text512,
    nalix_shared::control::Text1024,
    nalix_shared::control::Binary128,
    nalix_shared::control::Binary256,
    nalix_shared::control::Binary512,
    nalix_shared::control::Binary1024,
    nalix_shared::handshake::HandshakePacket,
    nalix_shared::timesync::TimeSyncPacket,
);

type InvokerFuture = Pin<Box<dyn Future<Output = Result<ReturnValue, ProtocolError>> + Send>>;
type Invoker = Box<dyn Fn(PacketContext) -> InvokerFuture + Send + Sync>;

/// Immutable per-opcode dispatch entry.
pub struct HandlerDescriptor {
    pub opcode: u16,
    pub attrs: HandlerAttrs,
    gate: Option<Arc<Semaphore>>,
    invoker: Invoker,
}

impl HandlerDescriptor {
    /// Concurrency gate, present when the attrs declare a limit.
    pub fn gate(&self) -> Option<Arc<Semaphore>> {
        self.gate.clone()
    }

    /// Runs the precompiled invoker on an owned context snapshot.
    pub fn invoke(&self, ctx: PacketContext) -> InvokerFuture {
        (self.invoker)(ctx)
    }
}

/// Opcode → descriptor map, frozen after build; lookups are lock-free.
pub struct DispatchRegistry {
    routes: HashMap<u16, Arc<HandlerDescriptor>>,
}

impl DispatchRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            routes: HashMap::new(),
        }
    }

    pub fn get(&self, opcode: u16) -> Option<Arc<HandlerDescriptor>> {
        self.routes.get(&opcode).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Accumulates routes, then freezes into a [`DispatchRegistry`].
pub struct RegistryBuilder {
    routes: HashMap<u16, Arc<HandlerDescriptor>>,
}

impl RegistryBuilder {
    /// Registers a handler for `opcode`. Fails fast on a duplicate.
    pub fn route<F, Fut, R>(
        mut self,
        opcode: u16,
        attrs: HandlerAttrs,
        handler: F,
    ) -> Result<Self, ProtocolError>
    where
        F: Fn(PacketContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoReturnValue + 'static,
    {
        if self.routes.contains_key(&opcode) {
            return Err(ProtocolError::Config("duplicate opcode registration"));
        }
        let gate = attrs
            .concurrency
            .as_ref()
            .map(|limit| Arc::new(Semaphore::new(limit.max)));
        let invoker: Invoker = Box::new(move |ctx| {
            let fut = handler(ctx);
            let boxed: InvokerFuture = Box::pin(async move { fut.await.into_return_value() });
            boxed
        });
        self.routes.insert(
            opcode,
            Arc::new(HandlerDescriptor {
                opcode,
                attrs,
                gate,
                invoker,
            }),
        );
        Ok(self)
    }

    pub fn build(self) -> DispatchRegistry {
        DispatchRegistry {
            routes: self.routes,
        }
    }
}
