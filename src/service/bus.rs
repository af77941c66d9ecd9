//! # Message Bus
//!
//! One [`MessageBus`] is one authenticated connection to a broker (or a
//! peer). It correlates calls with replies, dispatches incoming calls to
//! exported objects and fans signals out to subscribers.
//!
//! ## Components
//! - **Engine actor**: owns the serial counter, the pending-call table and
//!   the signal subscriptions. Every mutation of those happens on this task.
//! - **Reader task**: receives bytes and fds, decodes complete frames with
//!   [`MessageCodec`] and forwards them to the actor.
//! - **Writer task**: writes whole frames in queue order; the fds of a
//!   frame travel with its first chunk.
//! - **Handler futures**: method handlers run inside the actor loop through
//!   a `FuturesUnordered`, so a suspended handler never blocks other traffic.
//!
//! ## Lifecycle
//! ```text
//! Connecting -> Authenticating -> HelloPending -> Ready -> Disconnected
//! ```
//! `Hello` is always serial 1. Teardown is idempotent: it resolves every
//! pending call with [`DbusError::Disconnected`], unexports all objects and
//! drops every handler and subscription.

use crate::config::{AuthConfig, BusConfig, ConnectionConfig};
use crate::core::codec::MessageCodec;
use crate::core::marshal::Endian;
use crate::core::message::{Message, MessageType};
use crate::core::value::Value;
use crate::error::{constants, DbusError, RemoteError, Result};
use crate::protocol::auth::{authenticate, AuthOutcome, Authenticator};
use crate::protocol::introspection::Node;
use crate::protocol::names;
use crate::service::export::{self, ObjectTable};
use crate::service::interface::ServiceInterface;
use crate::service::name_owner::{is_name_owner_changed, NameOwnerCache};
use crate::service::proxy::ProxyObject;
use crate::transport::address::bus_address;
use crate::transport::stream::BusStream;
use crate::utils::metrics::BusMetrics;
use crate::utils::timeout::{maybe_timeout, with_timeout_error, SHUTDOWN_TIMEOUT};
use bytes::BytesMut;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, instrument, trace, warn};

/// Connection lifecycle. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    HelloPending,
    Ready,
    Disconnected,
}

/// What a user message handler did with a message.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Pass the message on to the next handler and default dispatch
    Continue,
    /// Stop here; nothing is sent
    Handled,
    /// Stop here and send this message
    Reply(Message),
}

impl From<bool> for HandlerOutcome {
    fn from(handled: bool) -> Self {
        if handled {
            HandlerOutcome::Handled
        } else {
            HandlerOutcome::Continue
        }
    }
}

pub type HandlerId = u64;

type MessageHandlerFn = dyn Fn(&Message) -> Result<HandlerOutcome> + Send + Sync;

/// Flags for `RequestName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NameFlags(u32);

impl NameFlags {
    pub const NONE: NameFlags = NameFlags(0);
    pub const ALLOW_REPLACEMENT: NameFlags = NameFlags(0x1);
    pub const REPLACE_EXISTING: NameFlags = NameFlags(0x2);
    pub const DO_NOT_QUEUE: NameFlags = NameFlags(0x4);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: NameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for NameFlags {
    type Output = NameFlags;

    fn bitor(self, rhs: NameFlags) -> NameFlags {
        NameFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

impl RequestNameReply {
    pub fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            1 => RequestNameReply::PrimaryOwner,
            2 => RequestNameReply::InQueue,
            3 => RequestNameReply::Exists,
            4 => RequestNameReply::AlreadyOwner,
            other => {
                return Err(DbusError::Client(format!(
                    "unknown RequestName reply code {other}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

impl ReleaseNameReply {
    pub fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            1 => ReleaseNameReply::Released,
            2 => ReleaseNameReply::NonExistent,
            3 => ReleaseNameReply::NotOwner,
            other => {
                return Err(DbusError::Client(format!(
                    "unknown ReleaseName reply code {other}"
                )))
            }
        })
    }
}

/// Signal selection for [`MessageBus::subscribe_signals`]. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalFilter {
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
}

impl SignalFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    /// The sender matches exactly or through the owner `cache`.
    pub fn matches(&self, message: &Message, cache: &NameOwnerCache) -> bool {
        if message.message_type() != MessageType::Signal {
            return false;
        }
        let field_matches =
            |want: &Option<String>, have: Option<&str>| want.as_deref().map_or(true, |w| Some(w) == have);
        field_matches(&self.path, message.path())
            && field_matches(&self.interface, message.interface())
            && field_matches(&self.member, message.member())
            && self
                .sender
                .as_deref()
                .map_or(true, |s| cache.sender_matches(s, message.sender()))
    }
}

struct Subscription {
    filter: SignalFilter,
    tx: mpsc::UnboundedSender<Message>,
}

/// Signals matching one [`SignalFilter`]. Dropping it unsubscribes.
pub struct SignalStream {
    id: u64,
    rx: UnboundedReceiverStream<Message>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl SignalStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next matching signal; `None` once the connection is gone.
    pub async fn next_signal(&mut self) -> Option<Message> {
        self.rx.next().await
    }

    pub fn unsubscribe(self) {}
}

impl Stream for SignalStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for SignalStream {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(Command::Unsubscribe { id: self.id });
        }
    }
}

impl fmt::Debug for SignalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalStream").field("id", &self.id).finish()
    }
}

enum Command {
    Send {
        message: Message,
        reply: Option<oneshot::Sender<Result<Message>>>,
    },
    /// Drop pending entries whose caller went away
    Reap,
    Subscribe {
        id: u64,
        subscription: Subscription,
    },
    Unsubscribe {
        id: u64,
    },
    Disconnect,
}

#[derive(Debug, Clone)]
struct DisconnectInfo {
    reason: String,
    failed: bool,
}

/// State shared between the handle and the engine.
pub(crate) struct Shared {
    pub(crate) exports: RwLock<ObjectTable>,
    handlers: RwLock<Vec<(HandlerId, Arc<MessageHandlerFn>)>>,
    pub(crate) name_owners: NameOwnerCache,
    match_rules: Mutex<HashMap<String, usize>>,
    pub(crate) name_owner_rule_installed: AtomicBool,
    pub(crate) machine_id: OnceLock<String>,
    next_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
    disconnect: Mutex<Option<DisconnectInfo>>,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::HelloPending);
        Self {
            exports: RwLock::new(ObjectTable::default()),
            handlers: RwLock::new(Vec::new()),
            name_owners: NameOwnerCache::new(),
            match_rules: Mutex::new(HashMap::new()),
            name_owner_rule_installed: AtomicBool::new(false),
            machine_id: OnceLock::new(),
            next_id: AtomicU64::new(1),
            state,
            disconnect: Mutex::new(None),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn disconnect_info(&self) -> Option<DisconnectInfo> {
        self.disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the terminal state once. Returns false if already recorded.
    /// Record the disconnect reason once. Returns false if already recorded.
    fn record_disconnect(&self, reason: &str, failed: bool) -> bool {
        let mut slot = self.disconnect.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(DisconnectInfo {
            reason: reason.to_owned(),
            failed,
        });
        true
    }

    /// Empty the object table, even if a panicking handler poisoned it.
    fn take_exports(&self) -> Vec<(String, Vec<Arc<ServiceInterface>>)> {
        self.exports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
    }

    fn clear_handlers(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Wake everyone waiting on the state. Called after teardown completes.
    fn publish_disconnected(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

struct BusInner {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    metrics: Arc<BusMetrics>,
    queued: Arc<AtomicUsize>,
    unique_name: OnceLock<String>,
    server_guid: String,
    unix_fd: bool,
    call_timeout: Option<Duration>,
    queue_limit: usize,
}

/// Handle to one bus connection. Clones share the connection.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("unique_name", &self.unique_name())
            .field("state", &self.state())
            .finish()
    }
}

/// Non-owning reference to a connection.
#[derive(Clone)]
pub(crate) struct WeakBus(Weak<BusInner>);

impl WeakBus {
    pub(crate) fn upgrade(&self) -> Option<MessageBus> {
        self.0.upgrade().map(|inner| MessageBus { inner })
    }

    pub(crate) fn is(&self, bus: &MessageBus) -> bool {
        Weak::ptr_eq(&self.0, &Arc::downgrade(&bus.inner))
    }
}

impl fmt::Debug for WeakBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakBus")
    }
}

/// Arms a reap request for a call future dropped before its reply arrived.
struct ReapOnDrop {
    commands: mpsc::WeakUnboundedSender<Command>,
    armed: bool,
}

impl Drop for ReapOnDrop {
    fn drop(&mut self) {
        if self.armed {
            if let Some(commands) = self.commands.upgrade() {
                let _ = commands.send(Command::Reap);
            }
        }
    }
}

pub(crate) fn remote_error(reply: &Message) -> DbusError {
    let text = reply
        .body()
        .first()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    DbusError::from(RemoteError {
        name: reply
            .error_name()
            .unwrap_or(constants::FAILED)
            .to_owned(),
        text,
        body: reply.body().to_vec(),
    })
}

/// Error reply for `call` built from a handler error.
pub(crate) fn error_reply(call: &Message, error: &DbusError) -> Result<Message> {
    Message::new_error(call, error.error_name(), &error.reply_text())
}

fn bus_call(member: &str) -> crate::core::message::MessageBuilder {
    Message::method_call(names::BUS_PATH, member)
        .destination(names::BUS_NAME)
        .interface(names::BUS_INTERFACE)
}

impl MessageBus {
    /// Connect to the bus named by `config`: the explicit address if set,
    /// otherwise the session or system bus address from the environment.
    #[instrument(skip_all, fields(bus_type = ?config.connection.bus_type))]
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        config.validate_strict()?;
        let address = match &config.connection.address {
            Some(address) => address.clone(),
            None => bus_address(config.connection.bus_type)?,
        };
        Self::open(&address, config).await
    }

    /// Connect to an explicit address with default settings.
    pub async fn connect_address(address: &str) -> Result<Self> {
        Self::open(address, &BusConfig::default()).await
    }

    async fn open(address: &str, config: &BusConfig) -> Result<Self> {
        debug!(state = ?ConnectionState::Connecting, address, "Opening bus connection");
        let (stream, entry) = BusStream::connect(address, config.connection.connect_timeout).await?;
        let guid = entry.guid().map(ToOwned::to_owned);
        Self::establish(stream, config, guid.as_deref()).await
    }

    /// Run auth and Hello over an already connected stream.
    pub async fn from_stream(stream: BusStream, config: &BusConfig) -> Result<Self> {
        Self::establish(stream, config, None).await
    }

    async fn establish(
        stream: BusStream,
        config: &BusConfig,
        expected_guid: Option<&str>,
    ) -> Result<Self> {
        debug!(state = ?ConnectionState::Authenticating, "Authenticating");
        let mut auth: AuthConfig = config.auth.clone();
        if auth.negotiate_unix_fd && !stream.supports_fd_passing() {
            debug!("Transport cannot pass fds; skipping NEGOTIATE_UNIX_FD");
            auth.negotiate_unix_fd = false;
        }
        let authenticator = Authenticator::from_config(&auth)?;
        let mut buf = BytesMut::with_capacity(4096);
        let outcome = authenticate(&stream, authenticator, &mut buf, auth.timeout).await?;
        if let Some(expected) = expected_guid {
            if expected != outcome.guid {
                let _ = stream.shutdown();
                return Err(DbusError::Auth(format!(
                    "server guid {} does not match address guid {expected}",
                    outcome.guid
                )));
            }
        }

        let bus = Self::start(stream, buf, outcome, &config.connection);
        debug!(state = ?ConnectionState::HelloPending, "Sending Hello");
        match with_timeout_error(bus.hello(), config.connection.hello_timeout).await {
            Ok(()) => Ok(bus),
            Err(e) => {
                bus.disconnect().await;
                Err(e)
            }
        }
    }

    async fn hello(&self) -> Result<()> {
        let reply = self.call_checked(bus_call("Hello").build()?).await?;
        let unique_name = reply
            .body()
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| DbusError::Client("Hello reply carries no unique name".into()))?
            .to_owned();
        let _ = self.inner.unique_name.set(unique_name.clone());
        self.inner.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::HelloPending {
                *state = ConnectionState::Ready;
                true
            } else {
                false
            }
        });
        info!(unique_name = %unique_name, guid = %self.inner.server_guid, "Connected to bus");
        Ok(())
    }

    fn start(
        stream: BusStream,
        leftover: BytesMut,
        outcome: AuthOutcome,
        config: &ConnectionConfig,
    ) -> Self {
        let stream = Arc::new(stream);
        let metrics = Arc::new(BusMetrics::new());
        let shared = Arc::new(Shared::new());
        let queued = Arc::new(AtomicUsize::new(0));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let codec = MessageCodec::new().with_max_message_size(config.max_message_size);
        let reader = tokio::spawn(read_loop(
            stream.clone(),
            leftover,
            codec,
            incoming_tx.clone(),
            metrics.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            stream.clone(),
            outgoing_rx,
            incoming_tx,
            metrics.clone(),
            queued.clone(),
        ));

        let inner = Arc::new(BusInner {
            commands: command_tx,
            shared: shared.clone(),
            metrics: metrics.clone(),
            queued: queued.clone(),
            unique_name: OnceLock::new(),
            server_guid: outcome.guid,
            unix_fd: outcome.unix_fd,
            call_timeout: config.call_timeout,
            queue_limit: config.command_queue_limit,
        });

        let engine = Engine {
            commands: command_rx,
            incoming: incoming_rx,
            outgoing: Some(outgoing_tx),
            reader: Some(reader),
            writer: Some(writer),
            stream,
            bus: WeakBus(Arc::downgrade(&inner)),
            shared,
            metrics,
            queued,
            serial: 0,
            unix_fd: outcome.unix_fd,
            max_message_size: config.max_message_size,
            pending: HashMap::new(),
            subscriptions: HashMap::new(),
            handler_tasks: FuturesUnordered::new(),
        };
        tokio::spawn(engine.run());

        MessageBus { inner }
    }

    pub(crate) fn downgrade(&self) -> WeakBus {
        WeakBus(Arc::downgrade(&self.inner))
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    /// Unique name assigned by the broker (`:N.M`), once `Hello` returned.
    pub fn unique_name(&self) -> Option<&str> {
        self.inner.unique_name.get().map(String::as_str)
    }

    pub fn server_guid(&self) -> &str {
        &self.inner.server_guid
    }

    /// Whether fds can be passed on this connection.
    pub fn unix_fd_enabled(&self) -> bool {
        self.inner.unix_fd
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() != ConnectionState::Disconnected
    }

    pub fn metrics(&self) -> &BusMetrics {
        &self.inner.metrics
    }

    pub fn name_owners(&self) -> &NameOwnerCache {
        &self.inner.shared.name_owners
    }

    /// Why the connection ended, once it has.
    pub fn disconnect_reason(&self) -> Option<String> {
        self.inner.shared.disconnect_info().map(|info| info.reason)
    }

    fn disconnected_error(&self) -> DbusError {
        DbusError::Disconnected(
            self.disconnect_reason()
                .unwrap_or_else(|| constants::ERR_ENGINE_GONE.to_owned()),
        )
    }

    fn submit(&self, command: Command) -> Result<()> {
        if !self.is_connected() {
            return Err(self.disconnected_error());
        }
        self.inner
            .commands
            .send(command)
            .map_err(|_| self.disconnected_error())
    }

    /// Queue a message without waiting for a reply.
    ///
    /// A serial is assigned if the message has none.
    pub fn send(&self, message: Message) -> Result<()> {
        if !message.unix_fds().is_empty() && !self.inner.unix_fd {
            return Err(DbusError::Client(
                "unix fd passing was not negotiated on this connection".into(),
            ));
        }
        let queued = self.inner.queued.load(Ordering::Relaxed);
        if queued >= self.inner.queue_limit {
            warn!(queued, limit = self.inner.queue_limit, "Outgoing queue above limit");
        }
        self.submit(Command::Send {
            message,
            reply: None,
        })
    }

    /// Send a call and wait for its reply, which may be an error reply.
    ///
    /// Dropping the returned future forgets the call; a late reply is then
    /// discarded. The configured call timeout applies.
    pub async fn call(&self, message: Message) -> Result<Message> {
        maybe_timeout(self.call_inner(message), self.inner.call_timeout).await
    }

    /// [`call`](Self::call) with an explicit deadline.
    pub async fn call_with_timeout(&self, message: Message, timeout: Duration) -> Result<Message> {
        with_timeout_error(self.call_inner(message), timeout).await
    }

    async fn call_inner(&self, message: Message) -> Result<Message> {
        if !message.expects_reply() {
            return Err(DbusError::Client(
                "call() needs a method call that expects a reply; use send()".into(),
            ));
        }
        if !message.unix_fds().is_empty() && !self.inner.unix_fd {
            return Err(DbusError::Client(
                "unix fd passing was not negotiated on this connection".into(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Send {
            message,
            reply: Some(tx),
        })?;
        let mut guard = ReapOnDrop {
            commands: self.inner.commands.downgrade(),
            armed: true,
        };
        let result = rx.await;
        guard.armed = false;
        match result {
            Ok(reply) => reply,
            Err(_) => Err(self.disconnected_error()),
        }
    }

    /// Like [`call`](Self::call), turning error replies into [`DbusError::Remote`].
    pub async fn call_checked(&self, message: Message) -> Result<Message> {
        let reply = self.call(message).await?;
        match reply.message_type() {
            MessageType::MethodReturn => Ok(reply),
            MessageType::Error => Err(remote_error(&reply)),
            other => Err(DbusError::Client(format!(
                "unexpected {other:?} in reply to a method call"
            ))),
        }
    }

    /// Install a handler that sees every incoming message before default dispatch.
    pub fn add_message_handler<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&Message) -> Result<HandlerOutcome> + Send + Sync + 'static,
    {
        let id = self.inner.shared.next_id();
        self.inner
            .shared
            .handlers
            .write()
            .map_err(|_| DbusError::Internal(constants::ERR_LOCK_POISONED.into()))?
            .push((id, Arc::new(handler)));
        Ok(id)
    }

    /// Returns whether a handler with this id was installed.
    pub fn remove_message_handler(&self, id: HandlerId) -> Result<bool> {
        let mut handlers = self
            .inner
            .shared
            .handlers
            .write()
            .map_err(|_| DbusError::Internal(constants::ERR_LOCK_POISONED.into()))?;
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        Ok(handlers.len() != before)
    }

    /// Deliver matching signals locally. Installs no broker match rule.
    pub fn subscribe_signals(&self, filter: SignalFilter) -> Result<SignalStream> {
        let id = self.inner.shared.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.submit(Command::Subscribe {
            id,
            subscription: Subscription { filter, tx },
        })?;
        Ok(SignalStream {
            id,
            rx: UnboundedReceiverStream::new(rx),
            commands: self.inner.commands.downgrade(),
        })
    }

    /// Add a broker match rule; only the first reference sends `AddMatch`.
    pub async fn add_match_rule(&self, rule: &str) -> Result<()> {
        let first = {
            let mut rules = self
                .inner
                .shared
                .match_rules
                .lock()
                .map_err(|_| DbusError::Internal(constants::ERR_LOCK_POISONED.into()))?;
            let count = rules.entry(rule.to_owned()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if !first {
            return Ok(());
        }
        let message = bus_call("AddMatch")
            .signature("s")
            .body(vec![Value::from(rule)])
            .build()?;
        if let Err(e) = self.call_checked(message).await {
            self.forget_match_rule(rule);
            return Err(e);
        }
        debug!(rule, "Match rule added");
        Ok(())
    }

    /// Drop one reference; the last one sends `RemoveMatch`.
    pub async fn remove_match_rule(&self, rule: &str) -> Result<()> {
        let last = {
            let mut rules = self
                .inner
                .shared
                .match_rules
                .lock()
                .map_err(|_| DbusError::Internal(constants::ERR_LOCK_POISONED.into()))?;
            match rules.get_mut(rule) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    rules.remove(rule);
                    true
                }
                None => return Ok(()),
            }
        };
        if !last || !self.is_connected() {
            return Ok(());
        }
        let message = bus_call("RemoveMatch")
            .signature("s")
            .body(vec![Value::from(rule)])
            .build()?;
        self.call_checked(message).await?;
        debug!(rule, "Match rule removed");
        Ok(())
    }

    fn forget_match_rule(&self, rule: &str) {
        let mut rules = self
            .inner
            .shared
            .match_rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = rules.get_mut(rule) {
            *count -= 1;
            if *count == 0 {
                rules.remove(rule);
            }
        }
    }

    /// References currently held on `rule`.
    pub fn match_rule_refs(&self, rule: &str) -> usize {
        self.inner
            .shared
            .match_rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rule)
            .copied()
            .unwrap_or(0)
    }

    pub async fn request_name(&self, name: &str, flags: NameFlags) -> Result<RequestNameReply> {
        crate::protocol::validators::assert_bus_name_valid(name)?;
        let reply = self
            .call_checked(
                bus_call("RequestName")
                    .signature("su")
                    .body(vec![Value::from(name), Value::UInt32(flags.bits())])
                    .build()?,
            )
            .await?;
        let code = reply
            .body()
            .first()
            .and_then(Value::as_u32)
            .ok_or_else(|| DbusError::Client("RequestName reply is not a uint32".into()))?;
        RequestNameReply::from_code(code)
    }

    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        crate::protocol::validators::assert_bus_name_valid(name)?;
        let reply = self
            .call_checked(
                bus_call("ReleaseName")
                    .signature("s")
                    .body(vec![Value::from(name)])
                    .build()?,
            )
            .await?;
        let code = reply
            .body()
            .first()
            .and_then(Value::as_u32)
            .ok_or_else(|| DbusError::Client("ReleaseName reply is not a uint32".into()))?;
        ReleaseNameReply::from_code(code)
    }

    /// Fetch and parse the introspection data of a remote object.
    pub async fn introspect(&self, bus_name: &str, path: &str) -> Result<Node> {
        let reply = self
            .call_checked(
                Message::method_call(path, "Introspect")
                    .destination(bus_name)
                    .interface(names::INTROSPECTABLE)
                    .build()?,
            )
            .await?;
        let xml = reply
            .body()
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| DbusError::Client("Introspect reply is not a string".into()))?;
        Node::parse(xml)
    }

    /// Proxy for a remote object described by `node`.
    pub async fn get_proxy_object(&self, bus_name: &str, path: &str, node: Node) -> Result<ProxyObject> {
        ProxyObject::new(self.clone(), bus_name, path, node).await
    }

    /// Tear the connection down. Safe to call more than once.
    pub async fn disconnect(&self) {
        let _ = self.inner.commands.send(Command::Disconnect);
        let _ = self.wait_for_state(ConnectionState::Disconnected).await;
    }

    /// Resolve when the connection ends: `Ok` after a local disconnect,
    /// the failure otherwise.
    pub async fn wait_for_disconnect(&self) -> Result<()> {
        self.wait_for_state(ConnectionState::Disconnected).await;
        match self.inner.shared.disconnect_info() {
            Some(info) if info.failed => Err(DbusError::Disconnected(info.reason)),
            _ => Ok(()),
        }
    }

    async fn wait_for_state(&self, wanted: ConnectionState) {
        let mut rx = self.inner.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state == wanted).await;
    }
}

struct PendingCall {
    reply: oneshot::Sender<Result<Message>>,
    destination: Option<String>,
}

struct Outgoing {
    bytes: BytesMut,
    fds: Vec<Arc<OwnedFd>>,
}

enum Shutdown {
    Local(&'static str),
    Failed(DbusError),
}

struct Engine {
    commands: mpsc::UnboundedReceiver<Command>,
    incoming: mpsc::UnboundedReceiver<Result<Message>>,
    outgoing: Option<mpsc::UnboundedSender<Outgoing>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    stream: Arc<BusStream>,
    bus: WeakBus,
    shared: Arc<Shared>,
    metrics: Arc<BusMetrics>,
    queued: Arc<AtomicUsize>,
    serial: u32,
    unix_fd: bool,
    max_message_size: usize,
    pending: HashMap<u32, PendingCall>,
    subscriptions: HashMap<u64, Subscription>,
    handler_tasks: FuturesUnordered<BoxFuture<'static, Option<Message>>>,
}

impl Engine {
    async fn run(mut self) {
        let shutdown = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(shutdown) = self.handle_command(command) {
                            break shutdown;
                        }
                    }
                    None => break Shutdown::Local("all connection handles dropped"),
                },
                incoming = self.incoming.recv() => match incoming {
                    Some(Ok(message)) => self.handle_incoming(message),
                    Some(Err(e)) => break Shutdown::Failed(e),
                    None => break Shutdown::Failed(DbusError::Disconnected(
                        "connection tasks stopped".into(),
                    )),
                },
                Some(reply) = self.handler_tasks.next(), if !self.handler_tasks.is_empty() => {
                    // sends issued by the handler go out before its reply
                    if let Some(shutdown) = self.drain_commands() {
                        break shutdown;
                    }
                    if let Some(reply) = reply {
                        self.queue(reply, None);
                    }
                }
            }
        };
        self.finalize(shutdown).await;
    }

    fn drain_commands(&mut self) -> Option<Shutdown> {
        while let Ok(command) = self.commands.try_recv() {
            if let Some(shutdown) = self.handle_command(command) {
                return Some(shutdown);
            }
        }
        None
    }

    fn handle_command(&mut self, command: Command) -> Option<Shutdown> {
        match command {
            Command::Send { message, reply } => self.queue(message, reply),
            Command::Reap => {
                self.pending.retain(|_, call| !call.reply.is_closed());
                self.metrics.set_pending(self.pending.len());
            }
            Command::Subscribe { id, subscription } => {
                self.subscriptions.insert(id, subscription);
            }
            Command::Unsubscribe { id } => {
                self.subscriptions.remove(&id);
            }
            Command::Disconnect => return Some(Shutdown::Local("disconnect requested")),
        }
        None
    }

    fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        if self.serial == 0 {
            self.serial = 1;
        }
        self.serial
    }

    /// Frame `message` and hand it to the writer. A pending entry exists
    /// before the bytes can reach the socket.
    fn queue(&mut self, mut message: Message, reply: Option<oneshot::Sender<Result<Message>>>) {
        if message.serial() == 0 {
            let serial = self.next_serial();
            message.set_serial(serial);
        }
        let serial = message.serial();

        let encoded = if !message.unix_fds().is_empty() && !self.unix_fd {
            Err(DbusError::Client(
                "unix fd passing was not negotiated on this connection".into(),
            ))
        } else {
            message.to_bytes(Endian::Little).and_then(|bytes| {
                if bytes.len() > self.max_message_size {
                    Err(DbusError::InvalidMessage(format!(
                        "message of {} bytes exceeds the {} byte limit",
                        bytes.len(),
                        self.max_message_size
                    )))
                } else {
                    Ok(bytes)
                }
            })
        };
        let bytes = match encoded {
            Ok(bytes) => bytes,
            Err(e) => {
                match reply {
                    Some(reply) => {
                        let _ = reply.send(Err(e));
                    }
                    None => warn!(serial, error = %e, "Dropping message that failed to encode"),
                }
                return;
            }
        };

        if let Some(reply) = reply {
            self.pending.insert(
                serial,
                PendingCall {
                    reply,
                    destination: message.destination().map(ToOwned::to_owned),
                },
            );
            self.metrics.call_started();
            self.metrics.set_pending(self.pending.len());
        }

        trace!(serial, message = %message, "Queueing message");
        let fds = message.take_fds();
        if let Some(outgoing) = &self.outgoing {
            self.queued.fetch_add(1, Ordering::Relaxed);
            if outgoing.send(Outgoing { bytes, fds }).is_err() {
                self.queued.fetch_sub(1, Ordering::Relaxed);
                debug!(serial, "Writer gone; message dropped");
            }
        }
    }

    fn handle_incoming(&mut self, message: Message) {
        trace!(message = %message, "Received message");
        if self.run_user_handlers(&message) {
            return;
        }
        match message.message_type() {
            MessageType::MethodReturn | MessageType::Error => self.resolve_reply(message),
            MessageType::Signal => self.dispatch_signal(message),
            MessageType::MethodCall => self.dispatch_call(message),
        }
    }

    /// Returns true when a handler consumed the message.
    fn run_user_handlers(&mut self, message: &Message) -> bool {
        let handlers: Vec<Arc<MessageHandlerFn>> = match self.shared.handlers.read() {
            Ok(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            Err(_) => {
                error!("{}", constants::ERR_LOCK_POISONED);
                return false;
            }
        };

        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(message)))
                .unwrap_or_else(|_| Err(DbusError::Internal("message handler panicked".into())));
            match outcome {
                Ok(HandlerOutcome::Continue) => continue,
                Ok(HandlerOutcome::Handled) => return true,
                Ok(HandlerOutcome::Reply(reply)) => {
                    self.queue(reply, None);
                    return true;
                }
                Err(e) => {
                    warn!(error = %e, message = %message, "Message handler failed");
                    if message.expects_reply() {
                        match error_reply(message, &e) {
                            Ok(reply) => self.queue(reply, None),
                            Err(e) => warn!(error = %e, "Could not build error reply"),
                        }
                    }
                    return true;
                }
            }
        }
        false
    }

    fn resolve_reply(&mut self, message: Message) {
        let Some(reply_serial) = message.reply_serial() else {
            debug!("Reply without a reply serial ignored");
            return;
        };
        let Some(pending) = self.pending.remove(&reply_serial) else {
            debug!(reply_serial, "Discarding reply to unknown serial");
            self.metrics.reply_discarded();
            return;
        };

        self.metrics.reply_matched();
        if message.message_type() == MessageType::Error {
            self.metrics.error_received();
        }
        if let (Some(destination), Some(sender)) = (pending.destination.as_deref(), message.sender()) {
            if !destination.starts_with(':') && destination != names::BUS_NAME {
                self.shared.name_owners.set(destination, sender);
            }
        }
        let _ = pending.reply.send(Ok(message));
        self.metrics.set_pending(self.pending.len());
    }

    fn dispatch_signal(&mut self, message: Message) {
        if is_name_owner_changed(&message) {
            self.shared.name_owners.apply_owner_changed(&message);
        }
        let cache = &self.shared.name_owners;
        self.subscriptions.retain(|_, subscription| {
            if subscription.filter.matches(&message, cache) {
                subscription.tx.send(message.clone()).is_ok()
            } else {
                !subscription.tx.is_closed()
            }
        });
        self.metrics.signal_dispatched();
    }

    fn dispatch_call(&mut self, message: Message) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        self.metrics.call_dispatched();
        self.handler_tasks.push(export::dispatch(&bus, message));
    }

    async fn finalize(&mut self, shutdown: Shutdown) {
        let (reason, failed) = match &shutdown {
            Shutdown::Local(reason) => ((*reason).to_owned(), false),
            Shutdown::Failed(e) => (e.to_string(), true),
        };
        if !self.shared.record_disconnect(&reason, failed) {
            return;
        }
        if failed {
            self.metrics.connection_error();
            error!(reason = %reason, pending = self.pending.len(), "Bus connection failed");
        } else {
            info!(reason = %reason, "Bus connection closed");
        }

        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(DbusError::Disconnected(reason.clone())));
        }
        self.metrics.set_pending(0);
        self.subscriptions.clear();
        self.handler_tasks = FuturesUnordered::new();

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Send {
                reply: Some(reply), ..
            } = command
            {
                let _ = reply.send(Err(DbusError::Disconnected(reason.clone())));
            }
        }

        let exports = self.shared.take_exports();
        for (path, interfaces) in exports {
            for interface in interfaces {
                interface.detach(&path);
            }
        }
        self.shared.clear_handlers();
        self.shared
            .match_rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        // let the writer flush what is already queued
        drop(self.outgoing.take());
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, writer).await.is_err() {
                debug!("Writer did not finish within the shutdown timeout");
            }
        }
        if let Err(e) = self.stream.shutdown() {
            debug!(error = %e, "Socket shutdown failed");
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // pending table is empty by now
        self.shared.publish_disconnected();
        self.metrics.log_metrics();
    }
}

async fn read_loop(
    stream: Arc<BusStream>,
    mut buf: BytesMut,
    mut codec: MessageCodec,
    incoming: mpsc::UnboundedSender<Result<Message>>,
    metrics: Arc<BusMetrics>,
) {
    let mut fds = Vec::new();
    loop {
        loop {
            let before = buf.len();
            match codec.decode(&mut buf) {
                Ok(Some(message)) => {
                    metrics.message_received((before - buf.len()) as u64);
                    if incoming.send(Ok(message)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = incoming.send(Err(e));
                    return;
                }
            }
        }

        match stream.read_with_fds(&mut buf, &mut fds).await {
            Ok(0) => {
                let _ = incoming.send(Err(DbusError::Disconnected(
                    "connection closed by peer".into(),
                )));
                return;
            }
            Ok(_) => codec.push_fds(fds.drain(..)),
            Err(e) => {
                let _ = incoming.send(Err(DbusError::Io(e)));
                return;
            }
        }
    }
}

async fn write_loop(
    stream: Arc<BusStream>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    errors: mpsc::UnboundedSender<Result<Message>>,
    metrics: Arc<BusMetrics>,
    queued: Arc<AtomicUsize>,
) {
    while let Some(frame) = outgoing.recv().await {
        queued.fetch_sub(1, Ordering::Relaxed);
        let raw: Vec<RawFd> = frame.fds.iter().map(|fd| fd.as_raw_fd()).collect();
        if let Err(e) = stream.write_with_fds(&frame.bytes, &raw).await {
            let _ = errors.send(Err(DbusError::Io(e)));
            return;
        }
        metrics.message_sent(frame.bytes.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn signal(sender: &str, path: &str, member: &str) -> Message {
        Message::signal(path, "org.example.Iface", member)
            .sender(sender)
            .build()
            .unwrap()
    }

    #[test]
    fn test_signal_filter_fields() {
        let cache = NameOwnerCache::new();
        let filter = SignalFilter::new()
            .interface("org.example.Iface")
            .member("Changed");
        assert!(filter.matches(&signal(":1.1", "/a", "Changed"), &cache));
        assert!(!filter.matches(&signal(":1.1", "/a", "Other"), &cache));
        assert!(SignalFilter::new().path("/a").matches(&signal(":1.1", "/a", "X"), &cache));
        assert!(!SignalFilter::new().path("/b").matches(&signal(":1.1", "/a", "X"), &cache));
    }

    #[test]
    fn test_signal_filter_sender_resolves_through_cache() {
        let cache = NameOwnerCache::new();
        let filter = SignalFilter::new().sender("org.example.Svc");
        let message = signal(":1.5", "/a", "Changed");
        assert!(!filter.matches(&message, &cache));
        cache.set("org.example.Svc", ":1.5");
        assert!(filter.matches(&message, &cache));
    }

    #[test]
    fn test_name_reply_codes() {
        assert_eq!(
            RequestNameReply::from_code(1).unwrap(),
            RequestNameReply::PrimaryOwner
        );
        assert_eq!(
            RequestNameReply::from_code(4).unwrap(),
            RequestNameReply::AlreadyOwner
        );
        assert!(RequestNameReply::from_code(9).is_err());
        assert_eq!(
            ReleaseNameReply::from_code(3).unwrap(),
            ReleaseNameReply::NotOwner
        );
        let flags = NameFlags::DO_NOT_QUEUE | NameFlags::REPLACE_EXISTING;
        assert_eq!(flags.bits(), 6);
        assert!(flags.contains(NameFlags::DO_NOT_QUEUE));
    }

    #[test]
    fn test_disconnect_is_recorded_once_and_published_later() {
        let shared = Shared::new();
        assert!(shared.record_disconnect("closed", false));
        assert!(!shared.record_disconnect("again", true));
        assert_eq!(*shared.state.borrow(), ConnectionState::HelloPending);

        shared.publish_disconnected();
        assert_eq!(*shared.state.borrow(), ConnectionState::Disconnected);
        let info = shared.disconnect_info().unwrap();
        assert_eq!(info.reason, "closed");
        assert!(!info.failed);
    }

    #[test]
    fn test_poisoned_export_table_still_drains() {
        let shared = Shared::new();
        let iface = Arc::new(
            ServiceInterface::builder("org.example.A")
                .method("Ping", "", "", |_c| async { Ok(()) })
                .build()
                .unwrap(),
        );
        shared.exports.write().unwrap().insert("/p", iface);

        let poison = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = shared.exports.write().unwrap();
            panic!("handler panicked while holding the table");
        }));
        assert!(poison.is_err());
        assert!(shared.exports.is_poisoned());

        let drained = shared.take_exports();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, "/p");
        assert!(shared.take_exports().is_empty());
    }

    #[test]
    fn test_remote_error_from_reply() {
        let call = Message::method_call("/a", "M")
            .sender(":1.2")
            .serial(7)
            .build()
            .unwrap();
        let reply = Message::new_error(&call, constants::UNKNOWN_METHOD, "nope").unwrap();
        let err = remote_error(&reply);
        let remote = err.as_remote().unwrap();
        assert_eq!(remote.name, constants::UNKNOWN_METHOD);
        assert_eq!(remote.text, "nope");
        assert_eq!(reply.reply_serial(), Some(7));
        assert_eq!(reply.destination(), Some(":1.2"));
    }
}
