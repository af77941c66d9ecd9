//! In-process bus daemon for integration tests.
//!
//! Speaks the client side of the SASL exchange in reverse, hands out
//! `:1.N` unique names, answers the daemon methods the engine relies on and
//! routes everything else by destination. Every message received is
//! recorded in [`MockBroker::trace`].

#![allow(dead_code, clippy::unwrap_used)]

use bytes::BytesMut;
use dbus_wire::core::codec::MessageCodec;
use dbus_wire::core::message::{Message, MessageType};
use dbus_wire::core::value::Value;
use dbus_wire::protocol::names;
use dbus_wire::{BusConfig, DbusError, MessageBus};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed, FramedParts, FramedWrite};

pub const GUID: &str = "0123456789abcdef0123456789abcdef";
pub const MACHINE_ID: &str = "fedcba9876543210fedcba9876543210";

#[derive(Default)]
struct State {
    next_client: u32,
    clients: HashMap<String, mpsc::UnboundedSender<Message>>,
    names: HashMap<String, String>,
    match_rules: Vec<(String, String)>,
    /// Calls addressed to these destinations are dropped unanswered.
    swallow: Vec<String>,
}

#[derive(Clone)]
struct Broker {
    state: Arc<Mutex<State>>,
    trace: Arc<Mutex<Vec<Message>>>,
    headers: Arc<Mutex<Vec<(u8, u8)>>>,
    serial: Arc<AtomicU32>,
}

/// Records the endian marker and protocol version of every decoded frame.
struct RecordingCodec {
    inner: MessageCodec,
    headers: Arc<Mutex<Vec<(u8, u8)>>>,
}

impl Decoder for RecordingCodec {
    type Item = Message;
    type Error = DbusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, DbusError> {
        let header = (src.len() >= 4).then(|| (src[0], src[3]));
        let decoded = self.inner.decode(src)?;
        if let (Some(_), Some(header)) = (&decoded, header) {
            self.headers.lock().unwrap().push(header);
        }
        Ok(decoded)
    }
}

impl Encoder<Message> for RecordingCodec {
    type Error = DbusError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), DbusError> {
        self.inner.encode(message, dst)
    }
}

pub struct MockBroker {
    address: String,
    broker: Broker,
    task: JoinHandle<()>,
    _dir: TempDir,
}

impl MockBroker {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("bus");
        let listener = UnixListener::bind(&path).unwrap();
        let broker = Broker {
            state: Arc::new(Mutex::new(State::default())),
            trace: Arc::new(Mutex::new(Vec::new())),
            headers: Arc::new(Mutex::new(Vec::new())),
            serial: Arc::new(AtomicU32::new(1)),
        };
        let accept = broker.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let broker = accept.clone();
                tokio::spawn(async move { broker.serve(stream).await });
            }
        });
        Self {
            address: format!("unix:path={},guid={GUID}", path.display()),
            broker,
            task,
            _dir: dir,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> BusConfig {
        let mut config = BusConfig::default();
        config.connection.address = Some(self.address.clone());
        config.connection.call_timeout = Some(Duration::from_secs(5));
        config
    }

    pub async fn connect(&self) -> MessageBus {
        MessageBus::connect(&self.config()).await.unwrap()
    }

    /// Every message the broker has received, in arrival order.
    pub fn trace(&self) -> Vec<Message> {
        self.broker.trace.lock().unwrap().clone()
    }

    pub fn clear_trace(&self) {
        self.broker.trace.lock().unwrap().clear();
        self.broker.headers.lock().unwrap().clear();
    }

    /// `(endian marker, protocol version)` of every frame received.
    pub fn wire_headers(&self) -> Vec<(u8, u8)> {
        self.broker.headers.lock().unwrap().clone()
    }

    /// Messages from the trace that are not addressed to the daemon.
    pub fn peer_traffic(&self) -> Vec<Message> {
        self.trace()
            .into_iter()
            .filter(|m| m.destination() != Some(names::BUS_NAME))
            .collect()
    }

    pub fn match_rules(&self, client: &str) -> Vec<String> {
        self.broker
            .state
            .lock()
            .unwrap()
            .match_rules
            .iter()
            .filter(|(owner, _)| owner == client)
            .map(|(_, rule)| rule.clone())
            .collect()
    }

    /// Stop answering calls sent to `destination`.
    pub fn swallow_calls_to(&self, destination: &str) {
        self.broker
            .state
            .lock()
            .unwrap()
            .swallow
            .push(destination.to_owned());
    }

    /// Inject `message` to `client` as if it came from the bus.
    pub fn inject(&self, client: &str, mut message: Message) {
        if message.serial() == 0 {
            message.set_serial(self.broker.next_serial());
        }
        let state = self.broker.state.lock().unwrap();
        if let Some(tx) = state.clients.get(client) {
            let _ = tx.send(message);
        }
    }

    /// Drop every client connection.
    pub fn kick_all(&self) {
        self.broker.state.lock().unwrap().clients.clear();
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Broker {
    fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }

    async fn serve(self, mut stream: UnixStream) {
        let Some(leftover) = sasl(&mut stream).await else {
            return;
        };

        let unique = {
            let mut state = self.state.lock().unwrap();
            state.next_client += 1;
            format!(":1.{}", state.next_client)
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.state.lock().unwrap().clients.insert(unique.clone(), tx);

        let (read, write) = stream.into_split();
        let codec = RecordingCodec {
            inner: MessageCodec::new(),
            headers: self.headers.clone(),
        };
        // bytes after BEGIN (usually the Hello) must be decoded before the
        // socket is polled again
        let mut parts = FramedParts::new::<Message>(read, codec);
        parts.read_buf = leftover;
        let mut reader = Framed::from_parts(parts);
        let mut writer = FramedWrite::new(write, MessageCodec::new());

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if writer.send(message).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(mut message)) = reader.next().await {
            message.set_sender(unique.clone());
            self.trace.lock().unwrap().push(message.clone());
            if message.destination() == Some(names::BUS_NAME) {
                self.daemon_call(&unique, &message);
            } else {
                self.route(&unique, message);
            }
        }

        writer_task.abort();
        self.disconnect(&unique);
    }

    fn disconnect(&self, unique: &str) {
        let released: Vec<String> = {
            let mut state = self.state.lock().unwrap();
            state.clients.remove(unique);
            state.match_rules.retain(|(owner, _)| owner != unique);
            let owned: Vec<String> = state
                .names
                .iter()
                .filter(|(_, owner)| owner.as_str() == unique)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &owned {
                state.names.remove(name);
            }
            owned
        };
        for name in released {
            self.owner_changed(&name, unique, "");
        }
    }

    fn send_to(&self, client: &str, mut message: Message) {
        if message.serial() == 0 {
            message.set_serial(self.next_serial());
        }
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.clients.get(client) {
            let _ = tx.send(message);
        }
    }

    fn broadcast(&self, except: Option<&str>, message: Message) {
        let targets: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .clients
            .keys()
            .filter(|name| Some(name.as_str()) != except)
            .cloned()
            .collect();
        for target in targets {
            self.send_to(&target, message.clone());
        }
    }

    fn owner_changed(&self, name: &str, old: &str, new: &str) {
        let mut signal = Message::signal(
            names::BUS_PATH,
            names::BUS_INTERFACE,
            names::NAME_OWNER_CHANGED,
        )
        .sender(names::BUS_NAME)
        .signature("sss")
        .body(vec![Value::from(name), Value::from(old), Value::from(new)])
        .build()
        .unwrap();
        signal.set_serial(self.next_serial());
        self.broadcast(None, signal);
    }

    fn resolve(&self, destination: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        if state.clients.contains_key(destination) {
            return Some(destination.to_owned());
        }
        state.names.get(destination).cloned()
    }

    fn route(&self, origin: &str, message: Message) {
        match message.destination().map(str::to_owned) {
            None => self.broadcast(Some(origin), message),
            Some(destination) => {
                if message.message_type() == MessageType::MethodCall
                    && self.state.lock().unwrap().swallow.contains(&destination)
                {
                    return;
                }
                match self.resolve(&destination) {
                    Some(target) => self.send_to(&target, message),
                    None if message.expects_reply() => {
                        let error = Message::new_error(
                            &message,
                            "org.freedesktop.DBus.Error.ServiceUnknown",
                            &format!("The name {destination} was not provided"),
                        )
                        .unwrap();
                        self.reply(origin, error);
                    }
                    None => {}
                }
            }
        }
    }

    fn reply(&self, client: &str, mut message: Message) {
        message.set_sender(names::BUS_NAME);
        self.send_to(client, message);
    }

    fn daemon_call(&self, unique: &str, call: &Message) {
        let body = call.body();
        let arg = |i: usize| body.get(i).and_then(Value::as_str).unwrap_or_default().to_owned();
        let ret = |signature: &str, body: Vec<Value>| {
            Message::new_method_return(call, signature, body).unwrap()
        };
        let reply = match (call.interface(), call.member().unwrap_or_default()) {
            (_, "Hello") => ret("s", vec![Value::from(unique)]),
            (Some(names::PEER), "GetMachineId") => ret("s", vec![Value::from(MACHINE_ID)]),
            (_, "AddMatch") => {
                self.state
                    .lock()
                    .unwrap()
                    .match_rules
                    .push((unique.to_owned(), arg(0)));
                ret("", vec![])
            }
            (_, "RemoveMatch") => {
                let rule = arg(0);
                let mut state = self.state.lock().unwrap();
                match state
                    .match_rules
                    .iter()
                    .position(|(owner, r)| owner == unique && *r == rule)
                {
                    Some(index) => {
                        state.match_rules.remove(index);
                        drop(state);
                        ret("", vec![])
                    }
                    None => {
                        drop(state);
                        Message::new_error(
                            call,
                            "org.freedesktop.DBus.Error.MatchRuleNotFound",
                            "The given match rule wasn't found",
                        )
                        .unwrap()
                    }
                }
            }
            (_, "GetNameOwner") => {
                let name = arg(0);
                match self.resolve(&name) {
                    Some(owner) => ret("s", vec![Value::from(owner)]),
                    None => Message::new_error(
                        call,
                        "org.freedesktop.DBus.Error.NameHasNoOwner",
                        &format!("Could not get owner of name '{name}'"),
                    )
                    .unwrap(),
                }
            }
            (_, "RequestName") => {
                let name = arg(0);
                let current = self.state.lock().unwrap().names.get(&name).cloned();
                let code = match current.as_deref() {
                    None => {
                        self.state
                            .lock()
                            .unwrap()
                            .names
                            .insert(name.clone(), unique.to_owned());
                        self.owner_changed(&name, "", unique);
                        1
                    }
                    Some(owner) if owner == unique => 4,
                    Some(_) => 3,
                };
                ret("u", vec![Value::UInt32(code)])
            }
            (_, "ReleaseName") => {
                let name = arg(0);
                let current = self.state.lock().unwrap().names.get(&name).cloned();
                let code = match current.as_deref() {
                    None => 2,
                    Some(owner) if owner == unique => {
                        self.state.lock().unwrap().names.remove(&name);
                        self.owner_changed(&name, unique, "");
                        1
                    }
                    Some(_) => 3,
                };
                ret("u", vec![Value::UInt32(code)])
            }
            (_, member) => Message::new_error(
                call,
                "org.freedesktop.DBus.Error.UnknownMethod",
                &format!("Unknown method {member}"),
            )
            .unwrap(),
        };
        if call.expects_reply() {
            self.reply(unique, reply);
        }
    }
}

/// Server side of the SASL exchange; returns bytes read past `BEGIN`.
async fn sasl(stream: &mut UnixStream) -> Option<BytesMut> {
    let mut buf = BytesMut::with_capacity(256);
    let mut first = true;
    loop {
        while let Some(end) = buf.windows(2).position(|w| w == b"\r\n") {
            let raw = buf.split_to(end + 2);
            let mut line = &raw[..end];
            if first {
                if line.first() != Some(&0) {
                    return None;
                }
                line = &line[1..];
                first = false;
            }
            let line = std::str::from_utf8(line).ok()?;
            let response = if line.starts_with("AUTH EXTERNAL ") || line == "AUTH ANONYMOUS" {
                format!("OK {GUID}\r\n")
            } else if line == "AUTH EXTERNAL" {
                "DATA\r\n".to_owned()
            } else if line == "DATA" {
                format!("OK {GUID}\r\n")
            } else if line == "NEGOTIATE_UNIX_FD" {
                "AGREE_UNIX_FD\r\n".to_owned()
            } else if line == "BEGIN" {
                return Some(buf);
            } else if line.starts_with("AUTH") {
                "REJECTED EXTERNAL ANONYMOUS\r\n".to_owned()
            } else {
                "ERROR\r\n".to_owned()
            };
            stream.write_all(response.as_bytes()).await.ok()?;
        }
        if stream.read_buf(&mut buf).await.ok()? == 0 {
            return None;
        }
    }
}

/// Poll `cond` until it holds or a second passes.
pub async fn eventually<F: FnMut() -> bool>(mut cond: F) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
