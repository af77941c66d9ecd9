//! # Proxies
//!
//! Client-side accessors for a remote object, built from its introspection
//! data.
//!
//! ## Components
//! - [`ProxyObject`]: one `(bus name, path)` plus the parsed [`Node`]
//! - [`ProxyInterface`]: calls, properties and signal subscriptions of one
//!   interface of that object
//! - [`ProxySignalStream`]: signals of one member; holds a reference on the
//!   broker match rule until dropped
//!
//! Arguments are coerced to the declared input signature before sending.
//! Replies must carry exactly the declared output signature.
//!
//! ## Example
//! ```rust,no_run
//! use dbus_wire::core::value::Value;
//! use dbus_wire::service::bus::MessageBus;
//! use dbus_wire::service::proxy::ProxyObject;
//!
//! # async fn demo() -> dbus_wire::Result<()> {
//! let bus = MessageBus::connect_address("unix:path=/run/user/1000/bus").await?;
//! let object = ProxyObject::introspect_from(&bus, "org.example.Echo", "/t").await?;
//! let echo = object.get_interface("org.example.Echo")?;
//! let reply = echo.call("Echo", vec![Value::from("hello")]).await?;
//! assert_eq!(reply, vec![Value::from("hello")]);
//! # Ok(())
//! # }
//! ```

use crate::core::message::{Message, MessageFlags, MessageType};
use crate::core::signature::{signature_tree, SignatureType};
use crate::core::value::{Value, Variant};
use crate::error::{constants, DbusError, Result};
use crate::protocol::introspection::{self, Node};
use crate::protocol::names;
use crate::protocol::validators::{assert_bus_name_valid, assert_object_path_valid};
use crate::service::bus::{remote_error, MessageBus, SignalFilter, SignalStream};
use futures::stream::Stream;
use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, instrument, warn};

/// A remote object: bus name, path and introspection data.
#[derive(Debug, Clone)]
pub struct ProxyObject {
    bus: MessageBus,
    bus_name: String,
    path: String,
    node: Arc<Node>,
}

impl ProxyObject {
    /// Build a proxy from known introspection data.
    ///
    /// The first proxy on a connection installs the name-owner match rule.
    /// For a well-known name the current owner is looked up once.
    #[instrument(skip(bus, node), level = "debug")]
    pub async fn new(bus: MessageBus, bus_name: &str, path: &str, node: Node) -> Result<Self> {
        assert_bus_name_valid(bus_name)?;
        assert_object_path_valid(path)?;

        if let Err(e) = bus.ensure_name_owner_tracking().await {
            warn!(error = %e, "Could not subscribe to NameOwnerChanged");
        }
        if !bus_name.starts_with(':') && bus_name != names::BUS_NAME {
            bus.seed_name_owner(bus_name).await?;
        }

        Ok(Self {
            bus,
            bus_name: bus_name.to_owned(),
            path: path.to_owned(),
            node: Arc::new(node),
        })
    }

    /// Fetch the remote introspection data, then build the proxy.
    pub async fn introspect_from(bus: &MessageBus, bus_name: &str, path: &str) -> Result<Self> {
        let node = bus.introspect(bus_name, path).await?;
        Self::new(bus.clone(), bus_name, path, node).await
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn get_interface(&self, name: &str) -> Result<ProxyInterface> {
        let introspection = self.node.interface(name).cloned().ok_or_else(|| {
            DbusError::InterfaceNotFound(format!(
                "'{name}' is not declared by {} at {}",
                self.bus_name, self.path
            ))
        })?;
        Ok(ProxyInterface {
            bus: self.bus.clone(),
            bus_name: self.bus_name.clone(),
            path: self.path.clone(),
            introspection: Arc::new(introspection),
        })
    }

    /// Object paths of the child nodes.
    pub fn child_paths(&self) -> Vec<String> {
        self.node
            .nodes
            .iter()
            .filter_map(|child| child.name.as_deref())
            .map(|name| {
                if self.path == "/" {
                    format!("/{name}")
                } else {
                    format!("{}/{name}", self.path)
                }
            })
            .collect()
    }
}

/// One interface of a [`ProxyObject`].
#[derive(Debug, Clone)]
pub struct ProxyInterface {
    bus: MessageBus,
    bus_name: String,
    path: String,
    introspection: Arc<introspection::Interface>,
}

fn client_error(message: String) -> DbusError {
    DbusError::Client(message)
}

/// Accept only a method return with exactly `expected` as its signature.
fn check_reply(reply: Message, expected: &str) -> Result<Message> {
    match reply.message_type() {
        MessageType::MethodReturn => {}
        MessageType::Error => return Err(remote_error(&reply)),
        other => {
            return Err(client_error(format!(
                "expected a method return, got {other:?}"
            )))
        }
    }
    if reply.signature() != expected {
        return Err(client_error(format!(
            "reply signature '{}' does not match the expected '{expected}'",
            reply.signature()
        )));
    }
    Ok(reply)
}

impl ProxyInterface {
    pub fn name(&self) -> &str {
        &self.introspection.name
    }

    pub fn introspection(&self) -> &introspection::Interface {
        &self.introspection
    }

    fn method(&self, member: &str) -> Result<&introspection::Method> {
        self.introspection.method(member).ok_or_else(|| {
            client_error(format!("interface '{}' has no method '{member}'", self.name()))
        })
    }

    fn property(&self, name: &str) -> Result<&introspection::Property> {
        self.introspection.property(name).ok_or_else(|| {
            client_error(format!("interface '{}' has no property '{name}'", self.name()))
        })
    }

    fn build_call(
        &self,
        member: &str,
        args: Vec<Value>,
        unix_fds: Vec<Arc<OwnedFd>>,
        flags: MessageFlags,
    ) -> Result<Message> {
        let signature = self.method(member)?.in_signature();
        let body = signature_tree(&signature)?.coerce(args)?;
        Message::method_call(&self.path, member)
            .destination(&self.bus_name)
            .interface(self.name())
            .flags(flags)
            .signature(signature)
            .body(body)
            .unix_fds(unix_fds)
            .build()
    }

    /// Call `member` and return the reply body.
    pub async fn call(&self, member: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        Ok(self.call_with_fds(member, args, Vec::new()).await?.into_body())
    }

    /// Call `member` passing fds, returning the whole reply so that any
    /// returned fds can be resolved with [`Message::unix_fd`].
    pub async fn call_with_fds(
        &self,
        member: &str,
        args: Vec<Value>,
        unix_fds: Vec<Arc<OwnedFd>>,
    ) -> Result<Message> {
        let expected = self.method(member)?.out_signature();
        let message = self.build_call(member, args, unix_fds, MessageFlags::NONE)?;
        let reply = self.bus.call(message).await?;
        check_reply(reply, &expected)
    }

    /// Send `member` with `NO_REPLY_EXPECTED`.
    pub fn call_no_reply(&self, member: &str, args: Vec<Value>) -> Result<()> {
        let message =
            self.build_call(member, args, Vec::new(), MessageFlags::NO_REPLY_EXPECTED)?;
        self.bus.send(message)
    }

    fn properties_call(&self, member: &str, signature: &str, body: Vec<Value>) -> Result<Message> {
        Message::method_call(&self.path, member)
            .destination(&self.bus_name)
            .interface(names::PROPERTIES)
            .signature(signature)
            .body(body)
            .build()
    }

    /// `Properties.Get`; the variant must carry the declared type.
    pub async fn get_property(&self, name: &str) -> Result<Value> {
        let expected = self.property(name)?.signature.clone();
        let request = self.properties_call(
            "Get",
            "ss",
            vec![Value::from(self.name()), Value::from(name)],
        )?;
        let reply = check_reply(self.bus.call(request).await?, "v")?;
        let variant = reply
            .into_body()
            .into_iter()
            .next()
            .and_then(|value| match value {
                Value::Variant(variant) => Some(*variant),
                _ => None,
            })
            .ok_or_else(|| client_error("Get reply carries no variant".into()))?;
        if variant.signature() != expected {
            return Err(client_error(format!(
                "property '{name}' has signature '{expected}', reply carried '{}'",
                variant.signature()
            )));
        }
        Ok(variant.into_value())
    }

    /// `Properties.Set`, coercing `value` to the declared type.
    pub async fn set_property(&self, name: &str, value: Value) -> Result<()> {
        let property = self.property(name)?;
        if !property.access.writable() {
            return Err(client_error(format!("property '{name}' is not writable")));
        }
        let ty = SignatureType::parse_single(&property.signature)?;
        let value = ty.coerce(value)?;
        let variant = Variant::from_type(ty, value)?;
        let request = self.properties_call(
            "Set",
            "ssv",
            vec![
                Value::from(self.name()),
                Value::from(name),
                Value::Variant(Box::new(variant)),
            ],
        )?;
        check_reply(self.bus.call(request).await?, "")?;
        Ok(())
    }

    /// `Properties.GetAll`, unwrapped from their variants.
    pub async fn get_all_properties(&self) -> Result<Vec<(String, Value)>> {
        let request = self.properties_call("GetAll", "s", vec![Value::from(self.name())])?;
        let reply = check_reply(self.bus.call(request).await?, "a{sv}")?;
        let dict = reply
            .body()
            .first()
            .and_then(Value::as_dict)
            .ok_or_else(|| client_error("GetAll reply is not a dict".into()))?;
        let mut values = Vec::with_capacity(dict.len());
        for (key, value) in dict {
            let (Some(key), Some(variant)) = (key.as_str(), value.as_variant()) else {
                return Err(client_error("GetAll entry is not a string/variant pair".into()));
            };
            if let Some(declared) = self.introspection.property(key) {
                if declared.signature != variant.signature() {
                    warn!(property = key, "GetAll value does not match the declared signature");
                }
            }
            values.push((key.to_owned(), variant.value().clone()));
        }
        Ok(values)
    }

    /// Match rule shared by every subscription on this interface and path.
    pub fn match_rule(&self) -> String {
        format!(
            "type='signal',sender='{}',interface='{}',path='{}'",
            self.bus_name,
            self.name(),
            self.path
        )
    }

    /// Receive `signal` from this interface.
    ///
    /// The broker match rule is added on the first subscription and removed
    /// with the last.
    pub async fn subscribe(&self, signal: &str) -> Result<ProxySignalStream> {
        let expected = self
            .introspection
            .signal(signal)
            .ok_or_else(|| {
                client_error(format!("interface '{}' has no signal '{signal}'", self.name()))
            })?
            .signature();
        let filter = SignalFilter::new()
            .sender(&self.bus_name)
            .path(&self.path)
            .interface(self.name())
            .member(signal);
        let stream = self.bus.subscribe_signals(filter)?;
        let rule = self.match_rule();
        self.bus.add_match_rule(&rule).await?;
        Ok(ProxySignalStream {
            stream,
            expected,
            rule: Some(rule),
            bus: self.bus.clone(),
        })
    }
}

/// Signals of one member whose body matches the declared signature.
#[derive(Debug)]
pub struct ProxySignalStream {
    stream: SignalStream,
    expected: String,
    rule: Option<String>,
    bus: MessageBus,
}

impl ProxySignalStream {
    /// Next matching signal body; `None` once the connection is gone.
    pub async fn next_signal(&mut self) -> Option<Message> {
        futures::StreamExt::next(self).await
    }

    /// Drop the subscription and release the match rule now.
    pub async fn unsubscribe(mut self) -> Result<()> {
        match self.rule.take() {
            Some(rule) => self.bus.remove_match_rule(&rule).await,
            None => Ok(()),
        }
    }
}

impl Stream for ProxySignalStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        loop {
            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(message)) if message.signature() != self.expected => {
                    warn!(
                        member = message.member().unwrap_or_default(),
                        got = message.signature(),
                        expected = %self.expected,
                        "Skipping signal with unexpected signature"
                    );
                }
                other => return other,
            }
        }
    }
}

impl Drop for ProxySignalStream {
    fn drop(&mut self) {
        let Some(rule) = self.rule.take() else {
            return;
        };
        let bus = self.bus.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = bus.remove_match_rule(&rule).await {
                        debug!(rule = %rule, error = %e, "Could not remove match rule");
                    }
                });
            }
            Err(_) => debug!(rule = %rule, "No runtime to release match rule"),
        }
    }
}

impl MessageBus {
    /// Install the `NameOwnerChanged` match rule once per connection.
    pub(crate) async fn ensure_name_owner_tracking(&self) -> Result<()> {
        let installed = &self.shared().name_owner_rule_installed;
        if installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.add_match_rule(names::NAME_OWNER_MATCH_RULE).await {
            installed.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Look up the owner of a well-known name once; no owner is not an error.
    pub(crate) async fn seed_name_owner(&self, name: &str) -> Result<()> {
        if self.name_owners().get(name).is_some() {
            return Ok(());
        }
        let request = Message::method_call(names::BUS_PATH, "GetNameOwner")
            .destination(names::BUS_NAME)
            .interface(names::BUS_INTERFACE)
            .signature("s")
            .body(vec![Value::from(name)])
            .build()?;
        match self.call_checked(request).await {
            Ok(reply) => {
                if let Some(owner) = reply.body().first().and_then(Value::as_str) {
                    self.name_owners().set(name, owner);
                }
                Ok(())
            }
            Err(e) if e.error_name() == constants::NAME_HAS_NO_OWNER => {
                debug!(name, "Name has no owner yet");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn call() -> Message {
        Message::method_call("/t", "Echo")
            .serial(3)
            .sender(":1.9")
            .build()
            .unwrap()
    }

    #[test]
    fn test_check_reply_accepts_exact_signature() {
        let reply = Message::new_method_return(&call(), "s", vec![Value::from("x")]).unwrap();
        assert!(check_reply(reply, "s").is_ok());
    }

    #[test]
    fn test_check_reply_rejects_signature_mismatch() {
        let reply = Message::new_method_return(&call(), "i", vec![Value::Int32(1)]).unwrap();
        assert!(matches!(check_reply(reply, "s"), Err(DbusError::Client(_))));
    }

    #[test]
    fn test_check_reply_maps_error_replies() {
        let reply = Message::new_error(&call(), "org.example.Error.Boom", "boom").unwrap();
        let err = check_reply(reply, "s").unwrap_err();
        assert_eq!(err.error_name(), "org.example.Error.Boom");
        assert_eq!(err.as_remote().unwrap().text, "boom");
    }
}
