//! # Object Export
//!
//! The table of exported interfaces and the routing of incoming method
//! calls to them.
//!
//! ## Routing
//! 1. `Introspectable.Introspect`, `Peer.Ping`, `Peer.GetMachineId`,
//!    `ObjectManager.GetManagedObjects` and every `Properties` member are
//!    answered by built-in handlers for any path.
//! 2. Otherwise the call must match an exported `(path, interface, member,
//!    input signature)` exactly. A call without an interface field matches
//!    the first exported interface at the path that has the member.
//! 3. Anything else gets `UnknownMethod`.
//!
//! Handler errors become error replies and panics are caught. Calls flagged
//! `NO_REPLY_EXPECTED` never get a reply; failures are only logged.

use crate::core::message::{Message, MessageType};
use crate::core::value::Value;
use crate::error::{constants, DbusError, Result};
use crate::protocol::introspection::Node;
use crate::protocol::names;
use crate::protocol::validators::assert_object_path_valid;
use crate::service::bus::{error_reply, MessageBus};
use crate::service::interface::{MethodCall, MethodOutput, ServiceInterface, ServiceMethod};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Interfaces exported per object path.
#[derive(Debug, Default)]
pub(crate) struct ObjectTable {
    paths: BTreeMap<String, Vec<Arc<ServiceInterface>>>,
}

impl ObjectTable {
    pub(crate) fn contains(&self, path: &str, interface: &str) -> bool {
        self.paths
            .get(path)
            .is_some_and(|ifaces| ifaces.iter().any(|i| i.name() == interface))
    }

    pub(crate) fn insert(&mut self, path: &str, interface: Arc<ServiceInterface>) {
        self.paths.entry(path.to_owned()).or_default().push(interface);
    }

    /// Remove one interface, or every interface when `interface` is `None`.
    pub(crate) fn remove(&mut self, path: &str, interface: Option<&str>) -> Vec<Arc<ServiceInterface>> {
        let Some(exports) = self.paths.get_mut(path) else {
            return Vec::new();
        };
        let removed = match interface {
            None => std::mem::take(exports),
            Some(name) => match exports.iter().position(|i| i.name() == name) {
                Some(index) => vec![exports.remove(index)],
                None => Vec::new(),
            },
        };
        if exports.is_empty() {
            self.paths.remove(path);
        }
        removed
    }

    pub(crate) fn interfaces(&self, path: &str) -> Option<&[Arc<ServiceInterface>]> {
        self.paths.get(path).map(Vec::as_slice)
    }

    pub(crate) fn is_exported(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }

    /// Names of the direct children of `path` that lead to exports.
    pub(crate) fn children(&self, path: &str) -> Vec<String> {
        let mut children = BTreeSet::new();
        for export in self.paths.keys() {
            let rest = if path == "/" {
                export.strip_prefix('/')
            } else {
                export.strip_prefix(path).and_then(|r| r.strip_prefix('/'))
            };
            if let Some(child) = rest.and_then(|r| r.split('/').next()).filter(|c| !c.is_empty()) {
                children.insert(child.to_owned());
            }
        }
        children.into_iter().collect()
    }

    /// Every export below `path`, or all of them for `/`.
    pub(crate) fn managed(&self, path: &str) -> Vec<(String, Vec<Arc<ServiceInterface>>)> {
        let prefix = format!("{path}/");
        self.paths
            .iter()
            .filter(|(export, _)| path == "/" || export.starts_with(&prefix))
            .map(|(export, ifaces)| (export.clone(), ifaces.clone()))
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<(String, Vec<Arc<ServiceInterface>>)> {
        std::mem::take(&mut self.paths).into_iter().collect()
    }

    /// Introspection of `path`: standard plus exported interfaces and children.
    pub(crate) fn introspect(&self, path: &str) -> Result<Node> {
        assert_object_path_valid(path)?;
        let mut node = match self.interfaces(path) {
            Some(interfaces) => {
                let mut node = Node::with_standard_interfaces(Some(path))?;
                for interface in interfaces {
                    node.interfaces.push(interface.introspection()?);
                }
                node
            }
            None => Node::new(Some(path)),
        };
        node.nodes = self
            .children(path)
            .iter()
            .map(|name| Node::new(Some(name.as_str())))
            .collect();
        Ok(node)
    }
}

enum Route {
    Reply(Result<Message>),
    Method(Arc<ServiceInterface>, usize),
    Properties(Option<Vec<Arc<ServiceInterface>>>),
    GetMachineId,
    GetManagedObjects(Vec<(String, Vec<Arc<ServiceInterface>>)>),
    NotFound,
}

fn unknown_method(message: &Message) -> DbusError {
    DbusError::remote(
        constants::UNKNOWN_METHOD,
        format!(
            "{}.{} with signature \"{}\" could not be found",
            message.interface().unwrap_or_default(),
            message.member().unwrap_or_default(),
            message.signature()
        ),
    )
}

fn find_exported(
    interfaces: &[Arc<ServiceInterface>],
    interface: Option<&str>,
    member: &str,
    signature: &str,
) -> Option<(Arc<ServiceInterface>, usize)> {
    interfaces
        .iter()
        .filter(|i| interface.map_or(true, |name| i.name() == name))
        .find_map(|i| {
            i.methods()
                .iter()
                .position(|m| m.name() == member && m.in_signature().as_str() == signature)
                .map(|index| (i.clone(), index))
        })
}

fn route(bus: &MessageBus, message: &Message) -> Route {
    let table = match bus.shared().exports.read() {
        Ok(table) => table,
        Err(_) => {
            return Route::Reply(Err(DbusError::Internal(
                constants::ERR_LOCK_POISONED.into(),
            )))
        }
    };
    let path = message.path().unwrap_or("/");
    let member = message.member().unwrap_or_default();
    let signature = message.signature();

    match (message.interface(), member, signature) {
        (Some(names::INTROSPECTABLE), "Introspect", "") => {
            return Route::Reply(table.introspect(path).and_then(|node| {
                Message::new_method_return(message, "s", vec![Value::Str(node.to_xml()?)])
            }))
        }
        (Some(names::PEER), "Ping", "") => {
            return Route::Reply(Message::new_method_return(message, "", Vec::new()))
        }
        (Some(names::PEER), "GetMachineId", "") => return Route::GetMachineId,
        (Some(names::OBJECT_MANAGER), "GetManagedObjects", "") => {
            return Route::GetManagedObjects(table.managed(path))
        }
        (Some(names::PROPERTIES), _, _) => {
            return Route::Properties(table.interfaces(path).map(<[_]>::to_vec))
        }
        _ => {}
    }

    table
        .interfaces(path)
        .and_then(|interfaces| find_exported(interfaces, message.interface(), member, signature))
        .map_or(Route::NotFound, |(interface, index)| Route::Method(interface, index))
}

/// Turn an incoming call into the future producing its reply.
pub(crate) fn dispatch(bus: &MessageBus, message: Message) -> BoxFuture<'static, Option<Message>> {
    let expects_reply = message.expects_reply();
    let reply: BoxFuture<'static, Result<Message>> = match route(bus, &message) {
        Route::Reply(reply) => future::ready(reply).boxed(),
        Route::NotFound => {
            let err = unknown_method(&message);
            if !expects_reply {
                warn!(message = %message, "No handler for method call");
                return future::ready(None).boxed();
            }
            future::ready(Err(err)).boxed()
        }
        Route::Method(interface, index) => {
            let call = MethodCall::new(message.clone(), bus.clone());
            let started = catch_unwind(AssertUnwindSafe(|| interface.methods()[index].invoke(call)));
            match started {
                Ok(fut) => {
                    let call = message.clone();
                    async move {
                        let output = fut.await?;
                        let method: &ServiceMethod = &interface.methods()[index];
                        method_return(&call, method, output)
                    }
                    .boxed()
                }
                Err(_) => future::ready(Err(handler_panicked())).boxed(),
            }
        }
        Route::Properties(interfaces) => {
            properties_call(message.clone(), interfaces).boxed()
        }
        Route::GetMachineId => get_machine_id(bus.clone(), message.clone()).boxed(),
        Route::GetManagedObjects(entries) => {
            get_managed_objects(message.clone(), entries).boxed()
        }
    };

    async move {
        let result = match AssertUnwindSafe(reply).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(handler_panicked()),
        };
        finish(&message, expects_reply, result)
    }
    .boxed()
}

fn handler_panicked() -> DbusError {
    DbusError::remote(constants::INTERNAL_ERROR, "method handler panicked")
}

/// Reply to send for a completed handler, honouring `NO_REPLY_EXPECTED`.
fn finish(call: &Message, expects_reply: bool, result: Result<Message>) -> Option<Message> {
    match result {
        Ok(reply) if expects_reply => Some(reply),
        Ok(_) => None,
        Err(e) => {
            debug!(
                member = call.member().unwrap_or_default(),
                error = %e,
                "Method call failed"
            );
            if !expects_reply {
                warn!(message = %call, error = %e, "Method handler failed for a no-reply call");
                return None;
            }
            match error_reply(call, &e) {
                Ok(reply) => Some(reply),
                Err(build_error) => {
                    warn!(error = %build_error, "Could not build error reply");
                    None
                }
            }
        }
    }
}

fn method_return(call: &Message, method: &ServiceMethod, output: MethodOutput) -> Result<Message> {
    let body = method.out_signature().coerce(output.body)?;
    let mut builder = Message::builder(MessageType::MethodReturn)
        .reply_serial(call.serial())
        .signature(method.out_signature().as_str())
        .body(body)
        .unix_fds(output.unix_fds);
    if let Some(sender) = call.sender() {
        builder = builder.destination(sender);
    }
    builder.build()
}

fn body_str(message: &Message, index: usize) -> Result<String> {
    message
        .body()
        .get(index)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| DbusError::remote(constants::INVALID_ARGS, "expected a string argument"))
}

async fn properties_call(
    message: Message,
    interfaces: Option<Vec<Arc<ServiceInterface>>>,
) -> Result<Message> {
    let member = message.member().unwrap_or_default();
    let known = matches!(
        (member, message.signature()),
        ("Get", "ss") | ("Set", "ssv") | ("GetAll", "s")
    );
    if !known {
        return Err(unknown_method(&message));
    }

    let interface_name = body_str(&message, 0)?;
    if interface_name.is_empty() {
        return Err(DbusError::remote(
            constants::NOT_SUPPORTED,
            "properties with an empty interface name are not supported",
        ));
    }
    let path = message.path().unwrap_or("/");
    let Some(interfaces) = interfaces else {
        return Err(DbusError::remote(
            constants::UNKNOWN_OBJECT,
            format!("no interfaces at path '{path}'"),
        ));
    };

    let Some(interface) = interfaces.iter().find(|i| i.name() == interface_name).cloned() else {
        if names::is_standard_interface(&interface_name) {
            if member == "GetAll" {
                return Message::new_method_return(&message, "a{sv}", vec![Value::Dict(Vec::new())]);
            }
            return Err(DbusError::remote(
                constants::UNKNOWN_PROPERTY,
                format!(
                    "interface '{interface_name}' has no property '{}'",
                    body_str(&message, 1)?
                ),
            ));
        }
        return Err(DbusError::remote(
            constants::UNKNOWN_INTERFACE,
            format!("no interface '{interface_name}' at path '{path}'"),
        ));
    };

    match member {
        "Get" => {
            let name = body_str(&message, 1)?;
            let variant = interface.get_property(&name).await?;
            Message::new_method_return(&message, "v", vec![Value::Variant(Box::new(variant))])
        }
        "Set" => {
            let name = body_str(&message, 1)?;
            let variant = message
                .body()
                .get(2)
                .and_then(Value::as_variant)
                .cloned()
                .ok_or_else(|| DbusError::remote(constants::INVALID_ARGS, "expected a variant"))?;
            let value = interface.set_property(&name, variant).await?;
            let emits = interface.property(&name).is_some_and(|p| p.emits_changed());
            if emits {
                if let Err(e) = interface.emit_properties_changed(vec![(name.clone(), value)], Vec::new()) {
                    warn!(property = %name, error = %e, "Could not emit PropertiesChanged");
                }
            }
            Message::new_method_return(&message, "", Vec::new())
        }
        _ => {
            let values = interface.get_all().await?;
            Message::new_method_return(&message, "a{sv}", vec![Value::variant_dict(values)])
        }
    }
}

async fn get_machine_id(bus: MessageBus, message: Message) -> Result<Message> {
    if let Some(machine_id) = bus.shared().machine_id.get() {
        return Message::new_method_return(&message, "s", vec![Value::from(machine_id.as_str())]);
    }
    let request = Message::method_call(names::BUS_PATH, "GetMachineId")
        .destination(names::BUS_NAME)
        .interface(names::PEER)
        .build()?;
    let reply = bus.call_checked(request).await?;
    let machine_id = reply
        .body()
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| DbusError::remote(constants::FAILED, "could not get machine id"))?
        .to_owned();
    let _ = bus.shared().machine_id.set(machine_id.clone());
    Message::new_method_return(&message, "s", vec![Value::Str(machine_id)])
}

async fn get_managed_objects(
    message: Message,
    entries: Vec<(String, Vec<Arc<ServiceInterface>>)>,
) -> Result<Message> {
    let mut objects = Vec::with_capacity(entries.len());
    for (path, interfaces) in entries {
        let mut by_interface = Vec::with_capacity(interfaces.len());
        for interface in interfaces {
            let values = interface.get_all().await?;
            by_interface.push((
                Value::Str(interface.name().to_owned()),
                Value::variant_dict(values),
            ));
        }
        objects.push((Value::ObjectPath(path), Value::Dict(by_interface)));
    }
    Message::new_method_return(&message, "a{oa{sa{sv}}}", vec![Value::Dict(objects)])
}

impl MessageBus {
    /// Export `interface` at `path` and announce it with `InterfacesAdded`.
    ///
    /// Fails if an interface of the same name is already exported at `path`
    /// or if `interface` is exported on another connection.
    pub async fn export(&self, path: &str, interface: Arc<ServiceInterface>) -> Result<()> {
        assert_object_path_valid(path)?;
        if !self.is_connected() {
            return Err(DbusError::Disconnected(constants::ERR_NOT_CONNECTED.into()));
        }
        {
            let mut table = self
                .shared()
                .exports
                .write()
                .map_err(|_| DbusError::Internal(constants::ERR_LOCK_POISONED.into()))?;
            if table.contains(path, interface.name()) {
                return Err(DbusError::Client(format!(
                    "interface '{}' is already exported at '{path}'",
                    interface.name()
                )));
            }
            interface.attach(self, path)?;
            table.insert(path, interface.clone());
        }
        info!(path, interface = interface.name(), "Exported interface");

        let properties = interface.property_snapshot().await;
        let body = vec![
            Value::ObjectPath(path.to_owned()),
            Value::Dict(vec![(Value::Str(interface.name().to_owned()), properties)]),
        ];
        self.send(Message::new_signal(
            path,
            names::OBJECT_MANAGER,
            names::INTERFACES_ADDED,
            "oa{sa{sv}}",
            body,
        )?)
    }

    /// Unexport one interface at `path`, or all of them when `interface` is `None`.
    ///
    /// Removing something that is not exported is a no-op.
    pub fn unexport(&self, path: &str, interface: Option<&str>) -> Result<()> {
        assert_object_path_valid(path)?;
        let removed = self
            .shared()
            .exports
            .write()
            .map_err(|_| DbusError::Internal(constants::ERR_LOCK_POISONED.into()))?
            .remove(path, interface);
        if removed.is_empty() {
            return Ok(());
        }
        for iface in &removed {
            iface.detach(path);
        }
        let removed_names: Vec<Value> = removed
            .iter()
            .map(|iface| Value::Str(iface.name().to_owned()))
            .collect();
        info!(path, count = removed_names.len(), "Unexported interfaces");
        if !self.is_connected() {
            return Ok(());
        }
        self.send(Message::new_signal(
            path,
            names::OBJECT_MANAGER,
            names::INTERFACES_REMOVED,
            "oas",
            vec![Value::ObjectPath(path.to_owned()), Value::Array(removed_names)],
        )?)
    }

    /// Introspection data this connection serves for `path`.
    pub fn local_introspection(&self, path: &str) -> Result<Node> {
        self.shared()
            .exports
            .read()
            .map_err(|_| DbusError::Internal(constants::ERR_LOCK_POISONED.into()))?
            .introspect(path)
    }

    /// Whether anything is exported at `path`.
    pub fn is_exported(&self, path: &str) -> bool {
        self.shared()
            .exports
            .read()
            .map(|table| table.is_exported(path))
            .unwrap_or(false)
    }
}
