//! # Service Interfaces
//!
//! An exported D-Bus interface is described once with
//! [`ServiceInterface::builder`] and consulted at dispatch time: methods are
//! matched on `(member, input signature)`, properties carry their access mode
//! and optional getter/setter, signals carry their output signature.
//!
//! ## Handlers
//! Every handler returns a future. The reply to a method call is written only
//! after that future resolves, and the engine keeps processing other traffic
//! while it is pending.
//!
//! ## Example
//! ```rust,no_run
//! use dbus_wire::core::value::Value;
//! use dbus_wire::service::interface::ServiceInterface;
//!
//! # fn build() -> dbus_wire::Result<()> {
//! let iface = ServiceInterface::builder("org.example.Echo")
//!     .method("Echo", "s", "s", |call| async move { Ok(call.into_args()) })
//!     .property("Version", "u", || async { Ok(Value::UInt32(1)) })
//!     .signal("Echoed", "s")
//!     .build()?;
//! # let _ = iface;
//! # Ok(())
//! # }
//! ```

use crate::core::message::Message;
use crate::core::signature::{signature_tree, SignatureTree, SignatureType};
use crate::core::value::{Value, Variant};
use crate::error::{constants, DbusError, Result};
use crate::protocol::introspection::{self, args_from_signature, ArgDirection, PropertyAccess};
use crate::protocol::names;
use crate::protocol::validators::{assert_interface_name_valid, assert_member_name_valid};
use crate::service::bus::{MessageBus, WeakBus};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// An incoming method call as seen by a handler.
#[derive(Debug, Clone)]
pub struct MethodCall {
    message: Message,
    bus: MessageBus,
}

impl MethodCall {
    pub(crate) fn new(message: Message, bus: MessageBus) -> Self {
        Self { message, bus }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn args(&self) -> &[Value] {
        self.message.body()
    }

    pub fn into_args(self) -> Vec<Value> {
        self.message.into_body()
    }

    pub fn sender(&self) -> Option<&str> {
        self.message.sender()
    }

    /// The connection the call arrived on, for nested calls.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Resolve a `h` argument to the fd passed with the call.
    pub fn unix_fd(&self, value: &Value) -> Option<&Arc<OwnedFd>> {
        self.message.unix_fd(value)
    }
}

/// Reply body produced by a method handler.
#[derive(Debug, Clone, Default)]
pub struct MethodOutput {
    pub body: Vec<Value>,
    /// Fds referenced by `h` values in `body`, by index
    pub unix_fds: Vec<Arc<OwnedFd>>,
}

impl MethodOutput {
    pub fn with_fds(body: Vec<Value>, unix_fds: Vec<Arc<OwnedFd>>) -> Self {
        Self { body, unix_fds }
    }
}

impl From<Vec<Value>> for MethodOutput {
    fn from(body: Vec<Value>) -> Self {
        Self {
            body,
            unix_fds: Vec::new(),
        }
    }
}

impl From<Value> for MethodOutput {
    fn from(value: Value) -> Self {
        vec![value].into()
    }
}

impl From<()> for MethodOutput {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

type MethodFn = dyn Fn(MethodCall) -> BoxFuture<'static, Result<MethodOutput>> + Send + Sync;
type GetterFn = dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync;
type SetterFn = dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync;

pub struct ServiceMethod {
    name: String,
    in_signature: Arc<SignatureTree>,
    out_signature: Arc<SignatureTree>,
    handler: Arc<MethodFn>,
}

impl ServiceMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_signature(&self) -> &Arc<SignatureTree> {
        &self.in_signature
    }

    pub fn out_signature(&self) -> &Arc<SignatureTree> {
        &self.out_signature
    }

    /// Start the handler. The returned future owns everything it needs.
    pub(crate) fn invoke(&self, call: MethodCall) -> BoxFuture<'static, Result<MethodOutput>> {
        (self.handler)(call)
    }
}

impl fmt::Debug for ServiceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceMethod")
            .field("name", &self.name)
            .field("in_signature", &self.in_signature.as_str())
            .field("out_signature", &self.out_signature.as_str())
            .finish_non_exhaustive()
    }
}

pub struct ServiceProperty {
    name: String,
    signature: SignatureType,
    access: PropertyAccess,
    emits_changed: bool,
    getter: Option<Arc<GetterFn>>,
    setter: Option<Arc<SetterFn>>,
}

impl ServiceProperty {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &SignatureType {
        &self.signature
    }

    pub fn access(&self) -> PropertyAccess {
        self.access
    }

    pub fn emits_changed(&self) -> bool {
        self.emits_changed
    }
}

impl fmt::Debug for ServiceProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProperty")
            .field("name", &self.name)
            .field("signature", &self.signature.signature())
            .field("access", &self.access)
            .field("emits_changed", &self.emits_changed)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ServiceSignal {
    name: String,
    signature: Arc<SignatureTree>,
}

impl ServiceSignal {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Arc<SignatureTree> {
        &self.signature
    }
}

/// Where an interface is exported: one bus, any number of paths.
#[derive(Debug, Default)]
struct ExportLink {
    bus: Option<WeakBus>,
    paths: BTreeSet<String>,
}

pub struct ServiceInterface {
    name: String,
    methods: Vec<ServiceMethod>,
    properties: Vec<ServiceProperty>,
    signals: Vec<ServiceSignal>,
    link: Mutex<ExportLink>,
}

impl fmt::Debug for ServiceInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInterface")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .field("properties", &self.properties)
            .field("signals", &self.signals)
            .finish_non_exhaustive()
    }
}

fn unknown_property(interface: &str, property: &str) -> DbusError {
    DbusError::remote(
        constants::UNKNOWN_PROPERTY,
        format!("interface '{interface}' has no readable property '{property}'"),
    )
}

impl ServiceInterface {
    pub fn builder(name: impl Into<String>) -> ServiceInterfaceBuilder {
        ServiceInterfaceBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[ServiceMethod] {
        &self.methods
    }

    pub fn properties(&self) -> &[ServiceProperty] {
        &self.properties
    }

    pub fn signals(&self) -> &[ServiceSignal] {
        &self.signals
    }

    /// Exact `(member, input signature)` lookup.
    pub fn find_method(&self, member: &str, signature: &str) -> Option<&ServiceMethod> {
        self.methods
            .iter()
            .find(|m| m.name == member && m.in_signature.as_str() == signature)
    }

    pub fn property(&self, name: &str) -> Option<&ServiceProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn signal(&self, name: &str) -> Option<&ServiceSignal> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Introspection data for this interface.
    pub fn introspection(&self) -> Result<introspection::Interface> {
        let mut iface = introspection::Interface::new(&self.name)?;
        for method in &self.methods {
            iface.methods.push(introspection::Method::new(
                &method.name,
                args_from_signature(method.in_signature.as_str(), ArgDirection::In)?,
                args_from_signature(method.out_signature.as_str(), ArgDirection::Out)?,
            )?);
        }
        for signal in &self.signals {
            iface.signals.push(introspection::Signal::new(
                &signal.name,
                args_from_signature(signal.signature.as_str(), ArgDirection::Out)?,
            )?);
        }
        for property in &self.properties {
            iface.properties.push(introspection::Property::new(
                &property.name,
                &property.signature.signature(),
                property.access,
            )?);
        }
        Ok(iface)
    }

    /// Read one property through its getter.
    pub async fn get_property(&self, name: &str) -> Result<Variant> {
        let property = self
            .property(name)
            .filter(|p| p.access.readable())
            .ok_or_else(|| unknown_property(&self.name, name))?;
        let getter = property
            .getter
            .as_ref()
            .ok_or_else(|| unknown_property(&self.name, name))?;
        let value = getter().await?;
        let value = property.signature.coerce(value)?;
        Ok(Variant::new_unchecked(property.signature.clone(), value))
    }

    /// Write one property through its setter and return the stored value.
    ///
    /// The setter is never invoked for a read-only property or for a
    /// variant whose signature differs from the property's.
    pub async fn set_property(&self, name: &str, value: Variant) -> Result<Value> {
        let property = self
            .property(name)
            .ok_or_else(|| unknown_property(&self.name, name))?;
        if !property.access.writable() {
            return Err(DbusError::remote(
                constants::PROPERTY_READ_ONLY,
                format!("property '{}.{name}' is read-only", self.name),
            ));
        }
        if value.signature_type() != &property.signature {
            return Err(DbusError::remote(
                constants::INVALID_SIGNATURE,
                format!(
                    "property '{}.{name}' has signature '{}', got '{}'",
                    self.name,
                    property.signature.signature(),
                    value.signature()
                ),
            ));
        }
        let setter = property.setter.as_ref().ok_or_else(|| {
            DbusError::Internal(format!("writable property '{name}' has no setter"))
        })?;
        let value = value.into_value();
        setter(value.clone()).await?;
        Ok(value)
    }

    /// Every readable property. The first failing getter aborts.
    pub async fn get_all(&self) -> Result<Vec<(String, Variant)>> {
        let mut values = Vec::new();
        for property in self.properties.iter().filter(|p| p.access.readable()) {
            let variant = self.get_property(&property.name).await?;
            values.push((property.name.clone(), variant));
        }
        Ok(values)
    }

    /// Readable properties for object manager signals; failing getters are skipped.
    pub(crate) async fn property_snapshot(&self) -> Value {
        let mut values = Vec::new();
        for property in self.properties.iter().filter(|p| p.access.readable()) {
            match self.get_property(&property.name).await {
                Ok(variant) => values.push((property.name.clone(), variant)),
                Err(e) => warn!(
                    interface = %self.name,
                    property = %property.name,
                    error = %e,
                    "Property getter failed; omitted from snapshot"
                ),
            }
        }
        Value::variant_dict(values)
    }

    /// Paths this interface is currently exported on.
    pub fn exported_paths(&self) -> Vec<String> {
        self.lock_link().paths.iter().cloned().collect()
    }

    pub fn is_exported(&self) -> bool {
        !self.lock_link().paths.is_empty()
    }

    /// Emit a declared signal on every path this interface is exported on.
    pub fn emit_signal(&self, member: &str, body: Vec<Value>) -> Result<()> {
        let signal = self.signal(member).ok_or_else(|| {
            DbusError::Client(format!(
                "interface '{}' declares no signal '{member}'",
                self.name
            ))
        })?;
        let body = signal.signature.coerce(body)?;
        self.broadcast(member, signal.signature.as_str(), body)
    }

    /// Emit `PropertiesChanged` for known properties of this interface.
    ///
    /// Unknown names are dropped from both lists. Nothing is sent when both
    /// end up empty.
    pub fn emit_properties_changed(
        &self,
        changed: Vec<(String, Value)>,
        invalidated: Vec<String>,
    ) -> Result<()> {
        let mut changed_entries = Vec::with_capacity(changed.len());
        for (name, value) in changed {
            let Some(property) = self.property(&name) else {
                debug!(interface = %self.name, property = %name, "Dropping unknown changed property");
                continue;
            };
            let value = property.signature.coerce(value)?;
            changed_entries.push((
                Value::Str(name),
                Value::Variant(Box::new(Variant::new_unchecked(
                    property.signature.clone(),
                    value,
                ))),
            ));
        }
        let invalidated: Vec<Value> = invalidated
            .into_iter()
            .filter(|name| self.property(name).is_some())
            .map(Value::Str)
            .collect();
        if changed_entries.is_empty() && invalidated.is_empty() {
            return Ok(());
        }

        let body = vec![
            Value::Str(self.name.clone()),
            Value::Dict(changed_entries),
            Value::Array(invalidated),
        ];
        let bus = self.bus()?;
        for path in self.exported_paths() {
            let message = Message::new_signal(
                &path,
                names::PROPERTIES,
                names::PROPERTIES_CHANGED,
                "sa{sv}as",
                body.clone(),
            )?;
            bus.send(message)?;
        }
        Ok(())
    }

    fn broadcast(&self, member: &str, signature: &str, body: Vec<Value>) -> Result<()> {
        let bus = self.bus()?;
        for path in self.exported_paths() {
            bus.send(Message::new_signal(
                &path,
                &self.name,
                member,
                signature,
                body.clone(),
            )?)?;
        }
        Ok(())
    }

    fn bus(&self) -> Result<MessageBus> {
        self.lock_link()
            .bus
            .as_ref()
            .and_then(WeakBus::upgrade)
            .ok_or_else(|| {
                DbusError::Client(format!("interface '{}' is not exported", self.name))
            })
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, ExportLink> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an export on `path` of `bus`. Fails if bound to another bus.
    pub(crate) fn attach(&self, bus: &MessageBus, path: &str) -> Result<()> {
        let mut link = self.lock_link();
        match &link.bus {
            Some(existing) if !existing.is(bus) && existing.upgrade().is_some() => {
                return Err(DbusError::Client(format!(
                    "interface '{}' is already exported on another connection",
                    self.name
                )));
            }
            _ => {}
        }
        link.bus = Some(bus.downgrade());
        link.paths.insert(path.to_owned());
        Ok(())
    }

    /// Forget the export on `path`; the bus binding goes with the last path.
    pub(crate) fn detach(&self, path: &str) {
        let mut link = self.lock_link();
        link.paths.remove(path);
        if link.paths.is_empty() {
            link.bus = None;
        }
    }
}

enum PendingProperty {
    Property(ServiceProperty),
    Invalid(DbusError),
}

/// Builder for [`ServiceInterface`]. Validation happens in [`build`](Self::build).
pub struct ServiceInterfaceBuilder {
    name: String,
    methods: Vec<Result<ServiceMethod>>,
    properties: Vec<PendingProperty>,
    signals: Vec<Result<ServiceSignal>>,
    emits_changed: Vec<(String, bool)>,
}

fn arg_signature(signature: &str) -> Result<Arc<SignatureTree>> {
    signature_tree(signature)
}

impl ServiceInterfaceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            properties: Vec::new(),
            signals: Vec::new(),
            emits_changed: Vec::new(),
        }
    }

    /// Register a method. The handler's result must match `out_signature`.
    pub fn method<F, Fut, R>(
        mut self,
        name: &str,
        in_signature: &str,
        out_signature: &str,
        handler: F,
    ) -> Self
    where
        F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Into<MethodOutput>,
    {
        let entry = assert_member_name_valid(name).and_then(|()| {
            let handler: Arc<MethodFn> = Arc::new(move |call| {
                let fut = handler(call);
                async move { fut.await.map(Into::into) }.boxed()
            });
            Ok(ServiceMethod {
                name: name.to_owned(),
                in_signature: arg_signature(in_signature)?,
                out_signature: arg_signature(out_signature)?,
                handler,
            })
        });
        self.methods.push(entry);
        self
    }

    /// Register a read-only property.
    pub fn property<G, GFut>(self, name: &str, signature: &str, getter: G) -> Self
    where
        G: Fn() -> GFut + Send + Sync + 'static,
        GFut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.push_property(name, signature, PropertyAccess::Read, Some(boxed_getter(getter)), None)
    }

    pub fn writable_property<G, GFut, S, SFut>(
        self,
        name: &str,
        signature: &str,
        getter: G,
        setter: S,
    ) -> Self
    where
        G: Fn() -> GFut + Send + Sync + 'static,
        GFut: Future<Output = Result<Value>> + Send + 'static,
        S: Fn(Value) -> SFut + Send + Sync + 'static,
        SFut: Future<Output = Result<()>> + Send + 'static,
    {
        self.push_property(
            name,
            signature,
            PropertyAccess::ReadWrite,
            Some(boxed_getter(getter)),
            Some(boxed_setter(setter)),
        )
    }

    pub fn write_only_property<S, SFut>(self, name: &str, signature: &str, setter: S) -> Self
    where
        S: Fn(Value) -> SFut + Send + Sync + 'static,
        SFut: Future<Output = Result<()>> + Send + 'static,
    {
        self.push_property(
            name,
            signature,
            PropertyAccess::Write,
            None,
            Some(boxed_setter(setter)),
        )
    }

    pub fn signal(mut self, name: &str, signature: &str) -> Self {
        let entry = assert_member_name_valid(name)
            .and_then(|()| arg_signature(signature))
            .map(|signature| ServiceSignal {
                name: name.to_owned(),
                signature,
            });
        self.signals.push(entry);
        self
    }

    /// Whether a successful `Set` of `property` emits `PropertiesChanged`.
    pub fn emits_changed(mut self, property: &str, emits: bool) -> Self {
        self.emits_changed.push((property.to_owned(), emits));
        self
    }

    fn push_property(
        mut self,
        name: &str,
        signature: &str,
        access: PropertyAccess,
        getter: Option<Arc<GetterFn>>,
        setter: Option<Arc<SetterFn>>,
    ) -> Self {
        let entry = match assert_member_name_valid(name)
            .and_then(|()| SignatureType::parse_single(signature))
        {
            Ok(signature) => PendingProperty::Property(ServiceProperty {
                name: name.to_owned(),
                signature,
                access,
                emits_changed: true,
                getter,
                setter,
            }),
            Err(e) => PendingProperty::Invalid(e),
        };
        self.properties.push(entry);
        self
    }

    pub fn build(self) -> Result<ServiceInterface> {
        assert_interface_name_valid(&self.name)?;

        let methods = self.methods.into_iter().collect::<Result<Vec<_>>>()?;
        let signals = self.signals.into_iter().collect::<Result<Vec<_>>>()?;
        let mut properties = Vec::with_capacity(self.properties.len());
        for pending in self.properties {
            match pending {
                PendingProperty::Property(p) => properties.push(p),
                PendingProperty::Invalid(e) => return Err(e),
            }
        }

        let mut seen = BTreeSet::new();
        for property in &properties {
            if !seen.insert(property.name.as_str()) {
                return Err(DbusError::Client(format!(
                    "property '{}' declared twice on '{}'",
                    property.name, self.name
                )));
            }
        }
        let mut seen = BTreeSet::new();
        for method in &methods {
            if !seen.insert((method.name.as_str(), method.in_signature.as_str())) {
                return Err(DbusError::Client(format!(
                    "method '{}({})' declared twice on '{}'",
                    method.name,
                    method.in_signature.as_str(),
                    self.name
                )));
            }
        }

        for (name, emits) in self.emits_changed {
            let property = properties
                .iter_mut()
                .find(|p| p.name == name)
                .ok_or_else(|| {
                    DbusError::Client(format!("emits_changed names unknown property '{name}'"))
                })?;
            property.emits_changed = emits;
        }

        Ok(ServiceInterface {
            name: self.name,
            methods,
            properties,
            signals,
            link: Mutex::new(ExportLink::default()),
        })
    }
}

fn boxed_getter<G, GFut>(getter: G) -> Arc<GetterFn>
where
    G: Fn() -> GFut + Send + Sync + 'static,
    GFut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move || getter().boxed())
}

fn boxed_setter<S, SFut>(setter: S) -> Arc<SetterFn>
where
    S: Fn(Value) -> SFut + Send + Sync + 'static,
    SFut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |value| setter(value).boxed())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter_interface(count: Arc<AtomicU32>) -> ServiceInterface {
        let read = count.clone();
        ServiceInterface::builder("org.example.Counter")
            .method("Reset", "", "", |_call| async { Ok(()) })
            .writable_property(
                "count",
                "u",
                move || {
                    let read = read.clone();
                    async move { Ok(Value::UInt32(read.load(Ordering::SeqCst))) }
                },
                move |value| {
                    let count = count.clone();
                    async move {
                        count.store(value.as_u32().unwrap_or_default(), Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .property("Name", "s", || async { Ok(Value::from("counter")) })
            .signal("Overflow", "u")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_validates_names_and_signatures() {
        assert!(ServiceInterface::builder("bad").build().is_err());
        assert!(ServiceInterface::builder("org.example.I")
            .method("Bad.Name", "", "", |_c| async { Ok(()) })
            .build()
            .is_err());
        assert!(ServiceInterface::builder("org.example.I")
            .method("M", "a", "", |_c| async { Ok(()) })
            .build()
            .is_err());
        // a property is exactly one complete type
        assert!(ServiceInterface::builder("org.example.I")
            .property("P", "ii", || async { Ok(Value::Int32(0)) })
            .build()
            .is_err());
        assert!(ServiceInterface::builder("org.example.I")
            .signal("S", "a{")
            .build()
            .is_err());
        assert!(ServiceInterface::builder("org.example.I")
            .emits_changed("Missing", false)
            .build()
            .is_err());
    }

    #[test]
    fn test_method_lookup_matches_signature_exactly() {
        let iface = counter_interface(Arc::new(AtomicU32::new(0)));
        assert!(iface.find_method("Reset", "").is_some());
        assert!(iface.find_method("Reset", "u").is_none());
        assert!(iface.find_method("reset", "").is_none());
    }

    #[tokio::test]
    async fn test_property_access_control() {
        let count = Arc::new(AtomicU32::new(0));
        let iface = counter_interface(count.clone());

        let value = iface
            .set_property("count", Variant::new("u", Value::UInt32(5)).unwrap())
            .await
            .unwrap();
        assert_eq!(value, Value::UInt32(5));
        assert_eq!(count.load(Ordering::SeqCst), 5);

        let err = iface
            .set_property("Name", Variant::from("x"))
            .await
            .unwrap_err();
        assert_eq!(err.error_name(), constants::PROPERTY_READ_ONLY);

        let err = iface
            .set_property("count", Variant::from("five"))
            .await
            .unwrap_err();
        assert_eq!(err.error_name(), constants::INVALID_SIGNATURE);
        assert_eq!(count.load(Ordering::SeqCst), 5);

        let err = iface.get_property("nope").await.unwrap_err();
        assert_eq!(err.error_name(), constants::UNKNOWN_PROPERTY);

        let all = iface.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].1.value(), &Value::UInt32(5));
    }

    #[test]
    fn test_introspection_reflects_declarations() {
        let iface = counter_interface(Arc::new(AtomicU32::new(0)));
        let data = iface.introspection().unwrap();
        assert_eq!(data.name, "org.example.Counter");
        assert_eq!(data.property("count").unwrap().access, PropertyAccess::ReadWrite);
        assert_eq!(data.property("Name").unwrap().access, PropertyAccess::Read);
        assert_eq!(data.signal("Overflow").unwrap().signature(), "u");
    }

    #[test]
    fn test_emit_requires_export() {
        let iface = counter_interface(Arc::new(AtomicU32::new(0)));
        assert!(matches!(
            iface.emit_signal("Overflow", vec![Value::UInt32(1)]),
            Err(DbusError::Client(_))
        ));
        assert!(matches!(
            iface.emit_signal("Missing", vec![]),
            Err(DbusError::Client(_))
        ));
    }
}
