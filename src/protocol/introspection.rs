//! # Introspection Data
//!
//! Model of the `org.freedesktop.DBus.Introspectable` XML format and its
//! conversion to and from text.
//!
//! ## Defaults
//! - Method args without `direction` are inputs; signal args are outputs
//! - Properties without `access` are `readwrite`
//! - `<annotation>` elements are accepted and dropped

use crate::core::signature::{signature_tree, SignatureType};
use crate::error::{DbusError, Result};
use crate::protocol::names;
use crate::protocol::validators::{assert_interface_name_valid, assert_member_name_valid};
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::fmt;
use std::io;

/// Header written before serialized introspection documents
pub const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgDirection {
    In,
    Out,
}

impl ArgDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ArgDirection::In => "in",
            ArgDirection::Out => "out",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "in" => Ok(ArgDirection::In),
            "out" => Ok(ArgDirection::Out),
            other => Err(invalid(format!("invalid arg direction '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropertyAccess {
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl PropertyAccess {
    pub fn as_str(self) -> &'static str {
        match self {
            PropertyAccess::Read => "read",
            PropertyAccess::Write => "write",
            PropertyAccess::ReadWrite => "readwrite",
        }
    }

    pub fn readable(self) -> bool {
        matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(PropertyAccess::Read),
            "write" => Ok(PropertyAccess::Write),
            "readwrite" => Ok(PropertyAccess::ReadWrite),
            other => Err(invalid(format!("invalid property access '{other}'"))),
        }
    }
}

fn invalid(reason: impl Into<String>) -> DbusError {
    DbusError::InvalidIntrospection(reason.into())
}

fn single_complete_type(signature: &str) -> Result<()> {
    SignatureType::parse_single(signature)
        .map(|_| ())
        .map_err(|e| invalid(format!("'{signature}' is not a single complete type: {e}")))
}

/// One method or signal argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    pub name: Option<String>,
    pub signature: String,
    pub direction: ArgDirection,
}

impl Arg {
    pub fn new(name: Option<&str>, signature: &str, direction: ArgDirection) -> Result<Self> {
        single_complete_type(signature)?;
        Ok(Self {
            name: name.map(str::to_owned),
            signature: signature.to_owned(),
            direction,
        })
    }

    pub fn input(name: &str, signature: &str) -> Result<Self> {
        Self::new(Some(name), signature, ArgDirection::In)
    }

    pub fn output(name: &str, signature: &str) -> Result<Self> {
        Self::new(Some(name), signature, ArgDirection::Out)
    }
}

/// Split a signature into one argument per complete type.
pub fn args_from_signature(signature: &str, direction: ArgDirection) -> Result<Vec<Arg>> {
    signature_tree(signature)?
        .types()
        .iter()
        .map(|ty| Arg::new(None, &ty.signature(), direction))
        .collect()
}

fn joined_signature(args: &[Arg]) -> String {
    args.iter().map(|a| a.signature.as_str()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub name: String,
    pub in_args: Vec<Arg>,
    pub out_args: Vec<Arg>,
}

impl Method {
    pub fn new(name: &str, in_args: Vec<Arg>, out_args: Vec<Arg>) -> Result<Self> {
        assert_member_name_valid(name)?;
        Ok(Self {
            name: name.to_owned(),
            in_args,
            out_args,
        })
    }

    pub fn in_signature(&self) -> String {
        joined_signature(&self.in_args)
    }

    pub fn out_signature(&self) -> String {
        joined_signature(&self.out_args)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub name: String,
    pub args: Vec<Arg>,
}

impl Signal {
    pub fn new(name: &str, args: Vec<Arg>) -> Result<Self> {
        assert_member_name_valid(name)?;
        Ok(Self {
            name: name.to_owned(),
            args,
        })
    }

    pub fn signature(&self) -> String {
        joined_signature(&self.args)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub signature: String,
    pub access: PropertyAccess,
}

impl Property {
    pub fn new(name: &str, signature: &str, access: PropertyAccess) -> Result<Self> {
        assert_member_name_valid(name)?;
        single_complete_type(signature)?;
        Ok(Self {
            name: name.to_owned(),
            signature: signature.to_owned(),
            access,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub methods: Vec<Method>,
    pub signals: Vec<Signal>,
    pub properties: Vec<Property>,
}

impl Interface {
    pub fn new(name: &str) -> Result<Self> {
        assert_interface_name_valid(name)?;
        Ok(Self {
            name: name.to_owned(),
            methods: Vec::new(),
            signals: Vec::new(),
            properties: Vec::new(),
        })
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn signal(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// An object in the introspection tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub name: Option<String>,
    pub interfaces: Vec<Interface>,
    pub nodes: Vec<Node>,
}

impl Node {
    pub fn new(name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_owned),
            ..Self::default()
        }
    }

    /// A node carrying the four standard interfaces.
    pub fn with_standard_interfaces(name: Option<&str>) -> Result<Self> {
        let mut node = Self::new(name);
        node.interfaces = standard_interfaces()?;
        Ok(node)
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Parse an introspection document.
    pub fn parse(xml: &str) -> Result<Self> {
        let root = parse_elements(xml)?;
        if root.name != "node" {
            return Err(invalid(format!(
                "root element must be <node>, found <{}>",
                root.name
            )));
        }
        node_from_element(&root, true)
    }

    /// Serialize with the DOCTYPE header.
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        write_node(&mut writer, self)?;
        let body = String::from_utf8(writer.into_inner())
            .map_err(|_| invalid("serialized document is not UTF-8"))?;
        Ok(format!("{DOCTYPE}\n{body}\n"))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_xml() {
            Ok(xml) => f.write_str(&xml),
            Err(_) => Err(fmt::Error),
        }
    }
}

/// The Introspectable, Peer, Properties and ObjectManager interfaces.
pub fn standard_interfaces() -> Result<Vec<Interface>> {
    let mut introspectable = Interface::new(names::INTROSPECTABLE)?;
    introspectable
        .methods
        .push(Method::new("Introspect", vec![], vec![Arg::output("data", "s")?])?);

    let mut peer = Interface::new(names::PEER)?;
    peer.methods.push(Method::new(
        "GetMachineId",
        vec![],
        vec![Arg::output("machine_uuid", "s")?],
    )?);
    peer.methods.push(Method::new("Ping", vec![], vec![])?);

    let mut properties = Interface::new(names::PROPERTIES)?;
    properties.methods.push(Method::new(
        "Get",
        vec![
            Arg::input("interface_name", "s")?,
            Arg::input("property_name", "s")?,
        ],
        vec![Arg::output("value", "v")?],
    )?);
    properties.methods.push(Method::new(
        "Set",
        vec![
            Arg::input("interface_name", "s")?,
            Arg::input("property_name", "s")?,
            Arg::input("value", "v")?,
        ],
        vec![],
    )?);
    properties.methods.push(Method::new(
        "GetAll",
        vec![Arg::input("interface_name", "s")?],
        vec![Arg::output("props", "a{sv}")?],
    )?);
    properties.signals.push(Signal::new(
        names::PROPERTIES_CHANGED,
        vec![
            Arg::output("interface_name", "s")?,
            Arg::output("changed_properties", "a{sv}")?,
            Arg::output("invalidated_properties", "as")?,
        ],
    )?);

    let mut object_manager = Interface::new(names::OBJECT_MANAGER)?;
    object_manager.methods.push(Method::new(
        "GetManagedObjects",
        vec![],
        vec![Arg::output("objpath_interfaces_and_properties", "a{oa{sa{sv}}}")?],
    )?);
    object_manager.signals.push(Signal::new(
        names::INTERFACES_ADDED,
        vec![
            Arg::output("object_path", "o")?,
            Arg::output("interfaces_and_properties", "a{sa{sv}}")?,
        ],
    )?);
    object_manager.signals.push(Signal::new(
        names::INTERFACES_REMOVED,
        vec![
            Arg::output("object_path", "o")?,
            Arg::output("interfaces", "as")?,
        ],
    )?);

    Ok(vec![introspectable, peer, properties, object_manager])
}

// Minimal element tree; introspection documents carry no text content.
#[derive(Debug)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
}

impl Element {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn required(&self, key: &str) -> Result<&str> {
        self.attr(key).ok_or_else(|| {
            invalid(format!("<{}> must have a \"{key}\" attribute", self.name))
        })
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn element_from(start: &BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| invalid(format!("malformed attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.local_name().into_inner()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| invalid(format!("malformed attribute value: {e}")))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(Element {
        name,
        attrs,
        children: Vec::new(),
    })
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
    } else if root.is_none() {
        *root = Some(element);
    } else {
        return Err(invalid("document has more than one root element"));
    }
    Ok(())
}

fn parse_elements(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;
    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(element_from(&start)?),
            Event::Empty(start) => {
                let element = element_from(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| invalid("unbalanced closing tag"))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(invalid("document ended inside an element"));
    }
    root.ok_or_else(|| invalid("empty introspection document"))
}

fn arg_from_element(element: &Element, direction: ArgDirection) -> Result<Arg> {
    Arg::new(element.attr("name"), element.required("type")?, direction)
}

fn node_from_element(element: &Element, is_root: bool) -> Result<Node> {
    let name = element.attr("name");
    if !is_root && name.is_none() {
        return Err(invalid("child nodes must have a \"name\" attribute"));
    }

    let mut node = Node::new(name);
    for iface in element.children_named("interface") {
        node.interfaces.push(interface_from_element(iface)?);
    }
    for child in element.children_named("node") {
        node.nodes.push(node_from_element(child, false)?);
    }
    Ok(node)
}

fn interface_from_element(element: &Element) -> Result<Interface> {
    let mut iface = Interface::new(element.required("name")?)?;

    for method in element.children_named("method") {
        let mut in_args = Vec::new();
        let mut out_args = Vec::new();
        for arg in method.children_named("arg") {
            let direction = ArgDirection::parse(arg.attr("direction").unwrap_or("in"))?;
            let arg = arg_from_element(arg, direction)?;
            match direction {
                ArgDirection::In => in_args.push(arg),
                ArgDirection::Out => out_args.push(arg),
            }
        }
        iface
            .methods
            .push(Method::new(method.required("name")?, in_args, out_args)?);
    }

    for signal in element.children_named("signal") {
        let args = signal
            .children_named("arg")
            .map(|arg| arg_from_element(arg, ArgDirection::Out))
            .collect::<Result<Vec<_>>>()?;
        iface.signals.push(Signal::new(signal.required("name")?, args)?);
    }

    for property in element.children_named("property") {
        let access = PropertyAccess::parse(property.attr("access").unwrap_or("readwrite"))?;
        iface.properties.push(Property::new(
            property.required("name")?,
            property.required("type")?,
            access,
        )?);
    }

    Ok(iface)
}

fn write_arg<W: io::Write>(writer: &mut Writer<W>, arg: &Arg, with_direction: bool) -> io::Result<()> {
    let mut element = writer.create_element("arg");
    if let Some(name) = &arg.name {
        element = element.with_attribute(("name", name.as_str()));
    }
    element = element.with_attribute(("type", arg.signature.as_str()));
    if with_direction {
        element = element.with_attribute(("direction", arg.direction.as_str()));
    }
    element.write_empty()?;
    Ok(())
}

fn write_interface<W: io::Write>(writer: &mut Writer<W>, iface: &Interface) -> io::Result<()> {
    let element = writer
        .create_element("interface")
        .with_attribute(("name", iface.name.as_str()));
    if iface.methods.is_empty() && iface.signals.is_empty() && iface.properties.is_empty() {
        element.write_empty()?;
        return Ok(());
    }

    element.write_inner_content(|w| {
        for method in &iface.methods {
            let el = w
                .create_element("method")
                .with_attribute(("name", method.name.as_str()));
            if method.in_args.is_empty() && method.out_args.is_empty() {
                el.write_empty()?;
            } else {
                el.write_inner_content(|w| {
                    for arg in method.in_args.iter().chain(&method.out_args) {
                        write_arg(w, arg, true)?;
                    }
                    Ok(())
                })?;
            }
        }
        for signal in &iface.signals {
            let el = w
                .create_element("signal")
                .with_attribute(("name", signal.name.as_str()));
            if signal.args.is_empty() {
                el.write_empty()?;
            } else {
                el.write_inner_content(|w| {
                    for arg in &signal.args {
                        write_arg(w, arg, false)?;
                    }
                    Ok(())
                })?;
            }
        }
        for property in &iface.properties {
            w.create_element("property")
                .with_attribute(("name", property.name.as_str()))
                .with_attribute(("type", property.signature.as_str()))
                .with_attribute(("access", property.access.as_str()))
                .write_empty()?;
        }
        Ok(())
    })?;
    Ok(())
}

fn write_node<W: io::Write>(writer: &mut Writer<W>, node: &Node) -> io::Result<()> {
    let mut element = writer.create_element("node");
    if let Some(name) = &node.name {
        element = element.with_attribute(("name", name.as_str()));
    }
    if node.interfaces.is_empty() && node.nodes.is_empty() {
        element.write_empty()?;
        return Ok(());
    }
    element.write_inner_content(|w| {
        for iface in &node.interfaces {
            write_interface(w, iface)?;
        }
        for child in &node.nodes {
            write_node(w, child)?;
        }
        Ok(())
    })?;
    Ok(())
}
