//! # Message Model
//!
//! In-memory representation of a D-Bus message and its wire framing.
//!
//! ## Wire Format
//! ```text
//! [endian(1)] [type(1)] [flags(1)] [version(1)] [body_len(4)] [serial(4)]
//! [header fields a(yv)] [pad to 8] [body]
//! ```
//!
//! ## Required Fields
//! | kind          | fields                     |
//! |---------------|----------------------------|
//! | method call   | path, member               |
//! | method return | reply serial               |
//! | error         | error name, reply serial   |
//! | signal        | path, interface, member    |
//!
//! Required fields are always enforced. Name and body validation can be
//! switched off with [`MessageBuilder::validate`] for trusted input.

use crate::config::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use crate::core::marshal::{padding_for, Endian, Marshaller};
use crate::core::signature::{signature_tree, SignatureTree, SignatureType};
use crate::core::unmarshal::Unmarshaller;
use crate::core::value::{Value, Variant};
use crate::error::{DbusError, Result};
use crate::protocol::validators::{
    assert_bus_name_valid, assert_interface_name_valid, assert_member_name_valid,
    assert_object_path_valid,
};
use bytes::BytesMut;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Size of the fixed part of the header, up to and including the field array length
pub const FIXED_HEADER_LEN: usize = 16;

/// Header field codes
pub mod field {
    pub const PATH: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const ERROR_NAME: u8 = 4;
    pub const REPLY_SERIAL: u8 = 5;
    pub const DESTINATION: u8 = 6;
    pub const SENDER: u8 = 7;
    pub const SIGNATURE: u8 = 8;
    pub const UNIX_FDS: u8 = 9;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

/// Message header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    pub const NO_REPLY_EXPECTED: MessageFlags = MessageFlags(0x1);
    pub const NO_AUTO_START: MessageFlags = MessageFlags(0x2);
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: MessageFlags = MessageFlags(0x4);

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Unknown bits are dropped.
    pub fn from_bits_truncate(bits: u8) -> Self {
        MessageFlags(bits & 0x7)
    }

    pub fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: Self) -> Self {
        MessageFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for MessageFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A D-Bus message.
#[derive(Debug, Clone)]
pub struct Message {
    message_type: MessageType,
    flags: MessageFlags,
    serial: u32,
    destination: Option<String>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u32>,
    sender: Option<String>,
    signature: Arc<SignatureTree>,
    body: Vec<Value>,
    unix_fds: Vec<Arc<OwnedFd>>,
    declared_fds: u32,
}

impl Message {
    pub fn builder(message_type: MessageType) -> MessageBuilder {
        MessageBuilder::new(message_type)
    }

    /// Start a method call; path and member are the required fields.
    pub fn method_call(path: impl Into<String>, member: impl Into<String>) -> MessageBuilder {
        MessageBuilder::new(MessageType::MethodCall)
            .path(path)
            .member(member)
    }

    /// Start a signal; path, interface and member are the required fields.
    pub fn signal(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> MessageBuilder {
        MessageBuilder::new(MessageType::Signal)
            .path(path)
            .interface(interface)
            .member(member)
    }

    /// A method return answering `call`.
    pub fn new_method_return(call: &Message, signature: &str, body: Vec<Value>) -> Result<Message> {
        let mut builder = MessageBuilder::new(MessageType::MethodReturn)
            .reply_serial(call.serial)
            .signature(signature)
            .body(body);
        if let Some(sender) = &call.sender {
            builder = builder.destination(sender.clone());
        }
        builder.build()
    }

    /// An error reply answering `call` with a text body.
    pub fn new_error(call: &Message, error_name: &str, text: &str) -> Result<Message> {
        let mut builder = MessageBuilder::new(MessageType::Error)
            .reply_serial(call.serial)
            .error_name(error_name)
            .signature("s")
            .body(vec![Value::from(text)]);
        if let Some(sender) = &call.sender {
            builder = builder.destination(sender.clone());
        }
        builder.build()
    }

    /// A broadcast signal.
    pub fn new_signal(
        path: &str,
        interface: &str,
        member: &str,
        signature: &str,
        body: Vec<Value>,
    ) -> Result<Message> {
        Message::signal(path, interface, member)
            .signature(signature)
            .body(body)
            .build()
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    /// Serial of this message; zero until the sending connection assigns one.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn signature(&self) -> &str {
        self.signature.as_str()
    }

    pub fn signature_tree(&self) -> &Arc<SignatureTree> {
        &self.signature
    }

    pub fn body(&self) -> &[Value] {
        &self.body
    }

    pub fn into_body(self) -> Vec<Value> {
        self.body
    }

    pub fn unix_fds(&self) -> &[Arc<OwnedFd>] {
        &self.unix_fds
    }

    /// Resolve a `Value::UnixFd` index against this message's fds.
    pub fn unix_fd(&self, value: &Value) -> Option<&Arc<OwnedFd>> {
        match value {
            Value::UnixFd(index) => self.unix_fds.get(*index as usize),
            _ => None,
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall
            && !self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    pub fn set_sender(&mut self, sender: impl Into<String>) {
        self.sender = Some(sender.into());
    }

    pub fn set_destination(&mut self, destination: Option<String>) {
        self.destination = destination;
    }

    /// Number of fds announced by the UNIX_FDS header field.
    pub fn declared_unix_fds(&self) -> u32 {
        self.declared_fds
    }

    pub(crate) fn attach_fds(&mut self, fds: Vec<Arc<OwnedFd>>) {
        self.unix_fds = fds;
    }

    pub(crate) fn take_fds(&mut self) -> Vec<Arc<OwnedFd>> {
        std::mem::take(&mut self.unix_fds)
    }

    fn check_required(&self) -> Result<()> {
        let missing = |what: &str| {
            Err(DbusError::InvalidMessage(format!(
                "{:?} message requires {what}",
                self.message_type
            )))
        };
        match self.message_type {
            MessageType::MethodCall => {
                if self.path.is_none() {
                    return missing("a path");
                }
                if self.member.is_none() {
                    return missing("a member");
                }
            }
            MessageType::Signal => {
                if self.path.is_none() {
                    return missing("a path");
                }
                if self.interface.is_none() {
                    return missing("an interface");
                }
                if self.member.is_none() {
                    return missing("a member");
                }
            }
            MessageType::Error => {
                if self.error_name.is_none() {
                    return missing("an error name");
                }
                if self.reply_serial.is_none() {
                    return missing("a reply serial");
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return missing("a reply serial");
                }
            }
        }
        Ok(())
    }

    fn header_fields(&self) -> Vec<Value> {
        let mut fields = Vec::with_capacity(8);
        let mut push = |code: u8, ty: SignatureType, value: Value| {
            fields.push(Value::Struct(vec![
                Value::Byte(code),
                Value::Variant(Box::new(Variant::new_unchecked(ty, value))),
            ]));
        };

        if let Some(path) = &self.path {
            push(field::PATH, SignatureType::ObjectPath, Value::ObjectPath(path.clone()));
        }
        if let Some(interface) = &self.interface {
            push(field::INTERFACE, SignatureType::String, Value::Str(interface.clone()));
        }
        if let Some(member) = &self.member {
            push(field::MEMBER, SignatureType::String, Value::Str(member.clone()));
        }
        if let Some(name) = &self.error_name {
            push(field::ERROR_NAME, SignatureType::String, Value::Str(name.clone()));
        }
        if let Some(reply_serial) = self.reply_serial {
            push(field::REPLY_SERIAL, SignatureType::UInt32, Value::UInt32(reply_serial));
        }
        if let Some(destination) = &self.destination {
            push(field::DESTINATION, SignatureType::String, Value::Str(destination.clone()));
        }
        if let Some(sender) = &self.sender {
            push(field::SENDER, SignatureType::String, Value::Str(sender.clone()));
        }
        if !self.signature.is_empty() {
            push(
                field::SIGNATURE,
                SignatureType::Signature,
                Value::Signature(self.signature.as_str().to_owned()),
            );
        }
        if !self.unix_fds.is_empty() {
            push(
                field::UNIX_FDS,
                SignatureType::UInt32,
                Value::UInt32(self.unix_fds.len() as u32),
            );
        }
        fields
    }

    /// Encode the complete frame. The serial must already be assigned.
    pub fn to_bytes(&self, endian: Endian) -> Result<BytesMut> {
        if self.serial == 0 {
            return Err(DbusError::InvalidMessage(
                "cannot encode a message without a serial".into(),
            ));
        }

        let mut body = Marshaller::new(endian);
        body.write_body(&self.signature, &self.body)?;
        let body = body.into_inner();

        let mut header = Marshaller::new(endian);
        header.write_u8(endian.marker());
        header.write_u8(self.message_type.code());
        header.write_u8(self.flags.bits());
        header.write_u8(PROTOCOL_VERSION);
        header.write_u32(body.len() as u32);
        header.write_u32(self.serial);
        header.write_value(&header_fields_type(), &Value::Array(self.header_fields()))?;
        header.align(8);

        let mut frame = header.into_inner();
        if frame.len() + body.len() > MAX_MESSAGE_SIZE {
            return Err(DbusError::InvalidMessage(format!(
                "message of {} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit",
                frame.len() + body.len()
            )));
        }
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode one complete frame. Returns `None` for message types this
    /// implementation does not know, which must be ignored.
    pub fn from_bytes(frame: &[u8]) -> Result<Option<Message>> {
        let total = match frame_length(frame, usize::MAX)? {
            Some(total) if total == frame.len() => total,
            Some(total) => {
                return Err(DbusError::InvalidMessage(format!(
                    "frame is {} bytes but its header declares {total}",
                    frame.len()
                )));
            }
            None => return Err(DbusError::InvalidMessage("truncated header".into())),
        };

        let endian = Endian::from_marker(frame[0])
            .ok_or_else(|| DbusError::InvalidMessage("invalid endianness marker".into()))?;
        let Some(message_type) = MessageType::from_code(frame[1]) else {
            return Ok(None);
        };
        let flags = MessageFlags::from_bits_truncate(frame[2]);

        let mut fixed = Unmarshaller::with_position(frame, 4, endian);
        let body_len = fixed.read_u32()? as usize;
        let serial = fixed.read_u32()?;
        if serial == 0 {
            return Err(DbusError::InvalidMessage("serial must be non-zero".into()));
        }

        let mut reader = Unmarshaller::with_position(frame, 12, endian);
        let fields = reader.read_value(&header_fields_type())?;
        reader.align(8)?;
        let body_start = reader.position();

        let mut message = Message {
            message_type,
            flags,
            serial,
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            sender: None,
            signature: signature_tree("")?,
            body: Vec::new(),
            unix_fds: Vec::new(),
            declared_fds: 0,
        };

        let mut declared_fds = 0u32;
        if let Value::Array(items) = fields {
            for item in items {
                let (code, value) = match item {
                    Value::Struct(mut pair) if pair.len() == 2 => {
                        let value = pair.pop();
                        let code = pair.pop();
                        match (code, value) {
                            (Some(Value::Byte(code)), Some(Value::Variant(v))) => (code, v.into_value()),
                            _ => continue,
                        }
                    }
                    _ => continue,
                };
                message.apply_header_field(code, value, &mut declared_fds)?;
            }
        }

        if body_start + body_len != total {
            return Err(DbusError::InvalidMessage(
                "declared body length does not match the frame".into(),
            ));
        }
        let mut body_reader = Unmarshaller::with_position(frame, body_start, endian);
        message.body = body_reader.read_body(&message.signature)?;
        if body_reader.position() != total {
            return Err(DbusError::InvalidMessage(format!(
                "body for signature '{}' consumed {} of {body_len} declared bytes",
                message.signature,
                body_reader.position() - body_start
            )));
        }

        message.check_required()?;
        message.declared_fds = declared_fds;
        Ok(Some(message))
    }

    fn apply_header_field(&mut self, code: u8, value: Value, declared_fds: &mut u32) -> Result<()> {
        let wrong_type = || {
            Err(DbusError::InvalidMessage(format!(
                "header field {code} has the wrong type"
            )))
        };
        match (code, value) {
            (field::PATH, Value::ObjectPath(v)) => self.path = Some(v),
            (field::INTERFACE, Value::Str(v)) => self.interface = Some(v),
            (field::MEMBER, Value::Str(v)) => self.member = Some(v),
            (field::ERROR_NAME, Value::Str(v)) => self.error_name = Some(v),
            (field::REPLY_SERIAL, Value::UInt32(v)) => self.reply_serial = Some(v),
            (field::DESTINATION, Value::Str(v)) => self.destination = Some(v),
            (field::SENDER, Value::Str(v)) => self.sender = Some(v),
            (field::SIGNATURE, Value::Signature(v)) => {
                self.signature = signature_tree(&v)
                    .map_err(|e| DbusError::InvalidMessage(e.to_string()))?;
            }
            (field::UNIX_FDS, Value::UInt32(v)) => *declared_fds = v,
            (field::PATH..=field::UNIX_FDS, _) => return wrong_type(),
            _ => {}
        }
        Ok(())
    }
}

fn header_fields_type() -> SignatureType {
    SignatureType::Array(Box::new(SignatureType::Struct(vec![
        SignatureType::Byte,
        SignatureType::Variant,
    ])))
}

/// Compute the total frame length once the fixed header is buffered.
///
/// Returns `Ok(None)` while fewer than [`FIXED_HEADER_LEN`] bytes are present.
pub fn frame_length(buf: &[u8], max_message_size: usize) -> Result<Option<usize>> {
    if buf.len() < FIXED_HEADER_LEN {
        return Ok(None);
    }
    let endian = Endian::from_marker(buf[0]).ok_or_else(|| {
        DbusError::InvalidMessage(format!("invalid endianness marker 0x{:02x}", buf[0]))
    })?;
    if buf[3] != PROTOCOL_VERSION {
        return Err(DbusError::InvalidMessage(format!(
            "unsupported protocol version {}",
            buf[3]
        )));
    }

    let mut reader = Unmarshaller::with_position(&buf[..FIXED_HEADER_LEN], 4, endian);
    let body_len = reader.read_u32()? as u64;
    let _serial = reader.read_u32()?;
    let fields_len = reader.read_u32()? as u64;

    let header_end = FIXED_HEADER_LEN as u64 + fields_len;
    let body_start = header_end + padding_for(header_end as usize, 8) as u64;
    let total = body_start + body_len;
    let limit = max_message_size.min(MAX_MESSAGE_SIZE) as u64;
    if total > limit {
        return Err(DbusError::InvalidMessage(format!(
            "message of {total} bytes exceeds the {limit} byte limit"
        )));
    }
    Ok(Some(total as usize))
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} serial={}", self.message_type, self.serial)?;
        if let Some(reply_serial) = self.reply_serial {
            write!(f, " reply_serial={reply_serial}")?;
        }
        for (label, value) in [
            ("sender", &self.sender),
            ("destination", &self.destination),
            ("path", &self.path),
            ("interface", &self.interface),
            ("member", &self.member),
            ("error", &self.error_name),
        ] {
            if let Some(value) = value {
                write!(f, " {label}={value}")?;
            }
        }
        write!(f, " signature={:?}", self.signature.as_str())
    }
}

/// Builder for [`Message`].
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message_type: MessageType,
    flags: MessageFlags,
    serial: u32,
    destination: Option<String>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u32>,
    sender: Option<String>,
    signature: String,
    body: Vec<Value>,
    unix_fds: Vec<Arc<OwnedFd>>,
    validate: bool,
}

impl MessageBuilder {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: MessageFlags::NONE,
            serial: 0,
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            sender: None,
            signature: String::new(),
            body: Vec::new(),
            unix_fds: Vec::new(),
            validate: true,
        }
    }

    pub fn flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
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

    pub fn error_name(mut self, error_name: impl Into<String>) -> Self {
        self.error_name = Some(error_name.into());
        self
    }

    pub fn reply_serial(mut self, reply_serial: u32) -> Self {
        self.reply_serial = Some(reply_serial);
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }

    pub fn unix_fds(mut self, fds: Vec<Arc<OwnedFd>>) -> Self {
        self.unix_fds = fds;
        self
    }

    /// Toggle name and body validation. Required fields are always checked.
    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn build(self) -> Result<Message> {
        if self.validate {
            if let Some(destination) = &self.destination {
                assert_bus_name_valid(destination)?;
            }
            if let Some(path) = &self.path {
                assert_object_path_valid(path)?;
            }
            if let Some(interface) = &self.interface {
                assert_interface_name_valid(interface)?;
            }
            if let Some(member) = &self.member {
                assert_member_name_valid(member)?;
            }
            if let Some(error_name) = &self.error_name {
                assert_interface_name_valid(error_name)?;
            }
            if let Some(sender) = &self.sender {
                assert_bus_name_valid(sender)?;
            }
        }

        let signature = signature_tree(&self.signature)?;
        if self.validate {
            signature.verify(&self.body)?;
        }

        let message = Message {
            message_type: self.message_type,
            flags: self.flags,
            serial: self.serial,
            destination: self.destination,
            path: self.path,
            interface: self.interface,
            member: self.member,
            error_name: self.error_name,
            reply_serial: self.reply_serial,
            sender: self.sender,
            signature,
            body: self.body,
            declared_fds: self.unix_fds.len() as u32,
            unix_fds: self.unix_fds,
        };
        message.check_required()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn call_without_member_fails() {
        let err = Message::builder(MessageType::MethodCall)
            .path("/t")
            .build()
            .unwrap_err();
        assert!(matches!(err, DbusError::InvalidMessage(_)));
    }

    #[test]
    fn signal_without_interface_fails() {
        assert!(Message::builder(MessageType::Signal)
            .path("/t")
            .member("Changed")
            .build()
            .is_err());
    }

    #[test]
    fn error_without_reply_serial_fails() {
        assert!(Message::builder(MessageType::Error)
            .error_name("org.example.Error.Failed")
            .build()
            .is_err());
    }

    #[test]
    fn validation_can_be_disabled_but_not_required_fields() {
        let msg = Message::method_call("not a path", "Bad Member")
            .validate(false)
            .build();
        assert!(msg.is_ok());
        assert!(Message::builder(MessageType::MethodReturn)
            .validate(false)
            .build()
            .is_err());
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(Message::method_call("/t", "Echo").interface("noDots").build().is_err());
        assert!(Message::method_call("/t/", "Echo").build().is_err());
        assert!(Message::method_call("/t", "Echo").destination("a..b").build().is_err());
    }

    #[test]
    fn frame_roundtrip_keeps_header() {
        let msg = Message::method_call("/org/example", "Echo")
            .interface("org.example.Echo")
            .destination("org.example.Service")
            .signature("s")
            .body(vec![Value::from("hello")])
            .serial(9)
            .build()
            .unwrap();
        let bytes = msg.to_bytes(Endian::Little).unwrap();
        assert_eq!(bytes[0], b'l');
        assert_eq!(bytes[3], PROTOCOL_VERSION);
        assert_eq!(frame_length(&bytes, MAX_MESSAGE_SIZE).unwrap(), Some(bytes.len()));

        let decoded = Message::from_bytes(&bytes).unwrap().unwrap();
        assert_eq!(decoded.serial(), 9);
        assert_eq!(decoded.path(), Some("/org/example"));
        assert_eq!(decoded.interface(), Some("org.example.Echo"));
        assert_eq!(decoded.destination(), Some("org.example.Service"));
        assert_eq!(decoded.body(), &[Value::from("hello")]);
    }

    #[test]
    fn new_error_addresses_the_caller() {
        let mut call = Message::method_call("/t", "Echo").serial(4).build().unwrap();
        call.set_sender(":1.7");
        let err = Message::new_error(&call, "org.example.Error.Nope", "nope").unwrap();
        assert_eq!(err.reply_serial(), Some(4));
        assert_eq!(err.destination(), Some(":1.7"));
        assert_eq!(err.signature(), "s");
    }

    #[test]
    fn unknown_message_type_is_ignored() {
        let msg = Message::new_signal("/t", "org.example.I", "S", "", vec![]).unwrap();
        let mut msg = msg;
        msg.set_serial(1);
        let mut bytes = msg.to_bytes(Endian::Little).unwrap();
        bytes[1] = 42;
        assert!(Message::from_bytes(&bytes).unwrap().is_none());
    }

    #[test]
    fn rejects_wrong_protocol_version() {
        let mut msg = Message::new_signal("/t", "org.example.I", "S", "", vec![]).unwrap();
        msg.set_serial(1);
        let mut bytes = msg.to_bytes(Endian::Little).unwrap();
        bytes[3] = 2;
        assert!(matches!(
            frame_length(&bytes, MAX_MESSAGE_SIZE),
            Err(DbusError::InvalidMessage(_))
        ));
    }
}
