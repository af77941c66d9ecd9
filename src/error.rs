//! # Error Types
//!
//! Error handling for the D-Bus engine.
//!
//! This module defines every error variant that can occur while connecting to a
//! bus, encoding and decoding messages, dispatching exported objects and talking
//! to remote objects through proxies.
//!
//! ## Error Categories
//! - **Type errors**: malformed signatures, values that do not match a signature
//! - **Name errors**: bus names, object paths, interface and member names that fail grammar checks
//! - **Wire errors**: structurally invalid frames (fatal to the connection)
//! - **Session errors**: authentication failure, disconnection, timeouts
//! - **Remote errors**: error replies carrying a D-Bus error name, text and body
//! - **Client / internal errors**: unexpected replies, library-side faults
//!
//! ## Example Usage
//! ```rust
//! use dbus_wire::error::{DbusError, Result};
//! use dbus_wire::protocol::validators::assert_object_path_valid;
//!
//! fn check(path: &str) -> Result<()> {
//!     assert_object_path_valid(path)?;
//!     Ok(())
//! }
//!
//! assert!(check("/org/example").is_ok());
//! assert!(matches!(check("org/example"), Err(DbusError::InvalidObjectPath(_))));
//! ```

use crate::core::value::Value;
use std::fmt;
use std::io;
use thiserror::Error;

/// Well-known error names exchanged on the bus.
pub mod constants {
    pub const SERVICE_ERROR: &str = "org.dbuswire.Error.Service";
    pub const INTERNAL_ERROR: &str = "org.dbuswire.Error.Internal";
    pub const CLIENT_ERROR: &str = "org.dbuswire.Error.Client";

    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const NO_MEMORY: &str = "org.freedesktop.DBus.Error.NoMemory";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const IO_ERROR: &str = "org.freedesktop.DBus.Error.IOError";
    pub const BAD_ADDRESS: &str = "org.freedesktop.DBus.Error.BadAddress";
    pub const NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";
    pub const LIMITS_EXCEEDED: &str = "org.freedesktop.DBus.Error.LimitsExceeded";
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    pub const AUTH_FAILED: &str = "org.freedesktop.DBus.Error.AuthFailed";
    pub const NO_SERVER: &str = "org.freedesktop.DBus.Error.NoServer";
    pub const TIMEOUT: &str = "org.freedesktop.DBus.Error.Timeout";
    pub const NO_NETWORK: &str = "org.freedesktop.DBus.Error.NoNetwork";
    pub const ADDRESS_IN_USE: &str = "org.freedesktop.DBus.Error.AddressInUse";
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const FILE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.FileNotFound";
    pub const FILE_EXISTS: &str = "org.freedesktop.DBus.Error.FileExists";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const TIMED_OUT: &str = "org.freedesktop.DBus.Error.TimedOut";
    pub const MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";
    pub const MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
    pub const INVALID_SIGNATURE: &str = "org.freedesktop.DBus.Error.InvalidSignature";
    pub const INCONSISTENT_MESSAGE: &str = "org.freedesktop.DBus.Error.InconsistentMessage";
    pub const INTERACTIVE_AUTHORIZATION_REQUIRED: &str =
        "org.freedesktop.DBus.Error.InteractiveAuthorizationRequired";

    /// Messages for common library faults
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
    pub const ERR_ENGINE_GONE: &str = "Connection engine is no longer running";
    pub const ERR_NOT_CONNECTED: &str = "Not connected";
}

/// An error reply received from (or destined for) a peer on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    /// Interface-shaped error name, e.g. `org.freedesktop.DBus.Error.UnknownMethod`
    pub name: String,
    /// Human readable text (first `s` body member, when present)
    pub text: String,
    /// Complete error body
    pub body: Vec<Value>,
}

impl RemoteError {
    /// Build a remote error with a single text body.
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            name: name.into(),
            body: vec![Value::Str(text.clone())],
            text,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.text)
        }
    }
}

// DbusError is the primary error type for all bus operations
#[derive(Error, Debug)]
pub enum DbusError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Signature and body mismatch: {0}")]
    SignatureBodyMismatch(String),

    #[error("Invalid bus name: {0}")]
    InvalidBusName(String),

    #[error("Invalid object path: {0}")]
    InvalidObjectPath(String),

    #[error("Invalid interface name: {0}")]
    InvalidInterfaceName(String),

    #[error("Invalid member name: {0}")]
    InvalidMemberName(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid introspection data: {0}")]
    InvalidIntrospection(String),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Remote(Box<RemoteError>),

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl DbusError {
    /// Shorthand for a [`DbusError::Remote`] with a text body.
    pub fn remote(name: impl Into<String>, text: impl Into<String>) -> Self {
        DbusError::Remote(Box::new(RemoteError::new(name, text)))
    }

    /// The D-Bus error name used when this error is sent back as an error reply.
    pub fn error_name(&self) -> &str {
        match self {
            DbusError::Remote(remote) => &remote.name,
            DbusError::InvalidSignature(_) => constants::INVALID_SIGNATURE,
            DbusError::SignatureBodyMismatch(_) => constants::INVALID_ARGS,
            DbusError::InvalidBusName(_)
            | DbusError::InvalidObjectPath(_)
            | DbusError::InvalidInterfaceName(_)
            | DbusError::InvalidMemberName(_) => constants::INVALID_ARGS,
            DbusError::Disconnected(_) => constants::DISCONNECTED,
            DbusError::Timeout => constants::TIMEOUT,
            DbusError::Auth(_) => constants::AUTH_FAILED,
            DbusError::Client(_) => constants::CLIENT_ERROR,
            DbusError::Internal(_) => constants::INTERNAL_ERROR,
            _ => constants::SERVICE_ERROR,
        }
    }

    /// Text placed in the body of an error reply built from this error.
    pub fn reply_text(&self) -> String {
        match self {
            DbusError::Remote(remote) => remote.text.clone(),
            other => other.to_string(),
        }
    }

    /// Borrow the remote error, if this is one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            DbusError::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

impl From<RemoteError> for DbusError {
    fn from(remote: RemoteError) -> Self {
        DbusError::Remote(Box::new(remote))
    }
}

/// Type alias for Results using DbusError
pub type Result<T> = std::result::Result<T, DbusError>;
