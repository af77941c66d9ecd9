//! Bus address parsing and resolution.
//!
//! Addresses have the form `transport:key=value,key=value;transport2:...`.
//! Values may contain `%xx` escapes. Entries are tried in order.

use crate::config::BusType;
use crate::error::{DbusError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Fallback system bus socket
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";
pub const SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";

const MACHINE_ID_PATHS: [&str; 2] = ["/var/lib/dbus/machine-id", "/etc/machine-id"];

/// One `transport:options` entry of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    transport: String,
    options: BTreeMap<String, String>,
}

impl AddressEntry {
    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Server GUID, when the address names one.
    pub fn guid(&self) -> Option<&str> {
        self.get("guid")
    }

    fn check(&self) -> Result<()> {
        match self.transport.as_str() {
            "unix" => {
                let targets = ["path", "abstract"]
                    .iter()
                    .filter(|k| self.options.contains_key(**k))
                    .count();
                if targets != 1 {
                    return Err(DbusError::InvalidAddress(format!(
                        "unix address needs exactly one of path= or abstract=: {self}"
                    )));
                }
            }
            "tcp" => {
                let port = self.get("port").ok_or_else(|| {
                    DbusError::InvalidAddress(format!("tcp address needs port=: {self}"))
                })?;
                port.parse::<u16>().map_err(|_| {
                    DbusError::InvalidAddress(format!("invalid tcp port '{port}'"))
                })?;
                if let Some(family) = self.get("family") {
                    if family != "ipv4" && family != "ipv6" {
                        return Err(DbusError::InvalidAddress(format!(
                            "invalid tcp family '{family}'"
                        )));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for AddressEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.transport)?;
        for (i, (k, v)) in self.options.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{k}={}", escape_value(v))?;
        }
        Ok(())
    }
}

fn unescape_value(raw: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = raw.get(i + 1..i + 3).ok_or_else(|| {
                DbusError::InvalidAddress(format!("truncated escape in '{raw}'"))
            })?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| {
                DbusError::InvalidAddress(format!("invalid escape '%{hex}' in '{raw}'"))
            })?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| DbusError::InvalidAddress(format!("escaped value '{raw}' is not UTF-8")))
}

/// Escape a value for use in an address.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"-_/.\\*".contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02x}"));
        }
    }
    out
}

/// Parse a full address list.
pub fn parse_address(address: &str) -> Result<Vec<AddressEntry>> {
    let mut entries = Vec::new();
    for raw in address.split(';').filter(|s| !s.is_empty()) {
        let (transport, options) = raw.split_once(':').ok_or_else(|| {
            DbusError::InvalidAddress(format!("address entry '{raw}' has no transport"))
        })?;
        if transport.is_empty() {
            return Err(DbusError::InvalidAddress(format!(
                "address entry '{raw}' has an empty transport"
            )));
        }

        let mut parsed = BTreeMap::new();
        for option in options.split(',').filter(|s| !s.is_empty()) {
            let (key, value) = option.split_once('=').ok_or_else(|| {
                DbusError::InvalidAddress(format!("option '{option}' is not key=value"))
            })?;
            if key.is_empty() {
                return Err(DbusError::InvalidAddress(format!("option '{option}' has no key")));
            }
            if parsed.insert(key.to_owned(), unescape_value(value)?).is_some() {
                return Err(DbusError::InvalidAddress(format!("duplicate option '{key}'")));
            }
        }

        let entry = AddressEntry {
            transport: transport.to_owned(),
            options: parsed,
        };
        entry.check()?;
        entries.push(entry);
    }

    if entries.is_empty() {
        return Err(DbusError::InvalidAddress(format!("no entries in '{address}'")));
    }
    Ok(entries)
}

/// Resolve the address for a bus type from the environment and platform defaults.
pub fn bus_address(bus_type: BusType) -> Result<String> {
    match bus_type {
        BusType::Session => session_bus_address(),
        BusType::System => Ok(system_bus_address()),
    }
}

pub fn session_bus_address() -> Result<String> {
    session_bus_address_from(|key| std::env::var(key).ok())
}

pub fn system_bus_address() -> String {
    std::env::var(SYSTEM_BUS_ENV).unwrap_or_else(|_| DEFAULT_SYSTEM_BUS_ADDRESS.to_owned())
}

/// Session address lookup over an arbitrary environment.
pub fn session_bus_address_from<F>(env: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(address) = env(SESSION_BUS_ENV).filter(|a| !a.is_empty()) {
        return Ok(address);
    }

    if let Some(runtime_dir) = env("XDG_RUNTIME_DIR") {
        let socket = Path::new(&runtime_dir).join("bus");
        if socket.exists() {
            return Ok(format!("unix:path={}", escape_value(&socket.to_string_lossy())));
        }
    }

    if let (Some(display), Some(home)) = (env("DISPLAY"), env("HOME")) {
        if let Some(address) = x11_session_address(&display, Path::new(&home)) {
            return Ok(address);
        }
    }

    Err(DbusError::InvalidAddress(
        "could not determine the session bus address".into(),
    ))
}

/// Display number from `DISPLAY` (`host:N.screen`).
fn display_number(display: &str) -> Option<&str> {
    let (_, rest) = display.rsplit_once(':')?;
    let number = rest.split('.').next()?;
    (!number.is_empty() && number.bytes().all(|b| b.is_ascii_digit())).then_some(number)
}

fn machine_id() -> Option<String> {
    MACHINE_ID_PATHS.iter().find_map(|path| {
        std::fs::read_to_string(path)
            .ok()
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty())
    })
}

/// Legacy lookup file written by `dbus-launch` for X11 sessions.
pub fn x11_session_file(home: &Path, machine_id: &str, display: &str) -> Option<PathBuf> {
    let number = display_number(display)?;
    Some(
        home.join(".dbus")
            .join("session-bus")
            .join(format!("{machine_id}-{number}")),
    )
}

/// Extract the address line from a session-bus lookup file.
pub fn parse_session_file(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let value = line.trim().strip_prefix("DBUS_SESSION_BUS_ADDRESS=")?;
        let value = value.trim_matches(|c| c == '\'' || c == '"');
        (!value.is_empty()).then(|| value.to_owned())
    })
}

fn x11_session_address(display: &str, home: &Path) -> Option<String> {
    let id = machine_id()?;
    let file = x11_session_file(home, &id, display)?;
    parse_session_file(&std::fs::read_to_string(file).ok()?)
}
