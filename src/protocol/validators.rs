//! Name and path grammar checks.
//!
//! Each `is_*_valid` predicate has an `assert_*_valid` twin returning the
//! matching [`DbusError`] variant.

use crate::error::{DbusError, Result};

/// Maximum length of bus, interface and member names
pub const MAX_NAME_LEN: usize = 255;

fn is_name_start(c: char, allow_dash: bool) -> bool {
    c.is_ascii_alphabetic() || c == '_' || (allow_dash && c == '-')
}

fn is_name_char(c: char, allow_dash: bool) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || (allow_dash && c == '-')
}

fn dotted_segments_valid(name: &str, allow_dash: bool, digit_start: bool) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.starts_with('.') {
        return false;
    }
    let mut segments = 0;
    for segment in name.split('.') {
        let mut chars = segment.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        let start_ok = is_name_start(first, allow_dash) || (digit_start && first.is_ascii_digit());
        if !start_ok || !chars.all(|c| is_name_char(c, allow_dash)) {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

/// Bus names are unique (`:1.42`) or well-known (`org.example.Service`).
pub fn is_bus_name_valid(name: &str) -> bool {
    if let Some(unique) = name.strip_prefix(':') {
        return !unique.is_empty() && dotted_segments_valid(unique, true, true);
    }
    dotted_segments_valid(name, true, false)
}

/// Object paths are `/` or `/`-separated segments of `[A-Za-z0-9_]+`.
pub fn is_object_path_valid(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

pub fn is_interface_name_valid(name: &str) -> bool {
    dotted_segments_valid(name, false, false)
}

pub fn is_member_name_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if is_name_start(first, false) => chars.all(|c| is_name_char(c, true)),
        _ => false,
    }
}

pub fn assert_bus_name_valid(name: &str) -> Result<()> {
    if is_bus_name_valid(name) {
        Ok(())
    } else {
        Err(DbusError::InvalidBusName(name.to_owned()))
    }
}

pub fn assert_object_path_valid(path: &str) -> Result<()> {
    if is_object_path_valid(path) {
        Ok(())
    } else {
        Err(DbusError::InvalidObjectPath(path.to_owned()))
    }
}

pub fn assert_interface_name_valid(name: &str) -> Result<()> {
    if is_interface_name_valid(name) {
        Ok(())
    } else {
        Err(DbusError::InvalidInterfaceName(name.to_owned()))
    }
}

pub fn assert_member_name_valid(name: &str) -> Result<()> {
    if is_member_name_valid(name) {
        Ok(())
    } else {
        Err(DbusError::InvalidMemberName(name.to_owned()))
    }
}
