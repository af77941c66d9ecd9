//! Well-known name to unique name resolution.
//!
//! Seeded by `GetNameOwner` replies and by the sender of replies to calls
//! addressed to a well-known name, then kept current through the bus
//! daemon's `NameOwnerChanged` signal.

use crate::core::message::{Message, MessageType};
use crate::protocol::names;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;

#[derive(Debug, Clone, Default)]
pub struct NameOwnerCache {
    owners: Arc<RwLock<HashMap<String, String>>>,
}

impl NameOwnerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unique name currently owning `name`, if known.
    pub fn get(&self, name: &str) -> Option<String> {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn set(&self, name: impl Into<String>, owner: impl Into<String>) {
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), owner.into());
    }

    pub fn remove(&self, name: &str) -> Option<String> {
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn len(&self) -> usize {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Apply a `NameOwnerChanged(name, old, new)` signal.
    ///
    /// Only signals sent by the bus daemon from its own path and interface
    /// are honoured. Returns whether the cache was updated.
    pub fn apply_owner_changed(&self, message: &Message) -> bool {
        if !is_name_owner_changed(message) {
            return false;
        }
        let body = message.body();
        let (Some(name), Some(new_owner)) = (
            body.first().and_then(|v| v.as_str()),
            body.get(2).and_then(|v| v.as_str()),
        ) else {
            return false;
        };
        // unique names are never cached against themselves
        if name.starts_with(':') {
            return false;
        }
        trace!(name, new_owner, "Name owner changed");
        if new_owner.is_empty() {
            self.remove(name);
        } else {
            self.set(name, new_owner);
        }
        true
    }

    /// Whether `sender` is `expected` itself or its cached owner.
    pub fn sender_matches(&self, expected: &str, sender: Option<&str>) -> bool {
        let Some(sender) = sender else {
            return false;
        };
        if expected == sender {
            return true;
        }
        self.get(expected).is_some_and(|owner| owner == sender)
    }
}

pub(crate) fn is_name_owner_changed(message: &Message) -> bool {
    message.message_type() == MessageType::Signal
        && message.sender() == Some(names::BUS_NAME)
        && message.path() == Some(names::BUS_PATH)
        && message.interface() == Some(names::BUS_INTERFACE)
        && message.member() == Some(names::NAME_OWNER_CHANGED)
        && message.signature() == "sss"
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::core::value::Value;

    fn owner_changed(sender: &str, name: &str, old: &str, new: &str) -> Message {
        Message::signal(names::BUS_PATH, names::BUS_INTERFACE, names::NAME_OWNER_CHANGED)
            .sender(sender)
            .signature("sss")
            .body(vec![Value::from(name), Value::from(old), Value::from(new)])
            .build()
            .unwrap()
    }

    #[test]
    fn test_owner_changed_updates_cache() {
        let cache = NameOwnerCache::new();
        assert!(cache.apply_owner_changed(&owner_changed(
            names::BUS_NAME,
            "org.example.Svc",
            "",
            ":1.7"
        )));
        assert_eq!(cache.get("org.example.Svc").as_deref(), Some(":1.7"));
        assert!(cache.sender_matches("org.example.Svc", Some(":1.7")));
        assert!(!cache.sender_matches("org.example.Svc", Some(":1.8")));

        cache.apply_owner_changed(&owner_changed(names::BUS_NAME, "org.example.Svc", ":1.7", ""));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_spoofed_owner_changed_is_ignored() {
        let cache = NameOwnerCache::new();
        assert!(!cache.apply_owner_changed(&owner_changed(
            ":1.99",
            "org.example.Svc",
            "",
            ":1.99"
        )));
        assert!(cache.get("org.example.Svc").is_none());
    }

    #[test]
    fn test_exact_sender_matches_without_cache() {
        let cache = NameOwnerCache::new();
        assert!(cache.sender_matches(":1.3", Some(":1.3")));
        assert!(!cache.sender_matches(":1.3", None));
    }
}
