//! Well-known names of the bus daemon and the standard interfaces.

pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";
pub const PEER: &str = "org.freedesktop.DBus.Peer";
pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
pub const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";

/// Interfaces every exported path answers implicitly
pub const STANDARD_INTERFACES: [&str; 4] = [INTROSPECTABLE, PEER, PROPERTIES, OBJECT_MANAGER];

pub const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";
pub const INTERFACES_ADDED: &str = "InterfacesAdded";
pub const INTERFACES_REMOVED: &str = "InterfacesRemoved";

/// Match rule for the standing name-owner subscription
pub const NAME_OWNER_MATCH_RULE: &str = "sender='org.freedesktop.DBus',interface='org.freedesktop.DBus',path='/org/freedesktop/DBus',member='NameOwnerChanged'";

pub fn is_standard_interface(name: &str) -> bool {
    STANDARD_INTERFACES.contains(&name)
}
