//! # Protocol Layer
//!
//! Everything above raw bytes and below the connection engine.
//!
//! ## Components
//! - **Validators**: grammar checks for bus names, object paths, interfaces and members
//! - **Auth**: SASL line exchange that precedes binary framing
//! - **Introspection**: the `<node>` XML model and its parser/serializer
//! - **Names**: the bus daemon and standard interface names
//!
//! ## Ordering
//! Authentication must complete before any message is framed; the engine
//! only starts its reader and writer tasks after `BEGIN` has been written.

pub mod auth;
pub mod introspection;
pub mod names;
pub mod validators;

#[cfg(test)]
mod tests;
