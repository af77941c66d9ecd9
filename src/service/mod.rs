//! # Service Layer
//!
//! The connection engine and everything built on top of it.
//!
//! ## Components
//! - **Bus**: [`MessageBus`](bus::MessageBus) handle, serial allocation,
//!   reply correlation, message handlers and signal subscriptions
//! - **Interface**: [`ServiceInterface`](interface::ServiceInterface) with
//!   methods, properties and signals backed by async handlers
//! - **Export**: object table, call routing and the standard interfaces
//!   answered on behalf of exported objects
//! - **Name owner**: well-known name to unique name cache
//! - **Proxy**: typed client access to remote objects
//!
//! ## Concurrency
//! One engine task owns the socket halves and the pending-call table.
//! Handles talk to it over an unbounded command channel, so ordering of
//! outgoing messages is the order in which they were queued.

pub mod bus;
pub mod export;
pub mod interface;
pub mod name_owner;
pub mod proxy;

pub use bus::{
    ConnectionState, HandlerId, HandlerOutcome, MessageBus, NameFlags, ReleaseNameReply,
    RequestNameReply, SignalFilter, SignalStream,
};
pub use interface::{MethodCall, MethodOutput, ServiceInterface, ServiceInterfaceBuilder};
pub use name_owner::NameOwnerCache;
pub use proxy::{ProxyInterface, ProxyObject, ProxySignalStream};
