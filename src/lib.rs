//! # dbus-wire
//!
//! Asynchronous D-Bus client and service engine built on Tokio.
//!
//! ## Layers
//! - [`core`]: signatures, values, marshalling and the message model
//! - [`protocol`]: name validation, SASL authentication, introspection XML
//! - [`transport`]: bus addresses and the sockets they resolve to
//! - [`service`]: the connection engine, exported interfaces and proxies
//! - [`utils`]: logging, metrics and timeouts
//!
//! ## Quick Start
//! ```rust,no_run
//! use dbus_wire::{BusConfig, MessageBus, ServiceInterface, Value};
//! use std::sync::Arc;
//!
//! # async fn demo() -> dbus_wire::Result<()> {
//! let bus = MessageBus::connect(&BusConfig::default()).await?;
//!
//! let echo = ServiceInterface::builder("org.example.Echo")
//!     .method("Echo", "s", "s", |call| async move { Ok(call.into_args()) })
//!     .build()?;
//! bus.export("/t", Arc::new(echo)).await?;
//! bus.request_name("org.example.Echo", Default::default()).await?;
//!
//! let proxy = dbus_wire::ProxyObject::introspect_from(&bus, "org.example.Echo", "/t").await?;
//! let reply = proxy
//!     .get_interface("org.example.Echo")?
//!     .call("Echo", vec![Value::from("hi")])
//!     .await?;
//! assert_eq!(reply, vec![Value::from("hi")]);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used)]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::BusConfig;
pub use core::message::{Message, MessageBuilder, MessageFlags, MessageType};
pub use core::signature::{SignatureTree, SignatureType};
pub use core::value::{Value, Variant};
pub use error::{DbusError, RemoteError, Result};
pub use service::{MessageBus, ProxyInterface, ProxyObject, ServiceInterface};
