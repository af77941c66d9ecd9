//! # Core Protocol Components
//!
//! Type signatures, values, and the binary wire format.
//!
//! This module provides the foundation of the engine: everything needed to turn
//! a [`Message`](message::Message) into bytes and back, with no I/O involved.
//!
//! ## Components
//! - **Signature**: parsed type signatures, value verification and coercion
//! - **Value**: dynamically typed values and self-describing variants
//! - **Marshal / Unmarshal**: body encoding with D-Bus alignment rules
//! - **Message**: header model, required fields, frame encode/decode
//! - **Codec**: Tokio codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [endian(1)] [type(1)] [flags(1)] [version(1)] [body_len(4)] [serial(4)]
//! [fields a(yv)] [pad to 8] [body]
//! ```
//!
//! ## Limits
//! - Maximum message size: 128 MiB
//! - Maximum array payload: 64 MiB
//! - Lengths are validated before any allocation

pub mod codec;
pub mod marshal;
pub mod message;
pub mod signature;
pub mod unmarshal;
pub mod value;
