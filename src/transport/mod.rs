//! # Transport Layer
//!
//! Bus addresses and the byte streams they resolve to.
//!
//! ## Components
//! - **Address**: parsing of `transport:key=value,...;...` strings and
//!   session/system bus discovery
//! - **Stream**: unix and tcp sockets with unix fd passing on unix sockets
//!
//! The engine owns one [`stream::BusStream`] per connection and drives it
//! from separate reader and writer tasks.

pub mod address;
pub mod stream;
