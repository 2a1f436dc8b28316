//! # signalk-protocol
//!
//! SignalK protocol message types and codec.
//!
//! This crate defines the messages a SignalK server streams to its clients
//! and the codec that turns text frames from transports and peers into them.

pub mod codec;
pub mod messages;

pub use codec::*;
pub use messages::*;
