//! # signalk-server
//!
//! The SignalK delta hub.
//!
//! Providers send deltas to [`SignalKServer`] over an mpsc queue. A single
//! worker normalizes each delta, fans its values out on the
//! [`StreamBundle`] distribution bus and records it in the
//! [`DeltaCache`](signalk_core::DeltaCache).

pub mod server;
pub mod statistics;
pub mod streambundle;

pub use server::{ServerConfig, ServerError, ServerEvent, SignalKServer};
pub use signalk_core::{Delta, DeltaCache, MetadataLookup};
pub use statistics::{HubStatistics, StatisticsSnapshot};
pub use streambundle::{BusError, BusHandle, NormalizedValue, StreamBundle, META_SUFFIX, SCHEMA_SOURCE};
