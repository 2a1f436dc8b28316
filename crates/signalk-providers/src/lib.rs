//! # signalk-providers
//!
//! Data providers for the SignalK hub.
//!
//! This crate provides the resilient-ingestion side of the server:
//! - [`TcpTransport`]: reconnecting TCP link governed by a [`RetryPolicy`]
//! - [`TcpDeltaProvider`]: newline-delimited deltas over TCP
//! - [`FileReplayProvider`]: deltas replayed from a file
//! - [`DiscoveryBridge`]: subscriptions to peer servers found by mDNS or
//!   configured as seed hosts
//!
//! Every provider runs as a tokio task, sends
//! [`ServerEvent`](signalk_server::ServerEvent)s to the hub and stops when its
//! shutdown watch channel is set.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

pub mod discovery;
pub mod framing;
pub mod replay;
pub mod retry;
pub mod tcp;

pub use discovery::{DiscoveryBridge, DiscoveryConfig, DiscoveryError};
pub use framing::LineFramer;
pub use replay::FileReplayProvider;
pub use retry::{Decision, LinkState, RetryPolicy};
pub use tcp::{LinkStatus, TcpDeltaProvider, TcpTransport, TcpTransportConfig, TransportError};

/// Deserialize a duration given in (fractional) seconds.
pub(crate) fn duration_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
