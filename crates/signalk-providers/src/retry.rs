//! Reconnect policy for unreliable links.
//!
//! A link reports what happened to its connection and the policy answers
//! with what to do next:
//!
//! | event              | reconnect = true                    | reconnect = false |
//! |--------------------|-------------------------------------|-------------------|
//! | error              | retry until `max_retries`, then suspend for `cooldown` | stop |
//! | peer closed        | reconnect immediately               | stop              |
//! | link went stale    | reconnect immediately               | stop              |
//! | cooldown elapsed   | reset retries, reconnect            | n/a               |
//!
//! A successful connection resets the retry counter.

use std::time::Duration;

use serde::Serialize;

/// Used when `max_retries` is zero.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Connection state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connecting,
    Connected,
    /// Waiting out the cooldown after too many consecutive errors.
    Suspended,
    /// Stopped for good: shut down, or one-shot link that ended.
    Closed,
}

/// What a link should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Reconnect,
    Suspend(Duration),
    Stop,
}

/// Retry bookkeeping for one link.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    reconnect: bool,
    max_retries: u32,
    cooldown: Duration,
    retries: u32,
}

impl RetryPolicy {
    pub fn new(reconnect: bool, max_retries: u32, cooldown: Duration) -> Self {
        Self {
            reconnect,
            max_retries: if max_retries == 0 {
                DEFAULT_MAX_RETRIES
            } else {
                max_retries
            },
            cooldown,
            retries: 0,
        }
    }

    /// A connection attempt or an open connection failed.
    pub fn on_error(&mut self) -> Decision {
        if !self.reconnect {
            return Decision::Stop;
        }
        self.retries += 1;
        if self.retries < self.max_retries {
            Decision::Reconnect
        } else {
            Decision::Suspend(self.cooldown)
        }
    }

    /// The peer closed the connection.
    pub fn on_close(&mut self) -> Decision {
        if self.reconnect {
            Decision::Reconnect
        } else {
            Decision::Stop
        }
    }

    /// Nothing was received for too long. Does not count as a retry.
    pub fn on_stale(&mut self) -> Decision {
        self.on_close()
    }

    pub fn on_connected(&mut self) {
        self.retries = 0;
    }

    pub fn on_cooldown_elapsed(&mut self) {
        self.retries = 0;
    }

    /// Consecutive failures since the last connect or cooldown.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
