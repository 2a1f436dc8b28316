//! Reconnecting TCP link.
//!
//! [`TcpTransport`] owns an outbound TCP connection and keeps it alive
//! according to a [`RetryPolicy`]. Inbound bytes are forwarded unmodified on
//! an mpsc channel whatever the connection state, so consumers see a single
//! stream across reconnects.
//!
//! A liveness timer fires every `timeout` while connected. If nothing has
//! been received for longer than `stale_after` (or nothing ever), the link
//! is torn down and reconnected.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use signalk_server::ServerEvent;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::duration_secs;
use crate::framing::{decode_lines, LineFramer};
use crate::retry::{Decision, LinkState, RetryPolicy, DEFAULT_MAX_RETRIES};

const READ_BUFFER: usize = 8 * 1024;

/// Errors from a link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("link is closed")]
    Closed,

    #[error("hub is not accepting events")]
    HubClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration of a TCP link.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpTransportConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Liveness timer period, in seconds when deserialized.
    #[serde(default = "default_timeout", deserialize_with = "duration_secs")]
    pub timeout: Duration,
    #[serde(default = "default_stale_after", deserialize_with = "duration_secs")]
    pub stale_after: Duration,
    #[serde(default = "default_timeout", deserialize_with = "duration_secs")]
    pub cooldown: Duration,
}

fn default_reconnect() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout() -> Duration {
    Duration::from_secs(150)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(18_000)
}

impl TcpTransportConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            reconnect: default_reconnect(),
            max_retries: default_max_retries(),
            timeout: default_timeout(),
            stale_after: default_stale_after(),
            cooldown: default_timeout(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.reconnect, self.max_retries, self.cooldown)
    }
}

/// Current state of a link and the number of connection attempts so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub attempts: u64,
}

/// Handle to a running TCP link.
pub struct TcpTransport {
    status: watch::Receiver<LinkStatus>,
    write_tx: mpsc::Sender<Bytes>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TcpTransport {
    /// Start connecting. Returns the handle and the inbound byte stream.
    pub fn spawn(config: TcpTransportConfig) -> (Self, mpsc::Receiver<Bytes>) {
        let (data_tx, data_rx) = mpsc::channel(256);
        let (write_tx, write_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status) = watch::channel(LinkStatus {
            state: LinkState::Connecting,
            attempts: 0,
        });

        let link = Link {
            policy: config.policy(),
            config,
            data_tx,
            write_rx,
            status_tx,
            shutdown_rx,
            last_rx: None,
            attempts: 0,
        };
        let task = tokio::spawn(link.run());

        (
            Self {
                status,
                write_tx,
                shutdown_tx,
                task,
            },
            data_rx,
        )
    }

    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Queue bytes for the current connection.
    ///
    /// Bytes written while disconnected are sent once a connection is up.
    pub async fn write(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.write_tx
            .send(bytes)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Tear down the socket and timers and wait for the link to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// How a connected session ended.
enum SessionEnd {
    Closed,
    Error(std::io::Error),
    Stale,
    Shutdown,
    /// Nobody reads the inbound stream any more.
    Abandoned,
}

struct Link {
    config: TcpTransportConfig,
    policy: RetryPolicy,
    data_tx: mpsc::Sender<Bytes>,
    write_rx: mpsc::Receiver<Bytes>,
    status_tx: watch::Sender<LinkStatus>,
    shutdown_rx: watch::Receiver<bool>,
    last_rx: Option<Instant>,
    attempts: u64,
}

impl Link {
    fn set_state(&self, state: LinkState) {
        let _ = self.status_tx.send(LinkStatus {
            state,
            attempts: self.attempts,
        });
    }

    async fn run(mut self) {
        let address = self.config.address();

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            self.attempts += 1;
            self.set_state(LinkState::Connecting);
            debug!("TCP {}: connecting (attempt {})", address, self.attempts);

            let connected = tokio::select! {
                result = TcpStream::connect(&address) => result,
                _ = self.shutdown_rx.changed() => break,
            };

            let decision = match connected {
                Ok(stream) => {
                    info!("TCP {}: connected", address);
                    self.policy.on_connected();
                    self.set_state(LinkState::Connected);

                    match self.session(stream).await {
                        SessionEnd::Closed => {
                            info!("TCP {}: closed by peer", address);
                            self.policy.on_close()
                        }
                        SessionEnd::Error(e) => {
                            warn!("TCP {}: {}", address, e);
                            self.policy.on_error()
                        }
                        SessionEnd::Stale => {
                            warn!("TCP {}: no data received, resetting connection", address);
                            self.policy.on_stale()
                        }
                        SessionEnd::Shutdown | SessionEnd::Abandoned => break,
                    }
                }
                Err(e) => {
                    let decision = self.policy.on_error();
                    warn!(
                        "TCP {}: connect attempt {} failed ({} / {} consecutive): {}",
                        address,
                        self.attempts,
                        self.policy.retries(),
                        self.policy.max_retries(),
                        e
                    );
                    decision
                }
            };

            match decision {
                Decision::Reconnect => continue,
                Decision::Stop => break,
                Decision::Suspend(cooldown) => {
                    warn!("TCP {}: too many errors, suspending for {:?}", address, cooldown);
                    self.set_state(LinkState::Suspended);
                    tokio::select! {
                        _ = tokio::time::sleep(cooldown) => self.policy.on_cooldown_elapsed(),
                        _ = self.shutdown_rx.changed() => break,
                    }
                }
            }
        }

        self.set_state(LinkState::Closed);
        info!("TCP {}: stopped", address);
    }

    async fn session(&mut self, stream: TcpStream) -> SessionEnd {
        let (mut reader, mut writer) = stream.into_split();
        let mut buf = BytesMut::with_capacity(READ_BUFFER);
        let period = self.config.timeout;
        let liveness = tokio::time::sleep(period);
        tokio::pin!(liveness);

        loop {
            tokio::select! {
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => return SessionEnd::Closed,
                    Ok(_) => {
                        self.last_rx = Some(Instant::now());
                        liveness.as_mut().reset(Instant::now() + period);
                        if self.data_tx.send(buf.split().freeze()).await.is_err() {
                            return SessionEnd::Abandoned;
                        }
                    }
                    Err(e) => return SessionEnd::Error(e),
                },
                Some(bytes) = self.write_rx.recv() => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        return SessionEnd::Error(e);
                    }
                }
                () = &mut liveness => {
                    let stale = self
                        .last_rx
                        .map_or(true, |last| last.elapsed() > self.config.stale_after);
                    if stale {
                        return SessionEnd::Stale;
                    }
                    liveness.as_mut().reset(Instant::now() + period);
                }
                _ = self.shutdown_rx.changed() => return SessionEnd::Shutdown,
            }
        }
    }
}

/// Feeds newline-delimited deltas from a TCP link into the hub.
#[derive(Debug, Clone)]
pub struct TcpDeltaProvider {
    label: String,
    config: TcpTransportConfig,
}

impl TcpDeltaProvider {
    pub fn new(label: impl Into<String>, config: TcpTransportConfig) -> Self {
        Self {
            label: label.into(),
            config,
        }
    }

    /// Run until `shutdown` is set or the hub goes away.
    pub fn spawn(
        self,
        events: mpsc::Sender<ServerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<(), TransportError>> {
        tokio::spawn(async move {
            info!("{}: reading deltas from {}", self.label, self.config.address());
            let (transport, mut data) = TcpTransport::spawn(self.config);
            let mut framer = LineFramer::new();

            let result = loop {
                tokio::select! {
                    chunk = data.recv() => {
                        let Some(chunk) = chunk else { break Ok(()) };
                        for delta in decode_lines(&self.label, framer.push(&chunk)) {
                            if events.send(ServerEvent::delta(self.label.as_str(), delta)).await.is_err() {
                                break;
                            }
                        }
                        if events.is_closed() {
                            break Err(TransportError::HubClosed);
                        }
                    }
                    _ = shutdown.changed() => break Ok(()),
                }
            };

            transport.shutdown().await;
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let config: TcpTransportConfig =
            serde_json::from_value(json!({"host": "localhost", "port": 10110})).unwrap();

        assert!(config.reconnect);
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.timeout, Duration::from_secs(150));
        assert_eq!(config.stale_after, Duration::from_secs(18_000));
        assert_eq!(config.cooldown, Duration::from_secs(150));
        assert_eq!(config.address(), "localhost:10110");
    }

    #[test]
    fn test_config_overrides() {
        let config: TcpTransportConfig = serde_json::from_value(json!({
            "host": "10.0.0.5",
            "port": 2000,
            "reconnect": false,
            "maxRetries": 3,
            "timeout": 0.5,
            "staleAfter": 60,
            "cooldown": 2
        }))
        .unwrap();

        assert!(!config.reconnect);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.stale_after, Duration::from_secs(60));
        assert_eq!(config.cooldown, Duration::from_secs(2));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let result: Result<TcpTransportConfig, _> =
            serde_json::from_value(json!({"host": "h", "port": 1, "timeout": -1}));
        assert!(result.is_err());
    }
}
