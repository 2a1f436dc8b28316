//! File replay provider.
//!
//! Replays a file of newline-delimited deltas into the hub, one line per
//! `interval`, optionally looping.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use signalk_server::ServerEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::framing::decode_lines;
use crate::tcp::TransportError;

#[derive(Debug, Clone)]
pub struct FileReplayProvider {
    label: String,
    path: PathBuf,
    interval: Duration,
    repeat: bool,
}

impl FileReplayProvider {
    pub fn new(label: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            path: path.into(),
            interval: Duration::ZERO,
            repeat: false,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    /// Replay the file. Resolves to the number of deltas sent.
    pub fn spawn(
        self,
        events: mpsc::Sender<ServerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<u64, TransportError>> {
        tokio::spawn(async move {
            info!("{}: replaying {}", self.label, self.path.display());
            let mut sent = 0;

            loop {
                let file = tokio::fs::File::open(&self.path).await?;
                let mut lines = BufReader::new(file).lines();

                while let Some(line) = lines.next_line().await? {
                    if line.trim().is_empty() {
                        continue;
                    }
                    for delta in decode_lines(&self.label, vec![Bytes::from(line)]) {
                        events
                            .send(ServerEvent::delta(self.label.as_str(), delta))
                            .await
                            .map_err(|_| TransportError::HubClosed)?;
                        sent += 1;
                    }
                    if !self.interval.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(self.interval) => {}
                            _ = shutdown.changed() => return Ok(sent),
                        }
                    } else if *shutdown.borrow() {
                        return Ok(sent);
                    }
                }

                if !self.repeat {
                    break;
                }
                if sent == 0 {
                    warn!("{}: nothing to replay in {}", self.label, self.path.display());
                    break;
                }
            }

            info!("{}: replay finished after {} deltas", self.label, sent);
            Ok(sent)
        })
    }
}
