//! Newline-delimited JSON framing.
//!
//! TCP links deliver arbitrary chunks. [`LineFramer`] buffers them and
//! yields complete lines with the line ending removed.

use bytes::{Bytes, BytesMut};
use signalk_core::Delta;
use signalk_protocol::decode_delta;
use tracing::{debug, warn};

/// Lines longer than this are discarded.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct LineFramer {
    buf: BytesMut,
    discarding: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the complete, non-empty lines it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();

        while let Some(end) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if !line.is_empty() {
                lines.push(line.freeze());
            }
        }

        if self.buf.len() > MAX_LINE_LENGTH {
            warn!("Discarding line longer than {} bytes", MAX_LINE_LENGTH);
            self.buf.clear();
            self.discarding = true;
        }
        lines
    }

    /// Bytes waiting for a line ending.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Decode framed lines into deltas, dropping anything that does not decode.
pub fn decode_lines(label: &str, lines: Vec<Bytes>) -> Vec<Delta> {
    let mut deltas = Vec::with_capacity(lines.len());
    for line in lines {
        match decode_delta(&line) {
            Ok(Some(delta)) => deltas.push(delta),
            Ok(None) => debug!("{}: ignoring hello", label),
            Err(e) => warn!("{}: dropping malformed frame: {}", label, e),
        }
    }
    deltas
}
