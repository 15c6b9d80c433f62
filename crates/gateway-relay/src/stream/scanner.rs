//! Line scanner over an upstream byte stream.

use super::ByteStream;
use bytes::BytesMut;
use futures::StreamExt;
use gateway_config::StreamingConfig;
use gateway_core::{GatewayError, GatewayResult};

/// Scanner buffer sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannerLimits {
    /// Capacity before the first frame
    pub initial: usize,
    /// Capacity after the first frame
    pub steady: usize,
    /// Longest accepted line
    pub max_line: usize,
}

impl Default for ScannerLimits {
    fn default() -> Self {
        Self::from(&StreamingConfig::default())
    }
}

impl From<&StreamingConfig> for ScannerLimits {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            initial: config.initial_buffer_size,
            steady: config.steady_buffer_size,
            max_line: config.max_buffer_size,
        }
    }
}

/// Splits a byte stream into lines.
///
/// The read buffer starts at `initial` so the first frame is not held back
/// waiting to fill a large allocation; [`LineScanner::grow`] enlarges it once.
pub struct LineScanner {
    body: ByteStream,
    buf: BytesMut,
    searched: usize,
    limits: ScannerLimits,
    eof: bool,
    grown: bool,
}

impl LineScanner {
    /// Scan `body` with the given limits
    #[must_use]
    pub fn new(body: ByteStream, limits: ScannerLimits) -> Self {
        Self {
            body,
            buf: BytesMut::with_capacity(limits.initial),
            searched: 0,
            limits,
            eof: false,
            grown: false,
        }
    }

    /// Next line without its terminator; `None` at end of stream
    pub async fn next_line(&mut self) -> Option<GatewayResult<String>> {
        loop {
            if let Some(offset) = self.buf[self.searched..].iter().position(|b| *b == b'\n') {
                let end = self.searched + offset;
                let line = self.buf.split_to(end + 1);
                self.searched = 0;
                return Some(Ok(decode(&line[..end])));
            }
            self.searched = self.buf.len();

            if self.buf.len() > self.limits.max_line {
                return Some(Err(GatewayError::translation(format!(
                    "stream line exceeds {} bytes",
                    self.limits.max_line
                ))));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return None;
                }
                let rest = self.buf.split();
                self.searched = 0;
                return Some(Ok(decode(&rest)));
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Some(Err(e)),
                None => self.eof = true,
            }
        }
    }

    /// Enlarge the buffer to the steady size; only the first call acts
    pub fn grow(&mut self) -> bool {
        if self.grown {
            return false;
        }
        self.grown = true;
        if self.limits.steady > self.buf.capacity() {
            self.buf.reserve(self.limits.steady - self.buf.len());
        }
        true
    }

    /// Buffer has been grown
    #[must_use]
    pub fn is_grown(&self) -> bool {
        self.grown
    }

    /// Current buffer capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

fn decode(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
