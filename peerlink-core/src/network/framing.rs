//! Stream Framing
//!
//! Records on the reliable stream are newline-delimited JSON. [`LineDecoder`]
//! buffers raw reads so a record is only handed out once its terminating
//! newline has arrived, regardless of how the bytes were chunked by the
//! socket.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::NetworkError;

/// Hard cap for a single serialized record.
pub const MAX_LINE_BYTES: usize = 65_536;

/// Serializes a frame to one newline-terminated JSON line.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, NetworkError> {
    let mut line =
        serde_json::to_vec(frame).map_err(|e| NetworkError::MalformedFrame(e.to_string()))?;
    if line.len() > MAX_LINE_BYTES {
        return Err(NetworkError::FrameTooLarge {
            size: line.len(),
            limit: MAX_LINE_BYTES,
        });
    }
    line.push(b'\n');
    Ok(line)
}

/// Parses one record (without its newline) into a frame.
pub fn decode_frame<T: DeserializeOwned>(line: &[u8]) -> Result<T, NetworkError> {
    serde_json::from_slice(line).map_err(|e| NetworkError::MalformedFrame(e.to_string()))
}

/// Accumulates raw stream bytes and yields complete lines.
///
/// A record longer than the limit is discarded once detected: the buffered
/// prefix is dropped and everything up to the next newline is skipped, so a
/// hostile or buggy sender cannot grow the buffer without bound.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_line: usize,
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }

    pub fn with_limit(max_line: usize) -> Self {
        LineDecoder {
            buffer: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pops the next complete line, stripped of its terminator.
    ///
    /// Returns `None` when no full line is buffered yet. Empty and oversized
    /// lines are skipped, never returned.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                if line.is_empty() {
                    continue;
                }
                if line.len() > self.max_line {
                    log::warn!(
                        "dropping oversized record: {} bytes (limit {})",
                        line.len(),
                        self.max_line
                    );
                    continue;
                }
                return Some(line);
            }
            if self.buffer.len() > self.max_line {
                log::warn!(
                    "dropping oversized record: {} bytes buffered without newline (limit {})",
                    self.buffer.len(),
                    self.max_line
                );
                self.buffer.clear();
                self.discarding = true;
            }
            return None;
        }
    }

    /// True if a complete line is already buffered.
    pub fn has_complete_line(&self) -> bool {
        self.buffer.contains(&b'\n')
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }
}
