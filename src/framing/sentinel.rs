//! Sentinel-terminated accumulation.
//!
//! The interpreter has no framing of its own, so each batch program ends by
//! printing a marker string. [`SentinelScanner`] buffers raw output until that
//! marker has arrived in full, however the bytes were chunked.

use crate::framing::find_subsequence;

#[derive(Debug, Clone)]
pub struct SentinelScanner {
    sentinel: Vec<u8>,
    buffer: Vec<u8>,
    found_at: Option<usize>,
}

impl SentinelScanner {
    pub fn new(sentinel: impl Into<String>) -> Self {
        SentinelScanner {
            sentinel: sentinel.into().into_bytes(),
            buffer: Vec::new(),
            found_at: None,
        }
    }

    /// Append a chunk. Returns `true` once the sentinel has been seen.
    ///
    /// Only the tail of the existing buffer is rescanned, so a marker split
    /// across chunks is still found exactly once.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        if self.found_at.is_some() {
            self.buffer.extend_from_slice(chunk);
            return true;
        }

        let rescan_from = self
            .buffer
            .len()
            .saturating_sub(self.sentinel.len().saturating_sub(1));
        self.buffer.extend_from_slice(chunk);

        if let Some(pos) = find_subsequence(&self.buffer[rescan_from..], &self.sentinel) {
            self.found_at = Some(rescan_from + pos);
        }
        self.found_at.is_some()
    }

    pub fn is_found(&self) -> bool {
        self.found_at.is_some()
    }

    /// Bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Text preceding the sentinel, decoded lossily.
    ///
    /// Returns `None` until the sentinel has been seen. Anything after the
    /// sentinel is discarded, and the scanner is reset for reuse.
    pub fn take_before_sentinel(&mut self) -> Option<String> {
        let end = self.found_at.take()?;
        let text = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
        self.buffer.clear();
        Some(text)
    }
}
