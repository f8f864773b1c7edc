//! Stream framing for the two child-process protocols.
//!
//! Child processes deliver output in arbitrary chunks. This module turns
//! those chunks back into logical units:
//!
//! - [`ContentLengthCodec`] - HTTP-style `Content-Length` framing used by the
//!   language server (a `tokio_util` codec, so it plugs into `FramedRead`).
//! - [`SentinelScanner`] - accumulate interpreter output until a known marker
//!   string appears.
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: 47\r\n
//! \r\n
//! {"jsonrpc":"2.0","method":"initialized","params":{}}
//! ```
//!
//! Both framers are chunk-boundary agnostic: feeding the same bytes split at
//! any points yields the same sequence of frames.

mod content_length;
mod sentinel;

pub use content_length::{encode_frame, ContentLengthCodec, Frame, MAX_MESSAGE_SIZE};
pub use sentinel::SentinelScanner;

/// Position of the first occurrence of `needle` in `haystack`.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
