//! Content-Length framing as a `tokio_util` codec.
//!
//! Header parsing is case-insensitive and accepts both CRLF and LF line
//! endings. A header block without a usable `Content-Length` is logged and
//! skipped so that one bad frame does not end the stream; an oversized frame
//! is fatal because its body cannot be skipped safely.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::SessionError;
use crate::framing::find_subsequence;

/// Maximum message size (100MB) to prevent OOM from a misbehaving server.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Bytes consumed by the header block including its terminator.
    pub header_length: usize,
    /// Raw payload, exactly `Content-Length` bytes.
    pub body: Bytes,
}

impl Frame {
    /// Decode the payload as JSON.
    pub fn json(&self) -> Result<serde_json::Value, SessionError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| SessionError::ProtocolParse(format!("invalid JSON payload: {}", e)))
    }
}

/// Codec for `Content-Length: N\r\n\r\n<N bytes>` frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentLengthCodec;

impl ContentLengthCodec {
    pub fn new() -> Self {
        ContentLengthCodec
    }
}

/// Locate the end of the header block: `(offset, terminator_len)`.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find_subsequence(buf, b"\r\n\r\n").map(|pos| (pos, 4));
    let lf = find_subsequence(buf, b"\n\n").map(|pos| (pos, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Extract the Content-Length value from a header block.
///
/// Splits each line on the first ':' and trims key and value. When the
/// header appears more than once the last valid value wins.
pub(crate) fn parse_content_length(header: &str) -> Option<usize> {
    let mut content_length = None;
    for line in header.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            if let Ok(len) = value.trim().parse::<usize>() {
                content_length = Some(len);
            }
        }
    }
    content_length
}

impl Decoder for ContentLengthCodec {
    type Item = Frame;
    type Error = SessionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, SessionError> {
        loop {
            let Some((header_end, terminator_len)) = find_header_end(src) else {
                return Ok(None);
            };
            let header_length = header_end + terminator_len;

            let content_length = std::str::from_utf8(&src[..header_end])
                .ok()
                .and_then(parse_content_length);
            let Some(size) = content_length else {
                warn!(
                    "Dropping frame header without valid Content-Length ({} bytes)",
                    header_end
                );
                src.advance(header_length);
                continue;
            };

            if size > MAX_MESSAGE_SIZE {
                return Err(SessionError::ProtocolParse(format!(
                    "Message size {} exceeds maximum {} bytes",
                    size, MAX_MESSAGE_SIZE
                )));
            }

            let total = header_length + size;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(header_length);
            let body = src.split_to(size).freeze();
            return Ok(Some(Frame {
                header_length,
                body,
            }));
        }
    }
}

impl Encoder<&str> for ContentLengthCodec {
    type Error = SessionError;

    fn encode(&mut self, body: &str, dst: &mut BytesMut) -> Result<(), SessionError> {
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(body.as_bytes());
        Ok(())
    }
}

/// Frame a payload into a standalone byte buffer.
pub fn encode_frame(body: &str) -> Bytes {
    let mut buf = BytesMut::new();
    // Encoding into an in-memory buffer cannot fail.
    let _ = Encoder::<&str>::encode(&mut ContentLengthCodec, body, &mut buf);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(codec: &mut ContentLengthCodec, buf: &mut BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).expect("decode failed") {
            frames.push(frame);
        }
        frames
    }

    fn bodies(frames: &[Frame]) -> Vec<String> {
        frames
            .iter()
            .map(|f| String::from_utf8_lossy(&f.body).into_owned())
            .collect()
    }

    fn sample_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#));
        stream.extend_from_slice(
            b"content-type: application/vscode-jsonrpc\r\ncontent-length: 40\r\n\r\n",
        );
        stream.extend_from_slice(br#"{"jsonrpc":"2.0","method":"window/log"} "#);
        stream.extend_from_slice(&encode_frame(r#"{"text":"héllo ☃"}"#));
        stream
    }

    #[test]
    fn test_header_parsing_case_variations() {
        assert_eq!(parse_content_length("Content-Length: 42"), Some(42));
        assert_eq!(parse_content_length("content-length: 42"), Some(42));
        assert_eq!(parse_content_length("CONTENT-LENGTH: 42"), Some(42));
        assert_eq!(parse_content_length("Content-Length :42  "), Some(42));
    }

    #[test]
    fn test_header_parsing_invalid_cases() {
        assert_eq!(parse_content_length("Content-Length: abc"), None);
        assert_eq!(parse_content_length("Content-Length: -5"), None);
        assert_eq!(parse_content_length("Content-Type: application/json"), None);
        assert_eq!(parse_content_length("Content-Length 42"), None);
    }

    #[test]
    fn test_header_parsing_duplicate_last_wins() {
        let header = "Content-Length: 10\r\nContent-Length: 20";
        assert_eq!(parse_content_length(header), Some(20));
    }

    #[test]
    fn test_decode_single_frame() {
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::from(&b"Content-Length: 2\r\n\r\n{}"[..]);
        let frame = codec.decode(&mut buf).unwrap().expect("frame");
        assert_eq!(frame.header_length, 21);
        assert_eq!(&frame.body[..], b"{}");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_lf_line_endings() {
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::from(&b"Content-Length: 2\n\n{}"[..]);
        let frame = codec.decode(&mut buf).unwrap().expect("frame");
        assert_eq!(&frame.body[..], b"{}");
    }

    #[test]
    fn test_decode_waits_for_full_body() {
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::from(&b"Content-Length: 10\r\n\r\n{\"a\":"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"true}");
        let frame = codec.decode(&mut buf).unwrap().expect("frame");
        assert_eq!(&frame.body[..], br#"{"a":true}"#);
    }

    #[test]
    fn test_decode_skips_header_without_length() {
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::from(&b"Content-Type: text/plain\r\n\r\n"[..]);
        buf.extend_from_slice(&encode_frame("{}"));
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(bodies(&frames), vec!["{}".to_string()]);
    }

    #[test]
    fn test_decode_oversized_is_error() {
        let mut codec = ContentLengthCodec::new();
        let header = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_SIZE + 1);
        let mut buf = BytesMut::from(header.as_bytes());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(SessionError::ProtocolParse(_))
        ));
    }

    #[test]
    fn test_decode_multiple_frames_in_one_chunk() {
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::from(&sample_stream()[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_chunking_invariance() {
        let stream = sample_stream();
        let mut reference_codec = ContentLengthCodec::new();
        let expected = bodies(&decode_all(
            &mut reference_codec,
            &mut BytesMut::from(&stream[..]),
        ));

        for chunk_size in 1..=stream.len() {
            let mut codec = ContentLengthCodec::new();
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                frames.extend(decode_all(&mut codec, &mut buf));
            }
            assert_eq!(bodies(&frames), expected, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_encode_counts_bytes_not_chars() {
        let framed = encode_frame("\u{2603}");
        assert_eq!(&framed[..], "Content-Length: 3\r\n\r\n\u{2603}".as_bytes());
    }
}
