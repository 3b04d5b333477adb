//! Content-Length framing for the runner pipe
//!
//! Every message on the wire is a newline-delimited header block followed by
//! exactly `Content-Length` bytes of UTF-8 JSON:
//!
//! ```text
//! Content-Length: 52
//! Content-Type: application/json
//! Request-uuid: 6d1c...
//!
//! {"jsonrpc": "2.0", "params": {"status": "success"}}
//! ```
//!
//! Header lines may end in `\n` or `\r\n`. Blank lines between messages are
//! skipped, and a single read may carry several messages or a fragment of the
//! next header block.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::protocol::RpcEnvelope;

/// Upper bound on a header block before the connection is considered garbage
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const REQUEST_UUID: &str = "Request-uuid";

/// Framing errors. All of them are local to one connection.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("header block has no Content-Length")]
    MissingContentLength,

    #[error("unparseable Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("header block exceeds {MAX_HEADER_BYTES} bytes")]
    HeaderTooLarge,

    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
}

/// Parsed header block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameHeaders {
    pub content_length: usize,
    pub content_type: Option<String>,
    pub request_uuid: Option<String>,
}

/// One complete message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub headers: FrameHeaders,
    pub body: Bytes,
}

impl Frame {
    /// Wrap `params` in a JSON-RPC envelope and frame it
    pub fn json<T: Serialize>(params: &T) -> crate::Result<Self> {
        let envelope = RpcEnvelope::new(serde_json::to_value(params)?);
        let body = Bytes::from(serde_json::to_vec(&envelope)?);
        Ok(Self {
            headers: FrameHeaders {
                content_length: body.len(),
                content_type: Some("application/json".to_string()),
                request_uuid: Some(uuid::Uuid::new_v4().to_string()),
            },
            body,
        })
    }

    /// Decode the body as a JSON-RPC envelope
    pub fn envelope(&self) -> crate::Result<RpcEnvelope> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Codec for the runner pipe
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

/// Locate the blank line ending the header block.
///
/// Returns `(header_text_len, block_len)` where `block_len` includes the
/// terminating blank line.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Some((i, i + 2)),
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, i + 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn parse_headers(block: &[u8]) -> Result<FrameHeaders, FrameError> {
    let text = String::from_utf8_lossy(block);
    let mut content_length = None;
    let mut headers = FrameHeaders::default();

    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        let key = key.trim();
        let value = value.trim();

        if key.eq_ignore_ascii_case(CONTENT_LENGTH) {
            let len = value
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;
            content_length = Some(len);
        } else if key.eq_ignore_ascii_case(CONTENT_TYPE) {
            headers.content_type = Some(value.to_string());
        } else if key.eq_ignore_ascii_case(REQUEST_UUID) {
            headers.request_uuid = Some(value.to_string());
        } else {
            trace!("Ignoring unknown header {}", key);
        }
    }

    headers.content_length = content_length.ok_or(FrameError::MissingContentLength)?;
    Ok(headers)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let separators = src
            .iter()
            .take_while(|&&b| b == b'\r' || b == b'\n')
            .count();
        src.advance(separators);

        let Some((header_len, block_len)) = find_header_end(src) else {
            if src.len() > MAX_HEADER_BYTES {
                return Err(FrameError::HeaderTooLarge);
            }
            return Ok(None);
        };

        let headers = parse_headers(&src[..header_len])?;
        let total = block_len + headers.content_length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(block_len);
        let body = src.split_to(headers.content_length).freeze();
        trace!("Decoded frame with {} byte body", body.len());
        Ok(Some(Frame { headers, body }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.iter().all(u8::is_ascii_whitespace) => {
                src.clear();
                Ok(None)
            }
            None => Err(FrameError::Truncated {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let mut header = format!("{}: {}\n", CONTENT_LENGTH, frame.body.len());
        if let Some(content_type) = &frame.headers.content_type {
            header.push_str(&format!("{}: {}\n", CONTENT_TYPE, content_type));
        }
        if let Some(uuid) = &frame.headers.request_uuid {
            header.push_str(&format!("{}: {}\n", REQUEST_UUID, uuid));
        }
        header.push('\n');

        dst.reserve(header.len() + frame.body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&frame.body);
        Ok(())
    }
}
