//! Incremental HTTP/1.1 Framing
//!
//! This module turns a byte buffer into complete requests or responses.
//! It never blocks and never consumes input on its own: the caller keeps the
//! bytes and advances its buffer only once a full message has been framed.
//!
//! ## How the Parser Works
//!
//! Every parse call returns one of:
//! - `Ok(Some((message, consumed)))` - a full message, `consumed` bytes used
//! - `Ok(None)` - the message is incomplete, read more and retry
//! - `Err(ParseError)` - the peer sent something we cannot frame
//!
//! Since the return value carries `consumed`, several pipelined messages in
//! one read are handled by calling the parser repeatedly.
//!
//! ## Body Framing
//!
//! ```text
//!   Transfer-Encoding: chunked  ──>  decode chunks until the 0-size chunk
//!   Content-Length: N           ──>  exactly N bytes
//!   neither (request)           ──>  empty body
//!   neither (response)          ──>  empty for 1xx/204/304, otherwise an
//!                                    error: a body delimited by connection
//!                                    close cannot be pipelined
//! ```

use crate::protocol::request::Request;
use crate::protocol::response::{is_bodiless_status, Response};
use crate::protocol::types::{header, Headers, Version, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while framing HTTP messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The request line or status line is malformed
    #[error("invalid start line: {0}")]
    InvalidStartLine(String),

    /// The version token is not HTTP/1.0 or HTTP/1.1
    #[error("unsupported version: {0}")]
    InvalidVersion(String),

    /// The status code is not a three-digit number
    #[error("invalid status code: {0}")]
    InvalidStatus(String),

    /// A header line has no colon or an invalid name
    #[error("invalid header line: {0}")]
    InvalidHeader(String),

    /// The message head is not valid UTF-8
    #[error("invalid UTF-8 in message head")]
    InvalidUtf8,

    /// Content-Length is not a number, or conflicting values were sent
    #[error("invalid content length: {0}")]
    InvalidContentLength(String),

    /// A chunk size line or chunk terminator is malformed
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    /// A transfer coding other than chunked was requested
    #[error("unsupported transfer encoding: {0}")]
    UnsupportedTransferEncoding(String),

    /// A response body is delimited by connection close
    #[error("response body has no length")]
    UnframedBody,

    /// The header block exceeds the configured limit
    #[error("message head too large: {size} bytes (max: {max})")]
    HeadTooLarge { size: usize, max: usize },

    /// The body exceeds the configured limit
    #[error("message body too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size of a start line plus headers (64 KB)
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum size of a decoded body (16 MB)
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of header lines
pub const MAX_HEADERS: usize = 100;

/// An HTTP/1.1 message framer with configurable limits.
#[derive(Debug, Clone)]
pub struct HttpParser {
    max_head_size: usize,
    max_body_size: usize,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed message head before the body is framed.
struct Head<'a> {
    start: Vec<&'a str>,
    headers: Headers,
    /// Offset of the first body byte
    body_start: usize,
}

impl HttpParser {
    /// Creates a parser with the default limits.
    pub fn new() -> Self {
        Self {
            max_head_size: MAX_HEAD_SIZE,
            max_body_size: MAX_BODY_SIZE,
        }
    }

    /// Creates a parser with custom limits.
    pub fn with_limits(max_head_size: usize, max_body_size: usize) -> Self {
        Self {
            max_head_size,
            max_body_size,
        }
    }

    /// Attempts to frame one request from the front of `buf`.
    pub fn parse_request(&self, buf: &[u8]) -> ParseResult<Option<(Request, usize)>> {
        let head = match self.parse_head(buf, 3)? {
            Some(head) => head,
            None => return Ok(None),
        };

        let (method, target, version) = match head.start.as_slice() {
            [method, target, version]
                if !method.is_empty() && !target.is_empty() && is_token(method) =>
            {
                (*method, *target, *version)
            }
            _ => return Err(ParseError::InvalidStartLine(head.start.join(" "))),
        };
        let version =
            Version::parse(version).ok_or_else(|| ParseError::InvalidVersion(version.to_string()))?;

        let framed = match self.frame_body(buf, &head.headers, head.body_start, false)? {
            Some(framed) => framed,
            None => return Ok(None),
        };

        let request = Request {
            method: method.to_string(),
            target: target.to_string(),
            version,
            headers: head.headers,
            body: framed.0,
        };
        Ok(Some((request, framed.1)))
    }

    /// Attempts to frame one response from the front of `buf`.
    pub fn parse_response(&self, buf: &[u8]) -> ParseResult<Option<(Response, usize)>> {
        let head = match self.parse_head(buf, 3)? {
            Some(head) => head,
            None => return Ok(None),
        };

        let (version, status, reason) = match head.start.as_slice() {
            [version, status] => (*version, *status, ""),
            [version, status, reason] => (*version, *status, *reason),
            _ => return Err(ParseError::InvalidStartLine(head.start.join(" "))),
        };
        let version =
            Version::parse(version).ok_or_else(|| ParseError::InvalidVersion(version.to_string()))?;
        let status = parse_status(status)?;

        let framed = if is_bodiless_status(status) {
            Some((Bytes::new(), head.body_start))
        } else {
            self.frame_body(buf, &head.headers, head.body_start, true)?
        };
        let (body, consumed) = match framed {
            Some(framed) => framed,
            None => return Ok(None),
        };

        let response = Response {
            version,
            status,
            reason: reason.to_string(),
            headers: head.headers,
            body,
        };
        Ok(Some((response, consumed)))
    }

    /// Splits the start line into at most `parts` space-separated tokens and
    /// parses the header lines.
    fn parse_head<'a>(&self, buf: &'a [u8], parts: usize) -> ParseResult<Option<Head<'a>>> {
        // Tolerate blank lines between pipelined messages
        let mut skip = 0;
        while buf[skip..].starts_with(CRLF) {
            skip += 2;
        }
        let buf_start = skip;
        let buf = &buf[buf_start..];

        let head_end = match find_head_end(buf) {
            Some(pos) => pos,
            None => {
                if buf.len() > self.max_head_size {
                    return Err(ParseError::HeadTooLarge {
                        size: buf.len(),
                        max: self.max_head_size,
                    });
                }
                return Ok(None);
            }
        };
        if head_end > self.max_head_size {
            return Err(ParseError::HeadTooLarge {
                size: head_end,
                max: self.max_head_size,
            });
        }

        let text = std::str::from_utf8(&buf[..head_end]).map_err(|_| ParseError::InvalidUtf8)?;
        let mut lines = text.split("\r\n");

        let start_line = lines.next().unwrap_or_default();
        let start: Vec<&str> = start_line.splitn(parts, ' ').collect();

        let mut headers = Headers::new();
        for line in lines {
            if headers.len() >= MAX_HEADERS {
                return Err(ParseError::InvalidHeader(format!(
                    "more than {} headers",
                    MAX_HEADERS
                )));
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::InvalidHeader(line.to_string()))?;
            if name.is_empty() || !is_token(name) {
                return Err(ParseError::InvalidHeader(line.to_string()));
            }
            headers.append(name, value.trim());
        }

        Ok(Some(Head {
            start,
            headers,
            // +4 for the blank line terminating the head
            body_start: buf_start + head_end + 4,
        }))
    }

    /// Frames the body starting at `start`. Returns the body and the total
    /// number of bytes consumed from the beginning of `buf`.
    fn frame_body(
        &self,
        buf: &[u8],
        headers: &Headers,
        start: usize,
        is_response: bool,
    ) -> ParseResult<Option<(Bytes, usize)>> {
        if let Some(coding) = headers.get(header::TRANSFER_ENCODING) {
            let last = coding.rsplit(',').next().unwrap_or_default().trim();
            if !last.eq_ignore_ascii_case("chunked") {
                return Err(ParseError::UnsupportedTransferEncoding(coding.to_string()));
            }
            return Ok(self
                .decode_chunked(&buf[start..])?
                .map(|(body, used)| (body, start + used)));
        }

        let length = match content_length(headers)? {
            Some(length) => length,
            None if is_response => return Err(ParseError::UnframedBody),
            None => 0,
        };
        if length > self.max_body_size {
            return Err(ParseError::MessageTooLarge {
                size: length,
                max: self.max_body_size,
            });
        }

        let end = start + length;
        if buf.len() < end {
            return Ok(None);
        }
        Ok(Some((Bytes::copy_from_slice(&buf[start..end]), end)))
    }

    /// Decodes a chunked body, skipping chunk extensions and trailers.
    fn decode_chunked(&self, buf: &[u8]) -> ParseResult<Option<(Bytes, usize)>> {
        let mut body = Vec::new();
        let mut pos = 0;

        loop {
            let line_end = match find_crlf(&buf[pos..]) {
                Some(end) => end,
                None => return Ok(None),
            };
            let line = std::str::from_utf8(&buf[pos..pos + line_end])
                .map_err(|_| ParseError::InvalidUtf8)?;
            let size_text = line.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size_text, 16)
                .map_err(|_| ParseError::InvalidChunk(line.to_string()))?;
            pos += line_end + 2;

            if size == 0 {
                // Trailer section ends with an empty line
                loop {
                    let end = match find_crlf(&buf[pos..]) {
                        Some(end) => end,
                        None => return Ok(None),
                    };
                    pos += end + 2;
                    if end == 0 {
                        return Ok(Some((Bytes::from(body), pos)));
                    }
                }
            }

            let total = body.len().saturating_add(size);
            if total > self.max_body_size {
                return Err(ParseError::MessageTooLarge {
                    size: total,
                    max: self.max_body_size,
                });
            }
            if buf.len() < pos + size + 2 {
                return Ok(None);
            }
            if &buf[pos + size..pos + size + 2] != CRLF {
                return Err(ParseError::InvalidChunk(
                    "chunk data missing trailing CRLF".to_string(),
                ));
            }
            body.extend_from_slice(&buf[pos..pos + size]);
            pos += size + 2;
        }
    }
}

/// Reads Content-Length, rejecting conflicting duplicates.
fn content_length(headers: &Headers) -> ParseResult<Option<usize>> {
    let mut length = None;
    for (name, value) in headers.iter() {
        if !name.eq_ignore_ascii_case(header::CONTENT_LENGTH) {
            continue;
        }
        let parsed: usize = value
            .parse()
            .map_err(|_| ParseError::InvalidContentLength(value.to_string()))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(ParseError::InvalidContentLength(format!(
                    "conflicting values {} and {}",
                    existing, parsed
                )));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

fn parse_status(text: &str) -> ParseResult<u16> {
    if text.len() != 3 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidStatus(text.to_string()));
    }
    text.parse()
        .map_err(|_| ParseError::InvalidStatus(text.to_string()))
}

/// Returns true if `s` only contains RFC 9110 token characters.
fn is_token(s: &str) -> bool {
    s.bytes().all(|b| {
        b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                    | b'_' | b'`' | b'|' | b'~'
            )
    })
}

/// Finds the position of the first CRLF.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Finds the position of the CRLFCRLF that ends a message head.
#[inline]
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Frames a request with the default limits.
pub fn parse_request(buf: &[u8]) -> ParseResult<Option<(Request, usize)>> {
    HttpParser::new().parse_request(buf)
}

/// Frames a response with the default limits.
pub fn parse_response(buf: &[u8]) -> ParseResult<Option<(Response, usize)>> {
    HttpParser::new().parse_response(buf)
}
