//! HTTP Response

use crate::protocol::request::Request;
use crate::protocol::types::{header, keep_alive, write_headers, Headers, Version, CRLF};
use bytes::Bytes;

/// An HTTP/1.x response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            version: Version::Http11,
            status: 200,
            reason: reason_phrase(200).to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }
}

impl Response {
    /// Creates a response with the canonical reason phrase.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            ..Self::default()
        }
    }

    /// Creates the default answer to `request`.
    ///
    /// The version matches the request, and the request's keep-alive decision
    /// is carried over so that a `Connection: close` request yields a
    /// response that closes the connection.
    pub fn for_request(request: &Request) -> Self {
        let mut response = Self {
            version: request.version,
            ..Self::default()
        };
        response.set_keep_alive(request.keep_alive());
        response
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the status code and its canonical reason phrase.
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
        self.reason = reason_phrase(status).to_string();
    }

    /// Writes the `Connection` header needed to express `keep_alive` for
    /// this version, removing it when the version default already matches.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.headers.remove(header::CONNECTION);
        match (self.version, keep_alive) {
            (Version::Http11, false) => self.headers.set(header::CONNECTION, "close"),
            (Version::Http10, true) => self.headers.set(header::CONNECTION, "keep-alive"),
            _ => {}
        }
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    /// Returns true when the connection must close once this response is
    /// on the wire.
    pub fn close_requested(&self) -> bool {
        !self.keep_alive()
    }

    /// Returns true for status codes that never carry a body.
    pub fn is_bodiless(&self) -> bool {
        is_bodiless_status(self.status)
    }

    /// Serializes the response with an exact `Content-Length`.
    pub fn serialize(&self) -> Bytes {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(CRLF);

        let mut headers = self.headers.clone();
        headers.remove(header::TRANSFER_ENCODING);
        if self.is_bodiless() {
            headers.remove(header::CONTENT_LENGTH);
        } else {
            headers.set(header::CONTENT_LENGTH, self.body.len().to_string());
        }
        write_headers(&mut out, &headers);
        if !self.is_bodiless() {
            out.extend_from_slice(&self.body);
        }
        Bytes::from(out)
    }
}

pub(crate) fn is_bodiless_status(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

/// Canonical reason phrases for common status codes.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
