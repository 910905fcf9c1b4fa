//! HTTP Request

use crate::protocol::types::{header, keep_alive, write_headers, Headers, Version, CRLF};
use bytes::Bytes;

/// A fully framed HTTP/1.x request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Bytes,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            target: "/".to_string(),
            version: Version::Http11,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }
}

impl Request {
    /// Creates a request with no headers and an empty body.
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    /// Sets a header, replacing existing values.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns true unless the client asked for the connection to close.
    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    /// Serializes the request with an exact `Content-Length`.
    ///
    /// Any `Transfer-Encoding` header is dropped since the body is already
    /// fully buffered.
    pub fn serialize(&self) -> Bytes {
        let mut out = Vec::with_capacity(64 + self.target.len() + self.body.len());
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(CRLF);

        let mut headers = self.headers.clone();
        headers.remove(header::TRANSFER_ENCODING);
        if !self.body.is_empty() || headers.contains(header::CONTENT_LENGTH) {
            headers.set(header::CONTENT_LENGTH, self.body.len().to_string());
        }
        write_headers(&mut out, &headers);
        out.extend_from_slice(&self.body);
        Bytes::from(out)
    }
}
