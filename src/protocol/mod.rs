//! HTTP/1.1 Framing
//!
//! The pipelining core only needs three things from the wire protocol:
//! "give me the next complete request", "serialize this response", and
//! "does this response close the connection". This module provides exactly
//! that, plus the mirror image for the client side.
//!
//! ## Modules
//!
//! - `types`: `Version`, `Headers` and keep-alive rules
//! - `request`: the `Request` message and its serializer
//! - `response`: the `Response` message, its serializer and `close_requested`
//! - `parser`: incremental framing of requests and responses
//!
//! ## Example
//!
//! ```
//! use httpipe::protocol::{parse_request, Response};
//!
//! let data = b"POST /echo HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi";
//! let (request, consumed) = parse_request(data).unwrap().unwrap();
//! assert_eq!(consumed, data.len());
//!
//! let response = Response::for_request(&request).with_body(request.body.clone());
//! assert!(!response.close_requested());
//! ```

pub mod parser;
pub mod request;
pub mod response;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{parse_request, parse_response, HttpParser, ParseError, ParseResult};
pub use request::Request;
pub use response::{reason_phrase, Response};
pub use types::{Headers, Version};
