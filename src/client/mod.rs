//! Client Module
//!
//! A pipelining HTTP/1.1 client used to drive and benchmark servers built
//! on this crate. Requests are sent back to back on one connection and
//! responses are matched to them by order alone.

pub mod pipeline;

pub use pipeline::{ClientError, ClientState, PipelineClient, ResponseCallback};
