//! Response Pipeline
//!
//! HTTP/1.1 pipelining lets a client send several requests without waiting
//! for the answers, but the answers must come back in the same order. This
//! module provides the ring of response slots that makes that possible while
//! handlers finish in any order.
//!
//! ```text
//!  requests in:   1   2   3   4
//!  commits:           3   1   2   4
//!  wire out:      1   2   3   4
//! ```

pub mod buffer;

pub use buffer::{PipelineBuffer, PipelineError};
