//! Connection Module
//!
//! This module drives individual client connections. Each connection runs as
//! one local task on the reactor that accepted it, reading pipelined requests
//! and writing the responses back in request order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Connection                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────────┐  │
//! │  │ Read bytes  │───>│ Parse HTTP  │───>│ RequestHandler  │  │
//! │  └─────────────┘    └─────────────┘    └────────┬────────┘  │
//! │         ▲                                       │           │
//! │         │ room in ring                          │ CommitHandle
//! │         │                                       ▼           │
//! │  ┌──────┴──────┐    ┌─────────────┐    ┌─────────────────┐  │
//! │  │ Pop head    │<───│ Write head  │<───│ PipelineBuffer  │  │
//! │  └─────────────┘    └─────────────┘    └─────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `engine`: the per-connection read/write loop and `ConnectionHandle`
//! - `commit`: the single-use `CommitHandle`
//! - `stats`: per-reactor counters

pub mod commit;
pub mod engine;
pub mod stats;

// Re-export commonly used types
pub use commit::{CommitError, CommitHandle};
pub use engine::{Connection, ConnectionError, ConnectionHandle, ConnectionState, RequestHandler};
pub use stats::{ConnectionStats, StatsSnapshot};
