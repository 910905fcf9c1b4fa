//! # httpipe - A Pipelined HTTP/1.1 Server Core
//!
//! httpipe is the engine room of a high-throughput HTTP/1.1 server. Clients
//! may pipeline requests on one connection; handlers may finish them in any
//! order; responses still leave in exactly the order the requests arrived.
//! Connections are sharded across single-threaded reactors so that no
//! connection state is ever shared between cores.
//!
//! ## Features
//!
//! - **Ordered Pipelining**: A fixed ring of response slots per connection
//! - **Single-Use Commits**: Each request comes with a `CommitHandle` that
//!   publishes its response exactly once
//! - **Backpressure**: Reading pauses while the ring is full
//! - **Sharded Reactors**: One current-thread runtime per core, fed round robin
//! - **Pipelined Client**: The mirror-image engine for load generation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               httpipe                                   │
//! │                                                                         │
//! │  ┌─────────────┐  round robin   ┌─────────────────────────────────────┐ │
//! │  │  Acceptor   │ ─────────────> │  Reactor (thread + LocalSet)        │ │
//! │  │ TcpListener │                │                                     │ │
//! │  └─────────────┘                │  Worker ──> Connection ──> Handler  │ │
//! │                                 │               │   ▲          │      │ │
//! │                                 │               ▼   │ commit() │      │ │
//! │                                 │        PipelineBuffer <──────┘      │ │
//! │                                 └─────────────────────────────────────┘ │
//! │                                   ... one per reactor ...               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use httpipe::{CommitHandle, HandlerWorker, ReactorContext, Request, RequestHandler};
//! use httpipe::{Server, ServerConfig};
//!
//! struct Echo;
//!
//! impl RequestHandler for Echo {
//!     fn handle_request(&self, mut handle: CommitHandle, request: Request) {
//!         handle.response_mut().body = request.body;
//!         let _ = handle.commit();
//!     }
//! }
//!
//! fn main() -> Result<(), httpipe::ServerError> {
//!     let config = ServerConfig::new("127.0.0.1:8080".parse().unwrap())
//!         .with_pipeline_depth(32);
//!     let mut server = Server::new(config, |ctx: &ReactorContext| HandlerWorker::new(ctx, Echo))?;
//!     server.start()?;
//!     server.run()
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`pipeline`]: the ring of response slots
//! - [`connection`]: the per-connection engine, commit handles and statistics
//! - [`server`]: reactors, the worker pool and the acceptor
//! - [`client`]: the pipelined client
//! - [`protocol`]: HTTP/1.1 framing
//! - [`config`]: server and connection settings
//!
//! ## Design Highlights
//!
//! ### No Locks on the Hot Path
//!
//! A connection lives on exactly one reactor thread for its whole life, so
//! its state is plain `Rc`/`RefCell`. The only cross-thread traffic is the
//! accepted socket travelling through the target reactor's job queue.
//!
//! ### Reads and Writes Never Overlap
//!
//! Each connection is a single task that alternates between draining ready
//! responses and waiting for either more bytes or the next commit.

pub mod client;
pub mod config;
pub mod connection;
pub mod pipeline;
pub mod protocol;
pub mod server;

// Re-export commonly used types for convenience
pub use client::{ClientError, PipelineClient};
pub use config::{ConnectionOptions, ServerConfig};
pub use connection::{CommitError, CommitHandle, ConnectionHandle, RequestHandler};
pub use pipeline::PipelineBuffer;
pub use protocol::{ParseError, Request, Response};
pub use server::{HandlerWorker, ReactorContext, Server, ServerError, ServerHandle, Worker, WorkerFactory};

/// The default port the demo server listens on
pub const DEFAULT_PORT: u16 = 8080;

/// The default host the demo server binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of httpipe
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
