//! Server Configuration
//!
//! Everything the pipelining core needs to know up front: where to listen,
//! how deep each connection's pipeline is, how many reactors to run and how
//! the listening socket is set up.

use crate::protocol::parser::{MAX_BODY_SIZE, MAX_HEAD_SIZE};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Default per-connection pipeline depth
pub const DEFAULT_PIPELINE_DEPTH: usize = 16;

/// Default cap on unparsed inbound bytes per connection.
///
/// Twice the largest message, so a maximal request still fits when it
/// arrives chunked or behind a partially read successor.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 2 * (MAX_HEAD_SIZE + MAX_BODY_SIZE);

/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Errors found while validating a configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pipeline depth must be at least 1")]
    ZeroPipelineDepth,

    #[error("max buffer size must be greater than zero")]
    ZeroBufferSize,

    #[error("listen backlog must be greater than zero")]
    ZeroBacklog,

    #[error("max buffer size {buffer} cannot hold a maximal message of {message} bytes")]
    BufferTooSmall { buffer: usize, message: usize },
}

/// Per-connection settings handed to every connection engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Ring depth; `depth - 1` requests may be outstanding at once
    pub pipeline_depth: usize,

    /// Unparsed inbound bytes allowed before the connection is dropped
    pub max_buffer_size: usize,

    /// Largest request line plus headers
    pub max_head_size: usize,

    /// Largest request body
    pub max_body_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_head_size: MAX_HEAD_SIZE,
            max_body_size: MAX_BODY_SIZE,
        }
    }
}

impl ConnectionOptions {
    /// Checks that the depth is usable and that the inbound buffer can hold
    /// the largest message the parser accepts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline_depth == 0 {
            return Err(ConfigError::ZeroPipelineDepth);
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        let message = self.max_head_size.saturating_add(self.max_body_size);
        if self.max_buffer_size < message {
            return Err(ConfigError::BufferTooSmall {
                buffer: self.max_buffer_size,
                message,
            });
        }
        Ok(())
    }
}

/// Configuration for a [`Server`](crate::server::Server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind the listening socket to
    pub listen_addr: SocketAddr,

    /// Number of reactors; 0 means one per available core
    pub pool_size: usize,

    /// Set SO_REUSEPORT on the listening socket (Unix only)
    pub reuse_port: bool,

    /// Set TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,

    /// Listen backlog
    pub backlog: u32,

    /// Pause between retries after a failed accept
    pub accept_backoff: Duration,

    /// Settings applied to every accepted connection
    pub connection: ConnectionOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            pool_size: 0,
            reuse_port: false,
            tcp_nodelay: true,
            backlog: DEFAULT_BACKLOG,
            accept_backoff: Duration::from_millis(10),
            connection: ConnectionOptions::default(),
        }
    }
}

impl ServerConfig {
    /// Creates a configuration listening on `listen_addr` with defaults
    /// for everything else.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Self::default()
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.connection.pipeline_depth = depth;
        self
    }

    pub fn with_reuse_port(mut self, reuse_port: bool) -> Self {
        self.reuse_port = reuse_port;
        self
    }

    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.connection.max_buffer_size = size;
        self
    }

    /// Sets the parser limits for request heads and bodies.
    pub fn with_message_limits(mut self, max_head_size: usize, max_body_size: usize) -> Self {
        self.connection.max_head_size = max_head_size;
        self.connection.max_body_size = max_body_size;
        self
    }

    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    /// Checks the values that would otherwise make the server unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        if self.backlog == 0 {
            return Err(ConfigError::ZeroBacklog);
        }
        Ok(())
    }

    /// Resolves `pool_size`, mapping 0 to the available parallelism.
    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size > 0 {
            return self.pool_size;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
