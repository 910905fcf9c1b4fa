//! Server Module
//!
//! Ties the acceptor and the worker pool together.
//!
//! ## Threads
//!
//! ```text
//! ┌──────────────────────┐
//! │ caller of run()      │   acceptor: current-thread runtime
//! │  accept_loop         │
//! └──────────┬───────────┘
//!            │ round robin, one Job per socket
//!     ┌──────┴───────┬──────────────┐
//!     ▼              ▼              ▼
//! ┌────────┐    ┌────────┐     ┌────────┐
//! │reactor0│    │reactor1│ ... │reactorN│   one thread + LocalSet each
//! │ Worker │    │ Worker │     │ Worker │
//! └────────┘    └────────┘     └────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use httpipe::config::ServerConfig;
//! use httpipe::connection::{CommitHandle, RequestHandler};
//! use httpipe::protocol::Request;
//! use httpipe::server::{HandlerWorker, ReactorContext, Server};
//!
//! struct Hello;
//!
//! impl RequestHandler for Hello {
//!     fn handle_request(&self, mut handle: CommitHandle, _request: Request) {
//!         handle.response_mut().body = "hello".into();
//!         let _ = handle.commit();
//!     }
//! }
//!
//! let config = ServerConfig::new("127.0.0.1:8080".parse().unwrap());
//! let mut server = Server::new(config, |ctx: &ReactorContext| HandlerWorker::new(ctx, Hello))?;
//! server.start()?;
//! server.run()?;
//! # Ok::<(), httpipe::server::ServerError>(())
//! ```

pub mod acceptor;
pub mod pool;
pub mod reactor;

pub use pool::{RoundRobin, WorkerPool};
pub use reactor::{HandlerWorker, Job, ReactorContext, Worker, WorkerFactory};

use crate::config::{ConfigError, ServerConfig};
use crate::connection::StatsSnapshot;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::info;

/// Errors from building, starting or running a server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to build runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to spawn reactor {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("server already started")]
    AlreadyStarted,

    #[error("server not started")]
    NotStarted,

    #[error("reactor {0} is not running")]
    ReactorGone(usize),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Stops a running server from any thread.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    /// Requests shutdown. Repeated calls do nothing.
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Server stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// A pipelining HTTP/1.1 server: one acceptor and a pool of reactors.
pub struct Server<F: WorkerFactory> {
    config: ServerConfig,
    runtime: Runtime,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    pool: WorkerPool<F::Worker>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl<F: WorkerFactory> Server<F> {
    /// Validates `config` and starts the reactor threads.
    ///
    /// Nothing is listening until [`start`](Self::start) is called.
    pub fn new(config: ServerConfig, factory: F) -> Result<Self, ServerError> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let pool = WorkerPool::new(
            config.effective_pool_size(),
            Arc::new(factory),
            config.connection,
            Arc::clone(&shutdown),
        )?;

        Ok(Self {
            config,
            runtime,
            listener: None,
            local_addr: None,
            pool,
            shutdown,
        })
    }

    /// Binds the listening socket and returns its address.
    pub fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.local_addr.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = self.config.listen_addr;
        let _guard = self.runtime.enter();
        let listener = acceptor::bind_listener(&self.config)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            reactors = self.pool.size(),
            depth = self.config.connection.pipeline_depth,
            "Listening"
        );
        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Accepts connections until [`stop`](Self::stop) is called.
    pub fn run(&mut self) -> Result<(), ServerError> {
        self.run_until(std::future::pending())
    }

    /// Accepts connections until stopped or until `signal` resolves, then
    /// stops the pool.
    pub fn run_until<S>(&mut self, signal: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        let listener = self.listener.take().ok_or(ServerError::NotStarted)?;
        let shutdown = self.shutdown.subscribe();
        let pool = &mut self.pool;
        let config = &self.config;

        self.runtime.block_on(async {
            tokio::select! {
                _ = acceptor::accept_loop(&listener, pool, config, shutdown) => {}
                _ = signal => {
                    info!("Shutdown signal received, stopping server...");
                }
            }
        });

        drop(listener);
        self.shutdown.send_replace(true);
        self.pool.stop();
        info!("Server shutdown complete");
        Ok(())
    }

    /// Requests shutdown. Idempotent.
    pub fn stop(&self) {
        self.handle().stop();
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Address of the listening socket once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Counters summed over every reactor.
    pub fn stats(&self) -> StatsSnapshot {
        self.pool.stats()
    }
}
