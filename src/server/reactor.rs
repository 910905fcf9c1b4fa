//! Reactors
//!
//! A reactor is one OS thread running a current-thread tokio runtime and a
//! `LocalSet`. Every connection it owns lives as a local task on that
//! thread, so connection state never needs a lock. The only way in from
//! another thread is the reactor's job queue.
//!
//! ```text
//!   acceptor thread                 reactor thread
//!  ┌───────────────┐   Job<W>    ┌──────────────────────────────┐
//!  │ accept()      │ ──────────> │ jobs.recv() ─> job(&mut W)   │
//!  └───────────────┘   (mpsc)    │                 │            │
//!                                │                 ▼            │
//!                                │   W::handle_connection()     │
//!                                │        spawn_local(engine)   │
//!                                └──────────────────────────────┘
//! ```

use crate::config::ConnectionOptions;
use crate::connection::{Connection, ConnectionHandle, ConnectionStats, RequestHandler};
use std::rc::Rc;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tokio::task::LocalSet;
use tracing::{debug, info};

/// Work posted onto a reactor from another thread.
pub type Job<W> = Box<dyn FnOnce(&mut W) + Send + 'static>;

/// Per-reactor application object.
///
/// Built on the reactor thread by a [`WorkerFactory`] and never leaves it,
/// so it may hold `Rc`s and other thread-local state.
pub trait Worker {
    /// Takes ownership of a freshly accepted socket.
    fn handle_connection(&mut self, stream: TcpStream);

    /// Called on the reactor thread right before the worker is dropped.
    fn on_stop(&mut self) {}
}

/// Builds one [`Worker`] per reactor.
pub trait WorkerFactory: Send + Sync + 'static {
    type Worker: Worker + 'static;

    /// Runs on the reactor thread, inside its `LocalSet`.
    fn create(&self, context: &ReactorContext) -> Self::Worker;
}

impl<Func, W> WorkerFactory for Func
where
    Func: Fn(&ReactorContext) -> W + Send + Sync + 'static,
    W: Worker + 'static,
{
    type Worker = W;

    fn create(&self, context: &ReactorContext) -> W {
        self(context)
    }
}

/// What a worker knows about the reactor it runs on.
#[derive(Clone)]
pub struct ReactorContext {
    index: usize,
    options: ConnectionOptions,
    stats: Arc<ConnectionStats>,
    shutdown: watch::Receiver<bool>,
}

impl ReactorContext {
    pub(crate) fn new(
        index: usize,
        options: ConnectionOptions,
        stats: Arc<ConnectionStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            index,
            options,
            stats,
            shutdown,
        }
    }

    /// Position of this reactor in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn options(&self) -> ConnectionOptions {
        self.options
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Returns true once the pool has been asked to stop.
    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the pool has been asked to stop.
    pub async fn stopped(&self) {
        let mut shutdown = self.shutdown.clone();
        // A dropped sender means the pool is gone, which counts as stopped
        let _ = shutdown.wait_for(|stop| *stop).await;
    }

    /// Builds a connection engine for `stream` and starts it on this reactor.
    pub fn spawn_connection<H: RequestHandler>(
        &self,
        stream: TcpStream,
        handler: Rc<H>,
    ) -> ConnectionHandle {
        let peer = stream.peer_addr().ok();
        let handle = Connection::new(stream, peer, handler, self.options)
            .with_stats(Arc::clone(&self.stats))
            .start();
        debug!(reactor = self.index, conn = handle.id(), "Connection spawned");
        handle
    }
}

/// A [`Worker`] that serves every connection with one shared handler.
pub struct HandlerWorker<H> {
    context: ReactorContext,
    handler: Rc<H>,
}

impl<H: RequestHandler> HandlerWorker<H> {
    pub fn new(context: &ReactorContext, handler: H) -> Self {
        Self {
            context: context.clone(),
            handler: Rc::new(handler),
        }
    }

    pub fn handler(&self) -> &Rc<H> {
        &self.handler
    }
}

impl<H: RequestHandler> Worker for HandlerWorker<H> {
    fn handle_connection(&mut self, stream: TcpStream) {
        self.context
            .spawn_connection(stream, Rc::clone(&self.handler));
    }
}

/// Body of a reactor thread.
///
/// Builds the worker, then runs jobs until the pool stops or every sender is
/// gone. Tasks still pending at that point are dropped with the `LocalSet`.
pub(crate) fn run_reactor<F: WorkerFactory>(
    runtime: Runtime,
    factory: Arc<F>,
    context: ReactorContext,
    mut jobs: mpsc::UnboundedReceiver<Job<F::Worker>>,
) {
    let index = context.index;
    let local = LocalSet::new();

    local.block_on(&runtime, async move {
        let mut worker = factory.create(&context);
        let mut shutdown = context.shutdown.clone();
        info!(reactor = index, "Reactor started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.wait_for(|stop| *stop) => break,

                job = jobs.recv() => match job {
                    Some(job) => job(&mut worker),
                    None => break,
                },
            }
        }

        worker.on_stop();
        drop(worker);
    });

    drop(local);
    info!(reactor = index, "Reactor stopped");
}
