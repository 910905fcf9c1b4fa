//! Worker Pool
//!
//! Owns the reactor threads and decides which reactor gets the next
//! connection. Distribution is plain round robin: reactor `0`, `1`, ...,
//! `M - 1`, then `0` again.

use crate::config::ConnectionOptions;
use crate::connection::{ConnectionStats, StatsSnapshot};
use crate::server::reactor::{run_reactor, Job, ReactorContext, Worker, WorkerFactory};
use crate::server::ServerError;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Round-robin cursor over `size` reactors.
#[derive(Debug, Clone)]
pub struct RoundRobin {
    next: usize,
    size: usize,
}

impl RoundRobin {
    /// A size of 0 is treated as 1.
    pub fn new(size: usize) -> Self {
        Self {
            next: 0,
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the current index and advances the cursor.
    pub fn next_index(&mut self) -> usize {
        let index = self.next;
        self.next = (self.next + 1) % self.size;
        index
    }
}

struct ReactorSlot<W> {
    jobs: mpsc::UnboundedSender<Job<W>>,
    stats: Arc<ConnectionStats>,
    thread: Option<JoinHandle<()>>,
}

/// A fixed set of reactors fed through their job queues.
pub struct WorkerPool<W> {
    reactors: Vec<ReactorSlot<W>>,
    cursor: RoundRobin,
    shutdown: Arc<watch::Sender<bool>>,
}

impl<W: Worker + 'static> WorkerPool<W> {
    /// Starts `size` reactor threads (at least one), each with a worker
    /// built by `factory`.
    pub fn new<F>(
        size: usize,
        factory: Arc<F>,
        options: ConnectionOptions,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Result<Self, ServerError>
    where
        F: WorkerFactory<Worker = W>,
    {
        let size = size.max(1);
        let mut pool = Self {
            reactors: Vec::with_capacity(size),
            cursor: RoundRobin::new(size),
            shutdown,
        };

        for index in 0..size {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(ServerError::Runtime)?;
            let (jobs, receiver) = mpsc::unbounded_channel();
            let stats = Arc::new(ConnectionStats::new());
            let context = ReactorContext::new(
                index,
                options,
                Arc::clone(&stats),
                pool.shutdown.subscribe(),
            );
            let factory = Arc::clone(&factory);

            // On error, dropping `pool` stops the reactors already running
            let thread = std::thread::Builder::new()
                .name(format!("reactor-{}", index))
                .spawn(move || run_reactor(runtime, factory, context, receiver))
                .map_err(|source| ServerError::Spawn { index, source })?;

            pool.reactors.push(ReactorSlot {
                jobs,
                stats,
                thread: Some(thread),
            });
        }

        debug!(reactors = size, "Worker pool started");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.reactors.len()
    }

    /// Posts `job` onto reactor `index`.
    pub fn post(&self, index: usize, job: Job<W>) -> Result<(), ServerError> {
        let reactor = self
            .reactors
            .get(index)
            .ok_or(ServerError::ReactorGone(index))?;
        reactor
            .jobs
            .send(job)
            .map_err(|_| ServerError::ReactorGone(index))
    }

    /// Hands an accepted socket to the next reactor in turn and returns its
    /// index.
    ///
    /// The socket must be in non-blocking mode. It is registered with the
    /// target reactor's I/O driver on arrival.
    pub fn dispatch(&mut self, stream: std::net::TcpStream) -> Result<usize, ServerError> {
        let index = self.cursor.next_index();
        let job: Job<W> = Box::new(move |worker: &mut W| match TcpStream::from_std(stream) {
            Ok(stream) => worker.handle_connection(stream),
            Err(e) => warn!(reactor = index, error = %e, "Failed to register socket"),
        });
        self.post(index, job)?;
        Ok(index)
    }

    /// Counters of one reactor.
    pub fn reactor_stats(&self, index: usize) -> Option<StatsSnapshot> {
        self.reactors.get(index).map(|r| r.stats.snapshot())
    }

    /// Counters summed over every reactor.
    pub fn stats(&self) -> StatsSnapshot {
        self.reactors.iter().map(|r| r.stats.snapshot()).sum()
    }

    /// Stops every reactor and waits for its thread to exit.
    ///
    /// Connections still open are dropped without their close callback.
    /// Calling `stop` again does nothing.
    pub fn stop(&mut self) {
        self.shutdown.send_replace(true);

        for (index, reactor) in self.reactors.iter_mut().enumerate() {
            if let Some(thread) = reactor.thread.take() {
                if thread.join().is_err() {
                    warn!(reactor = index, "Reactor thread panicked");
                }
            }
        }
    }
}

impl<W> Drop for WorkerPool<W> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        for reactor in &mut self.reactors {
            if let Some(thread) = reactor.thread.take() {
                let _ = thread.join();
            }
        }
    }
}
