//! Pipelined Connection Engine
//!
//! One `Connection` drives one client socket. It reads requests as fast as
//! the pipeline has room for them, hands each one to the request handler
//! together with a [`CommitHandle`], and writes responses back strictly in
//! the order the requests arrived.
//!
//! ## Connection Lifecycle
//!
//! ```text
//!            start()
//!               │
//!               ▼
//!        ┌─────────────┐   ring full    ┌─────────────┐
//!        │   Reading   │ ─────────────> │   Paused    │
//!        │             │ <───────────── │             │
//!        └──────┬──────┘  head retired  └──────┬──────┘
//!               │                              │
//!               │ I/O error, parse error,      │ stop()
//!               │ close-requested response,    │
//!               │ peer EOF, stop()             │
//!               ▼                              ▼
//!        ┌────────────────────────────────────────────┐
//!        │ Closed: half-close, handle_close() once    │
//!        └────────────────────────────────────────────┘
//! ```
//!
//! ## Single-Loop Serialization
//!
//! Reads and writes run in the same task. Each turn of the loop first drains
//! every response that is ready at the head of the ring, then waits for
//! either more inbound bytes (only while the ring has room) or a wake-up from
//! `commit()`. A read can therefore never overlap a write on the same socket.
//!
//! ## Ownership
//!
//! The engine task holds the only long-lived strong reference to the shared
//! connection state. Commit handles hold a `Weak` reference, so a handle that
//! outlives its connection fails cleanly instead of keeping it alive.

use crate::config::ConnectionOptions;
use crate::connection::commit::{CommitError, CommitHandle};
use crate::connection::stats::ConnectionStats;
use crate::pipeline::{PipelineBuffer, PipelineError};
use crate::protocol::{HttpParser, ParseError, Request, Response};
use bytes::BytesMut;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Initial inbound buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Receives every request read from a connection.
///
/// Both callbacks run on the connection's reactor thread.
pub trait RequestHandler: 'static {
    /// Called exactly once per framed request.
    ///
    /// The handler answers by filling in `handle.response_mut()` and calling
    /// `handle.commit()`, now or later from another task on the same reactor.
    /// Dropping the handle uncommitted leaves the slot pending forever, which
    /// eventually stalls the connection once the ring fills up.
    fn handle_request(&self, handle: CommitHandle, request: Request);

    /// Called exactly once when the connection reaches `Closed`.
    fn handle_close(&self, connection: &ConnectionHandle) {
        let _ = connection;
    }
}

/// Observable state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading requests; the ring has free slots
    Reading,
    /// The ring is full; reads resume once the head response is written
    Paused,
    /// Terminal
    Closed,
}

/// State shared between the engine task, its handles and commit handles.
pub(crate) struct Shared {
    id: u64,
    peer: Option<SocketAddr>,
    pipeline: RefCell<PipelineBuffer<Response>>,
    state: Cell<ConnectionState>,
    stop_requested: Cell<bool>,
    /// Signalled when the head slot is committed or a stop is requested
    wake: Notify,
    /// Signalled only by a stop request; aborts pending writes
    stop_signal: Notify,
}

impl Shared {
    fn is_stopping(&self) -> bool {
        self.stop_requested.get() || self.state.get() == ConnectionState::Closed
    }

    /// Stores `response` in slot `index` and marks it ready.
    ///
    /// The response is only taken out of `response` once every check has
    /// passed, so a failed commit leaves the caller's value untouched.
    pub(crate) fn commit(&self, index: usize, response: &mut Response) -> Result<(), CommitError> {
        if self.is_stopping() {
            return Err(CommitError::ConnectionClosed);
        }

        let mut pipeline = self.pipeline.borrow_mut();
        if pipeline.is_ready(index)? {
            return Err(PipelineError::AlreadyCommitted(index).into());
        }
        *pipeline.get_mut(index)? = std::mem::take(response);
        pipeline.commit(index)?;

        // Only the head can unblock the writer
        if index == pipeline.head() {
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Resolves once a stop has been requested.
    async fn stopped(&self) {
        while !self.stop_requested.get() {
            self.stop_signal.notified().await;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state.get() != ConnectionState::Closed {
            self.state.set(state);
        }
    }
}

/// A cheap, cloneable reference to a running connection.
///
/// Handles are how applications track connections, for example to reap idle
/// ones. Holding a handle keeps the shared state alive but not the socket:
/// once the connection closes, the handle only reports `Closed`.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Rc<Shared>,
}

impl ConnectionHandle {
    pub(crate) fn from_shared(shared: Rc<Shared>) -> Self {
        Self { shared }
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.get() == ConnectionState::Closed
    }

    /// Number of requests read but not yet answered on the wire.
    pub fn outstanding(&self) -> usize {
        self.shared.pipeline.borrow().len()
    }

    /// Asks the engine to close the connection.
    ///
    /// Pending commits start failing immediately. The socket is half-closed
    /// and `handle_close` runs the next time the engine task is polled.
    /// Calling `stop` again, or on a closed connection, does nothing.
    pub fn stop(&self) {
        if self.shared.is_stopping() {
            return;
        }
        self.shared.stop_requested.set(true);
        self.shared.wake.notify_one();
        self.shared.stop_signal.notify_one();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("state", &self.shared.state.get())
            .finish()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The peer sent something that is not HTTP/1.1
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial request)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,

    /// Ring invariant violated
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// What the write pass decided.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// The engine for one pipelined connection.
pub struct Connection<S, H> {
    /// The transport; writes are buffered and flushed once per pass
    stream: BufWriter<S>,

    /// Inbound bytes not yet framed into a request
    buffer: BytesMut,

    shared: Rc<Shared>,

    handler: Rc<H>,

    parser: HttpParser,

    options: ConnectionOptions,

    /// Reactor statistics (optional)
    stats: Option<Arc<ConnectionStats>>,
}

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
    H: RequestHandler,
{
    /// Creates an engine for `stream`. Nothing happens until it is started.
    pub fn new(
        stream: S,
        peer: Option<SocketAddr>,
        handler: Rc<H>,
        options: ConnectionOptions,
    ) -> Self {
        let shared = Rc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            pipeline: RefCell::new(PipelineBuffer::new(options.pipeline_depth)),
            state: Cell::new(ConnectionState::Reading),
            stop_requested: Cell::new(false),
            wake: Notify::new(),
            stop_signal: Notify::new(),
        });

        Self {
            stream: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            shared,
            handler,
            parser: HttpParser::with_limits(options.max_head_size, options.max_body_size),
            options,
            stats: None,
        }
    }

    /// Records this connection in a reactor's statistics.
    pub fn with_stats(mut self, stats: Arc<ConnectionStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Replaces the default framing limits.
    pub fn with_parser(mut self, parser: HttpParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::from_shared(Rc::clone(&self.shared))
    }

    /// Spawns the engine on the current `LocalSet` and returns its handle.
    ///
    /// # Panics
    ///
    /// Panics when called outside a `LocalSet`, like `tokio::task::spawn_local`.
    pub fn start(self) -> ConnectionHandle {
        let handle = self.handle();
        tokio::task::spawn_local(self.run());
        handle
    }

    /// Runs the connection to completion.
    pub async fn run(mut self) {
        let id = self.shared.id;
        let peer = self.shared.peer;
        if let Some(stats) = &self.stats {
            stats.connection_opened();
        }
        debug!(conn = id, client = ?peer, "Connection started");

        let result = self.serve().await;

        match &result {
            Ok(()) => debug!(conn = id, client = ?peer, "Connection closed"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(conn = id, client = ?peer, "Client disconnected")
            }
            Err(ConnectionError::IoError(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(conn = id, client = ?peer, "Connection reset by client")
            }
            Err(e) => warn!(conn = id, client = ?peer, error = %e, "Connection error"),
        }

        self.close().await;
    }

    /// The read/write loop. Returns `Ok` for orderly closes.
    async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            if self.flush_ready().await? == Flow::Close {
                return Ok(());
            }
            if self.shared.stop_requested.get() {
                return Ok(());
            }

            let full = self.shared.pipeline.borrow().full();
            if full {
                self.shared.set_state(ConnectionState::Paused);
            } else {
                self.shared.set_state(ConnectionState::Reading);
                // Requests pipelined in one read are already buffered
                if let Some(request) = self.try_parse_request()? {
                    self.dispatch(request)?;
                    continue;
                }
            }

            let Self {
                stream,
                buffer,
                shared,
                options,
                stats,
                ..
            } = self;

            tokio::select! {
                biased;

                _ = shared.wake.notified() => {}

                read = read_more(stream.get_mut(), buffer, options.max_buffer_size), if !full => {
                    let n = read?;
                    if let Some(stats) = stats {
                        stats.bytes_read(n);
                    }
                    trace!(conn = shared.id, bytes = n, "Read data");
                }
            }
        }
    }

    /// Attempts to frame a request from the buffer.
    fn try_parse_request(&mut self) -> Result<Option<Request>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse_request(&self.buffer) {
            Ok(Some((request, consumed))) => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    conn = self.shared.id,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed request"
                );
                Ok(Some(request))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(conn = self.shared.id, error = %e, "Parse error");
                Err(ConnectionError::ParseError(e))
            }
        }
    }

    /// Puts `request` in the next slot and hands it to the handler.
    fn dispatch(&mut self, request: Request) -> Result<(), ConnectionError> {
        let index = {
            let mut pipeline = self.shared.pipeline.borrow_mut();
            let index = pipeline.consume()?;
            pipeline.push()?;
            index
        };

        if let Some(stats) = &self.stats {
            stats.request_dispatched();
        }
        trace!(
            conn = self.shared.id,
            slot = index,
            method = %request.method,
            target = %request.target,
            "Dispatching request"
        );

        let response = Response::for_request(&request);
        let handle = CommitHandle::new(Rc::downgrade(&self.shared), index, response);
        self.handler.handle_request(handle, request);
        Ok(())
    }

    /// Writes every ready response at the head of the ring.
    async fn flush_ready(&mut self) -> Result<Flow, ConnectionError> {
        let mut wrote = false;

        loop {
            let (frame, close) = {
                let pipeline = self.shared.pipeline.borrow();
                if !pipeline.ready() {
                    break;
                }
                let response = pipeline.front()?;
                (response.serialize(), response.close_requested())
            };

            match until_stopped(&self.shared, self.stream.write_all(&frame)).await {
                Some(result) => result?,
                None => return Ok(Flow::Close),
            }
            wrote = true;
            if let Some(stats) = &self.stats {
                stats.response_written(frame.len());
            }
            trace!(conn = self.shared.id, bytes = frame.len(), "Sent response");

            if close {
                if let Some(result) = until_stopped(&self.shared, self.stream.flush()).await {
                    result?;
                }
                return Ok(Flow::Close);
            }
            // Retiring the head frees a slot, so a paused reader resumes on
            // the next loop turn.
            self.shared.pipeline.borrow_mut().pop()?;
        }

        if wrote {
            match until_stopped(&self.shared, self.stream.flush()).await {
                Some(result) => result?,
                None => return Ok(Flow::Close),
            }
        }
        Ok(Flow::Continue)
    }

    /// Transitions to `Closed`: half-close, release buffers, notify once.
    ///
    /// Bytes still sitting in the write buffer are discarded; every orderly
    /// path has flushed them already.
    async fn close(&mut self) {
        self.shared.state.set(ConnectionState::Closed);

        if let Err(e) = self.stream.get_mut().shutdown().await {
            trace!(conn = self.shared.id, error = %e, "Shutdown failed");
        }
        self.buffer = BytesMut::new();

        if let Some(stats) = &self.stats {
            stats.connection_closed();
        }

        let handle = self.handle();
        self.handler.handle_close(&handle);
    }
}

impl<S, H> Drop for Connection<S, H> {
    fn drop(&mut self) {
        // An abandoned engine must not accept commits nobody will write
        self.shared.state.set(ConnectionState::Closed);
    }
}

/// Runs a write, giving up as soon as a stop is requested.
async fn until_stopped<F>(shared: &Shared, write: F) -> Option<std::io::Result<()>>
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        biased;

        _ = shared.stopped() => None,

        result = write => Some(result),
    }
}

/// Reads more data from the socket into the buffer.
async fn read_more<S: AsyncRead + Unpin>(
    stream: &mut S,
    buffer: &mut BytesMut,
    max_buffer_size: usize,
) -> Result<usize, ConnectionError> {
    if buffer.len() >= max_buffer_size {
        return Err(ConnectionError::BufferFull);
    }

    // Ensure we have some capacity
    if buffer.capacity() - buffer.len() < 1024 {
        buffer.reserve(INITIAL_BUFFER_SIZE);
    }

    let n = stream.read_buf(buffer).await?;
    if n == 0 {
        if buffer.is_empty() {
            return Err(ConnectionError::ClientDisconnected);
        }
        return Err(ConnectionError::UnexpectedEof);
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_response;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::task::LocalSet;

    /// Keeps every handle so the test decides when to commit.
    #[derive(Default)]
    struct Deferred {
        handles: RefCell<Vec<CommitHandle>>,
        dispatched: Cell<usize>,
        closes: Cell<usize>,
    }

    impl Deferred {
        fn take(&self) -> Vec<CommitHandle> {
            self.handles.borrow_mut().drain(..).collect()
        }
    }

    impl RequestHandler for Deferred {
        fn handle_request(&self, mut handle: CommitHandle, request: Request) {
            self.dispatched.set(self.dispatched.get() + 1);
            echo_into(&mut handle, &request);
            self.handles.borrow_mut().push(handle);
        }

        fn handle_close(&self, _connection: &ConnectionHandle) {
            self.closes.set(self.closes.get() + 1);
        }
    }

    /// Commits immediately.
    #[derive(Default)]
    struct Echo {
        dispatched: Cell<usize>,
        closes: Cell<usize>,
    }

    impl RequestHandler for Echo {
        fn handle_request(&self, mut handle: CommitHandle, request: Request) {
            self.dispatched.set(self.dispatched.get() + 1);
            echo_into(&mut handle, &request);
            handle.commit().unwrap();
        }

        fn handle_close(&self, _connection: &ConnectionHandle) {
            self.closes.set(self.closes.get() + 1);
        }
    }

    fn echo_into(handle: &mut CommitHandle, request: &Request) {
        let seq = request.headers.get("seq").unwrap_or("0").to_string();
        let response = handle.response_mut();
        response.body = request.body.clone();
        response.headers.set("seq", seq);
    }

    fn options(depth: usize) -> ConnectionOptions {
        ConnectionOptions {
            pipeline_depth: depth,
            ..ConnectionOptions::default()
        }
    }

    fn request_bytes(body: &str, seq: usize) -> Bytes {
        Request::new("POST", "/pipeline")
            .with_header("seq", seq.to_string())
            .with_body(body.to_string())
            .serialize()
    }

    async fn send_all(client: &mut DuplexStream, bodies: &[&str]) {
        for (i, body) in bodies.iter().enumerate() {
            client.write_all(&request_bytes(body, i + 1)).await.unwrap();
        }
    }

    async fn read_responses(client: &mut DuplexStream, count: usize) -> Vec<Response> {
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        while out.len() < count {
            if let Some((response, used)) = parse_response(&buf).unwrap() {
                let _ = buf.split_to(used);
                out.push(response);
                continue;
            }
            let n = client.read_buf(&mut buf).await.unwrap();
            assert!(n > 0, "unexpected EOF after {} responses", out.len());
        }
        out
    }

    async fn settle() {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        while !cond() {
            tokio::task::yield_now().await;
        }
    }

    fn bodies_and_seqs(responses: &[Response]) -> Vec<(String, String)> {
        responses
            .iter()
            .map(|r| {
                (
                    String::from_utf8_lossy(&r.body).to_string(),
                    r.headers.get("seq").unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    async fn within<F: std::future::Future>(fut: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("test timed out")
    }

    #[tokio::test]
    async fn test_out_of_order_commits_are_written_in_order() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (mut client, server) = tokio::io::duplex(64 * 1024);
            let handler = Rc::new(Deferred::default());
            let conn = Connection::new(server, None, Rc::clone(&handler), options(4)).start();

            send_all(&mut client, &["a", "b", "c", "d"]).await;

            // Depth 4 leaves room for three outstanding requests
            wait_until(|| handler.handles.borrow().len() == 3).await;
            settle().await;
            assert_eq!(handler.dispatched.get(), 3);
            assert_eq!(conn.state(), ConnectionState::Paused);

            let mut first = handler.take();
            first[2].commit().unwrap();
            first[0].commit().unwrap();

            // Retiring "a" frees a slot for "d"
            wait_until(|| handler.handles.borrow().len() == 1).await;
            let mut last = handler.take();
            first[1].commit().unwrap();
            last[0].commit().unwrap();

            let responses = read_responses(&mut client, 4).await;
            assert_eq!(
                bodies_and_seqs(&responses),
                vec![
                    ("a".to_string(), "1".to_string()),
                    ("b".to_string(), "2".to_string()),
                    ("c".to_string(), "3".to_string()),
                    ("d".to_string(), "4".to_string()),
                ]
            );
        }))
        .await;
    }

    #[tokio::test]
    async fn test_any_completion_order_is_serialized() {
        let orders: [[usize; 5]; 4] = [
            [0, 1, 2, 3, 4],
            [4, 3, 2, 1, 0],
            [2, 0, 4, 1, 3],
            [1, 3, 0, 4, 2],
        ];
        let bodies = ["one", "two", "three", "four", "five"];

        for order in orders {
            let local = LocalSet::new();
            within(local.run_until(async {
                let (mut client, server) = tokio::io::duplex(64 * 1024);
                let handler = Rc::new(Deferred::default());
                let _conn = Connection::new(server, None, Rc::clone(&handler), options(8)).start();

                send_all(&mut client, &bodies).await;
                wait_until(|| handler.handles.borrow().len() == bodies.len()).await;

                let mut handles = handler.take();
                for &i in order.iter() {
                    handles[i].commit().unwrap();
                }

                let responses = read_responses(&mut client, bodies.len()).await;
                let got: Vec<String> = bodies_and_seqs(&responses)
                    .into_iter()
                    .map(|(body, _)| body)
                    .collect();
                assert_eq!(got, bodies.to_vec(), "commit order {:?}", order);
            }))
            .await;
        }
    }

    #[tokio::test]
    async fn test_full_ring_pauses_reading() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (mut client, server) = tokio::io::duplex(64 * 1024);
            let handler = Rc::new(Deferred::default());
            let conn = Connection::new(server, None, Rc::clone(&handler), options(3)).start();

            send_all(&mut client, &["1", "2", "3", "4", "5"]).await;
            settle().await;
            assert_eq!(handler.dispatched.get(), 2);
            assert_eq!(conn.outstanding(), 2);
            assert_eq!(conn.state(), ConnectionState::Paused);

            // Committing a non-head slot does not free anything
            let mut handles = handler.take();
            handles[1].commit().unwrap();
            settle().await;
            assert_eq!(handler.dispatched.get(), 2);

            handles[0].commit().unwrap();
            wait_until(|| handler.dispatched.get() == 4).await;
            settle().await;
            assert_eq!(handler.dispatched.get(), 4);
            assert_eq!(conn.outstanding(), 2);

            let responses = read_responses(&mut client, 2).await;
            assert_eq!(&responses[1].body[..], b"2");
        }))
        .await;
    }

    #[tokio::test]
    async fn test_double_commit_fails_without_side_effects() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (mut client, server) = tokio::io::duplex(64 * 1024);
            let handler = Rc::new(Deferred::default());
            let conn = Connection::new(server, None, Rc::clone(&handler), options(4)).start();

            send_all(&mut client, &["x", "y"]).await;
            wait_until(|| handler.handles.borrow().len() == 2).await;
            let mut handles = handler.take();

            handles[1].commit().unwrap();
            assert!(handles[1].is_committed());
            assert_eq!(handles[1].commit(), Err(CommitError::AlreadyCommitted));
            assert_eq!(conn.outstanding(), 2);

            handles[0].commit().unwrap();
            let responses = read_responses(&mut client, 2).await;
            assert_eq!(&responses[0].body[..], b"x");
            assert_eq!(&responses[1].body[..], b"y");

            settle().await;
            assert_eq!(conn.outstanding(), 0);
            assert!(!conn.is_closed());
        }))
        .await;
    }

    #[tokio::test]
    async fn test_commit_after_stop_fails() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (mut client, server) = tokio::io::duplex(64 * 1024);
            let handler = Rc::new(Deferred::default());
            let conn = Connection::new(server, None, Rc::clone(&handler), options(4)).start();

            send_all(&mut client, &["late"]).await;
            wait_until(|| handler.handles.borrow().len() == 1).await;
            let mut handles = handler.take();

            conn.stop();
            conn.stop();
            assert_eq!(handles[0].commit(), Err(CommitError::ConnectionClosed));
            // The response stays with the handle
            assert_eq!(&handles[0].response().body[..], b"late");

            wait_until(|| handler.closes.get() == 1).await;
            assert!(conn.is_closed());

            // The peer sees the half-close and no response
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());

            settle().await;
            assert_eq!(handler.closes.get(), 1);
        }))
        .await;
    }

    #[tokio::test]
    async fn test_handle_outliving_connection_fails() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (mut client, server) = tokio::io::duplex(64 * 1024);
            let handler = Rc::new(Deferred::default());
            let conn = Connection::new(server, None, Rc::clone(&handler), options(4)).start();

            send_all(&mut client, &["gone"]).await;
            wait_until(|| handler.handles.borrow().len() == 1).await;
            let mut handles = handler.take();
            drop(conn);

            // Peer goes away; the engine task finishes and drops its state
            drop(client);
            wait_until(|| handler.closes.get() == 1).await;
            settle().await;

            assert!(handles[0].connection().is_none());
            assert_eq!(handles[0].commit(), Err(CommitError::ConnectionClosed));
        }))
        .await;
    }

    #[tokio::test]
    async fn test_close_requested_response_ends_connection() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (mut client, server) = tokio::io::duplex(64 * 1024);
            let handler = Rc::new(Echo::default());
            let conn = Connection::new(server, None, Rc::clone(&handler), options(4)).start();

            let closing = Request::new("POST", "/")
                .with_header("Connection", "close")
                .with_body("bye")
                .serialize();
            client.write_all(&closing).await.unwrap();
            client.write_all(&request_bytes("never", 2)).await.unwrap();

            let responses = read_responses(&mut client, 1).await;
            assert_eq!(&responses[0].body[..], b"bye");
            assert!(responses[0].close_requested());

            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());

            wait_until(|| handler.closes.get() == 1).await;
            assert_eq!(handler.dispatched.get(), 1);
            assert!(conn.is_closed());
        }))
        .await;
    }

    #[tokio::test]
    async fn test_peer_eof_closes_once() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (client, server) = tokio::io::duplex(1024);
            let handler = Rc::new(Echo::default());
            let conn = Connection::new(server, None, Rc::clone(&handler), options(4)).start();

            drop(client);
            wait_until(|| conn.is_closed()).await;
            settle().await;
            assert_eq!(handler.closes.get(), 1);
            assert_eq!(handler.dispatched.get(), 0);
        }))
        .await;
    }

    #[tokio::test]
    async fn test_stats_are_recorded() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (mut client, server) = tokio::io::duplex(64 * 1024);
            let stats = Arc::new(ConnectionStats::new());
            let handler = Rc::new(Echo::default());
            let conn = Connection::new(server, None, Rc::clone(&handler), options(4))
                .with_stats(Arc::clone(&stats))
                .start();

            send_all(&mut client, &["s1", "s2"]).await;
            read_responses(&mut client, 2).await;

            let snap = stats.snapshot();
            assert_eq!(snap.connections_accepted, 1);
            assert_eq!(snap.active_connections, 1);
            assert_eq!(snap.requests_dispatched, 2);
            assert_eq!(snap.responses_written, 2);
            assert!(snap.bytes_read > 0);

            drop(client);
            wait_until(|| conn.is_closed()).await;
            assert_eq!(stats.snapshot().active_connections, 0);
        }))
        .await;
    }

    #[tokio::test]
    async fn test_malformed_request_closes_without_response() {
        // The mock panics on any unexpected write
        let stream = tokio_test::io::Builder::new()
            .read(b"garbage\r\n\r\n")
            .build();
        let handler = Rc::new(Echo::default());

        Connection::new(stream, None, Rc::clone(&handler), options(4))
            .run()
            .await;

        assert_eq!(handler.dispatched.get(), 0);
        assert_eq!(handler.closes.get(), 1);
    }

    #[tokio::test]
    async fn test_buffer_limit_closes_connection() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (mut client, server) = tokio::io::duplex(64 * 1024);
            let handler = Rc::new(Echo::default());
            let opts = ConnectionOptions {
                pipeline_depth: 4,
                max_buffer_size: 16,
                ..ConnectionOptions::default()
            };
            let conn = Connection::new(server, None, Rc::clone(&handler), opts).start();

            // A head that never ends
            client
                .write_all(b"GET /aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa HTTP/1.1\r\nX: y")
                .await
                .unwrap();
            wait_until(|| conn.is_closed()).await;
            assert_eq!(handler.closes.get(), 1);
            assert_eq!(handler.dispatched.get(), 0);
        }))
        .await;
    }

    #[tokio::test]
    async fn test_stop_aborts_blocked_write() {
        let local = LocalSet::new();
        within(local.run_until(async {
            // The peer never reads, so a large response cannot drain
            let (mut client, server) = tokio::io::duplex(64);
            let handler = Rc::new(Deferred::default());
            let conn = Connection::new(server, None, Rc::clone(&handler), options(4)).start();

            send_all(&mut client, &["big"]).await;
            wait_until(|| handler.handles.borrow().len() == 1).await;
            let mut handles = handler.take();
            handles[0].response_mut().body = Bytes::from(vec![b'x'; 1024 * 1024]);
            handles[0].commit().unwrap();
            settle().await;
            assert!(!conn.is_closed());

            conn.stop();
            wait_until(|| handler.closes.get() == 1).await;
            assert!(conn.is_closed());
            drop(client);
        }))
        .await;
    }

    #[tokio::test]
    async fn test_write_error_closes_once() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let mut wire = request_bytes("first", 1).to_vec();
            wire.extend_from_slice(&request_bytes("second", 2));
            let stream = tokio_test::io::Builder::new()
                .read(&wire)
                .write_error(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "peer went away",
                ))
                .build();
            let handler = Rc::new(Deferred::default());
            let conn = Connection::new(stream, None, Rc::clone(&handler), options(4)).start();

            wait_until(|| handler.handles.borrow().len() == 2).await;
            let mut handles = handler.take();
            handles[0].commit().unwrap();

            wait_until(|| handler.closes.get() == 1).await;
            assert!(conn.is_closed());
            assert_eq!(handles[1].commit(), Err(CommitError::ConnectionClosed));

            settle().await;
            assert_eq!(handler.closes.get(), 1);
        }))
        .await;
    }

    #[tokio::test]
    async fn test_depth_one_alternates_requests_and_responses() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (mut client, server) = tokio::io::duplex(64 * 1024);
            let handler = Rc::new(Deferred::default());
            let conn = Connection::new(server, None, Rc::clone(&handler), options(1)).start();

            send_all(&mut client, &["ping", "pong"]).await;
            wait_until(|| handler.dispatched.get() == 1).await;
            settle().await;
            assert_eq!(handler.dispatched.get(), 1);
            assert_eq!(conn.state(), ConnectionState::Paused);

            let mut first = handler.take();
            first[0].commit().unwrap();
            let responses = read_responses(&mut client, 1).await;
            assert_eq!(&responses[0].body[..], b"ping");

            wait_until(|| handler.dispatched.get() == 2).await;
            let mut second = handler.take();
            second[0].commit().unwrap();
            let responses = read_responses(&mut client, 1).await;
            assert_eq!(&responses[0].body[..], b"pong");
        }))
        .await;
    }

    #[tokio::test]
    async fn test_body_up_to_parser_limit_is_dispatched() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (mut client, server) = tokio::io::duplex(1024 * 1024);
            let handler = Rc::new(Deferred::default());
            let conn = Connection::new(
                server,
                None,
                Rc::clone(&handler),
                ConnectionOptions::default(),
            )
            .start();

            let body = "b".repeat(9 * 1024 * 1024);
            let wire = request_bytes(&body, 1);
            tokio::task::spawn_local(async move {
                client.write_all(&wire).await.unwrap();
                // Hold the stream open until the test ends
                std::future::pending::<()>().await;
            });

            wait_until(|| handler.dispatched.get() == 1 || conn.is_closed()).await;
            assert!(!conn.is_closed());
            let handles = handler.take();
            assert_eq!(handles[0].response().body.len(), 9 * 1024 * 1024);
        }))
        .await;
    }

    #[tokio::test]
    async fn test_abandoned_engine_rejects_commits() {
        let local = LocalSet::new();
        let handler = Rc::new(Deferred::default());
        let (client, conn) = local
            .run_until(async {
                let (mut client, server) = tokio::io::duplex(64 * 1024);
                let conn =
                    Connection::new(server, None, Rc::clone(&handler), options(4)).start();
                send_all(&mut client, &["orphan"]).await;
                within(wait_until(|| handler.handles.borrow().len() == 1)).await;
                (client, conn)
            })
            .await;

        // Dropping the set drops the engine task without running close
        drop(local);
        let mut handles = handler.take();
        assert!(conn.is_closed());
        assert_eq!(handler.closes.get(), 0);
        assert_eq!(handles[0].commit(), Err(CommitError::ConnectionClosed));
        drop(client);
    }
}
