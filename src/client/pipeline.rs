//! Pipelined Client Engine
//!
//! The mirror image of the server-side connection engine: requests are
//! written as soon as they are issued and responses are matched to requests
//! purely by arrival order, through a FIFO of callbacks.
//!
//! ```text
//!  request(r1, cb1) ─┐                    ┌─> cb1(resp1)
//!  request(r2, cb2) ─┼─> writer task ─>   │
//!  request(r3, cb3) ─┘     socket   ─> reader task ─> cb2(resp2)
//!                                         └─> cb3(resp3)
//! ```
//!
//! On any failure every queued callback receives an error, oldest first, and
//! the queue is emptied.

use crate::protocol::{HttpParser, ParseError, Request, Response};
use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Callback receiving the response to one request, or why there is none.
pub type ResponseCallback = Box<dyn FnOnce(Result<Response, ClientError>)>;

/// Connection state of a [`PipelineClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client-side errors. Cloned into every aborted callback.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,

    #[error("pipeline full: {0} requests in flight")]
    PipelineFull(usize),

    #[error("connect failed: {0}")]
    Connect(Arc<io::Error>),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    #[error("response received with no request outstanding")]
    UnsolicitedResponse,

    #[error("connection closed by peer")]
    Closed,

    #[error("request aborted")]
    Aborted,
}

struct Inner {
    depth: usize,
    state: watch::Sender<ClientState>,
    callbacks: RefCell<VecDeque<ResponseCallback>>,
    outbound: RefCell<Option<mpsc::UnboundedSender<Bytes>>>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
    last_error: RefCell<Option<ClientError>>,
}

impl Inner {
    fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Hands `response` to the oldest callback. Returns false once the
    /// client has been shut down as a result.
    fn deliver(&self, response: Response) -> bool {
        let close = response.close_requested();
        let callback = self.callbacks.borrow_mut().pop_front();

        match callback {
            Some(callback) => callback(Ok(response)),
            None => {
                warn!(status = response.status, "Unsolicited response");
                self.shutdown(ClientError::UnsolicitedResponse);
                return false;
            }
        }

        if close {
            debug!("Server requested close");
            self.shutdown(ClientError::Closed);
            return false;
        }
        // A callback may have stopped the client
        self.state() == ClientState::Connected
    }

    /// Tears the connection down and fails every queued callback in order.
    fn shutdown(&self, error: ClientError) {
        self.state.send_replace(ClientState::Disconnected);
        self.last_error.borrow_mut().get_or_insert_with(|| error.clone());
        self.outbound.borrow_mut().take();
        for task in self.tasks.borrow_mut().drain(..) {
            task.abort();
        }

        // Pop one at a time so no borrow is held while a callback runs
        loop {
            let callback = self.callbacks.borrow_mut().pop_front();
            match callback {
                Some(callback) => callback(Err(error.clone())),
                None => break,
            }
        }
    }
}

/// A pipelining HTTP/1.1 client bound to one connection.
///
/// Lives on a single thread; every method that starts I/O must be called
/// inside a `LocalSet`. Dropping the client stops it.
pub struct PipelineClient {
    inner: Rc<Inner>,
}

impl PipelineClient {
    /// Creates a disconnected client allowing `depth` requests in flight.
    pub fn new(depth: usize) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            inner: Rc::new(Inner {
                depth: depth.max(1),
                state,
                callbacks: RefCell::new(VecDeque::new()),
                outbound: RefCell::new(None),
                tasks: RefCell::new(Vec::new()),
                last_error: RefCell::new(None),
            }),
        }
    }

    /// Starts connecting to `addr` in the background.
    ///
    /// Requests fail with [`ClientError::NotConnected`] until
    /// [`connected`](Self::connected) resolves successfully.
    pub fn connect(addr: SocketAddr, depth: usize) -> Self {
        let client = Self::new(depth);
        client.inner.state.send_replace(ClientState::Connecting);

        let weak = Rc::downgrade(&client.inner);
        let task = tokio::task::spawn_local(async move {
            let result = TcpStream::connect(addr).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(server = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    debug!(server = %addr, "Connected");
                    attach(&inner, stream);
                }
                Err(e) => {
                    warn!(server = %addr, error = %e, "Connect failed");
                    inner.shutdown(ClientError::Connect(Arc::new(e)));
                }
            }
        });
        client.inner.tasks.borrow_mut().push(task);
        client
    }

    /// Wraps an already connected stream.
    pub fn from_stream<S>(stream: S, depth: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + 'static,
    {
        let client = Self::new(depth);
        attach(&client.inner, stream);
        client
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    /// Requests queued or written but not yet answered.
    pub fn in_flight(&self) -> usize {
        self.inner.callbacks.borrow().len()
    }

    /// Waits for the connection attempt to finish.
    pub async fn connected(&self) -> Result<(), ClientError> {
        let mut state = self.inner.state.subscribe();
        let settled = state
            .wait_for(|s| *s != ClientState::Connecting)
            .await
            .map(|s| *s)
            .unwrap_or(ClientState::Disconnected);

        match settled {
            ClientState::Connected => Ok(()),
            _ => Err(self
                .inner
                .last_error
                .borrow()
                .clone()
                .unwrap_or(ClientError::NotConnected)),
        }
    }

    /// Queues `request` and registers `callback` for its response.
    ///
    /// Fails without side effects when not connected or when `depth`
    /// requests are already in flight.
    pub fn request<C>(&self, request: &Request, callback: C) -> Result<(), ClientError>
    where
        C: FnOnce(Result<Response, ClientError>) + 'static,
    {
        if self.state() != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }

        let in_flight = self.in_flight();
        if in_flight >= self.inner.depth {
            return Err(ClientError::PipelineFull(in_flight));
        }

        let frame = request.serialize();
        let sent = match self.inner.outbound.borrow().as_ref() {
            Some(outbound) => outbound.send(frame).is_ok(),
            None => false,
        };
        if !sent {
            return Err(ClientError::NotConnected);
        }

        self.inner.callbacks.borrow_mut().push_back(Box::new(callback));
        trace!(
            method = %request.method,
            target = %request.target,
            in_flight = in_flight + 1,
            "Request queued"
        );
        Ok(())
    }

    /// Sends `request` and waits for its response.
    pub async fn send(&self, request: &Request) -> Result<Response, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.request(request, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(ClientError::Aborted))
    }

    /// Closes the connection, failing queued callbacks with
    /// [`ClientError::Aborted`].
    pub fn stop(&self) {
        self.inner.shutdown(ClientError::Aborted);
    }
}

impl Drop for PipelineClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts the reader and writer tasks for `stream`.
fn attach<S>(inner: &Rc<Inner>, stream: S)
where
    S: AsyncRead + AsyncWrite + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (outbound, frames) = mpsc::unbounded_channel();
    *inner.outbound.borrow_mut() = Some(outbound);
    inner.state.send_replace(ClientState::Connected);

    let write_task = tokio::task::spawn_local(write_loop(Rc::downgrade(inner), writer, frames));
    let read_task = tokio::task::spawn_local(read_loop(Rc::downgrade(inner), reader));
    inner.tasks.borrow_mut().extend([write_task, read_task]);
}

async fn write_loop<W>(
    inner: Weak<Inner>,
    writer: W,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    while let Some(frame) = frames.recv().await {
        let mut result = writer.write_all(&frame).await;

        // Coalesce whatever else is already queued into one flush
        while result.is_ok() {
            match frames.try_recv() {
                Ok(frame) => result = writer.write_all(&frame).await,
                Err(_) => break,
            }
        }
        if result.is_ok() {
            result = writer.flush().await;
        }

        if let Err(e) = result {
            warn!(error = %e, "Write failed");
            if let Some(inner) = inner.upgrade() {
                inner.shutdown(ClientError::Io(Arc::new(e)));
            }
            return;
        }
    }
}

async fn read_loop<R>(inner: Weak<Inner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let parser = HttpParser::new();
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        loop {
            match parser.parse_response(&buffer) {
                Ok(Some((response, consumed))) => {
                    let _ = buffer.split_to(consumed);
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    if !inner.deliver(response) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Malformed response");
                    if let Some(inner) = inner.upgrade() {
                        inner.shutdown(ClientError::Protocol(e));
                    }
                    return;
                }
            }
        }

        if buffer.capacity() - buffer.len() < 1024 {
            buffer.reserve(4096);
        }

        let error = match reader.read_buf(&mut buffer).await {
            Ok(0) => ClientError::Closed,
            Ok(n) => {
                trace!(bytes = n, "Read data");
                continue;
            }
            Err(e) => ClientError::Io(Arc::new(e)),
        };

        debug!(error = %error, "Connection lost");
        if let Some(inner) = inner.upgrade() {
            inner.shutdown(error);
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;
    use crate::connection::{CommitHandle, Connection, RequestHandler};
    use std::cell::Cell;
    use std::future::Future;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::task::LocalSet;

    struct Echo;

    impl RequestHandler for Echo {
        fn handle_request(&self, mut handle: CommitHandle, request: Request) {
            handle.response_mut().body = request.body.clone();
            let _ = handle.commit();
        }
    }

    type Log = Rc<RefCell<Vec<Result<String, String>>>>;

    fn record(log: &Log) -> impl FnOnce(Result<Response, ClientError>) + 'static {
        let log = Rc::clone(log);
        move |result| {
            let entry = match result {
                Ok(response) => Ok(String::from_utf8_lossy(&response.body).to_string()),
                Err(e) => Err(e.to_string()),
            };
            log.borrow_mut().push(entry);
        }
    }

    fn post(body: &str) -> Request {
        Request::new("POST", "/").with_body(body.to_string())
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        while !cond() {
            tokio::task::yield_now().await;
        }
    }

    async fn within<F: Future>(fut: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("test timed out")
    }

    #[test]
    fn test_request_requires_connection() {
        let client = PipelineClient::new(4);
        assert_eq!(client.state(), ClientState::Disconnected);
        let called = Rc::new(Cell::new(false));
        let flag = Rc::clone(&called);
        let result = client.request(&post("x"), move |_| flag.set(true));
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert_eq!(client.in_flight(), 0);
        assert!(!called.get());
    }

    #[tokio::test]
    async fn test_responses_arrive_in_request_order() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (client_io, server_io) = tokio::io::duplex(64 * 1024);
            let _server = Connection::new(
                server_io,
                None,
                Rc::new(Echo),
                ConnectionOptions::default(),
            )
            .start();

            let client = PipelineClient::from_stream(client_io, 4);
            assert!(client.is_connected());
            let log: Log = Rc::default();
            for body in ["r1", "r2", "r3"] {
                client.request(&post(body), record(&log)).unwrap();
            }
            assert_eq!(client.in_flight(), 3);

            wait_until(|| log.borrow().len() == 3).await;
            assert_eq!(
                *log.borrow(),
                vec![
                    Ok("r1".to_string()),
                    Ok("r2".to_string()),
                    Ok("r3".to_string())
                ]
            );
            assert_eq!(client.in_flight(), 0);
        }))
        .await;
    }

    #[tokio::test]
    async fn test_depth_limits_in_flight_requests() {
        let local = LocalSet::new();
        within(local.run_until(async {
            // The peer never answers
            let (client_io, _silent) = tokio::io::duplex(64 * 1024);
            let client = PipelineClient::from_stream(client_io, 2);
            let log: Log = Rc::default();

            client.request(&post("a"), record(&log)).unwrap();
            client.request(&post("b"), record(&log)).unwrap();
            let third = client.request(&post("c"), record(&log));
            assert!(matches!(third, Err(ClientError::PipelineFull(2))));
            assert_eq!(client.in_flight(), 2);
            assert!(log.borrow().is_empty());
        }))
        .await;
    }

    #[tokio::test]
    async fn test_stop_aborts_callbacks_in_fifo_order() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (client_io, _silent) = tokio::io::duplex(64 * 1024);
            let client = PipelineClient::from_stream(client_io, 8);
            let order = Rc::new(RefCell::new(Vec::new()));

            for i in 0..5 {
                let order = Rc::clone(&order);
                client
                    .request(&post("pending"), move |result| {
                        assert!(matches!(result, Err(ClientError::Aborted)));
                        order.borrow_mut().push(i);
                    })
                    .unwrap();
            }

            client.stop();
            assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
            assert_eq!(client.in_flight(), 0);
            assert_eq!(client.state(), ClientState::Disconnected);

            client.stop();
            assert_eq!(order.borrow().len(), 5);
            assert!(matches!(
                client.request(&post("late"), |_| {}),
                Err(ClientError::NotConnected)
            ));
        }))
        .await;
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_requests() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (client_io, server_io) = tokio::io::duplex(64 * 1024);
            let client = PipelineClient::from_stream(client_io, 8);
            let log: Log = Rc::default();
            client.request(&post("one"), record(&log)).unwrap();
            client.request(&post("two"), record(&log)).unwrap();

            // Let the writer put both requests on the wire first
            for _ in 0..32 {
                tokio::task::yield_now().await;
            }
            drop(server_io);
            wait_until(|| log.borrow().len() == 2).await;
            let closed = ClientError::Closed.to_string();
            assert_eq!(*log.borrow(), vec![Err(closed.clone()), Err(closed)]);
            assert_eq!(client.state(), ClientState::Disconnected);
        }))
        .await;
    }

    #[tokio::test]
    async fn test_malformed_response_is_protocol_error() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (client_io, mut server_io) = tokio::io::duplex(64 * 1024);
            let client = PipelineClient::from_stream(client_io, 8);
            let log: Log = Rc::default();
            client.request(&post("q"), record(&log)).unwrap();

            server_io.write_all(b"NOT-HTTP nonsense\r\n\r\n").await.unwrap();
            wait_until(|| log.borrow().len() == 1).await;
            assert!(log.borrow()[0].as_ref().unwrap_err().starts_with("protocol error"));
            assert!(!client.is_connected());
        }))
        .await;
    }

    #[tokio::test]
    async fn test_close_requested_response_disconnects() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let (client_io, server_io) = tokio::io::duplex(64 * 1024);
            let _server = Connection::new(
                server_io,
                None,
                Rc::new(Echo),
                ConnectionOptions::default(),
            )
            .start();

            let client = PipelineClient::from_stream(client_io, 4);
            let request = post("last").with_header("Connection", "close");
            let response = client.send(&request).await.unwrap();
            assert_eq!(&response.body[..], b"last");
            assert!(response.close_requested());
            assert_eq!(client.state(), ClientState::Disconnected);
        }))
        .await;
    }

    #[tokio::test]
    async fn test_connect_and_send_over_tcp() {
        let local = LocalSet::new();
        within(local.run_until(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::task::spawn_local(async move {
                let (stream, peer) = listener.accept().await.unwrap();
                Connection::new(stream, Some(peer), Rc::new(Echo), ConnectionOptions::default())
                    .run()
                    .await;
            });

            let client = PipelineClient::connect(addr, 4);
            assert_eq!(client.state(), ClientState::Connecting);
            assert!(matches!(
                client.request(&post("early"), |_| {}),
                Err(ClientError::NotConnected)
            ));
            client.connected().await.unwrap();

            let response = client.send(&post("ping")).await.unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(&response.body[..], b"ping");
        }))
        .await;
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let local = LocalSet::new();
        within(local.run_until(async {
            // Grab a free port, then close it
            let addr = {
                let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                listener.local_addr().unwrap()
            };

            let client = PipelineClient::connect(addr, 4);
            let result = client.connected().await;
            assert!(matches!(result, Err(ClientError::Connect(_))));
            assert_eq!(client.state(), ClientState::Disconnected);
        }))
        .await;
    }
}
