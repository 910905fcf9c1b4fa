//! httpipe echo server
//!
//! Answers every request with its own body, copying the `seq` header so
//! pipelining clients can check ordering. Each reactor also reaps
//! connections that have been idle for too long.

use httpipe::connection::{CommitHandle, ConnectionHandle, RequestHandler};
use httpipe::protocol::Request;
use httpipe::server::{ReactorContext, Server, Worker};
use httpipe::ServerConfig;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// How often each reactor looks for idle connections
const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Connections silent for longer than this are closed
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Command-line configuration
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Number of reactors (0 = one per core)
    threads: usize,
    /// Per-connection pipeline depth
    depth: usize,
    /// Set SO_REUSEPORT on the listener
    reuse_port: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: httpipe::DEFAULT_HOST.to_string(),
            port: httpipe::DEFAULT_PORT,
            threads: 0,
            depth: httpipe::config::DEFAULT_PIPELINE_DEPTH,
            reuse_port: false,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = value_of(&args, i, "--host").to_string();
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = parse_value(&args, i, "--port", "invalid port number");
                    i += 2;
                }
                "--threads" | "-t" => {
                    config.threads = parse_value(&args, i, "--threads", "invalid thread count");
                    i += 2;
                }
                "--depth" | "-d" => {
                    config.depth = parse_value(&args, i, "--depth", "invalid pipeline depth");
                    i += 2;
                }
                "--reuse-port" => {
                    config.reuse_port = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("httpipe version {}", httpipe::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str, message: &str) -> T {
    value_of(args, i, flag).parse().unwrap_or_else(|_| {
        eprintln!("Error: {}", message);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
httpipe - Pipelined HTTP/1.1 echo server

USAGE:
    httpipe [OPTIONS]

OPTIONS:
    -h, --host <HOST>       Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>       Port to listen on (default: 8080)
    -t, --threads <N>       Number of reactors, 0 = one per core (default: 0)
    -d, --depth <N>         Pipeline depth per connection (default: 16)
        --reuse-port        Set SO_REUSEPORT on the listening socket
    -v, --version           Print version information
        --help              Print this help message

EXAMPLES:
    httpipe                          # Start on 127.0.0.1:8080
    httpipe --port 9000 -t 4         # Four reactors on port 9000
    httpipe --host 0.0.0.0 -d 64     # All interfaces, deeper pipelines
"#
    );
}

/// Per-connection bookkeeping for idle reaping
struct Tracked {
    handle: ConnectionHandle,
    last_active: Instant,
}

/// Echoes requests and remembers when each connection was last used.
#[derive(Default)]
struct EchoHandler {
    connections: RefCell<HashMap<u64, Tracked>>,
}

impl EchoHandler {
    fn track(&self, handle: ConnectionHandle) {
        let tracked = Tracked {
            handle: handle.clone(),
            last_active: Instant::now(),
        };
        self.connections.borrow_mut().insert(handle.id(), tracked);
    }

    /// Stops every connection idle for longer than `timeout`.
    fn reap(&self, timeout: Duration) -> usize {
        let idle: Vec<ConnectionHandle> = self
            .connections
            .borrow()
            .values()
            .filter(|t| t.last_active.elapsed() > timeout)
            .map(|t| t.handle.clone())
            .collect();

        for handle in &idle {
            debug!(conn = handle.id(), client = ?handle.peer_addr(), "Reaping idle connection");
            handle.stop();
        }
        idle.len()
    }
}

impl RequestHandler for EchoHandler {
    fn handle_request(&self, mut handle: CommitHandle, request: Request) {
        if let Some(conn) = handle.connection() {
            if let Some(tracked) = self.connections.borrow_mut().get_mut(&conn.id()) {
                tracked.last_active = Instant::now();
            }
        }

        let response = handle.response_mut();
        response.body = request.body.clone();
        if let Some(seq) = request.headers.get("seq") {
            response.headers.set("seq", seq);
        }

        if let Err(e) = handle.commit() {
            debug!(error = %e, "Dropped response");
        }
    }

    fn handle_close(&self, connection: &ConnectionHandle) {
        self.connections.borrow_mut().remove(&connection.id());
    }
}

/// One per reactor: spawns connections and runs the reaper.
struct EchoWorker {
    context: ReactorContext,
    handler: Rc<EchoHandler>,
}

impl EchoWorker {
    fn new(context: &ReactorContext) -> Self {
        let handler = Rc::new(EchoHandler::default());

        let reaper = Rc::clone(&handler);
        let ctx = context.clone();
        tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ctx.stopped() => break,
                    _ = interval.tick() => {
                        let reaped = reaper.reap(IDLE_TIMEOUT);
                        if reaped > 0 {
                            info!(reactor = ctx.index(), reaped = reaped, "Closed idle connections");
                        }
                    }
                }
            }
        });

        Self {
            context: context.clone(),
            handler,
        }
    }
}

impl Worker for EchoWorker {
    fn handle_connection(&mut self, stream: TcpStream) {
        let handle = self
            .context
            .spawn_connection(stream, Rc::clone(&self.handler));
        self.handler.track(handle);
    }

    fn on_stop(&mut self) {
        info!(
            reactor = self.context.index(),
            open = self.handler.connections.borrow().len(),
            "Worker stopping"
        );
    }
}

fn print_banner(addr: SocketAddr, reactors: usize, depth: usize) {
    println!(
        r#"
httpipe v{} - Pipelined HTTP/1.1 Server
──────────────────────────────────────────────────────────────
Server started on {}
Reactors: {}    Pipeline depth: {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        httpipe::VERSION,
        addr,
        reactors,
        depth
    );
}

fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let args = Config::from_args();

    // Set up logging
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let listen_addr: SocketAddr = args.bind_address().parse()?;
    let config = ServerConfig::new(listen_addr)
        .with_pool_size(args.threads)
        .with_pipeline_depth(args.depth)
        .with_reuse_port(args.reuse_port);

    let mut server = Server::new(config, EchoWorker::new)?;
    let addr = server.start()?;
    print_banner(addr, server.pool_size(), args.depth);

    server.run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    })?;

    let stats = server.stats();
    info!(
        connections = stats.connections_accepted,
        requests = stats.requests_dispatched,
        bytes_in = stats.bytes_read,
        bytes_out = stats.bytes_written,
        "Server totals"
    );
    Ok(())
}
