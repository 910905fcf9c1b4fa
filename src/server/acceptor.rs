//! Acceptor
//!
//! Binds the listening socket and runs the accept loop. One accept is
//! outstanding at a time; each accepted socket is detached from the
//! acceptor's runtime and handed to the next reactor in the pool.

use crate::config::ServerConfig;
use crate::server::pool::WorkerPool;
use crate::server::reactor::Worker;
use std::io;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Creates the listening socket described by `config`.
///
/// SO_REUSEADDR is always set. SO_REUSEPORT is set when requested and
/// supported. Must be called from within a tokio runtime.
pub(crate) fn bind_listener(config: &ServerConfig) -> io::Result<TcpListener> {
    let socket = if config.listen_addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    socket.set_reuseaddr(true)?;

    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    if config.reuse_port {
        socket.set_reuseport(true)?;
    }

    #[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
    if config.reuse_port {
        warn!("SO_REUSEPORT is not supported on this platform, ignoring");
    }

    socket.bind(config.listen_addr)?;
    socket.listen(config.backlog)
}

/// Accepts connections until `shutdown` flips to true.
pub(crate) async fn accept_loop<W: Worker + 'static>(
    listener: &TcpListener,
    pool: &mut WorkerPool<W>,
    config: &ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            biased;

            _ = shutdown.wait_for(|stop| *stop) => break,

            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                if config.tcp_nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                }

                // Detach from this runtime's driver; the reactor re-registers it
                let stream = match stream.into_std() {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(client = %addr, error = %e, "Failed to detach socket");
                        continue;
                    }
                };

                match pool.dispatch(stream) {
                    Ok(index) => debug!(client = %addr, reactor = index, "Accepted connection"),
                    Err(e) => error!(client = %addr, error = %e, "Failed to hand off connection"),
                }
            }
            Err(e) => {
                // Usually descriptor exhaustion; give in-flight closes a moment
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(config.accept_backoff).await;
            }
        }
    }
}
