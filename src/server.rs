//! TCP server for HTTP connections.
//!
//! Owns the listening socket and runs the accept loop. Every accepted
//! connection gets its own task that serves exactly one request; there is no
//! cap on the number of concurrent connections.

use crate::protocols::http::{handle_connection, ConnectionSettings, RequestHandler};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Listening,
}

/// Server startup and run errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),
    #[error("failed to create socket: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),
    #[error("server is not listening")]
    NotListening,
}

/// Server instance
pub struct Server {
    settings: ConnectionSettings,
    backlog: i32,
    state: Mutex<ServerState>,
    listener: Mutex<Option<Listening>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// A bound socket and the stop signal of the `start` that created it.
struct Listening {
    listener: TcpListener,
    shutdown: watch::Receiver<bool>,
}

impl Default for Server {
    fn default() -> Self {
        Server::new(ConnectionSettings::default(), DEFAULT_BACKLOG)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Server {
    /// Create a new server instance
    pub fn new(settings: ConnectionSettings, backlog: i32) -> Self {
        Server {
            settings,
            backlog,
            state: Mutex::new(ServerState::Stopped),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServerState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Listening
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Bind and listen on `host:port`.
    ///
    /// An empty host or `0.0.0.0` listens on all IPv4 interfaces. Port 0
    /// picks an ephemeral port; the bound address is returned. On any
    /// failure the server stays `Stopped`. Must be called from within a
    /// Tokio runtime.
    pub fn start(&self, host: &str, port: u16) -> Result<SocketAddr, ServerError> {
        {
            let mut state = lock(&self.state);
            if *state != ServerState::Stopped {
                warn!("Server is already running");
                return Err(ServerError::AlreadyRunning);
            }
            *state = ServerState::Starting;
        }

        match self.open_listener(host, port) {
            Ok((listener, addr)) => {
                // Each start gets its own channel so a later start cannot
                // revive an accept loop an earlier stop has ended.
                let (sender, shutdown) = watch::channel(false);
                *lock(&self.listener) = Some(Listening { listener, shutdown });
                *lock(&self.shutdown) = Some(sender);
                *lock(&self.local_addr) = Some(addr);
                *lock(&self.state) = ServerState::Listening;

                info!(address = %addr, "Server listening");
                Ok(addr)
            }
            Err(e) => {
                error!(host, port, error = %e, "Failed to start server");
                *lock(&self.state) = ServerState::Stopped;
                Err(e)
            }
        }
    }

    fn open_listener(
        &self,
        host: &str,
        port: u16,
    ) -> Result<(TcpListener, SocketAddr), ServerError> {
        let ip: IpAddr = match host {
            "" | "0.0.0.0" => Ipv4Addr::UNSPECIFIED.into(),
            host => host
                .parse()
                .map_err(|_| ServerError::InvalidAddress(host.to_string()))?,
        };
        let listener = create_listener(SocketAddr::new(ip, port), self.backlog)?;
        let listener = TcpListener::from_std(listener).map_err(ServerError::Socket)?;
        let addr = listener.local_addr().map_err(ServerError::Socket)?;
        Ok((listener, addr))
    }

    /// Accept connections until [`Server::stop`] is called.
    ///
    /// Each connection is served on its own task with `handler` producing
    /// the response bytes. Accept failures are logged and retried after a
    /// short pause; they never end the loop.
    pub async fn run(&self, handler: RequestHandler) -> Result<(), ServerError> {
        let Listening {
            listener,
            mut shutdown,
        } = lock(&self.listener).take().ok_or(ServerError::NotListening)?;

        info!("Waiting for client connections");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "New connection");
                        let handler = handler.clone();
                        let settings = self.settings;
                        tokio::spawn(async move {
                            handle_connection(stream, peer, handler, settings).await;
                            debug!(peer = %peer, "Connection closed");
                        });
                    }
                    Err(e) => {
                        if !self.is_running() {
                            break;
                        }
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        info!("Accept loop stopped");
        Ok(())
    }

    /// Stop accepting and close the listening socket. Connections already
    /// accepted finish their exchange.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ServerState::Stopped {
                return;
            }
            *state = ServerState::Stopped;
        }

        if let Some(sender) = lock(&self.shutdown).take() {
            sender.send_replace(true);
        }
        lock(&self.listener).take();
        lock(&self.local_addr).take();
        info!("Server stopped");
    }
}

/// Create a listening socket with SO_REUSEADDR set.
fn create_listener(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener, ServerError> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(ServerError::Socket)?;

    socket.set_reuse_address(true).map_err(ServerError::Socket)?;
    socket.set_nonblocking(true).map_err(ServerError::Socket)?;
    socket
        .bind(&addr.into())
        .map_err(|source| ServerError::Bind { addr, source })?;
    socket.listen(backlog).map_err(ServerError::Listen)?;

    Ok(socket.into())
}
