//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and serves HTTP/1.1 requests through a [`Router`].
//! Each connection runs on its own task; persistent connections (keep-alive)
//! are supported out of the box.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::Method;
use crate::router::{IntoHandler, RouteError, Router};

pub mod config;
mod connection;

pub use config::ServerConfig;

use connection::Connection;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Errors produced while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("address {addr} is already in use")]
    AddressInUse {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("permission denied binding to {addr}")]
    PermissionDenied {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("address {addr} is not available on this host")]
    AddressNotAvailable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    fn bind(addr: &str, source: io::Error) -> Self {
        let addr = addr.to_owned();
        match source.kind() {
            io::ErrorKind::AddrInUse => Self::AddressInUse { addr, source },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { addr, source },
            io::ErrorKind::AddrNotAvailable => Self::AddressNotAvailable { addr, source },
            _ => Self::Bind { addr, source },
        }
    }
}

// The route table is mutable until the first `listen`, then shared read-only.
enum Routes {
    Open(Router),
    Sealed(Arc<Router>),
}

/// The erica HTTP server.
///
/// Register routes, then call [`Server::listen`] to start serving on a TCP
/// address. The route table is frozen from that point on.
///
/// # Examples
///
/// ```rust,no_run
/// use erica::{Context, Response, Server, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut server = Server::new(ServerConfig::default());
///     server.get("/", |_ctx: Context, res: Response| async move {
///         Ok(res.text("Hello!"))
///     })?;
///
///     let handle = server.listen("127.0.0.1:8080").await?;
///     println!("listening on {}", handle.local_addr());
///     tokio::signal::ctrl_c().await?;
///     handle.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct Server {
    routes: Routes,
    config: Arc<ServerConfig>,
}

impl Server {
    /// Creates a server with an empty route table.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_router(Router::new(), config)
    }

    /// Creates a server that serves an already populated `router`.
    pub fn with_router(router: Router, config: ServerConfig) -> Self {
        Self {
            routes: Routes::Open(router),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Adds a route; see [`Router::register`].
    ///
    /// # Errors
    ///
    /// Besides the errors of [`Router::register`], returns
    /// [`RouteError::ServerAlreadyRunning`] once [`Server::listen`] has been
    /// called.
    pub fn register(
        &mut self,
        method: Method,
        pattern: &str,
        handler: impl IntoHandler,
    ) -> Result<(), RouteError> {
        match &mut self.routes {
            Routes::Open(router) => router.register(method, pattern, handler),
            Routes::Sealed(_) => Err(RouteError::ServerAlreadyRunning),
        }
    }

    /// Adds a `GET` route.
    pub fn get(&mut self, pattern: &str, handler: impl IntoHandler) -> Result<(), RouteError> {
        self.register(Method::Get, pattern, handler)
    }

    /// Adds a `POST` route.
    pub fn post(&mut self, pattern: &str, handler: impl IntoHandler) -> Result<(), RouteError> {
        self.register(Method::Post, pattern, handler)
    }

    // Freezes the route table and returns a shared handle to it.
    fn seal(&mut self) -> Arc<Router> {
        let router = match std::mem::replace(&mut self.routes, Routes::Open(Router::new())) {
            Routes::Open(router) => Arc::new(router),
            Routes::Sealed(router) => router,
        };
        self.routes = Routes::Sealed(Arc::clone(&router));
        router
    }

    /// Binds `addr` and starts serving in the background.
    ///
    /// Returns once the socket is bound, so [`ServerHandle::local_addr`]
    /// reports the real port when `addr` asked for port `0`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AddressInUse`], [`ServerError::PermissionDenied`],
    /// [`ServerError::AddressNotAvailable`] or [`ServerError::Bind`] when the
    /// address cannot be bound.
    pub async fn listen(&mut self, addr: impl AsRef<str>) -> Result<ServerHandle, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::bind(addr, e))?;
        let local_addr = listener.local_addr()?;

        let router = self.seal();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(
            address = %local_addr,
            routes = router.len(),
            max_connections = ?self.config.max_connections,
            "erica listening"
        );

        let task = tokio::spawn(accept_loop(
            listener,
            router,
            Arc::clone(&self.config),
            shutdown_rx,
        ));

        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }

    /// [`Server::listen`] on `host:port`.
    pub async fn listen_on(&mut self, host: &str, port: u16) -> Result<ServerHandle, ServerError> {
        self.listen(format!("{host}:{port}")).await
    }

    /// Serves on `addr` until Ctrl-C, then shuts down gracefully.
    ///
    /// # Errors
    ///
    /// Returns bind errors as [`Server::listen`] does, or [`ServerError::Io`]
    /// if the signal handler cannot be installed.
    pub async fn run(mut self, addr: impl AsRef<str>) -> Result<(), ServerError> {
        let handle = self.listen(addr).await?;
        let signal = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        handle.shutdown().await;
        signal?;
        Ok(())
    }
}

/// A running server.
///
/// Dropping the handle leaves the server running until the process exits.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Returns the address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for open ones to finish.
    ///
    /// Idle connections close immediately; a connection in the middle of a
    /// request finishes it and answers with `Connection: close`. Connections
    /// still open after the configured grace period are aborted.
    pub async fn shutdown(self) {
        // Send only fails once the accept loop is already gone.
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "server task failed");
        }
    }
}

// Resolves once shutdown is signalled. Never resolves if the handle was
// dropped without signalling.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Arc<Router>,
    config: Arc<ServerConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let limit = config.max_connections.map(|n| Arc::new(Semaphore::new(n)));
    let mut connections = JoinSet::new();

    loop {
        while let Some(finished) = connections.try_join_next() {
            log_connection_exit(finished);
        }

        // Acquire the slot before accepting so excess clients wait in the backlog.
        let permit = match &limit {
            Some(semaphore) => tokio::select! {
                permit = Arc::clone(semaphore).acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                _ = wait_for_shutdown(&mut shutdown) => break,
            },
            None => None,
        };

        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
            _ = wait_for_shutdown(&mut shutdown) => break,
        };

        debug!(peer = %peer, "connection accepted");
        let connection = Connection::new(
            stream,
            peer,
            Arc::clone(&router),
            Arc::clone(&config),
            shutdown.clone(),
        );
        connections.spawn(async move {
            // Held for the lifetime of the connection.
            let _permit = permit;
            connection.serve().await;
        });
    }

    drop(listener);
    drain(connections, config.shutdown_grace_period).await;
}

async fn drain(mut connections: JoinSet<()>, grace: Duration) {
    info!(active = connections.len(), "draining connections");

    let finished = tokio::time::timeout(grace, async {
        while let Some(finished) = connections.join_next().await {
            log_connection_exit(finished);
        }
    })
    .await;

    if finished.is_err() {
        warn!(
            remaining = connections.len(),
            "grace period elapsed, aborting connections"
        );
        connections.shutdown().await;
    }
    info!("server stopped");
}

fn log_connection_exit(result: Result<(), JoinError>) {
    match result {
        Err(e) if e.is_panic() => error!(error = %e, "connection task panicked"),
        _ => {}
    }
}
