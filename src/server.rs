//!
//! querygate listener
//! ------------------
//! Accepts TCP connections and runs one handler task per connection.
//!
//! Responsibilities:
//! - Bounded concurrency: at most `max_connections` handlers run at once; further
//!   connections wait in the accept backlog.
//! - Accept failures are logged and the loop continues until shutdown is requested.
//! - Ordered shutdown: close the listening socket, stop intake, wait up to the
//!   grace period for in-flight handlers, abort stragglers, stop the session
//!   store, and release the backing store last.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::audit::AuditSink;
use crate::config::GatewayConfig;
use crate::identity::{spawn_reaper, CredentialValidator, SessionStore};
use crate::security::RoleCatalog;
use crate::storage::BackingStore;

pub mod exec;
pub mod handler;
pub mod query;
pub mod wire;

use exec::QueryExecutor;

/// Shared server state injected into every connection handler.
pub struct GatewayState {
    pub sessions: Arc<SessionStore>,
    pub catalog: Arc<RoleCatalog>,
    pub validator: Arc<dyn CredentialValidator>,
    pub executor: Arc<dyn QueryExecutor>,
    pub audit: Arc<dyn AuditSink>,
}

impl GatewayState {
    /// Standard role catalog and a fresh session store using the configured window.
    pub fn new(
        config: &GatewayConfig,
        validator: Arc<dyn CredentialValidator>,
        executor: Arc<dyn QueryExecutor>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            sessions: Arc::new(SessionStore::new(config.session_ttl)),
            catalog: Arc::new(RoleCatalog::standard()),
            validator,
            executor,
            audit,
        }
    }
}

/// Requests shutdown of a running [`Server`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<GatewayState>,
    max_connections: usize,
    shutdown_grace: Duration,
    reaper_interval: Option<Duration>,
    backing_store: Option<Arc<BackingStore>>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Resolve once shutdown has been requested. A dropped sender never resolves.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn log_join(res: Result<(), JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            error!(target: "listener", "connection handler panicked: {}", e);
        } else if e.is_cancelled() {
            debug!(target: "listener", "connection handler cancelled");
        }
    }
}

impl Server {
    /// Bind the listening socket. Bind failure is fatal and not retried.
    pub async fn bind(config: &GatewayConfig, state: GatewayState) -> Result<(Server, ShutdownHandle)> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr).await
            .with_context(|| format!("could not listen on {}", addr))?;
        let (tx, rx) = watch::channel(false);
        state.sessions.start();
        let server = Server {
            listener,
            state: Arc::new(state),
            max_connections: config.max_connections.max(1),
            shutdown_grace: config.shutdown_grace,
            reaper_interval: config.reaper_interval,
            backing_store: None,
            shutdown_rx: rx,
        };
        Ok((server, ShutdownHandle { tx: Arc::new(tx) }))
    }

    /// Close this backing store at the very end of shutdown.
    pub fn with_backing_store(mut self, store: Arc<BackingStore>) -> Self {
        self.backing_store = Some(store);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Accept connections until shutdown is requested, then run the shutdown sequence.
    pub async fn run(self) -> Result<()> {
        let Server { listener, state, max_connections, shutdown_grace, reaper_interval, backing_store, mut shutdown_rx } = self;
        let local = listener.local_addr().ok();
        info!(target: "listener", "querygate listening on {:?} (max_connections={})", local, max_connections);

        let reaper = reaper_interval.map(|every| spawn_reaper(state.sessions.clone(), every, shutdown_rx.clone()));
        let limiter = Arc::new(Semaphore::new(max_connections));
        let mut handlers: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(res) = handlers.try_join_next() { log_join(res); }

            let permit = tokio::select! {
                _ = shutdown_requested(&mut shutdown_rx) => break,
                p = limiter.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let accepted = tokio::select! {
                _ = shutdown_requested(&mut shutdown_rx) => break,
                r = listener.accept() => r,
            };
            match accepted {
                Ok((socket, peer)) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!(target: "listener", "set_nodelay failed for {}: {}", peer, e);
                    }
                    info!(target: "listener", "new client connected: {}", peer);
                    let state = state.clone();
                    handlers.spawn(async move {
                        let _permit = permit;
                        handler::serve_connection(socket, state, peer.to_string()).await;
                    });
                }
                Err(e) => {
                    if *shutdown_rx.borrow() { break; }
                    error!(target: "listener", "error accepting client connection: {}", e);
                }
            }
        }

        // Stop intake: close the listening socket and refuse further handler slots
        drop(listener);
        limiter.close();
        info!(target: "listener", "stopped accepting; waiting up to {:?} for {} connection(s)", shutdown_grace, handlers.len());

        let drained = tokio::time::timeout(shutdown_grace, async {
            while let Some(res) = handlers.join_next().await { log_join(res); }
        }).await;
        if drained.is_err() {
            warn!(target: "listener", "grace period elapsed; cancelling {} connection(s)", handlers.len());
            handlers.abort_all();
            while let Some(res) = handlers.join_next().await { log_join(res); }
        }

        if let Some(h) = reaper {
            h.abort();
            let _ = h.await;
        }
        state.sessions.stop();
        if let Some(store) = backing_store {
            store.close().await;
        }
        info!(target: "listener", "querygate shut down");
        Ok(())
    }
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(target: "querygate", "failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => { stream.recv().await; }
            Err(e) => {
                error!(target: "querygate", "failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
