//! Server execution and the application-facing relay handle.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::{Router, routing::get};
use tokio::{
    sync::{Notify, mpsc},
    task::JoinHandle,
};

use super::{
    config::ServerConfig,
    error::ServerError,
    handler::{get_stats, health_check, websocket_handler},
    protocol,
    state::{AppState, ServerEvent},
};

/// Handle for broadcasting into the relay from application code.
///
/// Cheap to clone; safe to use concurrently from any task.
#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<AppState>,
}

impl RelayHandle {
    /// Fan one text message out to every currently authenticated connection.
    ///
    /// The message is enqueued to each recipient as exactly one text frame,
    /// under the registry lock, so two broadcasts reach a given connection in
    /// call order and the registry cannot change mid-fan-out. Returns once
    /// enqueued everywhere, not once delivered: a slow or broken client only
    /// grows its own queue. Ignored after shutdown has begun.
    pub async fn broadcast(&self, message: impl Into<String>) {
        if self.state.shutting_down.load(Ordering::SeqCst) {
            tracing::debug!("broadcast ignored: server is shutting down");
            return;
        }
        let message = message.into();

        let registry = self.state.registry.lock().await;
        let targets = protocol::broadcast_targets(&registry.clients);
        let target_count = targets.len();
        for (id, sender) in targets {
            if sender.send(message.clone()).is_err() {
                // Receiver already tearing down; it deregisters itself.
                tracing::warn!("connection {}: dropped broadcast, outbound queue closed", id);
            }
        }
        tracing::debug!("broadcast enqueued to {} connection(s)", target_count);
    }
}

/// A running relay server.
///
/// # Example
///
/// ```ignore
/// let config = ServerConfig::new("127.0.0.1", 8736, "swordfish");
/// let (server, mut events) = RelayServer::start(config).await?;
/// server.broadcast("update:1").await;
/// server.shutdown().await?;
/// ```
pub struct RelayServer {
    state: Arc<AppState>,
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    serve_task: JoinHandle<Result<(), io::Error>>,
}

impl RelayServer {
    /// Bind the listener and start accepting connections.
    ///
    /// Returns the running server together with the event channel the owner
    /// should watch for connection terminations and fatal listener failures.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the listener cannot bind. Fatal by design:
    /// a relay with a dead listener serves nobody, so the owner decides
    /// whether to retry or stop the process.
    pub async fn start(
        config: ServerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), ServerError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AppState::new(
            config.password,
            config.auth_window,
            events_tx,
        ));

        let app = Router::new()
            .route("/ws", get(websocket_handler))
            .route("/api/health", get(health_check))
            .route("/api/stats", get(get_stats))
            .with_state(state.clone());

        let bind_addr = format!("{}:{}", config.host, config.port);
        let listener =
            tokio::net::TcpListener::bind(&bind_addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: bind_addr.clone(),
                    source,
                })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: bind_addr,
            source,
        })?;

        tracing::info!("relay server listening on {}", local_addr);
        tracing::info!("clients connect to ws://{}/ws", local_addr);

        let shutdown = Arc::new(Notify::new());
        let shutdown_rx = shutdown.clone();
        let serve_state = state.clone();
        let serve_task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown_rx.notified().await })
                .await;
            if let Err(e) = &result {
                // Process-scoped failure: report it and let the owner decide
                // what to do with the process.
                tracing::error!("listener failed: {}", e);
                serve_state.report_listener_failure(e.to_string());
            }
            result
        });

        Ok((
            Self {
                state,
                local_addr,
                shutdown,
                serve_task,
            },
            events_rx,
        ))
    }

    /// Address the listener actually bound (useful when configured with
    /// port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get a cloneable broadcast handle for application code.
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            state: self.state.clone(),
        }
    }

    /// See [`RelayHandle::broadcast`].
    pub async fn broadcast(&self, message: impl Into<String>) {
        self.handle().broadcast(message).await;
    }

    /// Number of registered connections, authenticated or not.
    pub async fn connection_count(&self) -> usize {
        self.state.connection_count().await
    }

    /// Number of connections currently eligible for broadcasts.
    pub async fn authenticated_count(&self) -> usize {
        self.state.authenticated_count().await
    }

    /// Stop the listener, close every open connection, and wait for the
    /// server to wind down. Broadcasts issued after this point are ignored.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        self.state.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();

        // Removing each entry drops its outbound sender; the connection task
        // answers with a Close frame and exits. Removal is also what makes
        // the per-connection termination event fire exactly once, even when
        // a transport error races with this call.
        let closed = self.state.drain().await;
        if closed > 0 {
            tracing::info!("closed {} connection(s) on shutdown", closed);
        }

        let result = match self.serve_task.await {
            Ok(result) => result.map_err(ServerError::Serve),
            Err(e) => Err(ServerError::Serve(io::Error::other(e))),
        };
        tracing::info!("relay server shut down");
        result
    }
}
