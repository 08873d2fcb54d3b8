//! Server state, connection registry, and owner-facing events.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use crate::common::time::now_millis;

/// Lifecycle state of a single client connection.
///
/// A connection is in exactly one state at any instant. States only advance
/// forward; the only shortcut is that any live state may jump straight to
/// `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, `ACK` sent, waiting for the password line.
    AwaitingAuth,
    /// Password accepted; eligible to receive broadcasts.
    Authenticated,
    /// Tearing down; receives nothing further.
    Closing,
    /// Fully terminated. The registry never holds a `Closed` entry.
    Closed,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal forward transition.
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (AwaitingAuth, Authenticated) | (AwaitingAuth, Closing) | (Authenticated, Closing) => {
                true
            }
            _ => false,
        }
    }
}

/// Events surfaced to the owner of the server.
#[derive(Debug)]
pub enum ServerEvent {
    /// A connection terminated and was removed from the registry.
    /// Emitted exactly once per connection, whichever failure path fires
    /// first.
    ConnectionClosed { id: u64 },
    /// The listener failed after startup. Fatal: the server accepts no new
    /// clients and the owner is expected to stop it.
    ListenerFailed { message: String },
}

/// Registry entry for one client connection.
pub struct ClientInfo {
    /// Writer side of the connection's outbound queue. Dropping it makes the
    /// connection task emit a Close frame and exit.
    pub sender: mpsc::UnboundedSender<String>,
    /// Current lifecycle state
    pub state: ConnectionState,
    /// Unix timestamp when the connection was accepted (milliseconds)
    pub connected_at: i64,
}

/// Connection registry.
///
/// Owned exclusively by the server behind the [`AppState`] mutex: id
/// allocation, registration, state transitions, removal, and broadcast
/// fan-out all happen while holding that lock.
pub struct Registry {
    /// Map of connection id to its registry entry
    pub clients: HashMap<u64, ClientInfo>,
    /// Next connection id; strictly increasing, never reused
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            next_id: 0,
        }
    }

    /// Allocate the next id and register a new connection as `AwaitingAuth`.
    ///
    /// Returns the id together with the receiving side of the connection's
    /// outbound queue.
    pub fn register(&mut self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let id = self.next_id;
        self.next_id += 1;

        let (sender, receiver) = mpsc::unbounded_channel();
        self.clients.insert(
            id,
            ClientInfo {
                sender,
                state: ConnectionState::AwaitingAuth,
                connected_at: now_millis(),
            },
        );

        (id, receiver)
    }

    /// Advance a connection from `AwaitingAuth` to `Authenticated`.
    ///
    /// Returns `false` if the connection is gone or in any other state.
    pub fn authenticate(&mut self, id: u64) -> bool {
        match self.clients.get_mut(&id) {
            Some(info) if info.state == ConnectionState::AwaitingAuth => {
                info.state = ConnectionState::Authenticated;
                true
            }
            _ => false,
        }
    }

    /// Advance a connection to `Closing`. The first caller wins; repeated
    /// calls and calls for unknown ids return `false`.
    pub fn begin_close(&mut self, id: u64) -> bool {
        match self.clients.get_mut(&id) {
            Some(info) if info.state.can_advance_to(ConnectionState::Closing) => {
                info.state = ConnectionState::Closing;
                true
            }
            _ => false,
        }
    }

    /// Remove a connection. Returns the entry only on the first call; the
    /// `Some` return is the exactly-once guard for termination notification.
    pub fn remove(&mut self, id: u64) -> Option<ClientInfo> {
        self.clients.remove(&id)
    }

    /// Remove every connection, returning the removed ids. Dropping the
    /// entries drops their senders, which ends each connection task.
    pub fn drain(&mut self) -> Vec<u64> {
        self.clients.drain().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn authenticated_count(&self) -> usize {
        self.clients
            .values()
            .filter(|info| info.state == ConnectionState::Authenticated)
            .count()
    }

    pub fn state_of(&self, id: u64) -> Option<ConnectionState> {
        self.clients.get(&id).map(|info| info.state)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared application state.
///
/// The registry mutex is the server's single ordering context: every
/// registry mutation, every state transition, and every broadcast enqueue
/// goes through it, so none of them can interleave.
pub struct AppState {
    /// Connection registry
    pub registry: Mutex<Registry>,
    /// Shared-secret password for the handshake
    pub password: String,
    /// How long a client may take to present the password
    pub auth_window: Duration,
    /// Set once shutdown begins; broadcasts are ignored afterwards
    pub shutting_down: AtomicBool,
    /// Owner-facing event channel
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl AppState {
    pub fn new(
        password: String,
        auth_window: Duration,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
            password,
            auth_window,
            shutting_down: AtomicBool::new(false),
            events,
        }
    }

    /// Report a fatal listener failure to the owner.
    pub fn report_listener_failure(&self, message: String) {
        let _ = self.events.send(ServerEvent::ListenerFailed { message });
    }

    /// Advance a connection to `Closing` ahead of its removal.
    pub async fn begin_close(&self, id: u64) -> bool {
        let mut registry = self.registry.lock().await;
        registry.begin_close(id)
    }

    /// Advance a connection to `Authenticated`.
    pub async fn authenticate(&self, id: u64) -> bool {
        let mut registry = self.registry.lock().await;
        registry.authenticate(id)
    }

    /// Remove a connection from the registry and emit its termination event.
    ///
    /// Safe to call from racing teardown paths: only the caller that
    /// actually removes the entry emits the event, so the notification fires
    /// exactly once per connection.
    pub async fn deregister(&self, id: u64) -> bool {
        let removed = {
            let mut registry = self.registry.lock().await;
            registry.remove(id)
        };

        match removed {
            Some(info) => {
                tracing::info!(
                    "connection {} deregistered after {} ms",
                    id,
                    now_millis() - info.connected_at
                );
                let _ = self.events.send(ServerEvent::ConnectionClosed { id });
                true
            }
            None => false,
        }
    }

    /// Remove every connection, emitting each termination event exactly once.
    /// Returns how many connections were closed.
    pub async fn drain(&self) -> usize {
        let ids = {
            let mut registry = self.registry.lock().await;
            registry.drain()
        };
        for id in &ids {
            let _ = self.events.send(ServerEvent::ConnectionClosed { id: *id });
        }
        ids.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub async fn authenticated_count(&self) -> usize {
        self.registry.lock().await.authenticated_count()
    }
}
