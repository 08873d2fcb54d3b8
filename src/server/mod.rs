//! WebSocket relay server implementation.

mod config;
mod error;
mod handler;
mod protocol;
mod runner;
mod signal;
mod state;

pub use config::ServerConfig;
pub use error::ServerError;
pub use protocol::AUTH_WINDOW;
pub use runner::{RelayHandle, RelayServer};
pub use signal::shutdown_signal;
pub use state::{ConnectionState, ServerEvent};
