//! Error types for the relay server.

use std::io;

use thiserror::Error;

/// Server-level errors
///
/// Both variants are process-scoped: a relay with a dead listener serves
/// nobody, so they are surfaced to the owning process rather than handled
/// internally.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not bind to the requested address
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The listener failed after startup
    #[error("listener failed: {0}")]
    Serve(#[from] io::Error),
}
