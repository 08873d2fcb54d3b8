//! Push-style WebSocket relay server.
//!
//! Clients connect, present the shared password within the auth window, and
//! then passively receive broadcasts. Every line read from stdin is
//! broadcast verbatim to all authenticated clients.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin server -- --password swordfish
//! cargo run --bin server -- --host 0.0.0.0 --port 8736 --password swordfish
//! ```

use clap::Parser;
use push_relay::{
    common::logger::setup_logger,
    server::{RelayServer, ServerConfig, ServerEvent, shutdown_signal},
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "WebSocket relay server pushing broadcasts to authenticated clients", long_about = None)]
struct Args {
    /// Host address to bind the server to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, default_value = "8736")]
    port: u16,

    /// Shared-secret password clients must present within the auth window
    #[arg(short = 'P', long)]
    password: String,
}

#[tokio::main]
async fn main() {
    setup_logger(env!("CARGO_BIN_NAME"), "info");

    let args = Args::parse();
    let config = ServerConfig::new(args.host, args.port, args.password);

    let (server, mut events) = match RelayServer::start(config).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!("failed to start relay server: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("press Ctrl+C to shut down gracefully");

    let handle = server.handle();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let signal = shutdown_signal();
    tokio::pin!(signal);

    let mut fatal = false;
    loop {
        tokio::select! {
            _ = &mut signal => {
                tracing::info!("shutdown signal received");
                break;
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle.broadcast(line).await,
                Ok(None) | Err(_) => {
                    // stdin closed; keep serving until a signal arrives
                    stdin_open = false;
                }
            },
            event = events.recv() => match event {
                Some(ServerEvent::ConnectionClosed { id }) => {
                    tracing::debug!("connection {} terminated", id);
                }
                Some(ServerEvent::ListenerFailed { message }) => {
                    tracing::error!("listener failed, stopping: {}", message);
                    fatal = true;
                    break;
                }
                None => break,
            },
        }
    }

    if let Err(e) = server.shutdown().await {
        tracing::error!("error during shutdown: {}", e);
        fatal = true;
    }
    if fatal {
        std::process::exit(1);
    }
}
