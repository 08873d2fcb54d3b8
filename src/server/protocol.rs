//! Handshake protocol logic.
//!
//! This module contains the literal wire tokens and pure functions for the
//! auth handshake, kept free of I/O so they are easy to test.
//!
//! Connection flow:
//! 1. The server sends `ACK` as soon as the client connects.
//! 2. The client has one auth window to respond with the password and a
//!    newline.
//! 3. The server responds with `READY` if the password matches, `FAIL` if it
//!    does not, or closes silently if the window elapses first.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;

use super::state::{ClientInfo, ConnectionState};

/// Sent to the client immediately after the connection is accepted.
pub const ACK: &str = "ACK";
/// Sent when the password matches.
pub const READY: &str = "READY";
/// Sent when the password does not match.
pub const FAIL: &str = "FAIL";

/// How long a client has to present the password after receiving `ACK`.
pub const AUTH_WINDOW: Duration = Duration::from_secs(2);

/// Outcome of a password check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Granted,
    Denied,
}

/// Compare a client's password line against the configured password.
///
/// Client input is a newline-terminated line; the trailing `\n` or `\r\n`
/// is stripped before the exact comparison. An empty line never matches.
pub fn check_password(line: &str, expected: &str) -> AuthOutcome {
    let candidate = line.strip_suffix('\n').unwrap_or(line);
    let candidate = candidate.strip_suffix('\r').unwrap_or(candidate);

    if !candidate.is_empty() && candidate == expected {
        AuthOutcome::Granted
    } else {
        AuthOutcome::Denied
    }
}

/// Get broadcast targets: every connection currently authenticated.
///
/// Connections still awaiting auth or already tearing down receive nothing.
pub fn broadcast_targets(
    clients: &HashMap<u64, ClientInfo>,
) -> Vec<(u64, &mpsc::UnboundedSender<String>)> {
    clients
        .iter()
        .filter(|(_, info)| info.state == ConnectionState::Authenticated)
        .map(|(id, info)| (*id, &info.sender))
        .collect()
}
