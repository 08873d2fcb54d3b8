//! Push-style WebSocket relay library.
//!
//! This library provides a server that accepts passively-listening clients,
//! gates each one behind a shared-secret password handshake, and fans
//! application-originated text messages out to every authenticated client.

pub mod common;
pub mod server;
