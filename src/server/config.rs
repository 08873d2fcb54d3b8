//! Server configuration.

use std::time::Duration;

use super::protocol::AUTH_WINDOW;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to (e.g., "127.0.0.1")
    pub host: String,
    /// Port number to bind to (0 picks a free port)
    pub port: u16,
    /// Shared-secret password clients must present during the handshake
    pub password: String,
    /// How long a client may take to present the password
    pub auth_window: Duration,
}

impl ServerConfig {
    /// Create a configuration with the protocol's fixed 2-second auth window.
    ///
    /// The password must be non-empty: an empty password line never passes
    /// the handshake, so a server configured with an empty password would
    /// authenticate nobody.
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        let password = password.into();
        debug_assert!(
            !password.is_empty(),
            "an empty password can never pass the handshake"
        );
        Self {
            host: host.into(),
            port,
            password,
            auth_window: AUTH_WINDOW,
        }
    }

    /// Override the auth window.
    ///
    /// The wire protocol fixes the window at two seconds; this exists so
    /// tests can shorten it.
    pub fn with_auth_window(mut self, auth_window: Duration) -> Self {
        self.auth_window = auth_window;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_auth_window_is_two_seconds() {
        // given:

        // when:
        let config = ServerConfig::new("127.0.0.1", 8736, "swordfish");

        // then:
        assert_eq!(config.auth_window, Duration::from_secs(2));
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_empty_password_is_rejected_at_construction() {
        // given / when / then:
        let _ = ServerConfig::new("127.0.0.1", 8736, "");
    }

    #[test]
    fn test_with_auth_window_overrides_default() {
        // given:
        let config = ServerConfig::new("127.0.0.1", 8736, "swordfish");

        // when:
        let config = config.with_auth_window(Duration::from_millis(200));

        // then:
        assert_eq!(config.auth_window, Duration::from_millis(200));
    }
}
