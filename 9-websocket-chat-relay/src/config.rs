//! Plain configuration structs shared by the hub, the server, and the client.
//!
//! The command line in [`crate::cli`] fills these in; tests build them
//! directly. Every `Default` carries the reference values of the relay.

use std::{net::SocketAddr, time::Duration};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PATH: &str = "/ws";
pub const DEFAULT_WELCOME_MESSAGE: &str = "接続が確立されました";
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Whether a new connection is greeted with a system notice, and with what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WelcomePolicy {
    pub enabled: bool,
    pub message: String,
}

impl WelcomePolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            message: String::new(),
        }
    }
}

impl Default for WelcomePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            message: DEFAULT_WELCOME_MESSAGE.to_string(),
        }
    }
}

/// Behavior of the transport-independent hub.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    pub welcome: WelcomePolicy,
}

/// Frame limits handed to the WebSocket upgrade. `None` keeps the library default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportConfig {
    pub max_message_size: Option<usize>,
    pub max_frame_size: Option<usize>,
}

/// Origins allowed to open the socket from a browser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CorsPolicy {
    #[default]
    AnyOrigin,
    Origins(Vec<String>),
}

impl CorsPolicy {
    /// Builds a policy from the values given on the command line; `*` wins.
    pub fn from_origins(origins: &[String]) -> Self {
        if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
            Self::AnyOrigin
        } else {
            Self::Origins(origins.to_vec())
        }
    }
}

/// Everything needed to run the HTTP side of the hub.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub path: String,
    /// `None` disables the ping/pong liveness sweep.
    pub heartbeat: Option<Duration>,
    pub cors: CorsPolicy,
    pub transport: TransportConfig,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            path: DEFAULT_PATH.to_string(),
            heartbeat: Some(DEFAULT_HEARTBEAT),
            cors: CorsPolicy::default(),
            transport: TransportConfig::default(),
            hub: HubConfig::default(),
        }
    }
}

/// Reconnect limits for the resilient client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before the retry that follows `attempt` earlier retries.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

/// Appends the socket path to a server URL unless it is already there.
pub fn socket_url(server: &str, path: &str) -> String {
    if server.ends_with(path) {
        server.to_string()
    } else {
        format!("{}{}", server.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..7)
            .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn backoff_saturates_on_huge_attempts() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(40), policy.max_delay);
        assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);
    }

    #[test]
    fn cors_wildcard_wins() {
        assert_eq!(CorsPolicy::from_origins(&[]), CorsPolicy::AnyOrigin);
        assert_eq!(
            CorsPolicy::from_origins(&["https://a.example".into(), "*".into()]),
            CorsPolicy::AnyOrigin
        );
        assert_eq!(
            CorsPolicy::from_origins(&["https://a.example".into()]),
            CorsPolicy::Origins(vec!["https://a.example".into()])
        );
    }

    #[test]
    fn socket_url_appends_path_once() {
        assert_eq!(
            socket_url("ws://localhost:8080", "/ws"),
            "ws://localhost:8080/ws"
        );
        assert_eq!(
            socket_url("ws://localhost:8080/", "/ws"),
            "ws://localhost:8080/ws"
        );
        assert_eq!(
            socket_url("ws://localhost:8080/ws", "/ws"),
            "ws://localhost:8080/ws"
        );
    }
}
