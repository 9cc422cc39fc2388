use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::{
    client::ClientConfig,
    config::{
        CorsPolicy, DEFAULT_PATH, DEFAULT_PORT, DEFAULT_WELCOME_MESSAGE, HubConfig,
        ReconnectPolicy, ServerConfig, TransportConfig, WelcomePolicy, socket_url,
    },
    message::DEFAULT_USER,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hub that relays every chat message to all connected clients.
    Hub(HubArgs),
    /// Connect to a hub and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HubArgs {
    /// Address to listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub listen: IpAddr,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Path of the WebSocket endpoint.
    #[arg(long, default_value = DEFAULT_PATH, value_parser = parse_path)]
    pub path: String,

    /// Origin allowed to connect from a browser. Repeat for several; `*` allows any.
    #[arg(long = "allowed-origin", default_value = "*")]
    pub allowed_origins: Vec<String>,

    /// Seconds between liveness pings. 0 disables the heartbeat.
    #[arg(long, default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Do not greet new connections with a system notice.
    #[arg(long)]
    pub no_welcome: bool,

    /// System notice sent to each new connection.
    #[arg(long, default_value = DEFAULT_WELCOME_MESSAGE)]
    pub welcome_message: String,

    /// Largest accepted message in bytes.
    #[arg(long)]
    pub max_message_size: Option<usize>,

    /// Largest accepted frame in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,
}

impl HubArgs {
    pub fn server_config(&self) -> ServerConfig {
        let welcome = if self.no_welcome {
            WelcomePolicy::disabled()
        } else {
            WelcomePolicy {
                enabled: true,
                message: self.welcome_message.clone(),
            }
        };

        ServerConfig {
            listen: SocketAddr::new(self.listen, self.port),
            path: self.path.clone(),
            heartbeat: (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs)),
            cors: CorsPolicy::from_origins(&self.allowed_origins),
            transport: TransportConfig {
                max_message_size: self.max_message_size,
                max_frame_size: self.max_frame_size,
            },
            hub: HubConfig { welcome },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// URL of the hub. The endpoint path is appended when missing.
    #[arg(long, env = "CHAT_SERVER_URL", default_value = "ws://127.0.0.1:8080")]
    pub url: String,

    /// Path of the hub's WebSocket endpoint.
    #[arg(long, default_value = DEFAULT_PATH, value_parser = parse_path)]
    pub path: String,

    /// Name shown next to your messages.
    #[arg(long, default_value = DEFAULT_USER)]
    pub user: String,

    /// Reconnect attempts before giving up.
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,

    /// Delay before the first reconnect, doubled after each failure.
    #[arg(long, default_value_t = 1000)]
    pub base_delay_ms: u64,

    /// Upper bound for the reconnect delay.
    #[arg(long, default_value_t = 30_000)]
    pub max_delay_ms: u64,
}

impl ClientArgs {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            url: socket_url(&self.url, &self.path),
            user: self.user.clone(),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                max_attempts: self.max_attempts,
            },
        }
    }
}

fn parse_path(raw: &str) -> Result<String, String> {
    if raw.starts_with('/') {
        Ok(raw.to_string())
    } else {
        Err(format!("path must start with '/', got '{raw}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_line_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn hub_flags_become_server_config() {
        let cli = Cli::try_parse_from([
            "relay",
            "hub",
            "--listen",
            "127.0.0.1",
            "--port",
            "9000",
            "--path",
            "/chat",
            "--allowed-origin",
            "https://a.example",
            "--heartbeat-secs",
            "0",
            "--no-welcome",
            "--max-message-size",
            "65536",
        ])
        .expect("valid hub flags");

        let Command::Hub(args) = cli.command else {
            panic!("expected hub command");
        };
        let config = args.server_config();

        assert_eq!(config.listen, SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(config.path, "/chat");
        assert_eq!(config.heartbeat, None);
        assert_eq!(
            config.cors,
            CorsPolicy::Origins(vec!["https://a.example".into()])
        );
        assert!(!config.hub.welcome.enabled);
        assert_eq!(config.transport.max_message_size, Some(65536));
        assert_eq!(config.transport.max_frame_size, None);
    }

    #[test]
    fn hub_defaults_match_reference_values() {
        let cli = Cli::try_parse_from(["relay", "hub", "--port", "8080"]).expect("defaults");
        let Command::Hub(args) = cli.command else {
            panic!("expected hub command");
        };
        let config = args.server_config();

        assert_eq!(config.path, "/ws");
        assert_eq!(config.heartbeat, Some(Duration::from_secs(30)));
        assert_eq!(config.cors, CorsPolicy::AnyOrigin);
        assert_eq!(config.hub.welcome, WelcomePolicy::default());
    }

    #[test]
    fn client_flags_become_client_config() {
        let cli = Cli::try_parse_from([
            "relay",
            "client",
            "--url",
            "ws://chat.example:8080",
            "--user",
            "alice",
            "--max-attempts",
            "3",
            "--base-delay-ms",
            "10",
            "--max-delay-ms",
            "50",
        ])
        .expect("valid client flags");

        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        let config = args.client_config();

        assert_eq!(config.url, "ws://chat.example:8080/ws");
        assert_eq!(config.user, "alice");
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(10));
        assert_eq!(config.reconnect.max_delay, Duration::from_millis(50));
    }

    #[test]
    fn relative_paths_are_rejected() {
        let result = Cli::try_parse_from(["relay", "hub", "--path", "ws"]);
        assert!(result.is_err());
    }
}
