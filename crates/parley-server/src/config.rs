//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (`--config`, or the first of the default paths)
//! - Environment variables (`PARLEY_*`, `__` separates nested keys, e.g.
//!   `PARLEY_LIMITS__MAX_CONNECTIONS=5000`)

use anyhow::{ensure, Context, Result};
use ::config::{Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file locations, in lookup order.
const DEFAULT_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

const ENV_PREFIX: &str = "PARLEY";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub presence: PresenceConfig,

    /// Identity of this node.
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub bot: BotConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Users, contacts and groups loaded into the in-memory directory.
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of live sessions on this node.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum client frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Envelopes buffered per session before deliveries are dropped.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    /// Commands buffered in front of the hub loop.
    #[serde(default = "default_hub_capacity")]
    pub hub_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Time allowed between pongs, in milliseconds. Pings go out at half
    /// this interval.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_ms: u64,

    /// Time allowed for one write to a client, in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Lifetime of the online flag, in milliseconds.
    #[serde(default = "default_online_ttl")]
    pub online_ttl_ms: u64,
}

/// Node identity configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Fixed node id. Generated at startup when unset.
    #[serde(default)]
    pub id: Option<String>,

    /// Machine id for message ids. Derived from the node id when unset.
    #[serde(default)]
    pub machine_id: Option<u16>,
}

/// Bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Sender name on bot answers.
    #[serde(default = "default_bot_name")]
    pub display_name: String,
}

/// Handshake configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Lifetime of an issued one-time code, in milliseconds.
    #[serde(default = "default_otp_ttl")]
    pub otp_ttl_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Directory seed data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub users: Vec<SeedUser>,

    /// Pairs of usernames that are contacts of each other.
    #[serde(default)]
    pub contacts: Vec<(String, String)>,

    #[serde(default)]
    pub groups: Vec<SeedGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedGroup {
    pub name: String,
    /// Member usernames.
    pub members: Vec<String>,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_frame_size() -> usize {
    1024
}

fn default_inbox_capacity() -> usize {
    64
}

fn default_hub_capacity() -> usize {
    1024
}

fn default_pong_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_write_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_online_ttl() -> u64 {
    30_000 // 30 seconds
}

fn default_bot_name() -> String {
    parley_core::router::DEFAULT_BOT_NAME.to_string()
}

fn default_otp_ttl() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            presence: PresenceConfig::default(),
            node: NodeConfig::default(),
            bot: BotConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
            seed: SeedConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            inbox_capacity: default_inbox_capacity(),
            hub_capacity: default_hub_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pong_timeout_ms: default_pong_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_ttl_ms: default_online_ttl(),
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            display_name: default_bot_name(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            otp_ttl_ms: default_otp_ttl(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl PresenceConfig {
    #[must_use]
    pub fn online_ttl(&self) -> Duration {
        Duration::from_millis(self.online_ttl_ms)
    }
}

impl AuthConfig {
    #[must_use]
    pub fn otp_ttl(&self) -> Duration {
        Duration::from_millis(self.otp_ttl_ms)
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, the first default path
    /// that exists is used, if any. Environment variables are applied last.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be read or parsed, an
    /// environment override has the wrong type, or a value is out of range.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::discover(),
        };

        let mut builder = ::config::Config::builder();
        if let Some(file) = &file {
            builder = builder.add_source(File::from(file.as_path()).required(true));
        }
        let settings = builder
            .add_source(Self::environment())
            .build()
            .with_context(|| match &file {
                Some(file) => format!("Failed to load config file: {}", file.display()),
                None => "Failed to load configuration".to_string(),
            })?;

        let config: Self = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.heartbeat.pong_timeout_ms >= 2,
            "heartbeat.pong_timeout_ms must be at least 2, got {}",
            self.heartbeat.pong_timeout_ms
        );
        ensure!(
            self.heartbeat.write_timeout_ms > 0,
            "heartbeat.write_timeout_ms must be greater than 0"
        );
        ensure!(
            self.presence.online_ttl_ms > 0,
            "presence.online_ttl_ms must be greater than 0"
        );
        ensure!(
            self.limits.max_frame_size > 0,
            "limits.max_frame_size must be greater than 0"
        );
        ensure!(
            self.limits.hub_capacity > 0,
            "limits.hub_capacity must be greater than 0"
        );
        Ok(())
    }

    /// Parse configuration from a TOML string, without environment
    /// overrides.
    #[cfg(test)]
    pub fn from_toml(contents: &str) -> Result<Self> {
        ::config::Config::builder()
            .add_source(File::from_str(contents, ::config::FileFormat::Toml))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .context("Failed to parse configuration")
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    fn discover() -> Option<PathBuf> {
        DEFAULT_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.max_frame_size, 1024);
        assert_eq!(config.heartbeat.pong_timeout(), Duration::from_secs(30));
        assert_eq!(config.presence.online_ttl(), Duration::from_secs(30));
        assert_eq!(config.bot.display_name, "ChatBot");
        assert!(config.node.id.is_none());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000

            [node]
            id = "chat-server-east"

            [seed]
            contacts = [["alice", "bob"]]

            [[seed.users]]
            id = "1"
            username = "alice"

            [[seed.users]]
            id = "2"
            username = "bob"
            email = "bob@example.com"

            [[seed.groups]]
            name = "rust"
            members = ["alice", "bob"]
        "#;

        let config = Config::from_toml(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.inbox_capacity, 64);
        assert_eq!(config.node.id.as_deref(), Some("chat-server-east"));
        assert_eq!(config.seed.users.len(), 2);
        assert_eq!(config.seed.users[0].email, "");
        assert_eq!(config.seed.contacts, vec![("alice".to_string(), "bob".to_string())]);
        assert_eq!(config.seed.groups[0].members, vec!["alice", "bob"]);
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        let parsed = Config::from_toml(&rendered).unwrap();
        assert_eq!(parsed.port, config.port);
        assert_eq!(parsed.auth.otp_ttl_ms, config.auth.otp_ttl_ms);
    }

    #[test]
    fn test_validate_rejects_unusable_values() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.heartbeat.pong_timeout_ms = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pong_timeout_ms"));

        let mut config = Config::default();
        config.heartbeat.pong_timeout_ms = 2;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.presence.online_ttl_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.max_frame_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.heartbeat.write_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.hub_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_rejects_zero_pong_timeout() {
        let path = std::env::temp_dir().join(format!(
            "parley-config-test-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[heartbeat]\npong_timeout_ms = 0\n").unwrap();
        let result = Config::load(Some(&path));
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/parley.toml"))).is_err());
    }
}
