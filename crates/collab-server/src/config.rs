//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COLLAB_*)
//! - TOML configuration file (`collab.toml`)

use anyhow::{Context, Result};
use collab_core::{ManagerConfig, UserInfo};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on for client connections.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connection manager settings.
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// HTTP admin surface.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Users seeded into the registry at startup.
    #[serde(default)]
    pub users: Vec<UserInfo>,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connected clients.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum encoded frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Time a new connection has to send its join frame, in milliseconds.
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
}

/// Admin HTTP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Serve `/health`, `/stats` and `/connections`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Admin port.
    #[serde(default = "default_admin_port")]
    pub port: u16,
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

// Default value functions
fn default_host() -> String {
    std::env::var("COLLAB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("COLLAB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7420)
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_join_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_admin_port() -> u16 {
    7421
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            manager: ManagerConfig::default(),
            limits: LimitsConfig::default(),
            admin: AdminConfig::default(),
            metrics: MetricsConfig::default(),
            users: Vec::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            join_timeout_ms: default_join_timeout(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_admin_port(),
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

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// `COLLAB_CONFIG` names an explicit file; otherwise the usual locations
    /// are searched.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("COLLAB_CONFIG") {
            return Self::from_file(shellexpand::tilde(&path).as_ref());
        }

        let config_paths = [
            "collab.toml",
            "/etc/collab/collab.toml",
            "~/.config/collab/collab.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind client connections to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        Self::socket_addr(&self.host, self.port)
    }

    /// Get the socket address of the admin surface.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:admin.port` is not a valid socket address.
    pub fn admin_addr(&self) -> Result<SocketAddr> {
        Self::socket_addr(&self.host, self.admin.port)
    }

    fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
        format!("{host}:{port}")
            .parse()
            .with_context(|| format!("Invalid host:port {host}:{port}"))
    }
}
