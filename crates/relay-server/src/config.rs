//! Server configuration.
//!
//! Configuration can be loaded from:
//! - a TOML configuration file (`relay.toml`, `/etc/relay/relay.toml`,
//!   `~/.config/relay/relay.toml`)
//! - environment variables (`RELAY_*`) as per-field fallbacks
//!
//! `host` and `user_security_scope` are required; an empty value for
//! either is a structural error that aborts startup.

use anyhow::{bail, Context, Result};
use relay_core::config::{HubConfig, DEFAULT_CANCEL_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connection limit enforced per user.
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,

    /// Idle seconds after which a clientless User Hub is evicted.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub user_hub_inactivity_timeout_secs: u64,

    /// Inbox depth factor for hub processes.
    #[serde(default = "default_queue_multiplier")]
    pub queue_multiplier: usize,

    /// Host plugins are spawned on unless their descriptor overrides it.
    #[serde(default = "default_host")]
    pub host: String,

    /// Name of the security scope user hubs run under.
    #[serde(default = "default_user_security_scope")]
    pub user_security_scope: String,

    /// Plugin registry access.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Plugin process host settings.
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Admin HTTP surface.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Metrics export.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Plugin registry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// JSON snapshot of the external registry, queried once at boot.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Plugin host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directory plugin `process_id`s are resolved in.
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,
}

/// Admin surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Enable the health endpoint.
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
fn default_max_connections_per_user() -> usize {
    env_or("RELAY_MAX_CONNECTIONS_PER_USER", 10)
}

fn default_inactivity_timeout_secs() -> u64 {
    env_or("RELAY_INACTIVITY_TIMEOUT_SECS", 300)
}

fn default_queue_multiplier() -> usize {
    env_or("RELAY_QUEUE_MULTIPLIER", 100)
}

fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_default()
}

fn default_user_security_scope() -> String {
    std::env::var("RELAY_USER_SECURITY_SCOPE").unwrap_or_default()
}

fn default_bin_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_true() -> bool {
    true
}

fn default_admin_port() -> u16 {
    8090
}

fn default_metrics_port() -> u16 {
    9090
}

fn env_or<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections_per_user: default_max_connections_per_user(),
            user_hub_inactivity_timeout_secs: default_inactivity_timeout_secs(),
            queue_multiplier: default_queue_multiplier(),
            host: default_host(),
            user_security_scope: default_user_security_scope(),
            registry: RegistryConfig::default(),
            plugins: PluginsConfig::default(),
            admin: AdminConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            bin_dir: default_bin_dir(),
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
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

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

    /// Structural validation; failures abort startup.
    ///
    /// # Errors
    ///
    /// Returns an error naming the missing required field.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("config: host is required (set `host` or RELAY_HOST)");
        }
        if self.user_security_scope.trim().is_empty() {
            bail!(
                "config: user_security_scope is required \
                 (set `user_security_scope` or RELAY_USER_SECURITY_SCOPE)"
            );
        }
        Ok(())
    }

    /// The hub-side view of this configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections_per_user: self.max_connections_per_user,
            inactivity_timeout: Duration::from_secs(self.user_hub_inactivity_timeout_secs),
            queue_multiplier: self.queue_multiplier,
            host: self.host.clone(),
            user_security_scope: self.user_security_scope.clone(),
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_config_from_toml() {
        let config = parsed(
            r#"
            host = "node-1"
            user_security_scope = "user.default"
            max_connections_per_user = 4

            [registry]
            path = "registry.json"

            [admin]
            port = 9001
        "#,
        );

        assert_eq!(config.host, "node-1");
        assert_eq!(config.max_connections_per_user, 4);
        assert_eq!(config.registry.path.as_deref(), Some(Path::new("registry.json")));
        assert_eq!(config.admin.port, 9001);
        assert_eq!(config.metrics.port, 9090);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_requires_host() {
        let config = parsed(r#"user_security_scope = "user.default""#);
        if config.host.is_empty() {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_validate_requires_scope() {
        let mut config = parsed(r#"host = "node-1""#);
        config.user_security_scope = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hub_config_mapping() {
        let config = parsed(
            r#"
            host = "node-1"
            user_security_scope = "user.default"
            user_hub_inactivity_timeout_secs = 60
            queue_multiplier = 5
            max_connections_per_user = 2
        "#,
        );

        let hub = config.hub_config();
        assert_eq!(hub.inactivity_timeout, Duration::from_secs(60));
        assert_eq!(hub.message_queue_size(), 10);
        assert_eq!(hub.gc_check_interval(), Duration::from_secs(24));
        assert_eq!(hub.cancel_timeout, Duration::from_secs(10));
    }
}
