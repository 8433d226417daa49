//! Configuration management.
//!
//! Values come from an optional TOML file overlaid with environment variables
//! prefixed `BASTION__`, e.g. `BASTION__SERVER__PORT=9000` or
//! `BASTION__MEMBERSHIP__LOOKUP_TIMEOUT=500ms`.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::telemetry::LoggingConfig;
use crate::tenancy::resolver::DEFAULT_LOOKUP_TIMEOUT;

const ENV_PREFIX: &str = "BASTION";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Policy matrix source
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Membership store behaviour
    #[serde(default)]
    pub membership: MembershipConfig,

    /// Audit sink configuration
    #[serde(default)]
    pub audit: AuditConfig,

    /// Seed data for the in-memory stores
    #[serde(default)]
    pub fixtures: FixturesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    /// TOML policy file; the built-in matrix is used when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembershipConfig {
    /// Upper bound on a single membership lookup
    #[serde(default = "default_lookup_timeout", with = "humantime_serde")]
    pub lookup_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: default_lookup_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Capacity of the channel feeding the audit writer task
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: default_channel_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FixturesConfig {
    /// TOML file with workspaces, memberships and entities
    pub path: Option<PathBuf>,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_lookup_timeout() -> Duration { DEFAULT_LOOKUP_TIMEOUT }
fn default_channel_buffer_size() -> usize { 1024 }

impl Config {
    /// Load configuration from the environment only.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, overlaid with the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.membership.lookup_timeout, Duration::from_secs(2));
        assert_eq!(config.audit.channel_buffer_size, 1024);
        assert!(config.policy.path.is_none());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [server]
            port = 9100

            [logging]
            level = "debug"
            format = "compact"

            [membership]
            lookup_timeout = "250ms"

            [policy]
            path = "/etc/bastion/policy.toml"
            "#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.membership.lookup_timeout, Duration::from_millis(250));
        assert_eq!(
            config.policy.path.as_deref(),
            Some(std::path::Path::new("/etc/bastion/policy.toml"))
        );
    }
}
