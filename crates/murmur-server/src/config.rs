//! Server configuration.
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML file,
//! then `MURMUR__SECTION__KEY` environment variables.

use std::path::Path;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use murmur_relay::RelayConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration for `murmur-server`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: HttpConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub relay: RelayConfig,
}

/// HTTP listener and logging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    /// Emit logs as JSON lines instead of human-readable text
    pub json_logs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            json_logs: false,
        }
    }
}

/// Storage location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the database file (None for in-memory)
    pub path: Option<String>,
}

/// Token validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared HS256 secret
    pub jwt_secret: String,
    /// Claim holding the user identity
    pub identity_claim: String,
    /// Clock skew tolerated when checking `exp`
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            identity_claim: "user_id".to_string(),
            leeway_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&Self::default()).context("Failed to serialize default config")?,
        );
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix("MURMUR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            bail!("auth.jwt_secret must be set (MURMUR__AUTH__JWT_SECRET)");
        }
        if self.auth.identity_claim.is_empty() {
            bail!("auth.identity_claim must not be empty");
        }
        if self.relay.outbox_capacity == 0 || self.relay.command_capacity == 0 {
            bail!("relay queue capacities must be non-zero");
        }
        if self.relay.ping_interval_secs >= self.relay.liveness_timeout_secs {
            bail!(
                "relay.ping_interval_secs ({}) must be shorter than relay.liveness_timeout_secs ({})",
                self.relay.ping_interval_secs,
                self.relay.liveness_timeout_secs
            );
        }
        Ok(())
    }

    /// Copy safe to print, with secrets masked
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.auth.jwt_secret.is_empty() {
            config.auth.jwt_secret = "<redacted>".to_string();
        }
        config
    }
}
