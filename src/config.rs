//! Configuration — YAML file with serde defaults, overridable from the CLI.
//!
//! ```yaml
//! server:
//!   bind: "0.0.0.0:8000"
//!   auth_token: "..."          # optional; bearer auth is off without one
//! poller:
//!   command: "helix auth access-token print -a"
//! dynamic_key:
//!   endpoint_url: "http://localhost:8000/keys/{provider}"
//!   cache_duration_seconds: 300
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client-side settings for [`crate::provider::RemoteKeyFetcher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicKeyConfig {
    /// Key endpoint. A `{provider}` placeholder is replaced with the
    /// requested provider name.
    pub endpoint_url: String,
    /// Cache lifetime when the response carries no hint.
    #[serde(default = "default_cache_duration")]
    pub cache_duration_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Nominal rotation period assumed for `age_seconds` responses.
    #[serde(default = "default_rotation_cadence")]
    pub rotation_cadence_seconds: u64,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// Sent as `Authorization: Bearer <token>`.
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_cache_duration() -> u64 {
    1800
}

fn default_timeout() -> u64 {
    10
}

fn default_rotation_cadence() -> u64 {
    1800
}

impl DynamicKeyConfig {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            cache_duration_seconds: default_cache_duration(),
            timeout_seconds: default_timeout(),
            rotation_cadence_seconds: default_rotation_cadence(),
            headers: None,
            auth_token: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Shell command that prints the current credential.
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
    #[serde(default = "default_error_backoff")]
    pub error_backoff_seconds: u64,
}

fn default_command() -> String {
    "helix auth access-token print -a".into()
}

fn default_command_timeout() -> u64 {
    60
}

fn default_error_backoff() -> u64 {
    30
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            command_timeout_seconds: default_command_timeout(),
            error_backoff_seconds: default_error_backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on credential-bearing routes.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Token file to read, or to generate into when no token is configured.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: usize,
}

fn default_bind() -> String {
    "127.0.0.1:8000".into()
}

fn default_rate_limit() -> usize {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            auth_token: None,
            token_file: None,
            rate_limit_per_minute: default_rate_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub dynamic_key: Option<DynamicKeyConfig>,
}

impl RelayConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file — using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// `~/.keyrelay`
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".keyrelay"))
    }

    /// `~/.keyrelay/config.yaml`
    pub fn default_path() -> Option<PathBuf> {
        Self::default_dir().map(|dir| dir.join("config.yaml"))
    }
}
