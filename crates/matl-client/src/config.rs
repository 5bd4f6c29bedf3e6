//! Client configuration.
//!
//! Settings are read from a TOML file in the user's config directory:
//! - macOS: ~/Library/Application Support/matl-online/config.toml
//! - Linux: ~/.config/matl-online/config.toml
//! - Windows: C:\Users\<User>\AppData\Roaming\matl-online\config.toml
//!
//! Every field is optional. `MATL_ONLINE_URL` and `MATL_ONLINE_CSRF_TOKEN`
//! override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Public MATL Online instance.
pub const DEFAULT_SERVER_URL: &str = "https://matl.suever.net";

/// How long a submission may wait for the server's acknowledgement.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid server URL {0:?}: {1}")]
    InvalidUrl(String, url::ParseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the server (http or https).
    pub server_url: String,

    /// Acknowledgement timeout for submissions, in milliseconds.
    pub ack_timeout_ms: u64,

    /// Give up after this many automatic resubmissions. Unlimited when unset.
    pub resubmit_limit: Option<u32>,

    /// First delay between reconnection attempts, in milliseconds.
    pub reconnect_delay_ms: u64,

    /// Upper bound for the reconnection delay, in milliseconds.
    pub reconnect_delay_max_ms: u64,

    /// Stop reconnecting after this many failed attempts. Unlimited when unset.
    pub reconnect_attempts: Option<u32>,

    /// Where analytics events are posted. Analytics are off when unset.
    pub analytics_url: Option<String>,

    /// Anti-forgery token sent with non-safe HTTP requests.
    pub csrf_token: Option<String>,

    /// Interpreter version used when none is given.
    pub default_version: Option<String>,

    /// Debug flag forwarded with every submission.
    pub debug: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            resubmit_limit: None,
            reconnect_delay_ms: 1000,
            reconnect_delay_max_ms: 5000,
            reconnect_attempts: None,
            analytics_url: None,
            csrf_token: None,
            default_version: None,
            debug: None,
        }
    }
}

impl ClientConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn server_url(&self) -> Result<url::Url, ConfigError> {
        url::Url::parse(&self.server_url)
            .map_err(|e| ConfigError::InvalidUrl(self.server_url.clone(), e))
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `MATL_ONLINE_URL` / `MATL_ONLINE_CSRF_TOKEN`.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("MATL_ONLINE_URL") {
            if !url.is_empty() {
                self.server_url = url;
            }
        }
        if let Ok(token) = std::env::var("MATL_ONLINE_CSRF_TOKEN") {
            if !token.is_empty() {
                self.csrf_token = Some(token);
            }
        }
        self
    }
}

/// Get the path to the config file.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("matl-online")
        .join("config.toml")
}

/// Load the config from `path` (or the default location), then apply the
/// environment. A missing file yields defaults; an unreadable or invalid one
/// is an error.
pub fn load_config(path: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    let default_path = config_path();
    let path = path.unwrap_or(&default_path);

    let config = if path.exists() {
        ClientConfig::from_file(path)?
    } else {
        ClientConfig::default()
    };

    Ok(config.apply_env())
}
