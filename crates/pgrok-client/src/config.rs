//! Client configuration
//!
//! The relay settings live in a small `KEY=VALUE` file (by default
//! `~/.pgrok/config`). Session inputs (subdomain and local port) come from
//! the command line and are validated here.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable overriding the config file location
pub const CONFIG_ENV_VAR: &str = "PGROK_CONFIG";

/// Username used for the control channel when the file sets none
pub const DEFAULT_USER: &str = "pgrok";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing required setting {0} in config file")]
    MissingKey(&'static str),

    #[error("Could not determine home directory")]
    NoHomeDirectory,
}

/// Session input errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid subdomain '{0}': use 1-63 lowercase letters, digits or hyphens, not starting or ending with a hyphen")]
    InvalidSubdomain(String),

    #[error("Invalid port '{0}': must be a number between 1 and 65535")]
    InvalidPort(String),
}

/// Relay connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Relay host the control channel connects to
    pub host: String,
    /// Public domain tunnels are published under
    pub domain: String,
    /// Control-channel username
    pub user: String,
    /// Private key for the control channel, if one exists on disk
    pub key_path: Option<PathBuf>,
}

impl RelayConfig {
    /// Default config location: `~/.pgrok/config`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDirectory)?;
        Ok(home.join(".pgrok").join("config"))
    }

    /// Resolve the config location from an explicit path, the environment,
    /// or the default
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => Self::default_path(),
        }
    }

    /// Load the configuration from disk
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        Self::parse(&contents, dirs::home_dir().as_deref())
    }

    /// Parse file contents; `home` is used for `~` expansion of the key path
    pub fn parse(contents: &str, home: Option<&Path>) -> Result<Self, ConfigError> {
        let mut host = None;
        let mut domain = None;
        let mut user = None;
        let mut key = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let value = unquote(value.trim());
            if value.is_empty() {
                continue;
            }

            match name.trim() {
                "PGROK_HOST" | "HOST" => host = Some(value.to_string()),
                "PGROK_DOMAIN" | "DOMAIN" => domain = Some(value.to_string()),
                "PGROK_USER" | "USER" => user = Some(value.to_string()),
                "PGROK_SSH_KEY" | "SSH_KEY" => key = Some(value.to_string()),
                other => debug!("Ignoring unknown config key {}", other),
            }
        }

        Ok(Self {
            host: host.ok_or(ConfigError::MissingKey("PGROK_HOST"))?,
            domain: domain.ok_or(ConfigError::MissingKey("PGROK_DOMAIN"))?,
            user: user.unwrap_or_else(|| DEFAULT_USER.to_string()),
            key_path: key.and_then(|k| resolve_key_path(&k, home)),
        })
    }

    /// `user@host` destination for the control channel
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Public URL a subdomain is expected to be served at
    pub fn public_url(&self, subdomain: &Subdomain) -> String {
        format!("https://{}.{}", subdomain, self.domain)
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Expand `~` and keep the path only if it exists
fn resolve_key_path(raw: &str, home: Option<&Path>) -> Option<PathBuf> {
    let path = if raw == "~" {
        home?.to_path_buf()
    } else if let Some(rest) = raw.strip_prefix("~/") {
        home?.join(rest)
    } else {
        PathBuf::from(raw)
    };

    if path.is_file() {
        Some(path)
    } else {
        warn!("SSH key {} does not exist, ignoring", path.display());
        None
    }
}

/// Validated tunnel subdomain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subdomain(String);

impl Subdomain {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let valid_chars = raw
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');

        if raw.is_empty()
            || raw.len() > 63
            || !valid_chars
            || raw.starts_with('-')
            || raw.ends_with('-')
        {
            return Err(ValidationError::InvalidSubdomain(raw.to_string()));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subdomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a local port argument (1-65535, digits only)
pub fn parse_port(raw: &str) -> Result<u16, ValidationError> {
    let invalid = || ValidationError::InvalidPort(raw.to_string());

    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid()),
        Ok(port) => Ok(port),
    }
}
