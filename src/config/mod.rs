//! Client configuration — service location, timeouts, cache windows.
//!
//! Configuration is plain data deserialized with `serde`. Every field has a
//! default, so an empty JSON object is a valid config. A handful of
//! environment variables override the file for deployment convenience.
//!
//! ```json
//! {
//!   "base_url": "http://127.0.0.1:3001",
//!   "request_timeout_ms": 15000,
//!   "cache": { "ttl_ms": 30000, "linger_ms": 2000 },
//!   "token_file": "/var/lib/dashboard/auth_token"
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheConfig, DEFAULT_LINGER, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL};

/// Environment variable overriding [`ClientConfig::base_url`].
pub const ENV_BASE_URL: &str = "TESTHIST_BASE_URL";

/// Environment variable overriding [`ClientConfig::token_file`].
pub const ENV_TOKEN_FILE: &str = "TESTHIST_TOKEN_FILE";

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Root URL of the dashboard backend. Only `http://` is supported.
    pub base_url: String,

    pub connect_timeout_ms: u64,

    /// Upper bound on one request/response exchange, connect excluded.
    pub request_timeout_ms: u64,

    /// Responses larger than this are rejected.
    pub max_response_bytes: usize,

    pub cache: CacheSettings,

    /// File holding the bearer token. Missing or empty means anonymous.
    pub token_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3001".to_owned(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 15_000,
            max_response_bytes: 8 * 1024 * 1024,
            cache: CacheSettings::default(),
            token_file: None,
        }
    }
}

/// Cache windows, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_ms: u64,
    pub linger_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_ms: duration_ms(DEFAULT_TTL),
            linger_ms: duration_ms(DEFAULT_LINGER),
            sweep_interval_ms: duration_ms(DEFAULT_SWEEP_INTERVAL),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl ClientConfig {
    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the JSON is invalid.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Applies [`ENV_BASE_URL`] and [`ENV_TOKEN_FILE`] when set.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = url;
        }
        if let Some(path) = lookup(ENV_TOKEN_FILE).filter(|v| !v.trim().is_empty()) {
            self.token_file = Some(PathBuf::from(path));
        }
        self
    }

    /// Checks the values and parses the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unusable URL, a zero
    /// timeout/window, or a `cache.ttl_ms` shorter than one full exchange
    /// (`connect_timeout_ms + request_timeout_ms`). A pending entry must
    /// outlive its request, or a duplicate fetch could start while the first
    /// is still in flight.
    pub fn validate(&self) -> Result<BaseUrl, ConfigError> {
        let base = BaseUrl::parse(&self.base_url)?;
        let checks = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("cache.ttl_ms", self.cache.ttl_ms),
            ("cache.sweep_interval_ms", self.cache.sweep_interval_ms),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.cache.linger_ms > self.cache.ttl_ms {
            return Err(ConfigError::Invalid(
                "cache.linger_ms must not exceed cache.ttl_ms".to_owned(),
            ));
        }
        let exchange_ms = self.connect_timeout_ms.saturating_add(self.request_timeout_ms);
        if self.cache.ttl_ms < exchange_ms {
            return Err(ConfigError::Invalid(format!(
                "cache.ttl_ms ({}) must cover connect_timeout_ms + request_timeout_ms ({exchange_ms})",
                self.cache.ttl_ms
            )));
        }
        if self.max_response_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_response_bytes must be greater than zero".to_owned(),
            ));
        }
        Ok(base)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Converts the millisecond settings into a [`CacheConfig`].
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_millis(self.cache.ttl_ms),
            linger: Duration::from_millis(self.cache.linger_ms),
            sweep_interval: Duration::from_millis(self.cache.sweep_interval_ms),
        }
    }
}

/// A parsed `http://host[:port][/prefix]` URL.
///
/// # Examples
///
/// ```
/// use testhist::config::BaseUrl;
///
/// let base = BaseUrl::parse("http://dash.local:8080/app/").unwrap();
/// assert_eq!(base.host(), "dash.local");
/// assert_eq!(base.port(), 8080);
/// assert_eq!(base.join("/api/test/history"), "/app/api/test/history");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUrl {
    host: String,
    port: u16,
    prefix: String,
}

impl BaseUrl {
    /// Parses a base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for any scheme other than `http`,
    /// an empty host, or a bad port.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        let rest = match url.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") => rest,
            Some((scheme, _)) => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported URL scheme `{scheme}` (only http is supported)"
                )));
            }
            None => return Err(ConfigError::Invalid(format!("missing URL scheme in `{url}`"))),
        };

        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, ""),
        };
        if path.contains(['?', '#']) {
            return Err(ConfigError::Invalid(
                "base URL must not carry a query or fragment".to_owned(),
            ));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::Invalid(format!("invalid port `{port}`")))?;
                (host, port)
            }
            _ => (authority, 80),
        };
        if host.is_empty() {
            return Err(ConfigError::Invalid("base URL has an empty host".to_owned()));
        }

        Ok(Self {
            host: host.to_owned(),
            port,
            prefix: path.trim_end_matches('/').to_owned(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for both connecting and the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Prepends the path prefix to an origin-form target.
    pub fn join(&self, target: &str) -> String {
        if target.starts_with('/') {
            format!("{}{target}", self.prefix)
        } else {
            format!("{}/{target}", self.prefix)
        }
    }
}

impl fmt::Display for BaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}:{}{}", self.host, self.port, self.prefix)
    }
}
