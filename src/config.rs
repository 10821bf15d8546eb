//! Configuration Module
//!
//! Everything the controller needs to know before it mounts.

use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::retry::{Backoff, RetryPolicy};

pub const DEFAULT_LOCAL_DB_NAME: &str = "user";
pub const DEFAULT_SESSION_INTERVAL: Duration = Duration::from_millis(15_000);
pub const DEFAULT_USER_DB_RETRIES: u32 = 5;
pub const DEFAULT_USER_DB_RETRY_INTERVAL: Duration = Duration::from_millis(2_500);

/// Backend used for the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Adapter {
    /// In-process store, nothing survives a restart.
    #[default]
    Memory,
    /// A CouchDB-compatible server on this machine; the local name is a URL.
    Http,
}

impl FromStr for Adapter {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Adapter::Memory),
            "http" => Ok(Adapter::Http),
            other => Err(ConfigError::UnknownAdapter(other.to_string())),
        }
    }
}

impl std::fmt::Display for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Adapter::Memory => write!(f, "memory"),
            Adapter::Http => write!(f, "http"),
        }
    }
}

/// Delay policy between user database existence checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Base URL of the CouchDB server, e.g. `http://localhost:5984/`.
    pub url: String,
    pub adapter: Adapter,
    pub local_db_name: String,
    /// Replicate the user's database into the local store.
    pub sync: bool,
    /// Period of the background session check; zero turns it off.
    #[serde(with = "millis")]
    pub session_interval: Duration,
    pub debug: bool,
    /// Render the login/signup screens while unauthenticated.
    pub scaffold: bool,
    pub user_db_retries: u32,
    #[serde(with = "millis")]
    pub user_db_retry_interval: Duration,
    pub user_db_backoff: BackoffKind,
    /// Destroy and recreate the local store after a successful logout.
    pub reset_local_on_logout: bool,
    /// Keep credentials in the encrypted store between runs.
    pub remember: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            adapter: Adapter::default(),
            local_db_name: DEFAULT_LOCAL_DB_NAME.to_string(),
            sync: true,
            session_interval: DEFAULT_SESSION_INTERVAL,
            debug: false,
            scaffold: true,
            user_db_retries: DEFAULT_USER_DB_RETRIES,
            user_db_retry_interval: DEFAULT_USER_DB_RETRY_INTERVAL,
            user_db_backoff: BackoffKind::default(),
            reset_local_on_logout: false,
            remember: false,
        }
    }
}

impl AuthConfig {
    /// Config with the given server URL and defaults for everything else.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Read configuration from `COUCH_AUTH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("COUCH_AUTH_URL") {
            config.url = url;
        }
        if let Some(adapter) = lookup("COUCH_AUTH_ADAPTER") {
            config.adapter = adapter.parse()?;
        }
        if let Some(name) = lookup("COUCH_AUTH_LOCAL_DB") {
            config.local_db_name = name;
        }
        if let Some(value) = lookup("COUCH_AUTH_SYNC") {
            config.sync = parse_bool("COUCH_AUTH_SYNC", &value)?;
        }
        if let Some(value) = lookup("COUCH_AUTH_SESSION_INTERVAL_MS") {
            config.session_interval = parse_millis("COUCH_AUTH_SESSION_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("COUCH_AUTH_DEBUG") {
            config.debug = parse_bool("COUCH_AUTH_DEBUG", &value)?;
        }
        if let Some(value) = lookup("COUCH_AUTH_SCAFFOLD") {
            config.scaffold = parse_bool("COUCH_AUTH_SCAFFOLD", &value)?;
        }
        if let Some(value) = lookup("COUCH_AUTH_USER_DB_RETRIES") {
            config.user_db_retries = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "COUCH_AUTH_USER_DB_RETRIES".into(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("COUCH_AUTH_USER_DB_RETRY_INTERVAL_MS") {
            config.user_db_retry_interval =
                parse_millis("COUCH_AUTH_USER_DB_RETRY_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("COUCH_AUTH_REMEMBER") {
            config.remember = parse_bool("COUCH_AUTH_REMEMBER", &value)?;
        }

        Ok(config)
    }

    /// Check the configuration and return the normalised base URL.
    ///
    /// The returned URL always ends with `/` so endpoint paths can be appended.
    pub fn base_url(&self) -> Result<String, ConfigError> {
        let trimmed = self.url.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::MissingUrl);
        }

        let parsed = Url::parse(trimmed).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        let mut base = parsed.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(base)
    }

    /// Retry policy for the post-signup user database poll.
    pub fn user_db_retry_policy(&self) -> RetryPolicy {
        let backoff = match self.user_db_backoff {
            BackoffKind::Fixed => Backoff::Fixed(self.user_db_retry_interval),
            BackoffKind::Exponential => Backoff::Exponential {
                initial: self.user_db_retry_interval,
                factor: 2,
                max: self.user_db_retry_interval * 16,
            },
        };
        RetryPolicy::new(self.user_db_retries, backoff)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("A url to a couchdb instance is required")]
    MissingUrl,

    #[error("Invalid couchdb url: {0}")]
    InvalidUrl(String),

    #[error("Unknown storage adapter: {0}")]
    UnknownAdapter(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Could not build HTTP client: {0}")]
    Client(String),

    #[error("Could not open local database: {0}")]
    LocalStore(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_url_is_rejected() {
        let config = AuthConfig::default();
        assert!(matches!(config.base_url(), Err(ConfigError::MissingUrl)));

        let config = AuthConfig::new("   ");
        assert!(matches!(config.base_url(), Err(ConfigError::MissingUrl)));
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let config = AuthConfig::new("http://localhost:5984");
        assert_eq!(config.base_url().unwrap(), "http://localhost:5984/");

        let config = AuthConfig::new("https://couch.example.com/db/");
        assert_eq!(config.base_url().unwrap(), "https://couch.example.com/db/");
    }

    #[test]
    fn non_http_url_is_invalid() {
        let config = AuthConfig::new("ftp://example.com/");
        assert!(matches!(config.base_url(), Err(ConfigError::InvalidUrl(_))));

        let config = AuthConfig::new("not a url");
        assert!(matches!(config.base_url(), Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AuthConfig::default();
        assert_eq!(config.local_db_name, "user");
        assert!(config.sync);
        assert!(config.scaffold);
        assert_eq!(config.session_interval, Duration::from_millis(15_000));
        assert_eq!(config.user_db_retries, 5);
        assert_eq!(config.adapter, Adapter::Memory);
    }

    #[test]
    fn env_values_override_defaults() {
        let config = AuthConfig::from_lookup(lookup(&[
            ("COUCH_AUTH_URL", "http://couch:5984/"),
            ("COUCH_AUTH_ADAPTER", "HTTP"),
            ("COUCH_AUTH_SYNC", "false"),
            ("COUCH_AUTH_SESSION_INTERVAL_MS", "500"),
            ("COUCH_AUTH_USER_DB_RETRIES", "3"),
        ]))
        .unwrap();

        assert_eq!(config.url, "http://couch:5984/");
        assert_eq!(config.adapter, Adapter::Http);
        assert!(!config.sync);
        assert_eq!(config.session_interval, Duration::from_millis(500));
        assert_eq!(config.user_db_retries, 3);
    }

    #[test]
    fn malformed_env_values_are_reported() {
        let err = AuthConfig::from_lookup(lookup(&[("COUCH_AUTH_SYNC", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = AuthConfig::from_lookup(lookup(&[("COUCH_AUTH_ADAPTER", "idb")])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownAdapter(_)));
    }

    #[test]
    fn exponential_policy_uses_interval_as_initial_delay() {
        let mut config = AuthConfig::new("http://localhost:5984/");
        config.user_db_backoff = BackoffKind::Exponential;
        config.user_db_retry_interval = Duration::from_millis(100);

        let policy = config.user_db_retry_policy();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
    }
}
