//! Configuration for the sync client.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown environment: {0} (expected local, staging or production)")]
    UnknownEnvironment(String),

    #[error("Invalid sync server URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Deployment the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Local,
    Staging,
    Production,
}

impl Environment {
    /// Default WebSocket endpoint for this deployment.
    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::Local => "ws://localhost:8787/ws",
            Environment::Staging => "wss://sync.staging.practicejournal.app/ws",
            Environment::Production => "wss://sync.practicejournal.app/ws",
        }
    }
}

impl Display for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Environment::Local => "local",
            Environment::Staging => "staging",
            Environment::Production => "production",
        })
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "development" | "dev" => Ok(Environment::Local),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(ConfigError::UnknownEnvironment(s.to_string())),
        }
    }
}

/// Configuration for connection lifecycle, catch-up, and the offline queue.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Deployment used to derive the server address.
    pub environment: Environment,
    /// Explicit server address, overriding the environment default.
    pub base_url: Option<String>,
    /// Interval between heartbeat pings while connected.
    pub heartbeat_interval: Duration,
    /// Base delay for exponential reconnect backoff.
    pub reconnect_interval: Duration,
    /// Upper bound on a single reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Reconnect attempts before giving up for this connection lifetime.
    pub max_reconnect_attempts: u32,
    /// Whether abnormal closes trigger reconnection at all.
    pub auto_reconnect: bool,
    /// How long `connect` waits for the transport to open.
    pub connect_timeout: Duration,
    /// Staleness of the last sync beyond which a catch-up is requested.
    pub catch_up_threshold: Duration,
    /// Age beyond which queued mutations are discarded.
    pub queue_ttl: Duration,
    /// Maximum number of queued mutations kept.
    pub queue_capacity: usize,
    /// Namespace for persisted keys.
    pub storage_prefix: String,
}

impl SyncConfig {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            base_url: None,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            auto_reconnect: true,
            connect_timeout: Duration::from_secs(10),
            catch_up_threshold: Duration::from_secs(30),
            queue_ttl: Duration::from_secs(48 * 3600),
            queue_capacity: 200,
            storage_prefix: "practice_sync".to_string(),
        }
    }

    /// Sets an explicit server address.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the base reconnect delay.
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Sets the reconnect delay cap.
    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    /// Sets the reconnect attempt limit.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Enables or disables automatic reconnection.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Sets the connection attempt timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the catch-up staleness threshold.
    pub fn with_catch_up_threshold(mut self, threshold: Duration) -> Self {
        self.catch_up_threshold = threshold;
        self
    }

    /// Sets the queued mutation time-to-live.
    pub fn with_queue_ttl(mut self, ttl: Duration) -> Self {
        self.queue_ttl = ttl;
        self
    }

    /// Sets the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the persisted key namespace.
    pub fn with_storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_prefix = prefix.into();
        self
    }

    /// Server address in effect.
    pub fn server_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.environment.base_url())
    }

    /// Compose the connection URL with identity and credential as query parameters.
    pub fn connection_url(&self, user_id: &str, credential: &str) -> Result<Url, ConfigError> {
        let base = self.server_url();
        let mut url = Url::parse(base).map_err(|source| ConfigError::InvalidUrl {
            url: base.to_string(),
            source,
        })?;
        url.query_pairs_mut()
            .append_pair("userId", user_id)
            .append_pair("token", credential);
        Ok(url)
    }

    /// Delay before the next reconnect given how many attempts were already made.
    ///
    /// `reconnect_interval * 2^attempts`, capped at `max_reconnect_delay`.
    pub fn reconnect_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.min(31));
        self.reconnect_interval
            .checked_mul(factor)
            .unwrap_or(self.max_reconnect_delay)
            .min(self.max_reconnect_delay)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(Environment::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Backoff calculation ====================

    #[test]
    fn test_reconnect_delay_exponential() {
        let config = SyncConfig::default();

        // 1s, 2s, 4s, 8s, 16s, 30s (capped)
        assert_eq!(config.reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(config.reconnect_delay(2), Duration::from_secs(4));
        assert_eq!(config.reconnect_delay(3), Duration::from_secs(8));
        assert_eq!(config.reconnect_delay(4), Duration::from_secs(16));
        assert_eq!(config.reconnect_delay(5), Duration::from_secs(30));
        assert_eq!(config.reconnect_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_reconnect_delay_custom_interval() {
        let config = SyncConfig::default().with_reconnect_interval(Duration::from_millis(50));

        assert_eq!(config.reconnect_delay(0), Duration::from_millis(50));
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(100));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(200));
    }

    // ==================== Connection URL ====================

    #[test]
    fn test_connection_url_encodes_credentials() {
        let config = SyncConfig::default().with_base_url("ws://127.0.0.1:9000/ws");
        let url = config.connection_url("user 1", "a+b/c=").unwrap();

        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/ws");
        let pairs: Vec<_> = url.query_pairs().collect();
        assert_eq!(pairs[0].0, "userId");
        assert_eq!(pairs[0].1, "user 1");
        assert_eq!(pairs[1].0, "token");
        assert_eq!(pairs[1].1, "a+b/c=");
        assert!(!url.as_str().contains("a+b/c="));
    }

    #[test]
    fn test_connection_url_uses_environment() {
        let config = SyncConfig::new(Environment::Production);
        let url = config.connection_url("u", "t").unwrap();
        assert!(url.as_str().starts_with("wss://sync.practicejournal.app/ws?"));
    }

    #[test]
    fn test_connection_url_rejects_bad_base() {
        let config = SyncConfig::default().with_base_url("not a url");
        assert!(matches!(
            config.connection_url("u", "t"),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    // ==================== Environment ====================

    #[test]
    fn test_environment_parsing() {
        assert_eq!("staging".parse::<Environment>().unwrap(), Environment::Staging);
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Local);
        assert!("mars".parse::<Environment>().is_err());
        assert_eq!(Environment::Staging.to_string(), "staging");
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.catch_up_threshold, Duration::from_secs(30));
        assert_eq!(config.queue_ttl, Duration::from_secs(172_800));
        assert_eq!(config.queue_capacity, 200);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert!(config.auto_reconnect);
    }
}
