// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{
    DEFAULT_ACK_POLL_INTERVAL_SECS, DEFAULT_BACKOFF_THRESHOLD_SECS, DEFAULT_BUSY_WAIT_SECS,
    DEFAULT_CHANNELS_PER_ENDPOINT, DEFAULT_CLOSE_GRACE_PERIOD_SECS,
    DEFAULT_EVENT_BATCH_TIMEOUT_SECS, DEFAULT_MAX_HTTP_CONNECTION_PER_CHANNEL,
    DEFAULT_MAX_SUBMIT_ATTEMPTS, DEFAULT_SOCKET_TIMEOUT_SECS,
};
use crate::error::HecError;
use reqwest::Url;
use std::env;
use std::fmt;
use std::time::Duration;

/// What `send` does when every channel is at its connection cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Fail immediately with [`HecError::Busy`].
    Reject,
    /// Wait for a free slot, giving up with [`HecError::Busy`] after `max_wait`.
    Block { max_wait: Duration },
}

impl Default for BusyPolicy {
    fn default() -> Self {
        Self::Block {
            max_wait: Duration::from_secs(DEFAULT_BUSY_WAIT_SECS),
        }
    }
}

/// Configuration for the HEC client
#[derive(Clone)]
pub struct HecClientConfig {
    /// Collector base URIs, e.g. `https://hec.example.com:8088`
    pub uris: Vec<String>,
    /// HEC token with indexer acknowledgment enabled
    pub token: String,
    /// Interval between two ack poll cycles
    pub ack_poll_interval: Duration,
    /// How long a batch may stay unacknowledged before it resolves as timed out
    pub event_batch_timeout: Duration,
    /// Accept invalid TLS certificates
    pub disable_ssl_cert_verification: bool,
    /// Keep pooled connections alive between requests
    pub http_keep_alive: bool,
    /// Concurrent submissions allowed on one channel
    pub max_http_connection_per_channel: usize,
    /// Channels opened against each URI
    pub channels_per_endpoint: usize,
    /// Per-request timeout for submissions and ack queries
    pub socket_timeout: Duration,
    /// Behavior when all channels are saturated
    pub busy_policy: BusyPolicy,
    /// Channels tried by one `send` before giving up
    pub max_submit_attempts: usize,
    /// How long a channel is skipped after the collector reports it is busy
    pub backoff_threshold: Duration,
    /// How long `close` waits for in-flight submissions
    pub close_grace_period: Duration,
}

impl fmt::Debug for HecClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HecClientConfig")
            .field("uris", &self.uris)
            .field("token", &"<redacted>")
            .field("ack_poll_interval", &self.ack_poll_interval)
            .field("event_batch_timeout", &self.event_batch_timeout)
            .field(
                "disable_ssl_cert_verification",
                &self.disable_ssl_cert_verification,
            )
            .field("http_keep_alive", &self.http_keep_alive)
            .field(
                "max_http_connection_per_channel",
                &self.max_http_connection_per_channel,
            )
            .field("channels_per_endpoint", &self.channels_per_endpoint)
            .field("socket_timeout", &self.socket_timeout)
            .field("busy_policy", &self.busy_policy)
            .field("max_submit_attempts", &self.max_submit_attempts)
            .field("backoff_threshold", &self.backoff_threshold)
            .field("close_grace_period", &self.close_grace_period)
            .finish()
    }
}

impl HecClientConfig {
    /// Create a configuration with default tuning for the given collectors and token
    pub fn new<I, S>(uris: I, token: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            uris: uris.into_iter().map(Into::into).collect(),
            token: token.into(),
            ack_poll_interval: Duration::from_secs(DEFAULT_ACK_POLL_INTERVAL_SECS),
            event_batch_timeout: Duration::from_secs(DEFAULT_EVENT_BATCH_TIMEOUT_SECS),
            disable_ssl_cert_verification: false,
            http_keep_alive: true,
            max_http_connection_per_channel: DEFAULT_MAX_HTTP_CONNECTION_PER_CHANNEL,
            channels_per_endpoint: DEFAULT_CHANNELS_PER_ENDPOINT,
            socket_timeout: Duration::from_secs(DEFAULT_SOCKET_TIMEOUT_SECS),
            busy_policy: BusyPolicy::default(),
            max_submit_attempts: DEFAULT_MAX_SUBMIT_ATTEMPTS,
            backoff_threshold: Duration::from_secs(DEFAULT_BACKOFF_THRESHOLD_SECS),
            close_grace_period: Duration::from_secs(DEFAULT_CLOSE_GRACE_PERIOD_SECS),
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, HecError> {
        let uris: Vec<String> = env::var("HEC_URIS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
            .map(ToString::to_string)
            .collect();
        let token = env::var("HEC_TOKEN").unwrap_or_default();

        let mut config = Self::new(uris, token);
        if let Some(secs) = env_parse::<u64>("HEC_ACK_POLL_INTERVAL") {
            config.ack_poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("HEC_EVENT_BATCH_TIMEOUT") {
            config.event_batch_timeout = Duration::from_secs(secs);
        }
        if let Some(disable) = env_bool("HEC_DISABLE_SSL_CERT_VERIFICATION") {
            config.disable_ssl_cert_verification = disable;
        }
        if let Some(keep_alive) = env_bool("HEC_HTTP_KEEP_ALIVE") {
            config.http_keep_alive = keep_alive;
        }
        if let Some(max) = env_parse::<usize>("HEC_MAX_HTTP_CONNECTION_PER_CHANNEL") {
            config.max_http_connection_per_channel = max;
        }
        if let Some(channels) = env_parse::<usize>("HEC_TOTAL_CHANNELS") {
            config.channels_per_endpoint = channels;
        }
        if let Some(secs) = env_parse::<u64>("HEC_SOCKET_TIMEOUT") {
            config.socket_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_ack_poll_interval(mut self, interval: Duration) -> Self {
        self.ack_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_event_batch_timeout(mut self, timeout: Duration) -> Self {
        self.event_batch_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_disable_ssl_cert_verification(mut self, disable: bool) -> Self {
        self.disable_ssl_cert_verification = disable;
        self
    }

    #[must_use]
    pub fn with_http_keep_alive(mut self, keep_alive: bool) -> Self {
        self.http_keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_max_http_connection_per_channel(mut self, max: usize) -> Self {
        self.max_http_connection_per_channel = max;
        self
    }

    #[must_use]
    pub fn with_channels_per_endpoint(mut self, channels: usize) -> Self {
        self.channels_per_endpoint = channels;
        self
    }

    #[must_use]
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    #[must_use]
    pub fn with_max_submit_attempts(mut self, attempts: usize) -> Self {
        self.max_submit_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_threshold(mut self, threshold: Duration) -> Self {
        self.backoff_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_close_grace_period(mut self, grace: Duration) -> Self {
        self.close_grace_period = grace;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), HecError> {
        if self.uris.is_empty() {
            return Err(HecError::InvalidConfig(
                "At least one collector URI is required".to_string(),
            ));
        }

        for uri in &self.uris {
            let parsed = Url::parse(uri)
                .map_err(|e| HecError::InvalidConfig(format!("Invalid URI '{uri}': {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(HecError::InvalidConfig(format!(
                    "Unsupported scheme in URI '{uri}'. Must be http or https"
                )));
            }
        }

        if self.token.trim().is_empty() {
            return Err(HecError::InvalidConfig(
                "HEC token cannot be empty".to_string(),
            ));
        }

        let non_zero_durations = [
            ("ack poll interval", self.ack_poll_interval),
            ("event batch timeout", self.event_batch_timeout),
            ("socket timeout", self.socket_timeout),
        ];
        for (name, value) in non_zero_durations {
            if value.is_zero() {
                return Err(HecError::InvalidConfig(format!(
                    "The {name} must be greater than 0"
                )));
            }
        }

        if self.max_http_connection_per_channel == 0 {
            return Err(HecError::InvalidConfig(
                "Max HTTP connections per channel must be greater than 0".to_string(),
            ));
        }
        if self.channels_per_endpoint == 0 {
            return Err(HecError::InvalidConfig(
                "Channels per endpoint must be greater than 0".to_string(),
            ));
        }
        if self.max_submit_attempts == 0 {
            return Err(HecError::InvalidConfig(
                "Max submit attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|val| val.trim().eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_KEYS: [&str; 9] = [
        "HEC_URIS",
        "HEC_TOKEN",
        "HEC_ACK_POLL_INTERVAL",
        "HEC_EVENT_BATCH_TIMEOUT",
        "HEC_DISABLE_SSL_CERT_VERIFICATION",
        "HEC_HTTP_KEEP_ALIVE",
        "HEC_MAX_HTTP_CONNECTION_PER_CHANNEL",
        "HEC_TOTAL_CHANNELS",
        "HEC_SOCKET_TIMEOUT",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    fn valid_config() -> HecClientConfig {
        HecClientConfig::new(["https://hec1.example.com:8088"], "token")
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = valid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.ack_poll_interval, Duration::from_secs(10));
        assert!(config.http_keep_alive);
        assert!(!config.disable_ssl_cert_verification);
    }

    #[test]
    fn test_fluent_setters() {
        let config = valid_config()
            .with_ack_poll_interval(Duration::from_secs(10))
            .with_event_batch_timeout(Duration::from_secs(60))
            .with_disable_ssl_cert_verification(true)
            .with_http_keep_alive(true)
            .with_max_http_connection_per_channel(4)
            .with_busy_policy(BusyPolicy::Reject);

        assert_eq!(config.event_batch_timeout, Duration::from_secs(60));
        assert!(config.disable_ssl_cert_verification);
        assert_eq!(config.max_http_connection_per_channel, 4);
        assert_eq!(config.busy_policy, BusyPolicy::Reject);
    }

    #[test]
    fn test_validate_rejects_empty_uris() {
        let config = HecClientConfig::new(Vec::<String>::new(), "token");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_uris() {
        let config = HecClientConfig::new(["not a uri"], "token");
        assert!(config.validate().is_err());

        let config = HecClientConfig::new(["ftp://hec.example.com"], "token");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_token() {
        let config = HecClientConfig::new(["https://hec.example.com"], "   ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(valid_config()
            .with_ack_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(valid_config()
            .with_event_batch_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(valid_config()
            .with_max_http_connection_per_channel(0)
            .validate()
            .is_err());
        assert!(valid_config()
            .with_channels_per_endpoint(0)
            .validate()
            .is_err());
        assert!(valid_config()
            .with_max_submit_attempts(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = HecClientConfig::new(["https://hec.example.com"], "super-secret");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        env::set_var(
            "HEC_URIS",
            "https://hec1.example.com:8088, https://hec2.example.com:8088",
        );
        env::set_var("HEC_TOKEN", "536AF219-CF36-4C8C-AA0C-FD9793A0F4DD");
        env::set_var("HEC_ACK_POLL_INTERVAL", "5");
        env::set_var("HEC_EVENT_BATCH_TIMEOUT", "60");
        env::set_var("HEC_DISABLE_SSL_CERT_VERIFICATION", "TRUE");
        env::set_var("HEC_HTTP_KEEP_ALIVE", "false");
        env::set_var("HEC_MAX_HTTP_CONNECTION_PER_CHANNEL", "4");

        let config = HecClientConfig::from_env().expect("config should load");
        assert_eq!(
            config.uris,
            vec![
                "https://hec1.example.com:8088".to_string(),
                "https://hec2.example.com:8088".to_string()
            ]
        );
        assert_eq!(config.ack_poll_interval, Duration::from_secs(5));
        assert_eq!(config.event_batch_timeout, Duration::from_secs(60));
        assert!(config.disable_ssl_cert_verification);
        assert!(!config.http_keep_alive);
        assert_eq!(config.max_http_connection_per_channel, 4);
        assert_eq!(config.channels_per_endpoint, 1);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_requires_uris() {
        clear_env();
        env::set_var("HEC_TOKEN", "token");
        assert!(HecClientConfig::from_env().is_err());
        clear_env();
    }
}
