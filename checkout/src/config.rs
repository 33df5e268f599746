//! Configuration management for the checkout engine.
//!
//! Loads configuration from environment variables with sensible defaults.

use boxoffice_runtime::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable holds a value that cannot be used
    #[error("Invalid value '{value}' for {key}: {reason}")]
    Invalid {
        /// Variable name
        key: &'static str,
        /// Offending value
        value: String,
        /// What was expected
        reason: String,
    },

    /// A variable required by the chosen setup is unset
    #[error("{key} must be set when {context}")]
    Missing {
        /// Variable name
        key: &'static str,
        /// Why it is required
        context: &'static str,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Session lifetime and countdown
    pub session: SessionConfig,
    /// Payment gateway selection
    pub gateway: GatewayConfig,
    /// Session persistence
    pub storage: StorageConfig,
    /// Retry of transient gateway failures
    pub retry: RetryConfig,
}

/// Session lifetime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds from creation until a session expires (default: 600)
    pub ttl_secs: u64,
    /// Countdown tick interval in milliseconds (default: 1000)
    pub tick_interval_ms: u64,
    /// Artificial delay added to every session operation, in milliseconds (default: 0)
    pub latency_ms: u64,
    /// Seconds between sweeps deleting expired sessions; 0 disables (default: 60)
    pub purge_interval_secs: u64,
    /// Seconds an expired session is kept before a sweep may delete it (default: 300)
    pub purge_grace_secs: u64,
}

/// Which payment gateway implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    /// Deterministic in-memory gateway with test cards
    Mock,
    /// Stripe-compatible HTTP API
    Stripe,
}

impl FromStr for GatewayKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "stripe" => Ok(Self::Stripe),
            _ => Err("expected 'mock' or 'stripe'".to_string()),
        }
    }
}

/// Payment gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Implementation (default: mock)
    pub kind: GatewayKind,
    /// Simulated network delay of the mock gateway in milliseconds (default: 0)
    pub mock_latency_ms: u64,
    /// Base URL of the Stripe-compatible API (default: `https://api.stripe.com`)
    pub stripe_base_url: String,
    /// Secret API key, required for the Stripe gateway
    #[serde(skip_serializing)]
    pub stripe_secret_key: Option<String>,
    /// HTTP request timeout in seconds (default: 10)
    pub request_timeout_secs: u64,
}

/// Where sessions are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory
    Memory,
    /// A JSON file
    File,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            _ => Err("expected 'memory' or 'file'".to_string()),
        }
    }
}

/// Session storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend (default: memory)
    pub backend: StorageBackend,
    /// JSON file for the file backend (default: `data/sessions.json`)
    pub path: PathBuf,
}

/// Retry configuration for gateway calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 2)
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds (default: 100)
    pub initial_delay_ms: u64,
    /// Upper bound on any delay in milliseconds (default: 2000)
    pub max_delay_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an unusable value or
    /// the Stripe gateway is selected without a secret key.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let config = Self {
            session: SessionConfig {
                ttl_secs: vars.parse("CHECKOUT_SESSION_TTL_SECS", 600)?,
                tick_interval_ms: vars.parse("CHECKOUT_TICK_INTERVAL_MS", 1000)?,
                latency_ms: vars.parse("CHECKOUT_SESSION_LATENCY_MS", 0)?,
                purge_interval_secs: vars.parse("CHECKOUT_SESSION_PURGE_INTERVAL_SECS", 60)?,
                purge_grace_secs: vars.parse("CHECKOUT_SESSION_PURGE_GRACE_SECS", 300)?,
            },
            gateway: GatewayConfig {
                kind: vars.parse("PAYMENT_GATEWAY", GatewayKind::Mock)?,
                mock_latency_ms: vars.parse("GATEWAY_MOCK_LATENCY_MS", 0)?,
                stripe_base_url: lookup("STRIPE_API_BASE")
                    .unwrap_or_else(|| "https://api.stripe.com".to_string()),
                stripe_secret_key: lookup("STRIPE_SECRET_KEY").filter(|k| !k.is_empty()),
                request_timeout_secs: vars.parse("GATEWAY_TIMEOUT_SECS", 10)?,
            },
            storage: StorageConfig {
                backend: vars.parse("SESSION_STORAGE", StorageBackend::Memory)?,
                path: lookup("SESSION_STORAGE_PATH")
                    .map_or_else(|| PathBuf::from("data/sessions.json"), PathBuf::from),
            },
            retry: RetryConfig {
                max_retries: vars.parse("GATEWAY_MAX_RETRIES", 2)?,
                initial_delay_ms: vars.parse("GATEWAY_RETRY_INITIAL_MS", 100)?,
                max_delay_ms: vars.parse("GATEWAY_RETRY_MAX_MS", 2000)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.session.ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "CHECKOUT_SESSION_TTL_SECS",
                value: "0".to_string(),
                reason: "sessions need a positive lifetime".to_string(),
            });
        }
        if self.session.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "CHECKOUT_TICK_INTERVAL_MS",
                value: "0".to_string(),
                reason: "the countdown needs a positive tick".to_string(),
            });
        }
        if self.gateway.kind == GatewayKind::Stripe && self.gateway.stripe_secret_key.is_none() {
            return Err(ConfigError::Missing {
                key: "STRIPE_SECRET_KEY",
                context: "PAYMENT_GATEWAY=stripe",
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionConfig {
                ttl_secs: 600,
                tick_interval_ms: 1000,
                latency_ms: 0,
                purge_interval_secs: 60,
                purge_grace_secs: 300,
            },
            gateway: GatewayConfig {
                kind: GatewayKind::Mock,
                mock_latency_ms: 0,
                stripe_base_url: "https://api.stripe.com".to_string(),
                stripe_secret_key: None,
                request_timeout_secs: 10,
            },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                path: PathBuf::from("data/sessions.json"),
            },
            retry: RetryConfig {
                max_retries: 2,
                initial_delay_ms: 100,
                max_delay_ms: 2000,
            },
        }
    }
}

impl SessionConfig {
    /// Session lifetime
    #[must_use]
    pub fn ttl(&self) -> chrono::Duration {
        // Capped at a year; chrono rejects second counts near i64::MAX
        let secs = self.ttl_secs.min(365 * 24 * 60 * 60);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }

    /// Countdown tick
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Artificial delay per operation
    #[must_use]
    pub const fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    /// Interval of the expired-session sweep, if enabled
    #[must_use]
    pub const fn purge_interval(&self) -> Option<Duration> {
        match self.purge_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// How long expired sessions stay readable
    #[must_use]
    pub fn purge_grace(&self) -> chrono::Duration {
        let secs = self.purge_grace_secs.min(365 * 24 * 60 * 60);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }
}

impl GatewayConfig {
    /// Simulated delay of the mock gateway
    #[must_use]
    pub const fn mock_latency(&self) -> Duration {
        Duration::from_millis(self.mock_latency_ms)
    }

    /// HTTP request timeout
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl RetryConfig {
    /// The retry policy these settings describe
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retries)
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .jitter(true)
            .build()
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
                key,
                reason: err.to_string(),
                value,
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.session.ttl(), chrono::Duration::minutes(10));
        assert_eq!(config.session.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.gateway.kind, GatewayKind::Mock);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.retry.policy().max_retries, 2);
        assert_eq!(config.session.purge_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.session.purge_grace(), chrono::Duration::minutes(5));
    }

    #[test]
    fn test_zero_purge_interval_disables_sweep() {
        let config = config_from(&[("CHECKOUT_SESSION_PURGE_INTERVAL_SECS", "0")]).unwrap();
        assert_eq!(config.session.purge_interval(), None);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("CHECKOUT_SESSION_TTL_SECS", "900"),
            ("SESSION_STORAGE", "File"),
            ("SESSION_STORAGE_PATH", "/tmp/sessions.json"),
            ("PAYMENT_GATEWAY", "stripe"),
            ("STRIPE_SECRET_KEY", "sk_test_123"),
        ])
        .unwrap();

        assert_eq!(config.session.ttl(), chrono::Duration::minutes(15));
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.storage.path, PathBuf::from("/tmp/sessions.json"));
        assert_eq!(config.gateway.kind, GatewayKind::Stripe);
    }

    #[test]
    fn test_unparseable_value_names_the_variable() {
        let err = config_from(&[("GATEWAY_MAX_RETRIES", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "GATEWAY_MAX_RETRIES", .. }));

        let err = config_from(&[("PAYMENT_GATEWAY", "paypal")]).unwrap_err();
        assert!(err.to_string().contains("PAYMENT_GATEWAY"));
    }

    #[test]
    fn test_stripe_requires_secret_key() {
        let err = config_from(&[("PAYMENT_GATEWAY", "stripe")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing {
                key: "STRIPE_SECRET_KEY",
                context: "PAYMENT_GATEWAY=stripe",
            }
        );
    }

    #[test]
    fn test_zero_ttl_is_rejected() {
        assert!(config_from(&[("CHECKOUT_SESSION_TTL_SECS", "0")]).is_err());
    }
}
