//! # Bus Configuration
//!
//! Everything here is read once at construction and is immutable for the
//! lifetime of the bus.

use std::env;
use std::time::Duration;

use shared_types::{NamingPolicy, SerializerOptions};
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::{DEFAULT_RETRY_COUNT, DEFAULT_SUBSCRIPTION_CLIENT_NAME, MAX_RETRY_COUNT};

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("subscription client name must not be empty")]
    EmptySubscriptionClientName,

    #[error("retry count {0} exceeds the maximum of {MAX_RETRY_COUNT}")]
    RetryCountTooHigh(u32),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Event bus configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusConfig {
    /// Name of this service's subscription queue.
    pub subscription_client_name: String,
    /// Publish retries after the first attempt.
    pub retry_count: u32,
    /// Codec options shared by publish and consume.
    pub serializer: SerializerOptions,
    /// How long `shutdown` waits for the consumer to stop.
    pub shutdown_grace: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscription_client_name: DEFAULT_SUBSCRIPTION_CLIENT_NAME.to_string(),
            retry_count: DEFAULT_RETRY_COUNT,
            serializer: SerializerOptions::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl EventBusConfig {
    /// Configuration with a specific subscription queue name.
    #[must_use]
    pub fn for_client(subscription_client_name: impl Into<String>) -> Self {
        Self {
            subscription_client_name: subscription_client_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BUS_SUBSCRIPTION_CLIENT_NAME`: subscription queue name (default: integration-bus)
    /// - `BUS_RETRY_COUNT`: publish retries (default: 5, max: 10)
    /// - `BUS_JSON_NAMING`: as-is | camel | pascal | snake (default: as-is)
    /// - `BUS_JSON_OMIT_NULLS`: drop null fields (default: false)
    /// - `BUS_JSON_ESCAPE_NON_ASCII`: escape non-ASCII text (default: false)
    /// - `BUS_SHUTDOWN_GRACE_SECS`: consumer stop timeout (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`EventBusConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            subscription_client_name: lookup("BUS_SUBSCRIPTION_CLIENT_NAME")
                .map(|v| v.trim().to_string())
                .unwrap_or(defaults.subscription_client_name),
            retry_count: parse_or("BUS_RETRY_COUNT", &lookup, defaults.retry_count)?,
            serializer: SerializerOptions {
                naming: parse_or("BUS_JSON_NAMING", &lookup, NamingPolicy::AsIs)?,
                omit_nulls: parse_flag("BUS_JSON_OMIT_NULLS", &lookup, false)?,
                escape_non_ascii: parse_flag("BUS_JSON_ESCAPE_NON_ASCII", &lookup, false)?,
            },
            shutdown_grace: Duration::from_secs(parse_or(
                "BUS_SHUTDOWN_GRACE_SECS",
                &lookup,
                defaults.shutdown_grace.as_secs(),
            )?),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants `from_env` enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscription_client_name.is_empty() {
            return Err(ConfigError::EmptySubscriptionClientName);
        }
        if self.retry_count > MAX_RETRY_COUNT {
            return Err(ConfigError::RetryCountTooHigh(self.retry_count));
        }
        Ok(())
    }

    /// Publish retry policy for this configuration.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_retries(self.retry_count)
    }
}

fn parse_or<T, F>(key: &'static str, lookup: &F, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_flag<F>(key: &'static str, lookup: &F, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) if v == "true" || v == "1" => Ok(true),
        Some(v) if v == "false" || v == "0" => Ok(false),
        Some(value) => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected true, false, 1 or 0".to_string(),
        }),
    }
}
