//! Configuration for the fallback orchestrator
//!
//! Settings can be built in code, read from the environment, or loaded from a TOML file:
//!
//! ```toml
//! retry_before_fallback = 3
//!
//! [backoff]
//! initial_ms = 500
//! factor = 1.5
//! max_ms = 10000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::fallback::Backoff;

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Primary attempts before switching to the fallback (at least one is always made)
    pub retry_before_fallback: usize,

    /// Delay between primary attempts
    pub backoff: Backoff,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            retry_before_fallback: 2,
            backoff: Backoff::default(),
        }
    }
}

/// Failure to load a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration builder
pub struct ConfigBuilder {
    config: FallbackConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FallbackConfig::default(),
        }
    }

    pub fn retry_before_fallback(mut self, attempts: usize) -> Self {
        self.config.retry_before_fallback = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.backoff.initial = delay;
        self
    }

    /// Cap each backoff delay; uncapped unless set.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.backoff.max = Some(delay);
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff.factor = factor;
        self
    }

    pub fn build(self) -> FallbackConfig {
        self.config
    }
}

/// Load configuration from environment variables, keeping defaults for anything unset or
/// unparsable.
pub fn from_env() -> FallbackConfig {
    from_lookup(|key| std::env::var(key).ok())
}

fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> FallbackConfig {
    let mut config = FallbackConfig::default();

    if let Some(retries) = lookup("LLM_FALLBACK_RETRIES").and_then(|v| v.parse().ok()) {
        config.retry_before_fallback = retries;
    }

    if let Some(factor) = lookup("LLM_FALLBACK_BACKOFF_FACTOR").and_then(|v| v.parse().ok()) {
        config.backoff.factor = factor;
    }

    if let Some(ms) = lookup("LLM_FALLBACK_BACKOFF_INITIAL_MS").and_then(|v| v.parse().ok()) {
        config.backoff.initial = Duration::from_millis(ms);
    }

    if let Some(ms) = lookup("LLM_FALLBACK_BACKOFF_MAX_MS").and_then(|v| v.parse().ok()) {
        config.backoff.max = Some(Duration::from_millis(ms));
    }

    config
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<Path>) -> Result<FallbackConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: FallbackConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Serde helpers storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    /// Same encoding for an optional duration; absent means `None`.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => super::serialize(d, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
        }
    }
}
