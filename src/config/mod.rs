//! Orchestrator configuration.
//!
//! All tunables are captured in a [`SagaConfig`] snapshot at construction
//! time; nothing re-reads configuration while a saga is in flight. Values
//! load from an optional YAML file plus `TANDEM__`-prefixed environment
//! overrides.

use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "tandem.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TANDEM_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TANDEM";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TANDEM_LOG";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),
}

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Retry eligibility and pacing.
    pub retry: RetryPolicy,
    /// Step-result validity windows for resume planning.
    pub validity: ValidityPolicy,
    /// Progress bus sizing.
    pub progress: ProgressConfig,
    /// Per-step deadlines.
    pub step: StepTimeouts,
    /// Failure-reason substrings that block retry (matched
    /// case-insensitively).
    pub non_retryable_tokens: Vec<String>,
    /// Remote collaborator endpoints, when driving HTTP clients.
    pub collaborators: Option<CollaboratorEndpoints>,
}

impl SagaConfig {
    /// Load from the default file (if present) and environment overrides.
    ///
    /// The file path comes from `TANDEM_CONFIG`, falling back to
    /// `tandem.yaml` in the working directory. Environment variables use
    /// the `TANDEM__` prefix with `__` separators, e.g.
    /// `TANDEM__RETRY__MAX_ATTEMPTS=5`.
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut loaded: SagaConfig = settings.try_deserialize()?;
        if loaded.non_retryable_tokens.is_empty() {
            loaded.non_retryable_tokens = default_non_retryable_tokens();
        }
        Ok(loaded)
    }
}

fn default_non_retryable_tokens() -> Vec<String> {
    vec![
        "FRAUD".to_string(),
        "SUSPENDED".to_string(),
        "CANCELLED".to_string(),
    ]
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            validity: ValidityPolicy::default(),
            progress: ProgressConfig::default(),
            step: StepTimeouts::default(),
            non_retryable_tokens: default_non_retryable_tokens(),
            collaborators: None,
        }
    }
}

/// Retry eligibility and pacing policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Upper bound on retry attempts per order.
    pub max_attempts: u32,
    /// Eligibility expires this long after order creation.
    pub window_hours: i64,
    /// Minimum gap between attempts.
    pub cooldown_minutes: i64,
    /// Payment method used when a retry request supplies none and the
    /// order has none recorded.
    pub default_payment_method: Option<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            window_hours: 24,
            cooldown_minutes: 5,
            default_payment_method: None,
        }
    }
}

impl RetryPolicy {
    pub fn window(&self) -> Duration {
        Duration::hours(self.window_hours)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::minutes(self.cooldown_minutes)
    }
}

/// How long each step's stored result stays usable across retries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidityPolicy {
    /// Inventory reservation TTL (result is VALID within this).
    pub inventory_ttl_secs: i64,
    /// Inventory result is REFRESHABLE up to this long after completion.
    pub inventory_refresh_window_secs: i64,
    /// Payment authorization TTL.
    pub payment_ttl_secs: i64,
    /// Shipping arrangement TTL.
    pub shipping_ttl_secs: i64,
}

impl Default for ValidityPolicy {
    fn default() -> Self {
        Self {
            inventory_ttl_secs: 3_600,
            inventory_refresh_window_secs: 86_400,
            payment_ttl_secs: 86_400,
            shipping_ttl_secs: 14_400,
        }
    }
}

impl ValidityPolicy {
    pub fn inventory_ttl(&self) -> Duration {
        Duration::seconds(self.inventory_ttl_secs)
    }

    pub fn inventory_refresh_window(&self) -> Duration {
        Duration::seconds(self.inventory_refresh_window_secs)
    }

    pub fn payment_ttl(&self) -> Duration {
        Duration::seconds(self.payment_ttl_secs)
    }

    pub fn shipping_ttl(&self) -> Duration {
        Duration::seconds(self.shipping_ttl_secs)
    }
}

/// Progress bus sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Per-subscriber bounded buffer; overflow drops oldest and surfaces
    /// a DROPPED marker.
    pub buffer_size: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { buffer_size: 64 }
    }
}

/// Deadlines applied around step execution.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StepTimeouts {
    /// Per remote call, enforced inside the collaborator client.
    pub call_timeout_secs: u64,
    /// Per step total, enforced by the executor; covers client retries.
    pub total_timeout_secs: u64,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            total_timeout_secs: 120,
        }
    }
}

impl StepTimeouts {
    pub fn call_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.call_timeout_secs)
    }

    pub fn total_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.total_timeout_secs)
    }
}

/// Base URLs for the three remote collaborators.
#[derive(Debug, Clone, Deserialize)]
pub struct CollaboratorEndpoints {
    pub inventory_url: String,
    pub payment_url: String,
    pub shipping_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SagaConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.window_hours, 24);
        assert_eq!(config.retry.cooldown_minutes, 5);
        assert_eq!(config.validity.inventory_ttl_secs, 3_600);
        assert_eq!(config.validity.payment_ttl_secs, 86_400);
        assert_eq!(config.validity.shipping_ttl_secs, 14_400);
        assert_eq!(config.progress.buffer_size, 64);
        assert_eq!(config.step.call_timeout_secs, 30);
        assert_eq!(config.step.total_timeout_secs, 120);
        assert_eq!(
            config.non_retryable_tokens,
            vec!["FRAUD", "SUSPENDED", "CANCELLED"]
        );
    }

    #[test]
    fn test_duration_accessors() {
        let config = SagaConfig::default();
        assert_eq!(config.retry.window(), Duration::hours(24));
        assert_eq!(config.retry.cooldown(), Duration::minutes(5));
        assert_eq!(config.validity.inventory_ttl(), Duration::hours(1));
        assert_eq!(config.step.call_timeout(), StdDuration::from_secs(30));
    }
}
