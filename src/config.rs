use serde::{Deserialize, Serialize};

use crate::error::{LedgerLinkError, Result};
use crate::identity::Confidence;
use crate::retry::RetryPolicy;
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};

/// Main configuration for ledgerlink.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

/// Identity matching behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MatchingConfig {
    /// Lowest strategy confidence that may create a customer link without an operator.
    ///
    /// Matches below this level are reported as unresolved with the candidate
    /// attached so an operator can confirm it through a manual match.
    #[serde(default = "default_min_auto_link_confidence")]
    pub min_auto_link_confidence: Confidence,
    /// How many references a batch match resolves at the same time.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerConfig {
    /// Applied-event records older than this are eligible for cleanup.
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval_seconds")]
    pub interval_seconds: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_auto_link_confidence: default_min_auto_link_confidence(),
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            event_retention_days: default_event_retention_days(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

fn default_min_auto_link_confidence() -> Confidence {
    Confidence::Low
}

fn default_batch_concurrency() -> usize {
    4
}

fn default_event_retention_days() -> u32 {
    90
}

fn default_sweep_interval_seconds() -> u64 {
    300
}

/// Builder for [`Config`] with environment variable support.
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn with_min_auto_link_confidence(mut self, confidence: Confidence) -> Self {
        self.config.matching.min_auto_link_confidence = confidence;
        self
    }

    pub fn with_batch_concurrency(mut self, concurrency: usize) -> Self {
        self.config.matching.batch_concurrency = concurrency;
        self
    }

    pub fn with_sweep_interval(mut self, seconds: u64) -> Self {
        self.config.sweeper.interval_seconds = seconds;
        self
    }

    pub fn with_event_retention_days(mut self, days: u32) -> Self {
        self.config.ledger.event_retention_days = days;
        self
    }

    /// Load configuration from environment variables with the `LEDGERLINK_` prefix.
    pub fn from_env(mut self) -> Self {
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        if let Some(max_retries) = parse_env_with_prefix("RETRY_MAX_RETRIES") {
            self.config.retry.max_retries = max_retries;
        }
        if let Some(base) = parse_env_with_prefix("RETRY_BASE_DELAY_MS") {
            self.config.retry.base_delay_ms = base;
        }
        if let Some(max) = parse_env_with_prefix("RETRY_MAX_DELAY_MS") {
            self.config.retry.max_delay_ms = max;
        }
        if let Some(timeout) = parse_env_with_prefix("RETRY_TIMEOUT_SECONDS") {
            self.config.retry.timeout_seconds = timeout;
        }

        if let Some(confidence) = parse_env_with_prefix("MATCH_MIN_CONFIDENCE") {
            self.config.matching.min_auto_link_confidence = confidence;
        }
        if let Some(concurrency) = parse_env_with_prefix("MATCH_BATCH_CONCURRENCY") {
            self.config.matching.batch_concurrency = concurrency;
        }

        if let Some(interval) = parse_env_with_prefix("SWEEP_INTERVAL_SECONDS") {
            self.config.sweeper.interval_seconds = interval;
        }
        if let Some(days) = parse_env_with_prefix("EVENT_RETENTION_DAYS") {
            self.config.ledger.event_retention_days = days;
        }

        self
    }

    /// Build the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown log level, a zero batch
    /// concurrency, a zero sweep interval, or a retry policy whose base delay
    /// exceeds its cap.
    pub fn build(self) -> Result<Config> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(LedgerLinkError::validation(
                "logging.level",
                format!(
                    "{} is not one of: {}",
                    self.config.logging.level,
                    valid_log_levels.join(", ")
                ),
            ));
        }

        if self.config.matching.batch_concurrency == 0 {
            return Err(LedgerLinkError::validation(
                "matching.batch_concurrency",
                "must be greater than 0",
            ));
        }

        if self.config.sweeper.interval_seconds == 0 {
            return Err(LedgerLinkError::validation(
                "sweeper.interval_seconds",
                "must be greater than 0",
            ));
        }

        if self.config.retry.base_delay_ms > self.config.retry.max_delay_ms {
            return Err(LedgerLinkError::validation(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }

        if self.config.retry.timeout_seconds == 0 {
            return Err(LedgerLinkError::validation(
                "retry.timeout_seconds",
                "must be greater than 0",
            ));
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.matching.min_auto_link_confidence, Confidence::Low);
        assert_eq!(config.matching.batch_concurrency, 4);
        assert_eq!(config.sweeper.interval_seconds, 300);
        assert_eq!(config.ledger.event_retention_days, 90);
    }

    #[test]
    fn test_from_env() {
        unsafe {
            std::env::set_var("LEDGERLINK_MATCH_MIN_CONFIDENCE", "medium");
            std::env::set_var("LEDGERLINK_RETRY_MAX_RETRIES", "5");
            std::env::set_var("LEDGERLINK_SWEEP_INTERVAL_SECONDS", "60");
        }

        let config = ConfigBuilder::new().from_env().build().unwrap();
        assert_eq!(config.matching.min_auto_link_confidence, Confidence::Medium);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.sweeper.interval_seconds, 60);

        unsafe {
            std::env::remove_var("LEDGERLINK_MATCH_MIN_CONFIDENCE");
            std::env::remove_var("LEDGERLINK_RETRY_MAX_RETRIES");
            std::env::remove_var("LEDGERLINK_SWEEP_INTERVAL_SECONDS");
        }
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let err = ConfigBuilder::new().with_log_level("loud").build().unwrap_err();
        assert_eq!(err.code(), "validation_error");

        assert!(ConfigBuilder::new().with_batch_concurrency(0).build().is_err());
        assert!(ConfigBuilder::new().with_sweep_interval(0).build().is_err());

        let retry = RetryPolicy {
            base_delay_ms: 10_000,
            max_delay_ms: 100,
            ..RetryPolicy::default()
        };
        assert!(ConfigBuilder::new().with_retry(retry).build().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: Config =
            serde_json::from_str(r#"{"matching": {"min_auto_link_confidence": "high"}}"#).unwrap();
        assert_eq!(config.matching.min_auto_link_confidence, Confidence::High);
        assert_eq!(config.matching.batch_concurrency, 4);
        assert_eq!(config.retry.base_delay_ms, 500);
    }
}
