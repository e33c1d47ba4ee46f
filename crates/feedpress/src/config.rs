//! Runtime configuration for stage runners and external calls.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Knobs shared by the pipeline, stage runners and the publication orchestrator.
///
/// Every field has a default so a partial JSON/env configuration is valid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FeedpressConfig {
    /// Maximum items a stage runner picks up per batch.
    pub stage_batch_size: usize,
    /// Pause between two items of the same batch, in milliseconds.
    ///
    /// This is backpressure towards external rate limits. Zero disables it.
    pub inter_item_delay_ms: u64,
    /// `max_retries` stamped on new publications.
    pub publish_max_retries: u32,
    /// Timeout applied to each generation / image / publish call.
    pub external_call_timeout_secs: u64,
    /// Timeout applied to each event handler invocation. Zero disables it.
    pub handler_timeout_secs: u64,
}

impl Default for FeedpressConfig {
    fn default() -> Self {
        Self {
            stage_batch_size: 10,
            inter_item_delay_ms: 2_000,
            publish_max_retries: 3,
            external_call_timeout_secs: 120,
            handler_timeout_secs: 0,
        }
    }
}

impl FeedpressConfig {
    /// Load configuration from `FEEDPRESS_*` environment variables.
    ///
    /// Unset variables keep their defaults; set but unparsable ones are errors.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            stage_batch_size: env_or("FEEDPRESS_STAGE_BATCH_SIZE", defaults.stage_batch_size)?,
            inter_item_delay_ms: env_or(
                "FEEDPRESS_INTER_ITEM_DELAY_MS",
                defaults.inter_item_delay_ms,
            )?,
            publish_max_retries: env_or(
                "FEEDPRESS_PUBLISH_MAX_RETRIES",
                defaults.publish_max_retries,
            )?,
            external_call_timeout_secs: env_or(
                "FEEDPRESS_EXTERNAL_CALL_TIMEOUT_SECS",
                defaults.external_call_timeout_secs,
            )?,
            handler_timeout_secs: env_or(
                "FEEDPRESS_HANDLER_TIMEOUT_SECS",
                defaults.handler_timeout_secs,
            )?,
        })
    }

    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }

    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_secs(self.external_call_timeout_secs)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        (self.handler_timeout_secs > 0).then(|| Duration::from_secs(self.handler_timeout_secs))
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: FeedpressConfig =
            serde_json::from_str(r#"{"inter_item_delay_ms": 0, "publish_max_retries": 5}"#)
                .unwrap();

        assert_eq!(config.inter_item_delay(), Duration::ZERO);
        assert_eq!(config.publish_max_retries, 5);
        assert_eq!(config.stage_batch_size, 10);
        assert_eq!(config.handler_timeout(), None);
    }

    #[test]
    fn test_handler_timeout_enabled() {
        let config = FeedpressConfig {
            handler_timeout_secs: 5,
            ..FeedpressConfig::default()
        };
        assert_eq!(config.handler_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_env_or_rejects_garbage() {
        std::env::set_var("FEEDPRESS_TEST_GARBAGE", "twelve");
        let result: Result<u64> = env_or("FEEDPRESS_TEST_GARBAGE", 1);
        assert!(result.is_err());

        let result: Result<u64> = env_or("FEEDPRESS_TEST_UNSET_KEY", 7);
        assert_eq!(result.unwrap(), 7);
    }
}
