use std::env;

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::{MetricsError, MetricsResult};

/// Set to `test` to silence advisory console reports.
pub const ENV_VAR: &str = "TALLY_ENV";

const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_FREQUENCY_SECS: u64 = 20 * 60 * 60;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_frequency_secs")]
    pub default_frequency_secs: u64,
    #[serde(default)]
    pub advisories: Option<bool>,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_frequency_secs() -> u64 {
    DEFAULT_FREQUENCY_SECS
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            default_frequency_secs: DEFAULT_FREQUENCY_SECS,
            advisories: None,
        }
    }
}

impl MetricsConfig {
    pub fn quiet() -> Self {
        Self {
            advisories: Some(false),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn validate(&self) -> MetricsResult<()> {
        if self.batch_size == 0 {
            return Err(MetricsError::invalid("batch_size must be positive"));
        }
        if i64::try_from(self.default_frequency_secs).is_err() {
            return Err(MetricsError::invalid("default_frequency_secs out of range"));
        }
        Ok(())
    }

    pub fn default_frequency(&self) -> Duration {
        Duration::seconds(i64::try_from(self.default_frequency_secs).unwrap_or(i64::MAX))
    }

    /// Explicit setting wins; otherwise advisories are on outside test runs.
    pub fn advisories_enabled(&self) -> bool {
        match self.advisories {
            Some(flag) => flag,
            None => !running_under_test(),
        }
    }
}

pub fn running_under_test() -> bool {
    env::var(ENV_VAR).is_ok_and(|value| value.eq_ignore_ascii_case("test"))
}

#[cfg(test)]
mod tests {
    use super::MetricsConfig;
    use serde_json::json;
    use time::Duration;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: MetricsConfig = serde_json::from_value(json!({})).expect("config");
        assert_eq!(config, MetricsConfig::default());
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.default_frequency(), Duration::hours(20));
    }

    #[test]
    fn explicit_advisory_flag_wins() {
        assert!(!MetricsConfig::quiet().advisories_enabled());
        let loud = MetricsConfig {
            advisories: Some(true),
            ..MetricsConfig::default()
        };
        assert!(loud.advisories_enabled());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = MetricsConfig::default().with_batch_size(0);
        assert!(config.validate().is_err());
        assert!(MetricsConfig::default().validate().is_ok());
    }
}
