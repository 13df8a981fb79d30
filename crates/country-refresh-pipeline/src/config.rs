use std::path::PathBuf;
use std::time::Duration;

use country_refresh_sources::{DEFAULT_COUNTRIES_URL, DEFAULT_RATES_URL};
use serde::Serialize;

/// Environment variables behind the matching `cr` flags; also the keys in
/// [`ConfigError`].
pub const ENV_COUNTRIES_URL: &str = "COUNTRY_REFRESH_COUNTRIES_URL";
pub const ENV_RATES_URL: &str = "COUNTRY_REFRESH_RATES_URL";
pub const ENV_FETCH_BUDGET_MS: &str = "COUNTRY_REFRESH_FETCH_BUDGET_MS";
pub const ENV_ARTIFACT_PATH: &str = "COUNTRY_REFRESH_ARTIFACT_PATH";

pub const DEFAULT_FETCH_BUDGET_MS: u64 = 30_000;
pub const DEFAULT_ARTIFACT_PATH: &str = "cache/summary.svg";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must not be empty")]
    Empty { key: &'static str },
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RefreshConfig {
    pub countries_url: String,
    pub rates_url: String,
    pub fetch_budget_ms: u64,
    pub artifact_path: PathBuf,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            countries_url: DEFAULT_COUNTRIES_URL.to_string(),
            rates_url: DEFAULT_RATES_URL.to_string(),
            fetch_budget_ms: DEFAULT_FETCH_BUDGET_MS,
            artifact_path: PathBuf::from(DEFAULT_ARTIFACT_PATH),
        }
    }
}

impl RefreshConfig {
    /// # Errors
    /// Returns [`ConfigError`] for empty or non-HTTP URLs, a zero budget, or an
    /// empty artifact path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url(ENV_COUNTRIES_URL, &self.countries_url)?;
        validate_url(ENV_RATES_URL, &self.rates_url)?;
        if self.fetch_budget_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_FETCH_BUDGET_MS,
                value: "0".to_string(),
                reason: "budget must be positive".to_string(),
            });
        }
        if self.artifact_path.as_os_str().is_empty() {
            return Err(ConfigError::Empty {
                key: ENV_ARTIFACT_PATH,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn fetch_budget(&self) -> Duration {
        Duration::from_millis(self.fetch_budget_ms)
    }
}

fn validate_url(key: &'static str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Empty { key });
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected an http:// or https:// URL".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RefreshConfig {
        RefreshConfig {
            countries_url: "http://127.0.0.1:9000/countries".to_string(),
            rates_url: "https://127.0.0.1:9000/rates".to_string(),
            fetch_budget_ms: 1_500,
            artifact_path: PathBuf::from("/tmp/out/summary.svg"),
        }
    }

    #[test]
    fn defaults_are_valid() {
        let defaults = RefreshConfig::default();
        assert_eq!(defaults.validate(), Ok(()));
        assert_eq!(defaults.fetch_budget(), Duration::from_secs(30));
        assert_eq!(defaults.artifact_path, PathBuf::from("cache/summary.svg"));
    }

    #[test]
    fn explicit_values_pass_validation() {
        let config = config();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.fetch_budget(), Duration::from_millis(1_500));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let zero_budget = RefreshConfig {
            fetch_budget_ms: 0,
            ..config()
        };
        assert!(matches!(
            zero_budget.validate(),
            Err(ConfigError::InvalidValue {
                key: ENV_FETCH_BUDGET_MS,
                ..
            })
        ));

        let bad_url = RefreshConfig {
            rates_url: "ftp://rates".to_string(),
            ..config()
        };
        assert!(matches!(
            bad_url.validate(),
            Err(ConfigError::InvalidValue {
                key: ENV_RATES_URL,
                ..
            })
        ));

        let empty_url = RefreshConfig {
            countries_url: "  ".to_string(),
            ..config()
        };
        assert_eq!(
            empty_url.validate(),
            Err(ConfigError::Empty {
                key: ENV_COUNTRIES_URL
            })
        );

        let empty_path = RefreshConfig {
            artifact_path: PathBuf::new(),
            ..config()
        };
        assert_eq!(
            empty_path.validate(),
            Err(ConfigError::Empty {
                key: ENV_ARTIFACT_PATH
            })
        );
    }
}
