//! Environment-backed runtime configuration for `puppet-smoke`.

use std::{env, error::Error, fmt, time::Duration};

use puppet_core::{BackendKind, PuppetOptions, RetryPolicy};
use puppet_loopback::SELF_NAME_PARAM;

const DEFAULT_NAME: &str = "puppet-smoke";
const DEFAULT_RUN_SECS: u64 = 10;
const DEFAULT_START_ATTEMPTS: u32 = 3;

/// Runtime configuration used by the smoke binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// Backend variant driven by the session.
    pub backend: BackendKind,
    /// Session name used in logs.
    pub name: String,
    /// Optional override of the backend's watchdog timeout.
    pub watchdog_timeout_secs: Option<u64>,
    /// How long the session stays up before the scripted shutdown.
    pub run_for: Duration,
    /// Attempts allowed for `start()` when the backend reports transport failures.
    pub start_attempts: u32,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let backend = match optional_trimmed_env("PUPPET_BACKEND", &mut lookup) {
            Some(value) => value
                .parse::<BackendKind>()
                .map_err(|reason| ConfigError::InvalidValue {
                    key: "PUPPET_BACKEND",
                    value,
                    reason,
                })?,
            None => BackendKind::default(),
        };
        let name = optional_trimmed_env("PUPPET_NAME", &mut lookup)
            .unwrap_or_else(|| DEFAULT_NAME.to_owned());
        let watchdog_timeout_secs =
            parse_optional_u64("PUPPET_WATCHDOG_TIMEOUT_SECS", &mut lookup)?;
        let run_secs =
            parse_optional_u64("PUPPET_RUN_SECS", &mut lookup)?.unwrap_or(DEFAULT_RUN_SECS);
        let start_attempts = parse_optional_u32("PUPPET_START_ATTEMPTS", &mut lookup)?
            .unwrap_or(DEFAULT_START_ATTEMPTS);

        if watchdog_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "PUPPET_WATCHDOG_TIMEOUT_SECS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if start_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PUPPET_START_ATTEMPTS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            backend,
            name,
            watchdog_timeout_secs,
            run_for: Duration::from_secs(run_secs),
            start_attempts,
        })
    }

    /// Session options derived from this configuration. The loopback backend
    /// logs in under the session name.
    pub fn puppet_options(&self) -> PuppetOptions {
        let mut options = PuppetOptions::new(self.name.clone(), self.backend);
        if self.backend == BackendKind::Loopback {
            options = options.with_param(SELF_NAME_PARAM, self.name.clone());
        }
        match self.watchdog_timeout_secs {
            Some(secs) => options.with_watchdog_timeout_secs(secs),
            None => options,
        }
    }

    /// Backoff used around `start()`.
    pub fn start_retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy::new(
            defaults.base_delay_ms(),
            defaults.max_delay_ms(),
            self.start_attempts,
        )
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u32<F>(key: &'static str, lookup: &mut F) -> Result<Option<u32>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_to_mock_backend() {
        let cfg = config_from_pairs(&[]).expect("empty config should parse");
        assert_eq!(cfg.backend, BackendKind::Mock);
        assert_eq!(cfg.name, DEFAULT_NAME);
        assert_eq!(cfg.watchdog_timeout_secs, None);
        assert_eq!(cfg.run_for, Duration::from_secs(DEFAULT_RUN_SECS));
        assert_eq!(cfg.start_attempts, DEFAULT_START_ATTEMPTS);
    }

    #[test]
    fn parses_backend_and_overrides() {
        let cfg = config_from_pairs(&[
            ("PUPPET_BACKEND", " Loopback "),
            ("PUPPET_NAME", "bot"),
            ("PUPPET_WATCHDOG_TIMEOUT_SECS", "30"),
            ("PUPPET_RUN_SECS", "2"),
            ("PUPPET_START_ATTEMPTS", "5"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.backend, BackendKind::Loopback);
        assert_eq!(cfg.name, "bot");
        assert_eq!(cfg.run_for, Duration::from_secs(2));
        assert_eq!(cfg.start_retry_policy().max_attempts(), 5);

        let options = cfg.puppet_options();
        assert_eq!(options.watchdog_timeout_secs, Some(30));
        assert_eq!(options.backend, BackendKind::Loopback);
        assert_eq!(
            options.params.get(SELF_NAME_PARAM).map(String::as_str),
            Some("bot")
        );
    }

    #[test]
    fn mock_options_carry_no_params() {
        let cfg = config_from_pairs(&[("PUPPET_NAME", "bot")]).expect("config should parse");
        assert!(cfg.puppet_options().params.is_empty());
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let cfg = config_from_pairs(&[("PUPPET_NAME", "   "), ("PUPPET_RUN_SECS", "")])
            .expect("blank values should parse");
        assert_eq!(cfg.name, DEFAULT_NAME);
        assert_eq!(cfg.run_for, Duration::from_secs(DEFAULT_RUN_SECS));
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = config_from_pairs(&[("PUPPET_BACKEND", "matrix")])
            .expect_err("unknown backend should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "PUPPET_BACKEND",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_start_attempts() {
        let err = config_from_pairs(&[("PUPPET_START_ATTEMPTS", "0")])
            .expect_err("zero attempts should fail");
        assert_eq!(
            err.to_string(),
            "invalid PUPPET_START_ATTEMPTS='0': must be at least 1"
        );
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("PUPPET_WATCHDOG_TIMEOUT_SECS", "soon")])
            .expect_err("invalid timeout should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "PUPPET_WATCHDOG_TIMEOUT_SECS",
                ..
            }
        ));
    }
}
