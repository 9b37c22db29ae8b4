use crate::error::{Error, ErrorDetails};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Top-level runtime configuration, loaded from TOML at startup. Any
/// validation failure is fatal before a single request is served.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Minimum wait between a user's accepted requests, in seconds
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Images a single user may generate per UTC calendar day
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,

    /// Images all users together may generate per UTC calendar month
    pub global_monthly_limit: u64,

    /// How often the retention sweep runs, in hours
    #[serde(default = "default_sweep_interval_hours")]
    pub sweep_interval_hours: u64,

    /// Whether the retention sweep runs at all
    #[serde(default = "default_sweep_enabled")]
    pub sweep_enabled: bool,

    /// Stored prompt excerpts are truncated to this many characters
    #[serde(default = "default_prompt_excerpt_len")]
    pub prompt_excerpt_len: usize,

    /// Whether a request that fails after admission gives the user their
    /// cooldown back. The inherited behavior consumes it regardless.
    #[serde(default)]
    pub refund_cooldown_on_failure: bool,

    pub provider: ProviderConfig,
}

/// Remote image-generation provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub base_url: Url,
    pub api_key: SecretString,
    #[serde(default = "default_provider_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_cooldown_seconds() -> u64 {
    45
}

fn default_daily_limit() -> u64 {
    25
}

fn default_sweep_interval_hours() -> u64 {
    24
}

fn default_sweep_enabled() -> bool {
    true
}

fn default_prompt_excerpt_len() -> usize {
    80
}

fn default_provider_timeout_seconds() -> u64 {
    60
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file {}: {e}", path.display()),
            })
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file {}: {e}", path.display()),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.cooldown_seconds == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "cooldown_seconds must be greater than zero".to_string(),
            }));
        }
        if self.daily_limit == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "daily_limit must be greater than zero".to_string(),
            }));
        }
        // A global limit of zero is legal: it closes the system for the month.
        if self.sweep_interval_hours == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "sweep_interval_hours must be greater than zero".to_string(),
            }));
        }
        if self.prompt_excerpt_len == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "prompt_excerpt_len must be greater than zero".to_string(),
            }));
        }
        if self.provider.timeout_seconds == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "provider.timeout_seconds must be greater than zero".to_string(),
            }));
        }
        if self.provider.api_key.expose_secret().is_empty() {
            return Err(Error::new(ErrorDetails::Config {
                message: "provider.api_key must not be empty".to_string(),
            }));
        }
        Ok(())
    }

    pub fn cooldown_window(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_hours * 3600)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorDetails;
    use std::io::Write;

    fn base_toml() -> &'static str {
        r#"
            global_monthly_limit = 1000

            [provider]
            base_url = "https://api.example.com/models/flux"
            api_key = "hf_test_key"
        "#
    }

    #[test]
    fn test_defaults_applied() {
        let config: Config = toml::from_str(base_toml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.cooldown_seconds, 45);
        assert_eq!(config.daily_limit, 25);
        assert_eq!(config.global_monthly_limit, 1000);
        assert_eq!(config.sweep_interval_hours, 24);
        assert!(config.sweep_enabled);
        assert_eq!(config.prompt_excerpt_len, 80);
        assert!(!config.refund_cooldown_on_failure);
        assert_eq!(config.provider.timeout_seconds, 60);
    }

    #[test]
    fn test_missing_global_limit_is_fatal() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [provider]
            base_url = "https://api.example.com"
            api_key = "k"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_cooldown_rejected() {
        let mut config: Config = toml::from_str(base_toml()).unwrap();
        config.cooldown_seconds = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::Config { .. }));
    }

    #[test]
    fn test_zero_excerpt_len_rejected() {
        let mut config: Config = toml::from_str(base_toml()).unwrap();
        config.prompt_excerpt_len = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::Config { .. }));
    }

    #[test]
    fn test_empty_api_key_rejected() {
        let config: Config = toml::from_str(
            r#"
            global_monthly_limit = 10

            [provider]
            base_url = "https://api.example.com"
            api_key = ""
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::Config { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", base_toml()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.daily_limit, 25);
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = Config::load("/nonexistent/artbot.toml").unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::Config { .. }));
    }
}
