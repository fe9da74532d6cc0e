use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Directory holding project configuration, relative to the working directory
pub const CONFIG_DIR: &str = ".taskherd";

/// Prefix for environment overrides, e.g. `TASKHERD_BACKGROUND__POLL_INTERVAL_MS`
pub const ENV_PREFIX: &str = "TASKHERD_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid poll_interval_ms: {0}. Must be at least 1")]
    InvalidPollInterval(u64),

    #[error("Invalid stability_polls: {0}. Must be at least 1")]
    InvalidStabilityPolls(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Concurrency limit configured for an empty {0} key")]
    EmptyConcurrencyKey(&'static str),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .taskherd/config.yaml (project config)
    /// 3. .taskherd/local.yaml (project local overrides, optional)
    /// 4. Environment variables (TASKHERD_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        Self::load_from_dir(Path::new(CONFIG_DIR))
    }

    /// Same as [`ConfigLoader::load`] with the config directory at `dir`
    pub fn load_from_dir(dir: &Path) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let background = &config.background;
        if background.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval(background.poll_interval_ms));
        }
        if background.stability_polls == 0 {
            return Err(ConfigError::InvalidStabilityPolls(background.stability_polls));
        }
        if background.provider_concurrency.keys().any(|key| key.trim().is_empty()) {
            return Err(ConfigError::EmptyConcurrencyKey("provider"));
        }
        if background.model_concurrency.keys().any(|key| key.trim().is_empty()) {
            return Err(ConfigError::EmptyConcurrencyKey("model"));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.background.stale_timeout_ms, 180_000);
        assert_eq!(config.background.min_idle_time_ms, 5_000);
        assert_eq!(config.background.poll_interval_ms, 3_000);
        assert_eq!(config.background.stability_polls, 3);
        assert_eq!(config.logging.level, "info");
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
background:
  default_concurrency: 3
  provider_concurrency:
    anthropic: 2
  model_concurrency:
    anthropic/claude-opus: 1
  stale_timeout_ms: 60000
logging:
  level: debug
  format: json
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.background.default_concurrency, Some(3));
        assert_eq!(config.background.provider_concurrency.get("anthropic"), Some(&2));
        assert_eq!(
            config.background.model_concurrency.get("anthropic/claude-opus"),
            Some(&1)
        );
        assert_eq!(config.background.stale_timeout_ms, 60_000);
        assert_eq!(config.background.poll_interval_ms, 3_000, "unset fields keep defaults");
        assert_eq!(config.logging.format, "json");

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_zero_poll_interval() {
        let mut config = Config::default();
        config.background.poll_interval_ms = 0;

        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidPollInterval(0))
        ));
    }

    #[test]
    fn test_validate_zero_stability_polls() {
        let mut config = Config::default();
        config.background.stability_polls = 0;

        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidStabilityPolls(0))
        ));
    }

    #[test]
    fn test_validate_empty_concurrency_key() {
        let mut config = Config::default();
        config.background.provider_concurrency.insert(String::new(), 2);

        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::EmptyConcurrencyKey("provider"))
        ));
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();

        match ConfigLoader::validate(&config) {
            Err(ConfigError::InvalidLogLevel(level)) => assert_eq!(level, "invalid"),
            other => panic!("Expected InvalidLogLevel error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();

        match ConfigLoader::validate(&config) {
            Err(ConfigError::InvalidLogFormat(format)) => assert_eq!(format, "xml"),
            other => panic!("Expected InvalidLogFormat error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "background:\n  min_idle_time_ms: 250\n  pending_ttl_ms: 1000").unwrap();
        file.flush().unwrap();

        let config = ConfigLoader::load_from_file(file.path()).unwrap();
        assert_eq!(config.background.min_idle_time_ms, 250);
        assert_eq!(config.background.pending_ttl_ms, 1000);
        assert_eq!(config.background.running_ttl_ms, 30 * 60 * 1000);
    }

    #[test]
    fn test_load_from_file_rejects_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "background:\n  poll_interval_ms: 0").unwrap();
        file.flush().unwrap();

        assert!(ConfigLoader::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_hierarchical_merging_with_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "background:\n  default_concurrency: 4\n  poll_interval_ms: 1000\n\
             logging:\n  format: json\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("local.yaml"),
            "background:\n  poll_interval_ms: 500\n",
        )
        .unwrap();

        temp_env::with_vars(
            [
                ("TASKHERD_BACKGROUND__DEFAULT_CONCURRENCY", Some("8")),
                ("TASKHERD_LOGGING__LEVEL", Some("debug")),
            ],
            || {
                let config = ConfigLoader::load_from_dir(dir.path()).unwrap();
                assert_eq!(config.background.default_concurrency, Some(8), "env should win");
                assert_eq!(config.background.poll_interval_ms, 500, "local.yaml should win");
                assert_eq!(config.logging.format, "json", "base value should persist");
                assert_eq!(config.logging.level, "debug");
            },
        );
    }

    #[test]
    fn test_missing_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        temp_env::with_vars_unset(["TASKHERD_LOGGING__LEVEL"], || {
            let config = ConfigLoader::load_from_dir(dir.path()).unwrap();
            assert_eq!(config.background.stale_timeout_ms, 180_000);
            assert_eq!(config.logging.level, "info");
        });
    }
}
