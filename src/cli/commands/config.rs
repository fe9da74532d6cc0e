//! Configuration CLI commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use super::load_config;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;
use crate::infrastructure::config::loader::CONFIG_DIR;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show {
        /// Read this file instead of the project configuration
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Check that the configuration loads and passes validation
    Validate {
        /// Read this file instead of the project configuration
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Debug, serde::Serialize)]
pub struct ConfigShowOutput {
    pub source: String,
    pub config: Config,
}

impl CommandOutput for ConfigShowOutput {
    fn to_human(&self) -> String {
        let body = serde_yaml::to_string(&self.config)
            .unwrap_or_else(|err| format!("<failed to render configuration: {err}>"));
        format!("# source: {}\n{body}", self.source)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[derive(Debug, serde::Serialize)]
pub struct ConfigValidateOutput {
    pub source: String,
    pub valid: bool,
    pub default_concurrency: Option<usize>,
    pub provider_limits: usize,
    pub model_limits: usize,
}

impl CommandOutput for ConfigValidateOutput {
    fn to_human(&self) -> String {
        let default = self
            .default_concurrency
            .map_or_else(|| "fallback".to_string(), |limit| limit.to_string());
        format!(
            "Configuration from {} is valid.\n  \
             Default concurrency: {}\n  \
             Provider limits: {}\n  \
             Model limits: {}",
            self.source, default, self.provider_limits, self.model_limits
        )
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn execute(args: ConfigArgs, json: bool) -> Result<()> {
    match args.command {
        ConfigCommands::Show { file } => {
            let source = describe_source(file.as_ref());
            let config = load_config(file.as_deref()).context("Failed to load configuration")?;
            output(&ConfigShowOutput { source, config }, json);
        }
        ConfigCommands::Validate { file } => {
            let source = describe_source(file.as_ref());
            let config =
                load_config(file.as_deref()).context("Configuration is invalid")?;
            output(
                &ConfigValidateOutput {
                    source,
                    valid: true,
                    default_concurrency: config.background.default_concurrency,
                    provider_limits: config.background.provider_concurrency.len(),
                    model_limits: config.background.model_concurrency.len(),
                },
                json,
            );
        }
    }
    Ok(())
}

fn describe_source(file: Option<&PathBuf>) -> String {
    file.map_or_else(
        || format!("{CONFIG_DIR}/ + environment"),
        |path| path.display().to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_output_human() {
        let out = ConfigValidateOutput {
            source: "custom.yaml".to_string(),
            valid: true,
            default_concurrency: None,
            provider_limits: 1,
            model_limits: 0,
        };
        let text = out.to_human();
        assert!(text.contains("custom.yaml is valid"));
        assert!(text.contains("Default concurrency: fallback"));
    }

    #[test]
    fn test_show_output_renders_yaml() {
        let out = ConfigShowOutput {
            source: "defaults".to_string(),
            config: Config::default(),
        };
        let text = out.to_human();
        assert!(text.starts_with("# source: defaults"));
        assert!(text.contains("stale_timeout_ms: 180000"));
        assert_eq!(out.to_json()["config"]["background"]["poll_interval_ms"], 3000);
    }
}
