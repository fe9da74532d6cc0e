//! CLI subcommands.

pub mod config;
pub mod simulate;

use anyhow::Result;
use std::path::Path;

use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;

/// Load configuration from `file` when given, else from the project hierarchy.
pub fn load_config(file: Option<&Path>) -> Result<Config> {
    match file {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}
