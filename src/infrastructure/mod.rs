//! Infrastructure layer module
//!
//! This module contains the ambient infrastructure around the engine:
//! - Configuration management (figment, YAML + environment)
//! - Logging infrastructure (tracing-subscriber, rolling files)

pub mod config;
pub mod logging;
