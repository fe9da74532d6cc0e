//! taskherd - background task orchestration engine
//!
//! taskherd runs long-lived units of work ("background tasks") in execution
//! contexts provided by an external backend, on behalf of a parent session.
//! It enforces per-key concurrency limits, detects completion from idle
//! events, polling and staleness, and reports results back to the parent in
//! a strictly ordered way.
//!
//! # Architecture
//!
//! This crate follows Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): task model, backend-facing types and ports
//! - **Service Layer** (`services`): the orchestration engine
//! - **Adapters** (`adapters`): port implementations, including the mock backend
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use taskherd::adapters::backends::MockBackend;
//! use taskherd::{BackgroundManager, BackgroundTaskConfig, LaunchInput};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = BackgroundManager::new(
//!         BackgroundTaskConfig::default(),
//!         Arc::new(MockBackend::new()),
//!     );
//!     let task = manager
//!         .launch(LaunchInput::new("explore", "ses_parent", "Map the repository"))
//!         .await?;
//!     println!("queued {}", task.id);
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    BackendEvent, BackgroundTaskConfig, CancelOptions, Config, LaunchInput, LoggingConfig,
    ModelRef, Notice, ResumeInput, Task, TaskId, TaskStatus, TrackInput,
};
pub use domain::ports::{ContextHook, ExecutionBackend, NoticeSink};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{BackgroundManager, ConcurrencyGate, ConcurrencyLimit};
