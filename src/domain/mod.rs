//! Domain layer for the taskherd orchestration engine
//!
//! This module contains the task model, backend-facing types and the
//! port traits the services are written against.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
