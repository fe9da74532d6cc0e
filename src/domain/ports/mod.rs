//! Port trait definitions (Hexagonal Architecture)
//!
//! This module defines async trait interfaces that adapters must implement:
//! - ExecutionBackend: creates execution contexts and runs work in them
//! - NoticeSink: best-effort UI notices
//! - ContextHook: side effect run once per new execution context
//!
//! These traits keep the orchestration core independent of any particular
//! backend, UI or terminal multiplexer.

pub mod execution_backend;
pub mod notice_sink;

pub use execution_backend::ExecutionBackend;
pub use notice_sink::{ContextHook, NoticeSink};
