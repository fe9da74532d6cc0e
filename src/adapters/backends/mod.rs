//! Execution backend implementations.

pub mod mock;

pub use mock::{MockBackend, MockScript, RecordingContextHook, RecordingNoticeSink};
