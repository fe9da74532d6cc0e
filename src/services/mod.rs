//! Orchestration services.

pub mod background_manager;
pub mod concurrency_gate;
pub mod keyed_queue;
pub mod notification_serializer;
pub mod task_registry;

pub use background_manager::{BackgroundManager, BackgroundManagerBuilder};
pub use concurrency_gate::{ConcurrencyGate, ConcurrencyLimit};
pub use keyed_queue::{KeyedQueueProcessor, TaskSpawner};
pub use notification_serializer::NotificationSerializer;
pub use task_registry::{SharedRegistry, TaskRegistry, TimerKind};
