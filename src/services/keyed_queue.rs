//! Per-key FIFO dispatch.
//!
//! One drain loop per concurrency key, started lazily on enqueue and
//! retired as soon as its queue is empty. Each iteration waits for an
//! admission slot, then hands the head of the queue to a [`TaskSpawner`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{TaskId, TaskStatus};
use crate::services::concurrency_gate::ConcurrencyGate;
use crate::services::task_registry::SharedRegistry;

/// Starts a queued task once a slot is held for it.
#[async_trait]
pub trait TaskSpawner: Send + Sync {
    /// Move a pending task to running and begin its execution.
    ///
    /// On success the slot must be attributed to the task (its
    /// `concurrency_key` set). On failure the caller releases the slot
    /// only if the task never had it attributed.
    async fn start(self: Arc<Self>, task_id: TaskId, key: &str) -> DomainResult<()>;
}

pub struct KeyedQueueProcessor {
    gate: Arc<ConcurrencyGate>,
    registry: SharedRegistry,
}

impl KeyedQueueProcessor {
    pub fn new(gate: Arc<ConcurrencyGate>, registry: SharedRegistry) -> Self {
        Self { gate, registry }
    }

    /// Append a task to `key`'s queue and make sure a drain loop is running.
    pub fn enqueue(&self, key: &str, task_id: TaskId, spawner: Arc<dyn TaskSpawner>) {
        let start_loop = {
            let mut registry = self.registry.lock();
            registry.enqueue(key, task_id);
            registry.claim_processor(key)
        };
        if start_loop {
            self.spawn_drain(key, spawner);
        }
    }

    fn spawn_drain(&self, key: &str, spawner: Arc<dyn TaskSpawner>) {
        debug!(key = %key, "starting drain loop");
        let gate = self.gate.clone();
        let registry = self.registry.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            drain(gate, registry, key, spawner).await;
        });
    }
}

async fn drain(
    gate: Arc<ConcurrencyGate>,
    registry: SharedRegistry,
    key: String,
    spawner: Arc<dyn TaskSpawner>,
) {
    loop {
        let head = {
            let mut registry = registry.lock();
            match registry.queue_head(&key) {
                Some(head) => head,
                None => {
                    registry.retire_processor(&key);
                    break;
                }
            }
        };

        if let Err(err) = gate.acquire(&key).await {
            debug!(key = %key, error = %err, "admission cancelled, stopping drain loop");
            registry.lock().retire_processor(&key);
            break;
        }

        let still_pending = registry
            .lock()
            .get(head)
            .is_some_and(|task| task.status == TaskStatus::Pending);
        if !still_pending {
            debug!(key = %key, task_id = %head, "queued task no longer pending, returning slot");
            gate.release(&key);
            registry.lock().pop_head(&key, head);
            continue;
        }

        if let Err(err) = spawner.clone().start(head, &key).await {
            let attributed = registry
                .lock()
                .get(head)
                .is_some_and(|task| task.concurrency_key.is_some());
            if !attributed {
                gate.release(&key);
            }
            warn!(
                key = %key,
                task_id = %head,
                error = %err,
                slot_released = !attributed,
                "failed to start queued task"
            );
        }

        registry.lock().pop_head(&key, head);
    }
    debug!(key = %key, "drain loop retired");
}
