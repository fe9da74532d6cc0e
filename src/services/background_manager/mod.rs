//! Background Manager - the lifecycle controller for background tasks.
//!
//! The manager is one explicit instance that owns every piece of shared
//! state and composes the engine's subsystems:
//!
//! - **lifecycle**: launch, resume, cancel, external tracking, session
//!   deletion cascades, event ingress and shutdown
//! - **completion_detector**: idle-event, poll and stale sweeps racing on
//!   one idempotent terminal transition
//! - **notifications**: per-parent notice selection and delivery, and the
//!   retention purge that follows an aggregate notice
//!
//! Admission control, the task registry, per-key dispatch and per-parent
//! delivery ordering live in their own service modules.

mod completion_detector;
mod lifecycle;
mod notifications;

pub use lifecycle::describe_dispatch_failure;
pub use notifications::{aggregate_notice, individual_notice};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    BackendEvent, BackgroundTaskConfig, CancelOptions, LaunchInput, ResumeInput, Task, TaskId,
    TrackInput,
};
use crate::domain::ports::{ContextHook, ExecutionBackend, NoticeSink};
use crate::services::concurrency_gate::ConcurrencyGate;
use crate::services::keyed_queue::{KeyedQueueProcessor, TaskSpawner};
use crate::services::notification_serializer::NotificationSerializer;
use crate::services::task_registry::SharedRegistry;

/// Shared state behind a [`BackgroundManager`].
pub(crate) struct ManagerInner {
    pub(super) config: BackgroundTaskConfig,
    pub(super) backend: Arc<dyn ExecutionBackend>,
    pub(super) notice_sink: Option<Arc<dyn NoticeSink>>,
    pub(super) context_hook: Option<Arc<dyn ContextHook>>,
    pub(super) gate: Arc<ConcurrencyGate>,
    pub(super) registry: SharedRegistry,
    pub(super) queue: KeyedQueueProcessor,
    pub(super) notifier: NotificationSerializer,
    pub(super) sweeper: Mutex<Option<JoinHandle<()>>>,
    pub(super) shut_down: AtomicBool,
}

impl ManagerInner {
    pub(super) fn ensure_live(&self) -> DomainResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(DomainError::ShutDown)
        } else {
            Ok(())
        }
    }

    pub(super) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub(super) fn sweeper(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn spawner(self: &Arc<Self>) -> Arc<dyn TaskSpawner> {
        self.clone()
    }
}

/// Builder for a [`BackgroundManager`] with optional collaborators.
pub struct BackgroundManagerBuilder {
    config: BackgroundTaskConfig,
    backend: Arc<dyn ExecutionBackend>,
    notice_sink: Option<Arc<dyn NoticeSink>>,
    context_hook: Option<Arc<dyn ContextHook>>,
}

impl BackgroundManagerBuilder {
    /// Send toast-style notices to `sink`.
    pub fn notice_sink(mut self, sink: Arc<dyn NoticeSink>) -> Self {
        self.notice_sink = Some(sink);
        self
    }

    /// Run `hook` once for every execution context the manager creates.
    pub fn context_hook(mut self, hook: Arc<dyn ContextHook>) -> Self {
        self.context_hook = Some(hook);
        self
    }

    pub fn build(self) -> BackgroundManager {
        let gate = Arc::new(ConcurrencyGate::new(&self.config));
        let registry = SharedRegistry::new();
        let queue = KeyedQueueProcessor::new(gate.clone(), registry.clone());
        BackgroundManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                backend: self.backend,
                notice_sink: self.notice_sink,
                context_hook: self.context_hook,
                gate,
                registry,
                queue,
                notifier: NotificationSerializer::new(),
                sweeper: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }
}

/// Orchestrates background tasks against a shared execution backend.
///
/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct BackgroundManager {
    inner: Arc<ManagerInner>,
}

impl BackgroundManager {
    pub fn new(config: BackgroundTaskConfig, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self::builder(config, backend).build()
    }

    pub fn builder(
        config: BackgroundTaskConfig,
        backend: Arc<dyn ExecutionBackend>,
    ) -> BackgroundManagerBuilder {
        BackgroundManagerBuilder {
            config,
            backend,
            notice_sink: None,
            context_hook: None,
        }
    }

    /// Queue a new task. Returns as soon as the task is registered.
    pub async fn launch(&self, input: LaunchInput) -> DomainResult<Task> {
        self.inner.launch(input).await
    }

    /// Resume the task attached to `input.session_id`.
    pub async fn resume(&self, input: ResumeInput) -> DomainResult<Task> {
        self.inner.resume(input).await
    }

    /// Register a task whose execution context was created elsewhere.
    pub async fn track_external(&self, input: TrackInput) -> DomainResult<Task> {
        self.inner.track_external(input).await
    }

    /// Cancel a pending or running task. `Ok(false)` if it was already terminal.
    pub async fn cancel(&self, task_id: TaskId, options: CancelOptions) -> DomainResult<bool> {
        self.inner.cancel(task_id, options).await
    }

    /// Cancel and forget the task bound to `session_id` and all its descendants.
    pub async fn handle_session_deleted(&self, session_id: &str) -> Vec<TaskId> {
        self.inner.handle_session_deleted(session_id).await
    }

    /// Feed a decoded backend event into the engine.
    pub async fn handle_event(&self, event: BackendEvent) {
        self.inner.handle_event(event).await;
    }

    /// Tear everything down. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    pub fn get_task(&self, task_id: TaskId) -> Option<Task> {
        self.inner.registry.lock().get(task_id).cloned()
    }

    pub fn find_by_session(&self, session_id: &str) -> Option<Task> {
        self.inner.registry.lock().find_by_session(session_id).cloned()
    }

    /// Tasks launched directly from `parent_session_id`.
    pub fn get_tasks_by_parent_session(&self, parent_session_id: &str) -> Vec<Task> {
        self.inner
            .registry
            .lock()
            .children_of(parent_session_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Every task below `session_id` in the session tree.
    pub fn get_all_descendant_tasks(&self, session_id: &str) -> Vec<Task> {
        let registry = self.inner.registry.lock();
        registry
            .descendants_of(session_id)
            .into_iter()
            .filter_map(|id| registry.get(id).cloned())
            .collect()
    }

    pub fn running_tasks(&self) -> Vec<Task> {
        self.inner
            .registry
            .lock()
            .running_tasks()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Number of `parent_session_id`'s tasks still pending or running.
    pub fn pending_count(&self, parent_session_id: &str) -> usize {
        self.inner.registry.lock().pending_count(parent_session_id)
    }

    /// Finished tasks of `parent_session_id` whose aggregate notice is outstanding.
    pub fn pending_notifications(&self, parent_session_id: &str) -> Vec<Task> {
        self.inner
            .registry
            .lock()
            .pending_notifications(parent_session_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn clear_notifications(&self, parent_session_id: &str) {
        self.inner.registry.lock().clear_notifications(parent_session_id);
    }

    /// Wait for every notice queued so far for `parent_session_id`.
    pub async fn flush_notifications(&self, parent_session_id: &str) {
        self.inner.notifier.flush(parent_session_id).await;
    }

    /// The admission gate, for inspection.
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.inner.gate
    }

    pub fn config(&self) -> &BackgroundTaskConfig {
        &self.inner.config
    }

    /// Whether the poll/stale sweeps are currently scheduled.
    pub fn sweeps_active(&self) -> bool {
        self.inner
            .sweeper()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}
