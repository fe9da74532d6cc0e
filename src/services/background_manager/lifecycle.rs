//! Task lifecycle: launch, start, resume, tracking, cancellation and teardown.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use super::ManagerInner;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    BackendEvent, CancelOptions, ContextRequest, CreatedContext, LaunchInput, Notice, PromptBody,
    ResumeInput, Task, TaskId, TaskStatus, TrackInput,
};
use crate::services::concurrency_gate::ConcurrencyLimit;
use crate::services::keyed_queue::TaskSpawner;
use crate::services::task_registry::TaskRegistry;

const DEFAULT_CANCEL_REASON: &str = "Cancelled by user";
const SESSION_DELETED_REASON: &str = "Parent session deleted";

/// Turn a dispatch error into the message recorded on an interrupted task.
///
/// Errors that point at an unknown agent get an actionable message naming it.
pub fn describe_dispatch_failure(agent: &str, err: &DomainError) -> String {
    let message = match err {
        DomainError::DispatchFailed { message } => message.clone(),
        other => other.to_string(),
    };
    let lower = message.to_lowercase();
    let unknown_agent = lower.contains("agent.name")
        || lower.contains("agent not found")
        || lower.contains("unknown agent")
        || lower.contains("undefined");
    if unknown_agent {
        format!(
            "Agent \"{agent}\" not found. Make sure the agent is registered in your configuration."
        )
    } else {
        message
    }
}

#[async_trait]
impl TaskSpawner for ManagerInner {
    async fn start(self: Arc<Self>, task_id: TaskId, key: &str) -> DomainResult<()> {
        self.start_task(task_id, key).await
    }
}

impl ManagerInner {
    #[instrument(
        skip(self, input),
        fields(agent = %input.agent, parent = %input.parent_session_id)
    )]
    pub(super) async fn launch(self: &Arc<Self>, input: LaunchInput) -> DomainResult<Task> {
        self.ensure_live()?;
        input.validate()?;

        let key = input.concurrency_key();
        let task = Task::pending(&input);
        {
            let mut registry = self.registry.lock();
            registry.insert(task.clone());
            registry.track_pending(&task.parent_session_id, task.id);
        }

        let queued = self.is_saturated(&key);
        info!(task_id = %task.id, key = %key, queued, "background task launched");
        self.queue.enqueue(&key, task.id, self.spawner());
        if queued {
            self.spawn_notice(Notice::launched(&task, true));
        }
        Ok(task)
    }

    /// Whether a task enqueued under `key` now would have to wait. Counts
    /// tasks already queued ahead of it as well as held slots.
    fn is_saturated(&self, key: &str) -> bool {
        match self.gate.limit(key) {
            ConcurrencyLimit::Bounded(max) => {
                let queued = self.registry.lock().queue_len(key);
                self.gate.count(key) + queued >= max
            }
            ConcurrencyLimit::Unlimited => false,
        }
    }

    /// Move a queued task to running. Called by the key's drain loop with a
    /// slot already held under `key`.
    async fn start_task(self: Arc<Self>, task_id: TaskId, key: &str) -> DomainResult<()> {
        self.ensure_live()?;

        let request = {
            let registry = self.registry.lock();
            let task = registry
                .get(task_id)
                .ok_or(DomainError::TaskNotFound(task_id))?;
            ContextRequest {
                parent_session_id: task.parent_session_id.clone(),
                title: format!("Background: {}", task.description),
            }
        };

        let session_id = match self.backend.create_context(request.clone()).await {
            Ok(session_id) => session_id,
            Err(err) => {
                self.finish_pending(
                    task_id,
                    TaskStatus::Error,
                    format!("Failed to create execution context: {err}"),
                );
                return Err(err);
            }
        };

        let task = {
            let mut registry = self.registry.lock();
            let still_pending = registry
                .get(task_id)
                .is_some_and(|task| task.status == TaskStatus::Pending);
            if still_pending {
                if let Some(task) = registry.get_mut(task_id) {
                    task.transition_to(TaskStatus::Running)?;
                    task.concurrency_key = Some(key.to_string());
                    task.concurrency_group = Some(key.to_string());
                }
                registry.bind_session(task_id, &session_id);
                registry.get(task_id).cloned()
            } else {
                None
            }
        };

        let Some(task) = task else {
            debug!(
                task_id = %task_id,
                session_id = %session_id,
                "task left the queue during start, discarding context"
            );
            self.abort_quietly(&session_id).await;
            return Err(DomainError::ValidationFailed(format!(
                "Task {task_id} is no longer pending"
            )));
        };

        info!(
            task_id = %task_id,
            session_id = %session_id,
            key = %key,
            agent = %task.agent,
            "background task started"
        );
        self.ensure_sweeper();

        self.run_context_hook(CreatedContext {
            session_id: session_id.clone(),
            parent_session_id: request.parent_session_id,
            title: request.title,
        })
        .await;
        self.spawn_notice(Notice::launched(&task, false));

        let body = PromptBody {
            agent: Some(task.agent.clone()),
            model: task.model.clone(),
            text: task.prompt.clone(),
            no_reply: false,
        };
        self.spawn_dispatch(task_id, session_id, body);
        Ok(())
    }

    async fn run_context_hook(&self, context: CreatedContext) {
        let Some(hook) = &self.context_hook else {
            return;
        };
        match timeout(
            self.config.context_hook_timeout(),
            hook.on_context_created(&context),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(session_id = %context.session_id, error = %err, "context hook failed");
            }
            Err(_) => {
                debug!(session_id = %context.session_id, "context hook timed out, continuing");
            }
        }
    }

    /// Deliver the prompt without blocking the caller. A rejected dispatch
    /// interrupts the task.
    fn spawn_dispatch(self: &Arc<Self>, task_id: TaskId, session_id: String, body: PromptBody) {
        let inner = self.clone();
        tokio::spawn(async move {
            let agent = body.agent.clone().unwrap_or_default();
            if let Err(err) = inner.backend.dispatch(&session_id, body).await {
                let message = describe_dispatch_failure(&agent, &err);
                warn!(
                    task_id = %task_id,
                    session_id = %session_id,
                    error = %message,
                    "prompt dispatch failed"
                );
                inner
                    .finish_running(
                        task_id,
                        TaskStatus::Interrupt,
                        Some(message),
                        "dispatch failed",
                    )
                    .await;
            }
        });
    }

    /// Resume a finished task's context with a follow-up prompt.
    #[instrument(skip(self, input), fields(session_id = %input.session_id))]
    pub(super) async fn resume(self: &Arc<Self>, input: ResumeInput) -> DomainResult<Task> {
        self.ensure_live()?;

        let (task_id, group) = {
            let registry = self.registry.lock();
            let task = registry
                .find_by_session(&input.session_id)
                .ok_or_else(|| DomainError::SessionNotFound(input.session_id.clone()))?;
            if task.status == TaskStatus::Running {
                debug!(task_id = %task.id, "resume requested for running task, nothing to do");
                return Ok(task.clone());
            }
            (task.id, task.concurrency_group.clone())
        };

        if let Some(group) = &group {
            self.gate.acquire(group).await?;
        }

        let resumed = {
            let mut registry = self.registry.lock();
            match registry.get(task_id).map(|task| task.status) {
                None => Err(DomainError::TaskNotFound(task_id)),
                Some(TaskStatus::Running) => Ok(None),
                Some(_) => {
                    registry.reparent(task_id, &input.parent_session_id, &input.parent_message_id);
                    registry.clear_timers_for(task_id);
                    registry.clear_notifications_for_task(task_id);
                    let outcome = match registry.get_mut(task_id) {
                        Some(task) => task.transition_to(TaskStatus::Running).map(|()| {
                            task.concurrency_key = group.clone();
                            task.parent_agent = input.parent_agent.clone();
                            task.parent_model = input.parent_model.clone();
                            task.clone()
                        }),
                        None => Err(DomainError::TaskNotFound(task_id)),
                    };
                    if outcome.is_ok() {
                        registry.track_pending(&input.parent_session_id, task_id);
                    }
                    outcome.map(Some)
                }
            }
        };

        let task = match resumed {
            Ok(Some(task)) => task,
            Ok(None) => {
                if let Some(group) = &group {
                    self.gate.release(group);
                }
                return self
                    .registry
                    .lock()
                    .get(task_id)
                    .cloned()
                    .ok_or(DomainError::TaskNotFound(task_id));
            }
            Err(err) => {
                if let Some(group) = &group {
                    self.gate.release(group);
                }
                return Err(err);
            }
        };

        info!(task_id = %task_id, parent = %input.parent_session_id, "background task resumed");
        self.ensure_sweeper();
        self.spawn_notice(Notice::launched(&task, false));

        let body = PromptBody {
            agent: Some(task.agent.clone()),
            model: task.model.clone(),
            text: input.prompt,
            no_reply: false,
        };
        self.spawn_dispatch(task_id, input.session_id, body);
        Ok(task)
    }

    /// Register work running in a context the engine did not create.
    #[instrument(skip(self, input), fields(session_id = %input.session_id))]
    pub(super) async fn track_external(self: &Arc<Self>, input: TrackInput) -> DomainResult<Task> {
        self.ensure_live()?;
        if input.session_id.trim().is_empty() {
            return Err(DomainError::ValidationFailed(
                "Session id is required".to_string(),
            ));
        }
        if let Some(task) = self.retrack(&input) {
            return Ok(task);
        }

        let key = input
            .concurrency_key
            .clone()
            .unwrap_or_else(|| input.agent.clone());
        self.gate.acquire(&key).await?;

        let task = {
            let mut registry = self.registry.lock();
            if registry.find_by_session(&input.session_id).is_some() {
                None
            } else {
                let task = Task::tracked(&input, &key);
                registry.insert(task.clone());
                registry.track_pending(&task.parent_session_id, task.id);
                Some(task)
            }
        };

        let Some(task) = task else {
            self.gate.release(&key);
            return self
                .retrack(&input)
                .ok_or_else(|| DomainError::SessionNotFound(input.session_id.clone()));
        };

        info!(task_id = %task.id, key = %key, "tracking external task");
        self.ensure_sweeper();
        Ok(task)
    }

    fn retrack(&self, input: &TrackInput) -> Option<Task> {
        let mut registry = self.registry.lock();
        let (task_id, active) = registry
            .find_by_session(&input.session_id)
            .map(|task| (task.id, task.status.is_active()))?;
        registry.reparent(task_id, &input.parent_session_id, &input.parent_message_id);
        if active {
            registry.track_pending(&input.parent_session_id, task_id);
        }
        debug!(task_id = %task_id, parent = %input.parent_session_id, "retracked existing task");
        registry.get(task_id).cloned()
    }

    /// Cancel a pending or running task.
    #[instrument(skip(self, options), fields(task_id = %task_id))]
    pub(super) async fn cancel(
        self: &Arc<Self>,
        task_id: TaskId,
        options: CancelOptions,
    ) -> DomainResult<bool> {
        let reason = options
            .reason
            .clone()
            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

        let status = self
            .registry
            .lock()
            .get(task_id)
            .map(|task| task.status)
            .ok_or(DomainError::TaskNotFound(task_id))?;

        let cancelled = match status {
            TaskStatus::Pending => self.cancel_pending(task_id, reason, &options),
            TaskStatus::Running => self.cancel_running(task_id, reason, &options).await,
            _ => false,
        };
        if cancelled && options.skip_notification {
            self.schedule_purge(&[task_id]);
        }
        Ok(cancelled)
    }

    fn cancel_pending(
        self: &Arc<Self>,
        task_id: TaskId,
        reason: String,
        options: &CancelOptions,
    ) -> bool {
        if options.skip_notification {
            let mut registry = self.registry.lock();
            let Some(parent) =
                close_pending_locked(&mut registry, task_id, TaskStatus::Cancelled, reason)
            else {
                return false;
            };
            registry.untrack_pending(&parent, task_id);
            info!(task_id = %task_id, "pending task cancelled silently");
            return true;
        }
        self.finish_pending(task_id, TaskStatus::Cancelled, reason)
    }

    async fn cancel_running(
        self: &Arc<Self>,
        task_id: TaskId,
        reason: String,
        options: &CancelOptions,
    ) -> bool {
        if !options.skip_notification && options.abort_session {
            return self
                .finish_running(task_id, TaskStatus::Cancelled, Some(reason), "cancelled")
                .await;
        }

        let outcome = {
            let mut registry = self.registry.lock();
            let Some(task) = registry.get_mut(task_id) else {
                return false;
            };
            if task.status != TaskStatus::Running
                || task.transition_to(TaskStatus::Cancelled).is_err()
            {
                return false;
            }
            task.error = Some(reason);
            let key = task.concurrency_key.take();
            let parent = task.parent_session_id.clone();
            let session_id = task.session_id.clone();
            registry.clear_timers_for(task_id);
            let remaining = registry.untrack_pending(&parent, task_id);
            if !options.skip_notification {
                registry.mark_for_notification(&parent, task_id);
            }
            let snapshot = registry.get(task_id).cloned();
            (key, session_id, remaining, snapshot)
        };

        let (key, session_id, remaining, snapshot) = outcome;
        if let Some(key) = key {
            self.gate.release(&key);
        }
        info!(task_id = %task_id, "running task cancelled");
        if options.abort_session {
            if let Some(session_id) = &session_id {
                self.abort_quietly(session_id).await;
            }
        }
        if !options.skip_notification {
            if let Some(task) = snapshot {
                self.enqueue_notification(task, remaining);
            }
        }
        true
    }

    /// Terminal transition for a task that never started. Removes it from
    /// its key's queue and queues the parent notice.
    pub(super) fn finish_pending(
        self: &Arc<Self>,
        task_id: TaskId,
        status: TaskStatus,
        error: String,
    ) -> bool {
        let outcome = {
            let mut registry = self.registry.lock();
            let Some(parent) = close_pending_locked(&mut registry, task_id, status, error) else {
                return false;
            };
            let remaining = registry.untrack_pending(&parent, task_id);
            registry.mark_for_notification(&parent, task_id);
            registry.get(task_id).cloned().map(|task| (task, remaining))
        };
        let Some((task, remaining)) = outcome else {
            return false;
        };
        info!(task_id = %task_id, status = %status, "pending task finished before start");
        self.enqueue_notification(task, remaining);
        true
    }

    /// Cancel the task bound to `session_id` and every task below it, then
    /// forget them all.
    #[instrument(skip(self))]
    pub(super) async fn handle_session_deleted(self: &Arc<Self>, session_id: &str) -> Vec<TaskId> {
        let (direct, affected) = {
            let registry = self.registry.lock();
            let direct = registry.find_by_session(session_id).map(|task| task.id);
            let mut affected: Vec<TaskId> = direct.into_iter().collect();
            for id in registry.descendants_of(session_id) {
                if !affected.contains(&id) {
                    affected.push(id);
                }
            }
            (direct, affected)
        };
        if affected.is_empty() {
            self.registry.lock().remove_pending_set(session_id);
            return affected;
        }

        for &task_id in &affected {
            let options = CancelOptions {
                reason: Some(SESSION_DELETED_REASON.to_string()),
                skip_notification: true,
                // the deleted session itself is already gone
                abort_session: Some(task_id) != direct,
            };
            if let Err(err) = self.cancel(task_id, options).await {
                trace!(task_id = %task_id, error = %err, "task vanished during cascade");
            }
        }

        let mut registry = self.registry.lock();
        for &task_id in &affected {
            if let Some(task) = registry.remove(task_id) {
                if let Some(child_session) = &task.session_id {
                    registry.remove_pending_set(child_session);
                    registry.clear_notifications(child_session);
                }
            }
        }
        registry.remove_pending_set(session_id);
        registry.clear_notifications(session_id);
        info!(session_id = %session_id, removed = affected.len(), "session deleted, tasks removed");
        affected
    }

    /// Route one backend event.
    pub(super) async fn handle_event(self: &Arc<Self>, event: BackendEvent) {
        if self.is_shut_down() {
            return;
        }
        match event {
            BackendEvent::PartUpdated { session_id, tool } => {
                self.record_activity(&session_id, tool);
            }
            BackendEvent::MessageUpdated { session_id } => {
                self.record_activity(&session_id, None);
            }
            BackendEvent::SessionIdle { session_id } => {
                self.handle_idle(&session_id).await;
            }
            BackendEvent::SessionDeleted { session_id } => {
                self.handle_session_deleted(&session_id).await;
            }
            BackendEvent::Unknown { kind } => {
                trace!(kind = %kind, "ignoring backend event");
            }
        }
    }

    fn record_activity(&self, session_id: &str, tool: Option<String>) {
        let mut registry = self.registry.lock();
        let Some(task_id) = registry
            .find_by_session(session_id)
            .filter(|task| task.status == TaskStatus::Running)
            .map(|task| task.id)
        else {
            return;
        };
        if let Some(progress) = registry
            .get_mut(task_id)
            .and_then(|task| task.progress.as_mut())
        {
            progress.last_update = chrono::Utc::now();
            if let Some(tool) = tool {
                progress.tool_calls += 1;
                progress.last_tool = Some(tool);
            }
        }
    }

    /// Stop sweeps, abort every running context and drop all state.
    pub(super) async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.sweeper().take() {
            handle.abort();
        }

        let sessions: Vec<String> = self
            .registry
            .lock()
            .running_tasks()
            .into_iter()
            .filter_map(|task| task.session_id.clone())
            .collect();
        join_all(sessions.iter().map(|session_id| self.abort_quietly(session_id))).await;

        {
            let mut registry = self.registry.lock();
            registry.clear_all_timers();
            self.gate.clear();
            registry.clear();
        }
        self.notifier.clear();
        info!(aborted = sessions.len(), "background manager shut down");
    }

    pub(super) async fn abort_quietly(&self, session_id: &str) {
        if let Err(err) = self.backend.abort(session_id).await {
            debug!(session_id = %session_id, error = %err, "abort failed");
        }
    }
}

/// Move a pending task to `status` and pull it from its key's queue.
/// Returns its parent session, or `None` if it was not pending.
fn close_pending_locked(
    registry: &mut TaskRegistry,
    task_id: TaskId,
    status: TaskStatus,
    error: String,
) -> Option<String> {
    let task = registry.get_mut(task_id)?;
    if task.status != TaskStatus::Pending {
        return None;
    }
    task.transition_to(status).ok()?;
    task.error = Some(error);
    let parent = task.parent_session_id.clone();
    let group = task.concurrency_group.clone();
    if let Some(key) = group {
        registry.remove_from_queue(&key, task_id);
    }
    registry.clear_timers_for(task_id);
    Some(parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_agent_error_is_specialized() {
        let err = DomainError::DispatchFailed {
            message: "TypeError: undefined is not an object (evaluating 'agent.name')".to_string(),
        };
        assert_eq!(
            describe_dispatch_failure("oracle", &err),
            "Agent \"oracle\" not found. Make sure the agent is registered in your configuration."
        );
    }

    #[test]
    fn test_other_dispatch_errors_pass_through() {
        let err = DomainError::DispatchFailed {
            message: "connection reset".to_string(),
        };
        assert_eq!(describe_dispatch_failure("oracle", &err), "connection reset");

        let err = DomainError::Backend("timeout".to_string());
        assert_eq!(
            describe_dispatch_failure("oracle", &err),
            "Execution backend error: timeout"
        );
    }
}
