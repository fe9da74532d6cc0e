//! Completion detection.
//!
//! Three detectors race to finish a running task: the idle event, the
//! periodic status poll and the transcript-stability check. A fourth sweep
//! cancels tasks that stopped making progress and prunes tasks past their
//! TTL. Whichever path gets to the registry first performs the single
//! terminal transition; the others observe a non-running task and back off.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::ManagerInner;
use crate::domain::models::{SessionActivity, TaskId, TaskProgress, TaskStatus, TranscriptSummary};
use crate::services::task_registry::TimerKind;

/// Render a millisecond span as whole minutes, or seconds below a minute.
fn minutes_label(ms: u64) -> String {
    if ms >= 60_000 {
        format!("{}min", ms / 60_000)
    } else {
        format!("{}s", ms / 1000)
    }
}

fn elapsed_since(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - start).to_std().unwrap_or_default()
}

struct RunningSnapshot {
    id: TaskId,
    session_id: String,
    started_at: DateTime<Utc>,
    last_update: DateTime<Utc>,
}

impl ManagerInner {
    /// React to a `session.idle` event for `session_id`.
    ///
    /// An idle signal that arrives too soon after start is deferred until the
    /// minimum idle time has passed; repeated early signals share one timer.
    pub(super) async fn handle_idle(self: &Arc<Self>, session_id: &str) {
        let Some((task_id, started_at)) = self.running_by_session(session_id) else {
            trace!(session_id = %session_id, "idle event for untracked session");
            return;
        };

        let elapsed = elapsed_since(started_at, Utc::now());
        let min_idle = self.config.min_idle_time();
        if elapsed < min_idle {
            let wait = min_idle - elapsed;
            let mut registry = self.registry.lock();
            if registry.has_timer(task_id, TimerKind::IdleDeferral) {
                trace!(task_id = %task_id, "idle already deferred");
                return;
            }
            let inner = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                inner
                    .registry
                    .lock()
                    .take_timer(task_id, TimerKind::IdleDeferral);
                inner.evaluate_idle(task_id, "deferred idle").await;
            });
            registry.set_timer(task_id, TimerKind::IdleDeferral, handle.abort_handle());
            debug!(task_id = %task_id, wait = ?wait, "idle too early, deferring");
            return;
        }

        self.evaluate_idle(task_id, "session idle").await;
    }

    fn running_by_session(&self, session_id: &str) -> Option<(TaskId, DateTime<Utc>)> {
        let registry = self.registry.lock();
        let task = registry.find_by_session(session_id)?;
        if task.status != TaskStatus::Running {
            return None;
        }
        Some((task.id, task.started_at.unwrap_or_else(Utc::now)))
    }

    /// Validate an idle task and complete it if it passes.
    pub(super) async fn evaluate_idle(
        self: &Arc<Self>,
        task_id: TaskId,
        cause: &'static str,
    ) -> bool {
        let session_id = {
            let registry = self.registry.lock();
            match registry.get(task_id) {
                Some(task) if task.status == TaskStatus::Running => task.session_id.clone(),
                _ => None,
            }
        };
        let Some(session_id) = session_id else {
            return false;
        };

        if !self.has_output(&session_id).await {
            debug!(task_id = %task_id, cause, "idle without output, waiting");
            return false;
        }
        if self.has_open_todos(&session_id).await {
            debug!(task_id = %task_id, cause, "idle with open todos, waiting");
            return false;
        }
        self.finish_running(task_id, TaskStatus::Completed, None, cause)
            .await
    }

    /// A backend error counts as output so a flaky backend cannot strand a task.
    async fn has_output(&self, session_id: &str) -> bool {
        match self.backend.transcript(session_id).await {
            Ok(messages) => TranscriptSummary::from_messages(&messages).has_output,
            Err(err) => {
                warn!(
                    session_id = %session_id,
                    error = %err,
                    "transcript unavailable, assuming output"
                );
                true
            }
        }
    }

    async fn has_open_todos(&self, session_id: &str) -> bool {
        match self.backend.pending_items(session_id).await {
            Ok(items) => items.iter().any(|item| item.is_open()),
            Err(err) => {
                warn!(
                    session_id = %session_id,
                    error = %err,
                    "todos unavailable, assuming none open"
                );
                false
            }
        }
    }

    /// The one terminal transition for a running task.
    ///
    /// Under the registry lock: check it is still running, move it to
    /// `status`, detach its slot, capture how many siblings remain and mark
    /// it for notification. The slot is released before any backend I/O.
    /// Returns `false` if another path already finished the task.
    pub(super) async fn finish_running(
        self: &Arc<Self>,
        task_id: TaskId,
        status: TaskStatus,
        error: Option<String>,
        cause: &'static str,
    ) -> bool {
        let outcome = {
            let mut registry = self.registry.lock();
            let Some(task) = registry.get_mut(task_id) else {
                return false;
            };
            if task.status != TaskStatus::Running {
                trace!(task_id = %task_id, status = %task.status, cause, "already finished");
                return false;
            }
            if let Err(err) = task.transition_to(status) {
                warn!(task_id = %task_id, error = %err, "terminal transition rejected");
                return false;
            }
            task.error = error;
            let key = task.concurrency_key.take();
            let parent = task.parent_session_id.clone();
            let session_id = task.session_id.clone();
            registry.clear_timer(task_id, TimerKind::IdleDeferral);
            let remaining = registry.untrack_pending(&parent, task_id);
            registry.mark_for_notification(&parent, task_id);
            registry
                .get(task_id)
                .cloned()
                .map(|task| (task, key, session_id, remaining))
        };
        let Some((task, key, session_id, remaining)) = outcome else {
            return false;
        };

        if let Some(key) = &key {
            self.gate.release(key);
        }
        info!(
            task_id = %task_id,
            status = %status,
            cause,
            duration = %task.duration_label(),
            remaining,
            "background task finished"
        );

        if let Some(session_id) = &session_id {
            self.abort_quietly(session_id).await;
        }
        self.enqueue_notification(task, remaining);
        true
    }

    /// Start the sweep loop unless it is already running.
    pub(super) fn ensure_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper();
        if self.is_shut_down() {
            return;
        }
        if sweeper.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let inner = self.clone();
        *sweeper = Some(tokio::spawn(async move {
            inner.run_sweeps().await;
        }));
        debug!("sweeps started");
    }

    async fn run_sweeps(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            if self.is_shut_down() {
                break;
            }

            self.prune_expired().await;
            self.check_stale().await;
            self.poll_running().await;

            let drained = {
                let mut sweeper = self.sweeper();
                let drained = !self.registry.lock().has_running();
                if drained {
                    *sweeper = None;
                }
                drained
            };
            if drained {
                debug!("no running tasks, sweeps stopped");
                break;
            }
        }
    }

    /// Move tasks past their TTL to `error`.
    pub(super) async fn prune_expired(self: &Arc<Self>) {
        let now = Utc::now();
        let pending_ttl = self.config.pending_ttl();
        let running_ttl = self.config.running_ttl();

        let expired: Vec<(TaskId, TaskStatus)> = self
            .registry
            .lock()
            .all_tasks()
            .filter_map(|task| match task.status {
                TaskStatus::Pending if elapsed_since(task.queued_at, now) > pending_ttl => {
                    Some((task.id, TaskStatus::Pending))
                }
                TaskStatus::Running
                    if task
                        .started_at
                        .is_some_and(|started| elapsed_since(started, now) > running_ttl) =>
                {
                    Some((task.id, TaskStatus::Running))
                }
                _ => None,
            })
            .collect();

        for (task_id, status) in expired {
            if status == TaskStatus::Pending {
                let message = format!(
                    "Task timed out while queued ({})",
                    minutes_label(self.config.pending_ttl_ms)
                );
                self.finish_pending(task_id, TaskStatus::Error, message);
            } else {
                let message = format!(
                    "Task timed out after {}",
                    minutes_label(self.config.running_ttl_ms)
                );
                self.finish_running(task_id, TaskStatus::Error, Some(message), "ttl")
                    .await;
            }
        }
    }

    /// Cancel running tasks that have gone quiet for too long.
    pub(super) async fn check_stale(self: &Arc<Self>) {
        let now = Utc::now();
        let stale_timeout = self.config.stale_timeout();
        let min_runtime = self.config.min_runtime_before_stale();

        let stale: Vec<TaskId> = self
            .running_snapshot()
            .into_iter()
            .filter(|task| {
                elapsed_since(task.started_at, now) >= min_runtime
                    && elapsed_since(task.last_update, now) > stale_timeout
            })
            .map(|task| task.id)
            .collect();

        for task_id in stale {
            let reason = format!(
                "Stale timeout (no activity for {})",
                minutes_label(self.config.stale_timeout_ms)
            );
            warn!(task_id = %task_id, "task went stale, cancelling");
            self.finish_running(task_id, TaskStatus::Cancelled, Some(reason), "stale")
                .await;
        }
    }

    fn running_snapshot(&self) -> Vec<RunningSnapshot> {
        self.registry
            .lock()
            .running_tasks()
            .into_iter()
            .filter_map(|task| {
                let session_id = task.session_id.clone()?;
                let started_at = task.started_at?;
                let last_update = task
                    .progress
                    .as_ref()
                    .map_or(started_at, |progress| progress.last_update);
                Some(RunningSnapshot {
                    id: task.id,
                    session_id,
                    started_at,
                    last_update,
                })
            })
            .collect()
    }

    /// Poll every running task: complete idle ones, refresh progress for the
    /// rest and complete those whose transcript has stopped changing.
    pub(super) async fn poll_running(self: &Arc<Self>) {
        let running = self.running_snapshot();
        if running.is_empty() {
            return;
        }

        let statuses = match self.backend.status_snapshot().await {
            Ok(statuses) => statuses,
            Err(err) => {
                warn!(error = %err, "status snapshot failed");
                HashMap::new()
            }
        };

        for task in running {
            if statuses.get(&task.session_id) == Some(&SessionActivity::Idle) {
                self.evaluate_idle(task.id, "poll idle").await;
                continue;
            }
            if self.observe_transcript(&task).await {
                self.confirm_stable(&task).await;
            }
        }
    }

    /// Refresh progress from the transcript. Returns whether the task now
    /// looks stable enough to verify.
    async fn observe_transcript(&self, task: &RunningSnapshot) -> bool {
        let messages = match self.backend.transcript(&task.session_id).await {
            Ok(messages) => messages,
            Err(err) => {
                trace!(task_id = %task.id, error = %err, "transcript unavailable during poll");
                return false;
            }
        };
        let summary = TranscriptSummary::from_messages(&messages);
        let now = Utc::now();

        let mut registry = self.registry.lock();
        let Some(running) = registry
            .get_mut(task.id)
            .filter(|running| running.status == TaskStatus::Running)
        else {
            return false;
        };
        let progress = running
            .progress
            .get_or_insert_with(|| TaskProgress::new(task.started_at));
        progress.tool_calls = progress.tool_calls.max(summary.tool_calls);
        if summary.last_tool.is_some() {
            progress.last_tool = summary.last_tool.clone();
        }
        if summary.last_assistant_text.is_some()
            && progress.last_message != summary.last_assistant_text
        {
            progress.last_message = summary.last_assistant_text.clone();
            progress.last_message_at = Some(now);
        }
        progress.observe_message_count(summary.message_count, now);

        summary.has_output
            && progress.stable_polls >= self.config.stability_polls
            && elapsed_since(task.started_at, now) >= self.config.min_stability_time()
    }

    /// Re-check live status before trusting a stable transcript.
    ///
    /// Only a `Busy` report blocks completion; a session missing from the
    /// snapshot is not known to be busy and counts as idle here. A busy
    /// re-check starts the stability count over.
    async fn confirm_stable(self: &Arc<Self>, task: &RunningSnapshot) {
        match self.backend.status_snapshot().await {
            Ok(statuses) if statuses.get(&task.session_id) == Some(&SessionActivity::Busy) => {
                trace!(task_id = %task.id, "stable transcript but session busy");
                let mut registry = self.registry.lock();
                if let Some(progress) = registry
                    .get_mut(task.id)
                    .and_then(|running| running.progress.as_mut())
                {
                    progress.stable_polls = 0;
                }
            }
            Ok(_) => {
                self.evaluate_idle(task.id, "stable transcript").await;
            }
            Err(err) => {
                debug!(task_id = %task.id, error = %err, "status re-check failed, skipping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::backends::MockBackend;
    use crate::domain::models::{
        BackgroundTaskConfig, LaunchInput, MessagePart, TrackInput, TranscriptMessage,
    };
    use crate::services::background_manager::BackgroundManager;

    fn quiet_config() -> BackgroundTaskConfig {
        BackgroundTaskConfig {
            default_concurrency: Some(2),
            min_idle_time_ms: 0,
            poll_interval_ms: 60_000,
            ..Default::default()
        }
    }

    fn manager(config: BackgroundTaskConfig) -> (BackgroundManager, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        (BackgroundManager::new(config, backend.clone()), backend)
    }

    /// Wait until the task's prompt has reached its context.
    async fn wait_dispatched(
        manager: &BackgroundManager,
        backend: &MockBackend,
        task_id: TaskId,
    ) -> String {
        for _ in 0..200 {
            let session = manager.get_task(task_id).and_then(|task| task.session_id);
            if let Some(session) = session {
                if !backend.dispatches_to(&session).await.is_empty() {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never received its prompt");
    }

    #[tokio::test]
    async fn test_idle_poll_and_stale_race_to_one_transition() {
        let (manager, backend) = manager(BackgroundTaskConfig {
            stale_timeout_ms: 0,
            min_runtime_before_stale_ms: 0,
            ..quiet_config()
        });
        let inner = manager.inner.clone();
        // a slot held elsewhere; a double release would free it too
        inner.gate.acquire("explore").await.unwrap();

        let task = manager
            .launch(LaunchInput::new("explore", "ses_parent", "race"))
            .await
            .unwrap();
        let session = wait_dispatched(&manager, &backend, task.id).await;
        backend.finish(&session, "done", false).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        tokio::join!(
            inner.handle_idle(&session),
            inner.poll_running(),
            inner.check_stale(),
        );

        let finished = manager.get_task(task.id).unwrap();
        assert!(finished.status.is_terminal());
        inner.notifier.flush("ses_parent").await;
        assert_eq!(backend.dispatches_to("ses_parent").await.len(), 1);
        assert_eq!(inner.gate.count("explore"), 1);
        assert_eq!(manager.pending_count("ses_parent"), 0);
    }

    #[tokio::test]
    async fn test_busy_recheck_restarts_stability_count() {
        let (manager, backend) = manager(BackgroundTaskConfig {
            stability_polls: 2,
            min_stability_time_ms: 0,
            ..quiet_config()
        });
        backend
            .set_transcript(
                "ses_external",
                vec![TranscriptMessage::assistant(vec![MessagePart::text("still going")])],
            )
            .await;
        backend
            .set_activity("ses_external", SessionActivity::Busy)
            .await;
        let task = manager
            .track_external(TrackInput {
                session_id: "ses_external".to_string(),
                agent: "explore".to_string(),
                parent_session_id: "ses_parent".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let inner = manager.inner.clone();
        for _ in 0..3 {
            inner.poll_running().await;
        }

        let tracked = manager.get_task(task.id).unwrap();
        assert_eq!(tracked.status, TaskStatus::Running);
        assert_eq!(tracked.progress.map(|progress| progress.stable_polls), Some(0));
    }

    #[tokio::test]
    async fn test_failed_status_recheck_keeps_task_running() {
        let (manager, backend) = manager(BackgroundTaskConfig {
            stability_polls: 1,
            min_stability_time_ms: 0,
            ..quiet_config()
        });
        backend
            .set_transcript(
                "ses_external",
                vec![TranscriptMessage::assistant(vec![MessagePart::text("done?")])],
            )
            .await;
        let task = manager
            .track_external(TrackInput {
                session_id: "ses_external".to_string(),
                agent: "explore".to_string(),
                parent_session_id: "ses_parent".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        backend.fail_status("status endpoint down").await;

        let inner = manager.inner.clone();
        for _ in 0..3 {
            inner.poll_running().await;
        }

        let tracked = manager.get_task(task.id).unwrap();
        assert_eq!(tracked.status, TaskStatus::Running);
        assert_eq!(
            tracked.progress.and_then(|progress| progress.last_message).as_deref(),
            Some("done?")
        );
    }

    #[test]
    fn test_minutes_label() {
        assert_eq!(minutes_label(180_000), "3min");
        assert_eq!(minutes_label(1_800_000), "30min");
        assert_eq!(minutes_label(1_500), "1s");
    }

    #[test]
    fn test_elapsed_since_future_is_zero() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(5);
        assert_eq!(elapsed_since(later, now), Duration::ZERO);
        assert_eq!(elapsed_since(now, later), Duration::from_secs(5));
    }
}
