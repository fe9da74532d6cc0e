//! Parent notices and the retention purge that follows them.

use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

use super::ManagerInner;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Notice, PromptBody, Task, TaskId, TaskStatus};
use crate::services::task_registry::TimerKind;

fn status_heading(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Completed => "COMPLETED",
        TaskStatus::Cancelled => "CANCELLED",
        TaskStatus::Interrupt => "INTERRUPTED",
        TaskStatus::Error => "FAILED",
        TaskStatus::Pending | TaskStatus::Running => "UPDATE",
    }
}

/// Notice for a task that finished while siblings are still active.
pub fn individual_notice(task: &Task, remaining: usize) -> String {
    let mut text = format!(
        "[BACKGROUND TASK {}]\n**ID:** `{}`\n**Description:** {}\n**Duration:** {}\n",
        status_heading(task.status),
        task.id,
        task.description,
        task.duration_label()
    );
    if let Some(error) = &task.error {
        let _ = writeln!(text, "**Error:** {error}");
    }
    let noun = if remaining == 1 { "task" } else { "tasks" };
    let _ = write!(
        text,
        "\n**{remaining} {noun} still in progress.** You WILL be notified when ALL complete.\n\
         Do NOT poll - continue productive work."
    );
    text
}

/// Notice sent once a parent has nothing left pending or running.
pub fn aggregate_notice(finished: &[Task]) -> String {
    let mut text = String::from("[ALL BACKGROUND TASKS COMPLETE]\n\n**Finished:**\n");
    for task in finished {
        let _ = write!(
            text,
            "- `{}`: {} ({}, {})",
            task.id,
            task.description,
            task.status,
            task.duration_label()
        );
        if let Some(error) = &task.error {
            let _ = write!(text, " - {error}");
        }
        text.push('\n');
    }
    text.push_str("\nUse background_output(task_id=\"<id>\") to retrieve each result.");
    text
}

impl ManagerInner {
    /// Queue the parent notice for a task that just reached a terminal state.
    ///
    /// `remaining` is the parent's pending count captured at the transition.
    pub(super) fn enqueue_notification(self: &Arc<Self>, task: Task, remaining: usize) {
        let parent = task.parent_session_id.clone();
        let inner = self.clone();
        self.notifier.enqueue(&parent, async move {
            inner.deliver_notification(task, remaining).await
        });
    }

    async fn deliver_notification(
        self: Arc<Self>,
        task: Task,
        remaining: usize,
    ) -> DomainResult<()> {
        self.show_notice(Notice::finished(&task)).await;
        if self.is_shut_down() {
            return Ok(());
        }
        let parent = task.parent_session_id.clone();

        if remaining > 0 {
            let body = parent_body(&task, individual_notice(&task, remaining), true);
            debug!(task_id = %task.id, parent = %parent, remaining, "delivering individual notice");
            return self
                .backend
                .dispatch(&parent, body)
                .await
                .map_err(|err| DomainError::NotificationDeliveryFailed(err.to_string()));
        }

        let finished: Vec<Task> = self
            .registry
            .lock()
            .children_of(&parent)
            .into_iter()
            .filter(|sibling| sibling.is_terminal())
            .cloned()
            .collect();
        if finished.is_empty() {
            debug!(task_id = %task.id, parent = %parent, "nothing left to report");
            return Ok(());
        }

        let ids: Vec<TaskId> = finished.iter().map(|sibling| sibling.id).collect();
        let body = parent_body(&task, aggregate_notice(&finished), false);
        debug!(parent = %parent, finished = ids.len(), "delivering aggregate notice");
        let delivered = self.backend.dispatch(&parent, body).await;

        self.registry.lock().clear_notifications(&parent);
        self.schedule_purge(&ids);
        delivered.map_err(|err| DomainError::NotificationDeliveryFailed(err.to_string()))
    }

    /// Forget each task after the retention delay, replacing any earlier timer.
    pub(super) fn schedule_purge(self: &Arc<Self>, ids: &[TaskId]) {
        let retention = self.config.task_retention();
        let mut registry = self.registry.lock();
        for &task_id in ids {
            if !registry.contains(task_id) {
                continue;
            }
            let inner = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(retention).await;
                let mut registry = inner.registry.lock();
                registry.take_timer(task_id, TimerKind::Purge);
                if registry.get(task_id).is_some_and(Task::is_terminal) {
                    registry.remove(task_id);
                    debug!(task_id = %task_id, "finished task purged");
                }
            });
            registry.set_timer(task_id, TimerKind::Purge, handle.abort_handle());
        }
    }

    pub(super) async fn show_notice(&self, notice: Notice) {
        let Some(sink) = &self.notice_sink else {
            return;
        };
        let task_id = notice.task_id;
        if let Err(err) = sink.show(notice).await {
            debug!(task_id = %task_id, error = %err, "notice sink failed");
        }
    }

    pub(super) fn spawn_notice(self: &Arc<Self>, notice: Notice) {
        if self.notice_sink.is_none() {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            inner.show_notice(notice).await;
        });
    }
}

fn parent_body(task: &Task, text: String, no_reply: bool) -> PromptBody {
    PromptBody {
        agent: task.parent_agent.clone(),
        model: task.parent_model.clone(),
        text,
        no_reply,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::LaunchInput;

    fn finished(description: &str, status: TaskStatus) -> Task {
        let input = LaunchInput::new("explore", "parent", "work").with_description(description);
        let mut task = Task::pending(&input);
        task.transition_to(TaskStatus::Running).unwrap();
        task.transition_to(status).unwrap();
        task
    }

    #[test]
    fn test_individual_notice_counts_remaining() {
        let task = finished("Index the repo", TaskStatus::Completed);
        let text = individual_notice(&task, 1);
        assert!(text.starts_with("[BACKGROUND TASK COMPLETED]"));
        assert!(text.contains(&format!("`{}`", task.id)));
        assert!(text.contains("**Description:** Index the repo"));
        assert!(text.contains("1 task still in progress"));

        let text = individual_notice(&task, 3);
        assert!(text.contains("3 tasks still in progress"));
    }

    #[test]
    fn test_individual_notice_includes_error() {
        let mut task = finished("Flaky", TaskStatus::Cancelled);
        task.error = Some("Stale timeout (no activity for 3min)".to_string());
        let text = individual_notice(&task, 2);
        assert!(text.starts_with("[BACKGROUND TASK CANCELLED]"));
        assert!(text.contains("**Error:** Stale timeout (no activity for 3min)"));
    }

    #[test]
    fn test_aggregate_notice_lists_every_task() {
        let first = finished("First", TaskStatus::Completed);
        let second = finished("Second", TaskStatus::Interrupt);
        let text = aggregate_notice(&[first.clone(), second.clone()]);
        assert!(text.starts_with("[ALL BACKGROUND TASKS COMPLETE]"));
        assert!(text.contains(&format!("`{}`: First (completed", first.id)));
        assert!(text.contains(&format!("`{}`: Second (interrupt", second.id)));
    }

    #[test]
    fn test_parent_body_carries_parent_identity() {
        let mut task = finished("First", TaskStatus::Completed);
        task.parent_agent = Some("build".to_string());
        let body = parent_body(&task, "hi".to_string(), true);
        assert_eq!(body.agent.as_deref(), Some("build"));
        assert!(body.no_reply);
    }
}
