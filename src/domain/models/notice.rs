//! Best-effort UI notices about background tasks.

use serde::{Deserialize, Serialize};

use super::task::{Task, TaskId, TaskStatus};

/// Visual weight of a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeVariant {
    Info,
    Success,
    Warning,
    Error,
}

/// A toast-style notice about a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub task_id: TaskId,
    pub title: String,
    pub message: String,
    pub variant: NoticeVariant,
    /// How long the notice should stay visible
    pub duration_ms: u64,
}

impl Notice {
    pub fn launched(task: &Task, queued: bool) -> Self {
        let title = if queued {
            "Background task queued"
        } else {
            "Background task started"
        };
        Self {
            task_id: task.id,
            title: title.to_string(),
            message: format!("{} ({})", task.description, task.agent),
            variant: NoticeVariant::Info,
            duration_ms: 3000,
        }
    }

    pub fn finished(task: &Task) -> Self {
        let (title, variant) = match task.status {
            TaskStatus::Completed => ("Background task completed", NoticeVariant::Success),
            TaskStatus::Cancelled => ("Background task cancelled", NoticeVariant::Warning),
            _ => ("Background task failed", NoticeVariant::Error),
        };
        Self {
            task_id: task.id,
            title: title.to_string(),
            message: format!("\"{}\" finished in {}", task.description, task.duration_label()),
            variant,
            duration_ms: 5000,
        }
    }
}
