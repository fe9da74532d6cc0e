//! Background task domain model.
//!
//! A background task is a long-lived unit of work dispatched to an
//! execution context on behalf of a parent session. Tasks move through
//! `pending -> running -> terminal`, and a terminal task may be resumed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Unique identifier for a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bg_{}", self.0.simple())
    }
}

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued behind its concurrency key, no admission slot held
    Pending,
    /// Holding a slot and executing in its own context
    Running,
    /// Finished with valid output
    Completed,
    /// Pruned or failed to start
    Error,
    /// Cancelled by a caller, a cascade, or the stale detector
    Cancelled,
    /// Prompt delivery to the execution context failed
    Interrupt,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Interrupt => "interrupt",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" | "complete" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "interrupt" | "interrupted" => Some(Self::Interrupt),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Cancelled | Self::Interrupt
        )
    }

    /// Pending or running; these are the states tracked in a parent's pending set.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Valid transitions from this status.
    ///
    /// Terminal states may only go back to `Running`, which is a resume.
    pub fn valid_transitions(&self) -> Vec<TaskStatus> {
        match self {
            Self::Pending => vec![Self::Running, Self::Cancelled, Self::Error, Self::Interrupt],
            Self::Running => vec![Self::Completed, Self::Error, Self::Cancelled, Self::Interrupt],
            Self::Completed | Self::Error | Self::Cancelled | Self::Interrupt => {
                vec![Self::Running]
            }
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-qualified model reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    /// `provider/model`, the concurrency key used for model-routed launches.
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider_id, self.model_id)
    }
}

/// Request to launch a new background task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchInput {
    /// Short human-readable description used in notices
    pub description: String,
    /// Prompt delivered to the execution context
    pub prompt: String,
    /// Agent that runs the task; the routing key
    pub agent: String,
    /// Session that launched the task and receives its notices
    pub parent_session_id: String,
    /// Message in the parent session that triggered the launch
    pub parent_message_id: String,
    /// Agent of the parent session, echoed back on notice delivery
    pub parent_agent: Option<String>,
    /// Model of the parent session, echoed back on notice delivery
    pub parent_model: Option<ModelRef>,
    /// Optional explicit model; selects the concurrency key when present
    pub model: Option<ModelRef>,
}

impl LaunchInput {
    pub fn new(
        agent: impl Into<String>,
        parent_session_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        let prompt = prompt.into();
        Self {
            description: generate_description(&prompt),
            prompt,
            agent: agent.into(),
            parent_session_id: parent_session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_model(mut self, model: ModelRef) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_parent_message(mut self, message_id: impl Into<String>) -> Self {
        self.parent_message_id = message_id.into();
        self
    }

    /// Key under which admission is enforced: the model when given, else the agent.
    pub fn concurrency_key(&self) -> String {
        self.model
            .as_ref()
            .map_or_else(|| self.agent.clone(), ModelRef::key)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.agent.trim().is_empty() {
            return Err(DomainError::ValidationFailed(
                "Agent parameter is required".to_string(),
            ));
        }
        if self.parent_session_id.trim().is_empty() {
            return Err(DomainError::ValidationFailed(
                "Parent session id is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Request to resume a task whose execution context already exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeInput {
    pub session_id: String,
    pub prompt: String,
    pub parent_session_id: String,
    pub parent_message_id: String,
    pub parent_agent: Option<String>,
    pub parent_model: Option<ModelRef>,
}

/// Registration of a task whose context was started outside the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackInput {
    pub session_id: String,
    pub description: String,
    pub agent: String,
    pub parent_session_id: String,
    pub parent_message_id: String,
    pub concurrency_key: Option<String>,
}

/// Options controlling a cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOptions {
    /// Human-readable cause recorded on the task
    pub reason: Option<String>,
    /// Skip the parent notice; used when the caller is about to be notified itself
    pub skip_notification: bool,
    /// Best-effort abort of the execution context
    pub abort_session: bool,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            reason: None,
            skip_notification: false,
            abort_session: true,
        }
    }
}

impl CancelOptions {
    pub fn silent() -> Self {
        Self {
            skip_notification: true,
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Observed progress of a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub tool_calls: u32,
    pub last_tool: Option<String>,
    pub last_update: DateTime<Utc>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Transcript length seen on the previous poll
    pub last_msg_count: Option<usize>,
    /// Consecutive polls with an unchanged transcript length
    pub stable_polls: u32,
}

impl TaskProgress {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            tool_calls: 0,
            last_tool: None,
            last_update: now,
            last_message: None,
            last_message_at: None,
            last_msg_count: None,
            stable_polls: 0,
        }
    }

    /// Record a transcript length; any change resets the stability counter.
    pub fn observe_message_count(&mut self, count: usize, now: DateTime<Utc>) {
        if self.last_msg_count == Some(count) {
            self.stable_polls += 1;
        } else {
            self.stable_polls = 0;
            self.last_msg_count = Some(count);
            self.last_update = now;
        }
    }
}

/// A background task tracked by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Execution context, assigned once the task starts
    pub session_id: Option<String>,
    pub parent_session_id: String,
    pub parent_message_id: String,
    pub parent_agent: Option<String>,
    pub parent_model: Option<ModelRef>,
    pub description: String,
    pub prompt: String,
    pub agent: String,
    pub model: Option<ModelRef>,
    pub status: TaskStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set iff an admission slot is currently attributed to this task
    pub concurrency_key: Option<String>,
    /// Key used to re-acquire a slot on resume; survives release
    pub concurrency_group: Option<String>,
    pub progress: Option<TaskProgress>,
    pub error: Option<String>,
}

impl Task {
    /// Create a pending task from a launch request.
    pub fn pending(input: &LaunchInput) -> Self {
        Self {
            id: TaskId::new(),
            session_id: None,
            parent_session_id: input.parent_session_id.clone(),
            parent_message_id: input.parent_message_id.clone(),
            parent_agent: input.parent_agent.clone(),
            parent_model: input.parent_model.clone(),
            description: input.description.clone(),
            prompt: input.prompt.clone(),
            agent: input.agent.clone(),
            model: input.model.clone(),
            status: TaskStatus::Pending,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            concurrency_key: None,
            concurrency_group: Some(input.concurrency_key()),
            progress: None,
            error: None,
        }
    }

    /// Create a task that is already running in an externally created context.
    pub fn tracked(input: &TrackInput, key: &str) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            session_id: Some(input.session_id.clone()),
            parent_session_id: input.parent_session_id.clone(),
            parent_message_id: input.parent_message_id.clone(),
            parent_agent: None,
            parent_model: None,
            description: input.description.clone(),
            prompt: String::new(),
            agent: input.agent.clone(),
            model: None,
            status: TaskStatus::Running,
            queued_at: now,
            started_at: Some(now),
            completed_at: None,
            concurrency_key: Some(key.to_string()),
            concurrency_group: Some(key.to_string()),
            progress: Some(TaskProgress::new(now)),
            error: None,
        }
    }

    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Move to a new status, stamping the matching timestamp.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> DomainResult<()> {
        if !self.can_transition_to(new_status) {
            return Err(DomainError::ValidationFailed(format!(
                "Cannot transition task {} from {} to {}",
                self.id, self.status, new_status
            )));
        }

        let now = Utc::now();
        if new_status == TaskStatus::Running {
            self.started_at = Some(now);
            self.completed_at = None;
            self.error = None;
            self.progress = Some(TaskProgress::new(now));
        } else if new_status.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = new_status;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time spent running so far, or until completion.
    pub fn running_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.started_at.map_or_else(chrono::Duration::zero, |started| {
            self.completed_at.unwrap_or(now) - started
        })
    }

    /// Human-readable run time, e.g. `1m 5s`.
    pub fn duration_label(&self) -> String {
        format_duration(self.running_for(Utc::now()))
    }
}

/// Format a duration as `Xh Ym Zs`, dropping leading zero units.
pub fn format_duration(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Derive a short description from a prompt.
/// Takes the first line, truncates at ~60 chars on a word boundary.
fn generate_description(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or(prompt).trim();
    if first_line.is_empty() {
        return "Background task".to_string();
    }
    let max_len = 60;
    if first_line.chars().count() <= max_len {
        return first_line.to_string();
    }
    let truncated: String = first_line.chars().take(max_len).collect();
    match truncated.rfind(' ') {
        Some(pos) => format!("{}...", &truncated[..pos]),
        None => format!("{truncated}..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch() -> LaunchInput {
        LaunchInput::new("explore", "ses_parent", "Find every caller of the gate")
    }

    #[test]
    fn test_pending_task_from_launch() {
        let task = Task::pending(&launch());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.description, "Find every caller of the gate");
        assert_eq!(task.concurrency_group.as_deref(), Some("explore"));
        assert!(task.concurrency_key.is_none());
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_concurrency_key_prefers_model() {
        let input = launch().with_model(ModelRef::new("anthropic", "claude-opus"));
        assert_eq!(input.concurrency_key(), "anthropic/claude-opus");
        assert_eq!(launch().concurrency_key(), "explore");
    }

    #[test]
    fn test_launch_requires_agent() {
        let mut input = launch();
        input.agent = "  ".to_string();
        assert!(matches!(
            input.validate(),
            Err(DomainError::ValidationFailed(_))
        ));
        assert!(launch().validate().is_ok());
    }

    #[test]
    fn test_task_state_transitions() {
        let mut task = Task::pending(&launch());

        task.transition_to(TaskStatus::Running).unwrap();
        assert!(task.started_at.is_some());
        assert!(task.progress.is_some());

        task.transition_to(TaskStatus::Completed).unwrap();
        assert!(task.completed_at.is_some());
        assert!(task.is_terminal());

        assert!(task.transition_to(TaskStatus::Cancelled).is_err());
    }

    #[test]
    fn test_resume_resets_timing() {
        let mut task = Task::pending(&launch());
        task.transition_to(TaskStatus::Running).unwrap();
        task.transition_to(TaskStatus::Interrupt).unwrap();
        task.error = Some("boom".to_string());

        task.transition_to(TaskStatus::Running).unwrap();
        assert!(task.completed_at.is_none());
        assert!(task.error.is_none());
    }

    #[test]
    fn test_pending_cannot_complete() {
        let task = Task::pending(&launch());
        assert!(!task.can_transition_to(TaskStatus::Completed));
        assert!(task.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn test_stability_counter() {
        let now = Utc::now();
        let mut progress = TaskProgress::new(now);
        progress.observe_message_count(3, now);
        assert_eq!(progress.stable_polls, 0);
        progress.observe_message_count(3, now);
        progress.observe_message_count(3, now);
        assert_eq!(progress.stable_polls, 2);
        progress.observe_message_count(4, now);
        assert_eq!(progress.stable_polls, 0);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::seconds(5)), "5s");
        assert_eq!(format_duration(chrono::Duration::seconds(65)), "1m 5s");
        assert_eq!(format_duration(chrono::Duration::seconds(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_generate_description() {
        assert_eq!(generate_description("Short prompt"), "Short prompt");
        assert_eq!(generate_description("First line\nSecond line"), "First line");
        assert_eq!(generate_description(""), "Background task");

        let long =
            "This is a very long prompt that exceeds sixty characters and should be truncated";
        let description = generate_description(long);
        assert!(description.ends_with("..."));
        assert!(description.len() <= 63);
    }
}
