//! Mock execution backend for testing and simulation.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, RwLock};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    BackendEvent, ContextRequest, CreatedContext, MessagePart, Notice, PromptBody,
    SessionActivity, TodoItem, TranscriptMessage,
};
use crate::domain::ports::{ContextHook, ExecutionBackend, NoticeSink};

/// How a context created by the mock behaves once it receives a prompt.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Reply appended to the transcript when the work finishes
    pub output: String,
    /// Simulated work time; `None` leaves the context busy until told otherwise
    pub finish_after: Option<Duration>,
    /// Publish `session.idle` when the work finishes
    pub emit_idle: bool,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            output: "Mock task completed successfully.".to_string(),
            finish_after: None,
            emit_idle: true,
        }
    }
}

impl MockScript {
    pub fn finishing_after(duration: Duration) -> Self {
        Self {
            finish_after: Some(duration),
            ..Default::default()
        }
    }

    pub fn silent(mut self) -> Self {
        self.emit_idle = false;
        self
    }
}

#[derive(Default)]
struct MockState {
    created: Vec<ContextRequest>,
    owned: HashSet<String>,
    dispatches: Vec<(String, PromptBody)>,
    aborted: Vec<String>,
    transcripts: HashMap<String, Vec<TranscriptMessage>>,
    activity: HashMap<String, SessionActivity>,
    todos: HashMap<String, Vec<TodoItem>>,
    dispatch_errors: HashMap<String, String>,
    blocked: HashSet<String>,
    create_error: Option<String>,
    default_dispatch_error: Option<String>,
    transcript_error: Option<String>,
    status_error: Option<String>,
}

/// Scriptable in-memory backend.
///
/// Contexts it creates follow a [`MockScript`]; everything else can be
/// driven directly through the setters. Every call is recorded.
pub struct MockBackend {
    state: Arc<RwLock<MockState>>,
    script: MockScript,
    events: broadcast::Sender<BackendEvent>,
    unblocked: Arc<Notify>,
    next_id: AtomicU64,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_script(MockScript::default())
    }

    pub fn with_script(script: MockScript) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Arc::new(RwLock::new(MockState::default())),
            script,
            events,
            unblocked: Arc::new(Notify::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Receive the events this backend publishes.
    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    pub async fn set_transcript(&self, session_id: &str, messages: Vec<TranscriptMessage>) {
        let mut state = self.state.write().await;
        state.transcripts.insert(session_id.to_string(), messages);
    }

    pub async fn set_activity(&self, session_id: &str, activity: SessionActivity) {
        let mut state = self.state.write().await;
        state.activity.insert(session_id.to_string(), activity);
    }

    pub async fn set_todos(&self, session_id: &str, todos: Vec<TodoItem>) {
        let mut state = self.state.write().await;
        state.todos.insert(session_id.to_string(), todos);
    }

    /// Make `create_context` fail with `message`.
    pub async fn fail_create(&self, message: impl Into<String>) {
        self.state.write().await.create_error = Some(message.into());
    }

    /// Make dispatches to `session_id` fail with `message`.
    pub async fn fail_dispatch_to(&self, session_id: &str, message: impl Into<String>) {
        let mut state = self.state.write().await;
        state
            .dispatch_errors
            .insert(session_id.to_string(), message.into());
    }

    /// Make every dispatch to a context this backend created fail.
    pub async fn fail_task_dispatches(&self, message: impl Into<String>) {
        self.state.write().await.default_dispatch_error = Some(message.into());
    }

    pub async fn fail_transcripts(&self, message: impl Into<String>) {
        self.state.write().await.transcript_error = Some(message.into());
    }

    pub async fn fail_status(&self, message: impl Into<String>) {
        self.state.write().await.status_error = Some(message.into());
    }

    /// Hold dispatches to `session_id` until [`MockBackend::unblock_dispatch_to`].
    pub async fn block_dispatch_to(&self, session_id: &str) {
        self.state.write().await.blocked.insert(session_id.to_string());
    }

    pub async fn unblock_dispatch_to(&self, session_id: &str) {
        self.state.write().await.blocked.remove(session_id);
        self.unblocked.notify_waiters();
    }

    /// Finish a context's work: append the reply, mark it idle and
    /// optionally publish `session.idle`.
    pub async fn finish(&self, session_id: &str, output: &str, emit_idle: bool) {
        finish_session(&self.state, &self.events, session_id, output, emit_idle).await;
    }

    pub async fn created(&self) -> Vec<ContextRequest> {
        self.state.read().await.created.clone()
    }

    pub async fn dispatches(&self) -> Vec<(String, PromptBody)> {
        self.state.read().await.dispatches.clone()
    }

    pub async fn dispatches_to(&self, session_id: &str) -> Vec<PromptBody> {
        self.state
            .read()
            .await
            .dispatches
            .iter()
            .filter(|(target, _)| target == session_id)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub async fn aborted(&self) -> Vec<String> {
        self.state.read().await.aborted.clone()
    }

    async fn wait_until_unblocked(&self, session_id: &str) {
        loop {
            let notified = self.unblocked.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.state.read().await.blocked.contains(session_id) {
                return;
            }
            notified.await;
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn finish_session(
    state: &RwLock<MockState>,
    events: &broadcast::Sender<BackendEvent>,
    session_id: &str,
    output: &str,
    emit_idle: bool,
) {
    {
        let mut state = state.write().await;
        state
            .transcripts
            .entry(session_id.to_string())
            .or_default()
            .push(TranscriptMessage::assistant(vec![MessagePart::text(output)]));
        state
            .activity
            .insert(session_id.to_string(), SessionActivity::Idle);
    }
    if emit_idle {
        let _ = events.send(BackendEvent::SessionIdle {
            session_id: session_id.to_string(),
        });
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    async fn create_context(&self, request: ContextRequest) -> DomainResult<String> {
        let mut state = self.state.write().await;
        if let Some(message) = &state.create_error {
            return Err(DomainError::Backend(message.clone()));
        }
        let session_id = format!("ses_mock_{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        state.created.push(request);
        state.owned.insert(session_id.clone());
        state
            .activity
            .insert(session_id.clone(), SessionActivity::Busy);
        Ok(session_id)
    }

    async fn dispatch(&self, context_id: &str, body: PromptBody) -> DomainResult<()> {
        let owned = {
            let mut state = self.state.write().await;
            state.dispatches.push((context_id.to_string(), body.clone()));
            if let Some(message) = state.dispatch_errors.get(context_id) {
                return Err(DomainError::DispatchFailed {
                    message: message.clone(),
                });
            }
            let owned = state.owned.contains(context_id);
            if owned {
                if let Some(message) = &state.default_dispatch_error {
                    return Err(DomainError::DispatchFailed {
                        message: message.clone(),
                    });
                }
                state
                    .transcripts
                    .entry(context_id.to_string())
                    .or_default()
                    .push(TranscriptMessage::user(body.text.clone()));
                state
                    .activity
                    .insert(context_id.to_string(), SessionActivity::Busy);
            }
            owned
        };

        self.wait_until_unblocked(context_id).await;

        if owned {
            if let Some(after) = self.script.finish_after {
                let state = self.state.clone();
                let events = self.events.clone();
                let session_id = context_id.to_string();
                let output = self.script.output.clone();
                let emit_idle = self.script.emit_idle;
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    finish_session(&state, &events, &session_id, &output, emit_idle).await;
                });
            }
        }
        Ok(())
    }

    async fn abort(&self, context_id: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        state.aborted.push(context_id.to_string());
        if state.owned.contains(context_id) {
            state
                .activity
                .insert(context_id.to_string(), SessionActivity::Idle);
        }
        Ok(())
    }

    async fn transcript(&self, context_id: &str) -> DomainResult<Vec<TranscriptMessage>> {
        let state = self.state.read().await;
        if let Some(message) = &state.transcript_error {
            return Err(DomainError::Backend(message.clone()));
        }
        Ok(state
            .transcripts
            .get(context_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn status_snapshot(&self) -> DomainResult<HashMap<String, SessionActivity>> {
        let state = self.state.read().await;
        if let Some(message) = &state.status_error {
            return Err(DomainError::Backend(message.clone()));
        }
        Ok(state.activity.clone())
    }

    async fn pending_items(&self, context_id: &str) -> DomainResult<Vec<TodoItem>> {
        Ok(self
            .state
            .read()
            .await
            .todos
            .get(context_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Notice sink that keeps every notice it is shown.
#[derive(Default)]
pub struct RecordingNoticeSink {
    notices: RwLock<Vec<Notice>>,
}

impl RecordingNoticeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notices(&self) -> Vec<Notice> {
        self.notices.read().await.clone()
    }
}

#[async_trait]
impl NoticeSink for RecordingNoticeSink {
    async fn show(&self, notice: Notice) -> DomainResult<()> {
        self.notices.write().await.push(notice);
        Ok(())
    }
}

/// Context hook that records contexts, optionally taking its time.
#[derive(Default)]
pub struct RecordingContextHook {
    contexts: RwLock<Vec<CreatedContext>>,
    delay: Option<Duration>,
}

impl RecordingContextHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            contexts: RwLock::new(Vec::new()),
            delay: Some(delay),
        }
    }

    pub async fn contexts(&self) -> Vec<CreatedContext> {
        self.contexts.read().await.clone()
    }
}

#[async_trait]
impl ContextHook for RecordingContextHook {
    async fn on_context_created(&self, context: &CreatedContext) -> DomainResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.contexts.write().await.push(context.clone());
        Ok(())
    }
}
