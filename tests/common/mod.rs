//! Common test utilities for integration tests
//!
//! Provides a manager wired to the in-memory mock backend with timings short
//! enough for tests, plus polling helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use taskherd::adapters::backends::{MockBackend, MockScript, RecordingNoticeSink};
use taskherd::domain::models::{BackgroundTaskConfig, LaunchInput, Task, TaskStatus};
use taskherd::BackgroundManager;

pub const PARENT: &str = "ses_parent";

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
/// Call this at the beginning of tests that need logging.
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Wait for a condition to be true with timeout
///
/// Polls the predicate every 10ms until it returns true or timeout is reached.
pub async fn wait_for<F>(mut predicate: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    predicate()
}

/// Like [`wait_for`], for conditions that have to await to be checked.
pub async fn wait_for_async<F, Fut>(mut predicate: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    predicate().await
}

/// Configuration with every timer short and the slow detectors out of the way.
pub fn fast_config(limit: usize) -> BackgroundTaskConfig {
    BackgroundTaskConfig {
        default_concurrency: Some(limit),
        stale_timeout_ms: 600_000,
        min_runtime_before_stale_ms: 600_000,
        min_idle_time_ms: 0,
        pending_ttl_ms: 600_000,
        running_ttl_ms: 600_000,
        task_retention_ms: 600_000,
        poll_interval_ms: 25,
        stability_polls: 3,
        min_stability_time_ms: 600_000,
        context_hook_timeout_ms: 200,
        ..Default::default()
    }
}

/// A manager, its mock backend and a recording notice sink.
pub struct Harness {
    pub manager: BackgroundManager,
    pub backend: Arc<MockBackend>,
    pub sink: Arc<RecordingNoticeSink>,
}

impl Harness {
    pub fn new(config: BackgroundTaskConfig) -> Self {
        Self::with_script(config, MockScript::default())
    }

    pub fn with_script(config: BackgroundTaskConfig, script: MockScript) -> Self {
        let backend = Arc::new(MockBackend::with_script(script));
        let sink = Arc::new(RecordingNoticeSink::new());
        let manager = BackgroundManager::builder(config, backend.clone())
            .notice_sink(sink.clone())
            .build();
        Self {
            manager,
            backend,
            sink,
        }
    }

    /// Forward every backend event to the manager, as a host would.
    pub fn pump_events(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.manager.clone();
        let mut events = self.backend.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                manager.handle_event(event).await;
            }
        })
    }

    pub async fn launch(&self, agent: &str, prompt: &str) -> Task {
        self.manager
            .launch(LaunchInput::new(agent, PARENT, prompt).with_parent_message("msg_1"))
            .await
            .expect("launch should succeed")
    }

    pub fn status(&self, task: &Task) -> Option<TaskStatus> {
        self.manager.get_task(task.id).map(|task| task.status)
    }

    pub fn session_of(&self, task: &Task) -> Option<String> {
        self.manager.get_task(task.id).and_then(|task| task.session_id)
    }

    /// Wait until `task` is running and return its execution context.
    pub async fn wait_running(&self, task: &Task) -> String {
        assert!(
            wait_for(|| self.status(task) == Some(TaskStatus::Running), 2_000).await,
            "task {} never started",
            task.id
        );
        self.session_of(task).expect("running task has a session")
    }

    pub async fn wait_status(&self, task: &Task, status: TaskStatus) -> bool {
        wait_for(|| self.status(task) == Some(status), 2_000).await
    }

    /// Bodies the manager delivered to the parent session.
    pub async fn parent_messages(&self) -> Vec<String> {
        self.backend
            .dispatches_to(PARENT)
            .await
            .into_iter()
            .map(|body| body.text)
            .collect()
    }

    /// Wait until the parent has received `count` messages.
    pub async fn wait_parent_messages(&self, count: usize) -> Vec<String> {
        let start = std::time::Instant::now();
        loop {
            let messages = self.parent_messages().await;
            if messages.len() >= count || start.elapsed() > Duration::from_secs(2) {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
