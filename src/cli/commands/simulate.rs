//! Drive the engine end to end against the in-memory mock backend.

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{presets, Attribute, Cell, ContentArrangement, Table};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::load_config;
use crate::adapters::backends::{MockBackend, MockScript, RecordingNoticeSink};
use crate::cli::output::{output, truncate, CommandOutput};
use crate::domain::models::{LaunchInput, ModelRef, Task};
use crate::services::BackgroundManager;

const PARENT_SESSION: &str = "ses_cli";

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of tasks to launch
    #[arg(short, long, default_value_t = 3)]
    pub tasks: usize,

    /// Agent the tasks run as
    #[arg(short, long, default_value = "explore")]
    pub agent: String,

    /// Route tasks by model instead of agent (`provider/model`)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Override the default concurrency limit (0 = unlimited)
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Simulated work time per task in milliseconds
    #[arg(long, default_value_t = 500)]
    pub work_ms: u64,

    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 120)]
    pub timeout_secs: u64,

    /// Read configuration from this file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, serde::Serialize)]
pub struct SimulatedTask {
    pub id: String,
    pub description: String,
    pub status: String,
    pub session_id: Option<String>,
    pub duration: String,
    pub error: Option<String>,
}

impl From<&Task> for SimulatedTask {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            description: task.description.clone(),
            status: task.status.as_str().to_string(),
            session_id: task.session_id.clone(),
            duration: task.duration_label(),
            error: task.error.clone(),
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct SimulateOutput {
    pub concurrency_key: String,
    pub limit: String,
    pub tasks: Vec<SimulatedTask>,
    pub parent_messages: usize,
    pub notices: usize,
    pub timed_out: bool,
}

impl CommandOutput for SimulateOutput {
    fn to_human(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("ID").add_attribute(Attribute::Bold),
                Cell::new("Description").add_attribute(Attribute::Bold),
                Cell::new("Status").add_attribute(Attribute::Bold),
                Cell::new("Session").add_attribute(Attribute::Bold),
                Cell::new("Duration").add_attribute(Attribute::Bold),
            ]);

        for task in &self.tasks {
            table.add_row(vec![
                Cell::new(&task.id),
                Cell::new(truncate(&task.description, 40)),
                Cell::new(&task.status),
                Cell::new(task.session_id.as_deref().unwrap_or("-")),
                Cell::new(&task.duration),
            ]);
        }

        let mut lines = vec![
            format!("Concurrency key: {} (limit {})", self.concurrency_key, self.limit),
            table.to_string(),
            format!(
                "Parent messages: {}  Notices: {}",
                self.parent_messages, self.notices
            ),
        ];
        if self.timed_out {
            lines.push("Timed out before every task finished.".to_string());
        }
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn execute(args: SimulateArgs, json: bool) -> Result<()> {
    let mut config = load_config(args.config.as_deref())
        .context("Failed to load configuration")?
        .background;
    if let Some(limit) = args.limit {
        config.default_concurrency = Some(limit);
    }

    let model = args.model.as_deref().map(parse_model).transpose()?;

    let backend = Arc::new(MockBackend::with_script(MockScript::finishing_after(
        Duration::from_millis(args.work_ms),
    )));
    let sink = Arc::new(RecordingNoticeSink::new());
    let manager = BackgroundManager::builder(config, backend.clone())
        .notice_sink(sink.clone())
        .build();

    let pump = {
        let manager = manager.clone();
        let mut events = backend.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => manager.handle_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event pump lagged behind the backend");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let mut launched = Vec::with_capacity(args.tasks);
    for index in 1..=args.tasks {
        let mut input = LaunchInput::new(
            args.agent.clone(),
            PARENT_SESSION,
            format!("Simulated task {index}"),
        )
        .with_parent_message(format!("msg_{index}"));
        if let Some(model) = &model {
            input = input.with_model(model.clone());
        }
        let task = manager.launch(input).await?;
        debug!(task_id = %task.id, "Launched simulated task");
        launched.push(task);
    }

    let concurrency_key = launched
        .first()
        .and_then(|task| task.concurrency_group.clone())
        .unwrap_or_else(|| args.agent.clone());
    let limit = manager.gate().limit(&concurrency_key).to_string();
    info!(tasks = args.tasks, key = %concurrency_key, %limit, "Simulation started");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    let mut timed_out = false;
    while manager.pending_count(PARENT_SESSION) > 0 {
        if tokio::time::Instant::now() >= deadline {
            timed_out = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    manager.flush_notifications(PARENT_SESSION).await;

    let tasks = launched
        .iter()
        .map(|task| manager.get_task(task.id).unwrap_or_else(|| task.clone()))
        .map(|task| SimulatedTask::from(&task))
        .collect();
    let result = SimulateOutput {
        concurrency_key,
        limit,
        tasks,
        parent_messages: backend.dispatches_to(PARENT_SESSION).await.len(),
        notices: sink.notices().await.len(),
        timed_out,
    };

    manager.shutdown().await;
    pump.abort();

    output(&result, json);
    Ok(())
}

fn parse_model(value: &str) -> Result<ModelRef> {
    let (provider, model) = value
        .split_once('/')
        .filter(|(provider, model)| !provider.is_empty() && !model.is_empty())
        .with_context(|| format!("Model must look like provider/model, got '{value}'"))?;
    Ok(ModelRef::new(provider, model))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model() {
        let model = parse_model("anthropic/claude-sonnet").unwrap();
        assert_eq!(model.key(), "anthropic/claude-sonnet");
        assert!(parse_model("no-slash").is_err());
        assert!(parse_model("/missing-provider").is_err());
    }

    #[test]
    fn test_human_output_lists_tasks() {
        let out = SimulateOutput {
            concurrency_key: "explore".to_string(),
            limit: "2".to_string(),
            tasks: vec![SimulatedTask {
                id: "bg_1234".to_string(),
                description: "Simulated task 1".to_string(),
                status: "completed".to_string(),
                session_id: Some("ses_mock_1".to_string()),
                duration: "1s".to_string(),
                error: None,
            }],
            parent_messages: 1,
            notices: 2,
            timed_out: false,
        };
        let text = out.to_human();
        assert!(text.contains("Concurrency key: explore (limit 2)"));
        assert!(text.contains("bg_1234"));
        assert!(text.contains("Parent messages: 1  Notices: 2"));
        assert!(!text.contains("Timed out"));
    }
}
