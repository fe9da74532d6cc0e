//! Execution-context types exchanged with the execution backend.

use serde::{Deserialize, Serialize};

use super::task::ModelRef;

/// Author of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// One part of a transcript message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Reasoning { text: String },
    Tool { name: String },
    ToolResult { name: String, output: String },
    #[serde(other)]
    Other,
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool(name: impl Into<String>) -> Self {
        Self::Tool { name: name.into() }
    }

    /// Whether this part carries output a caller could use.
    pub fn has_output(&self) -> bool {
        match self {
            Self::Text { text } | Self::Reasoning { text } => !text.trim().is_empty(),
            Self::ToolResult { .. } => true,
            Self::Tool { .. } | Self::Other => false,
        }
    }
}

/// Ordered transcript entry of an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
}

impl TranscriptMessage {
    pub fn assistant(parts: Vec<MessagePart>) -> Self {
        Self {
            role: MessageRole::Assistant,
            parts,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            parts: vec![MessagePart::text(text)],
        }
    }

    /// Concatenated text parts, if any.
    pub fn text(&self) -> Option<String> {
        let text = self
            .parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        (!text.trim().is_empty()).then_some(text)
    }
}

/// Summary of what a transcript says about a task's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptSummary {
    pub message_count: usize,
    pub tool_calls: u32,
    pub last_tool: Option<String>,
    pub last_assistant_text: Option<String>,
    pub has_output: bool,
}

impl TranscriptSummary {
    pub fn from_messages(messages: &[TranscriptMessage]) -> Self {
        let mut summary = Self {
            message_count: messages.len(),
            ..Default::default()
        };
        for message in messages.iter().filter(|m| m.role == MessageRole::Assistant) {
            for part in &message.parts {
                if let MessagePart::Tool { name } = part {
                    summary.tool_calls += 1;
                    summary.last_tool = Some(name.clone());
                }
                if part.has_output() {
                    summary.has_output = true;
                }
            }
            if let Some(text) = message.text() {
                summary.last_assistant_text = Some(text);
            }
        }
        summary
    }
}

/// Activity of an execution context as reported by the backend status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionActivity {
    Idle,
    Busy,
}

/// Status of a todo item in an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

/// Todo item reported by an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
}

impl TodoItem {
    pub fn is_open(&self) -> bool {
        matches!(self.status, TodoStatus::Pending | TodoStatus::InProgress)
    }
}

/// Request to create an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRequest {
    pub parent_session_id: String,
    pub title: String,
}

/// Body dispatched to an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptBody {
    pub agent: Option<String>,
    pub model: Option<ModelRef>,
    pub text: String,
    /// Deliver without asking the context to respond
    pub no_reply: bool,
}

impl PromptBody {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            agent: None,
            model: None,
            text: text.into(),
            no_reply: false,
        }
    }
}

/// Context created for a task, passed to the context hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContext {
    pub session_id: String,
    pub parent_session_id: String,
    pub title: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_tools_and_output() {
        let messages = vec![
            TranscriptMessage::user("go"),
            TranscriptMessage::assistant(vec![
                MessagePart::tool("grep"),
                MessagePart::tool("read"),
            ]),
            TranscriptMessage::assistant(vec![MessagePart::text("Found 3 callers")]),
        ];
        let summary = TranscriptSummary::from_messages(&messages);
        assert_eq!(summary.message_count, 3);
        assert_eq!(summary.tool_calls, 2);
        assert_eq!(summary.last_tool.as_deref(), Some("read"));
        assert_eq!(summary.last_assistant_text.as_deref(), Some("Found 3 callers"));
        assert!(summary.has_output);
    }

    #[test]
    fn test_user_text_is_not_output() {
        let messages = vec![
            TranscriptMessage::user("go"),
            TranscriptMessage::assistant(vec![MessagePart::tool("grep")]),
        ];
        assert!(!TranscriptSummary::from_messages(&messages).has_output);
    }

    #[test]
    fn test_blank_text_is_not_output() {
        assert!(!MessagePart::text("   ").has_output());
        assert!(MessagePart::Reasoning { text: "hm".into() }.has_output());
    }

    #[test]
    fn test_unknown_part_decodes_as_other() {
        let part: MessagePart = serde_json::from_str(r#"{"type":"snapshot","id":"x"}"#).unwrap();
        assert_eq!(part, MessagePart::Other);
    }
}
