//! Backend events, decoded at the ingress boundary.
//!
//! The execution backend publishes loosely shaped `{type, properties}`
//! payloads. They are turned into a closed set of variants here so the
//! core never inspects raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::errors::DomainResult;

/// Event emitted by the execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    /// A message part changed; `tool` is set for tool invocations.
    PartUpdated {
        session_id: String,
        tool: Option<String>,
    },
    /// A message in the session was created or changed.
    MessageUpdated { session_id: String },
    /// The session stopped generating.
    SessionIdle { session_id: String },
    /// The session was deleted.
    SessionDeleted { session_id: String },
    /// Anything the engine does not act on.
    Unknown { kind: String },
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    properties: Value,
}

#[derive(Deserialize)]
struct SessionProps {
    #[serde(rename = "sessionID")]
    session_id: String,
}

#[derive(Deserialize)]
struct InfoProps {
    info: SessionInfo,
}

#[derive(Deserialize)]
struct SessionInfo {
    #[serde(alias = "sessionID")]
    id: String,
}

#[derive(Deserialize)]
struct MessageInfoProps {
    info: MessageInfo,
}

#[derive(Deserialize)]
struct MessageInfo {
    #[serde(rename = "sessionID")]
    session_id: String,
}

#[derive(Deserialize)]
struct PartProps {
    part: RawPart,
}

#[derive(Deserialize)]
struct RawPart {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    tool: Option<String>,
}

impl BackendEvent {
    /// Decode a raw backend payload.
    ///
    /// Unrecognized event types decode to [`BackendEvent::Unknown`];
    /// recognized types with malformed properties are an error.
    pub fn from_json(value: Value) -> DomainResult<Self> {
        let raw: RawEvent = serde_json::from_value(value)?;
        let event = match raw.kind.as_str() {
            "session.idle" => {
                let props: SessionProps = serde_json::from_value(raw.properties)?;
                Self::SessionIdle {
                    session_id: props.session_id,
                }
            }
            "session.deleted" => {
                let props: InfoProps = serde_json::from_value(raw.properties)?;
                Self::SessionDeleted {
                    session_id: props.info.id,
                }
            }
            "message.updated" => {
                let props: MessageInfoProps = serde_json::from_value(raw.properties)?;
                Self::MessageUpdated {
                    session_id: props.info.session_id,
                }
            }
            "message.part.updated" => {
                let props: PartProps = serde_json::from_value(raw.properties)?;
                let tool = (props.part.kind == "tool")
                    .then(|| props.part.tool.unwrap_or_else(|| "unknown".to_string()));
                Self::PartUpdated {
                    session_id: props.part.session_id,
                    tool,
                }
            }
            _ => Self::Unknown { kind: raw.kind },
        };
        Ok(event)
    }

    /// Session the event refers to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::PartUpdated { session_id, .. }
            | Self::MessageUpdated { session_id }
            | Self::SessionIdle { session_id }
            | Self::SessionDeleted { session_id } => Some(session_id),
            Self::Unknown { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_session_idle() {
        let event = BackendEvent::from_json(json!({
            "type": "session.idle",
            "properties": { "sessionID": "ses_1" }
        }))
        .unwrap();
        assert_eq!(
            event,
            BackendEvent::SessionIdle {
                session_id: "ses_1".to_string()
            }
        );
    }

    #[test]
    fn test_decode_tool_part() {
        let event = BackendEvent::from_json(json!({
            "type": "message.part.updated",
            "properties": { "part": { "sessionID": "ses_1", "type": "tool", "tool": "grep" } }
        }))
        .unwrap();
        assert_eq!(
            event,
            BackendEvent::PartUpdated {
                session_id: "ses_1".to_string(),
                tool: Some("grep".to_string())
            }
        );
    }

    #[test]
    fn test_decode_text_part_has_no_tool() {
        let event = BackendEvent::from_json(json!({
            "type": "message.part.updated",
            "properties": { "part": { "sessionID": "ses_1", "type": "text" } }
        }))
        .unwrap();
        assert!(matches!(event, BackendEvent::PartUpdated { tool: None, .. }));
    }

    #[test]
    fn test_decode_session_deleted() {
        let event = BackendEvent::from_json(json!({
            "type": "session.deleted",
            "properties": { "info": { "id": "ses_9" } }
        }))
        .unwrap();
        assert_eq!(event.session_id(), Some("ses_9"));
    }

    #[test]
    fn test_unknown_event_type() {
        let event = BackendEvent::from_json(json!({ "type": "tui.toast.show" })).unwrap();
        assert_eq!(
            event,
            BackendEvent::Unknown {
                kind: "tui.toast.show".to_string()
            }
        );
        assert!(event.session_id().is_none());
    }

    #[test]
    fn test_malformed_known_event_is_error() {
        let result = BackendEvent::from_json(json!({
            "type": "session.idle",
            "properties": {}
        }));
        assert!(result.is_err());
    }
}
