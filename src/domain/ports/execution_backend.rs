//! Execution backend port - the collaborator that actually runs work.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    ContextRequest, PromptBody, SessionActivity, TodoItem, TranscriptMessage,
};

/// Trait for execution backend implementations.
///
/// Every call is a suspension point and may fail; the engine tolerates
/// failures at each call site and never treats them as fatal.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Create an execution context under a parent session, returning its id.
    async fn create_context(&self, request: ContextRequest) -> DomainResult<String>;

    /// Deliver a prompt to a context.
    ///
    /// Resolves when the backend accepted or rejected the body, not when
    /// the work it describes is finished.
    async fn dispatch(&self, context_id: &str, body: PromptBody) -> DomainResult<()>;

    /// Abort a context. Best-effort.
    async fn abort(&self, context_id: &str) -> DomainResult<()>;

    /// Ordered transcript of a context.
    async fn transcript(&self, context_id: &str) -> DomainResult<Vec<TranscriptMessage>>;

    /// Activity of every context the backend knows about.
    ///
    /// A context missing from the map is neither known idle nor known busy.
    async fn status_snapshot(&self) -> DomainResult<HashMap<String, SessionActivity>>;

    /// Todo items of a context, used for the completeness gate.
    async fn pending_items(&self, context_id: &str) -> DomainResult<Vec<TodoItem>>;
}
