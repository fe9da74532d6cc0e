//! Optional side-effect ports.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{CreatedContext, Notice};

/// Receives toast-style notices. Failures are logged and ignored.
#[async_trait]
pub trait NoticeSink: Send + Sync {
    async fn show(&self, notice: Notice) -> DomainResult<()>;
}

/// Invoked once for every execution context the engine creates,
/// e.g. to open a terminal pane following the new context.
#[async_trait]
pub trait ContextHook: Send + Sync {
    async fn on_context_created(&self, context: &CreatedContext) -> DomainResult<()>;
}
