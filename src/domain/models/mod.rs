pub mod config;
pub mod event;
pub mod notice;
pub mod session;
pub mod task;

pub use config::{BackgroundTaskConfig, Config, LoggingConfig};
pub use event::BackendEvent;
pub use notice::{Notice, NoticeVariant};
pub use session::{
    ContextRequest, CreatedContext, MessagePart, MessageRole, PromptBody, SessionActivity,
    TodoItem, TodoStatus, TranscriptMessage, TranscriptSummary,
};
pub use task::{
    format_duration, CancelOptions, LaunchInput, ModelRef, ResumeInput, Task, TaskId,
    TaskProgress, TaskStatus, TrackInput,
};
