//! Provider capability interfaces.
//!
//! Chat-completion providers stream text fragments for a full history. Assistant-run
//! providers keep history server-side in a thread and generate through runs.

use crate::error::Result;
use crate::types::ChatMessage;
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;
pub type RunEventStream = Pin<Box<dyn Stream<Item = Result<RunEvent>> + Send>>;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Ordered, finite sequence of text fragments.
    async fn stream_chat(&self, model: &str, messages: &[ChatMessage]) -> Result<TextStream>;

    async fn complete_chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String>;
}

#[async_trait]
pub trait AssistantBackend: Send + Sync {
    async fn create_thread(&self) -> Result<String>;

    /// `Ok(false)` when the provider no longer knows the thread.
    async fn thread_exists(&self, thread_id: &str) -> Result<bool>;

    async fn create_thread_message(&self, thread_id: &str, content: &str) -> Result<String>;

    async fn latest_run(&self, thread_id: &str) -> Result<Option<RunInfo>>;

    async fn create_run(&self, thread_id: &str, request: &RunRequest) -> Result<RunEventStream>;

    async fn get_run_status(&self, thread_id: &str, run_id: &str) -> Result<RunStatus>;

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<()>;

    async fn latest_message(&self, thread_id: &str) -> Result<Option<ThreadMessage>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub assistant_id: String,
    pub model: Option<String>,
    pub instructions: Option<String>,
    pub additional_instructions: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled
                | RunStatus::Failed
                | RunStatus::Completed
                | RunStatus::Incomplete
                | RunStatus::Expired
        )
    }

    /// Still generating or waiting to; a new run must not start until this one ends.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Queued | RunStatus::InProgress | RunStatus::RequiresAction
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub id: String,
    pub status: RunStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMessage {
    pub id: String,
    pub role: String,
    pub text: String,
}

impl ThreadMessage {
    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Created { run_id: String },
    TextDelta { text: String },
    Completed,
    /// Terminal non-success status reported inside the stream.
    Ended {
        status: RunStatus,
        reason: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_classification() {
        assert!(RunStatus::Queued.is_active());
        assert!(RunStatus::RequiresAction.is_active());
        assert!(!RunStatus::Cancelling.is_active());
        assert!(!RunStatus::Cancelling.is_terminal());
        for status in [
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Expired,
            RunStatus::Incomplete,
        ] {
            assert!(status.is_terminal(), "{status} should be terminal");
            assert!(!status.is_active());
        }
    }

    #[test]
    fn run_status_uses_provider_spelling() {
        let parsed: RunStatus = serde_json::from_str("\"in_progress\"").expect("parse status");
        assert_eq!(parsed, RunStatus::InProgress);
        assert_eq!(parsed.to_string(), "in_progress");
    }
}
