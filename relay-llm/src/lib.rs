//! Provider clients for relay.
//!
//! Two protocol families live here: stateless chat completion (OpenAI, DeepSeek,
//! Anthropic) and stateful assistant runs. Both sit behind the traits in `backend`
//! so the orchestration layer can be exercised with scripted fakes.

mod anthropic;
mod assistants;
mod backend;
mod client;
mod error;
mod normalize;
mod openai;
mod sse;
mod types;

pub use assistants::AssistantsClient;
pub use backend::{
    AssistantBackend, ChatBackend, RunEvent, RunEventStream, RunInfo, RunRequest, RunStatus,
    TextStream, ThreadMessage,
};
pub use client::LlmClient;
pub use error::{LlmError, Result};
pub use normalize::{PLACEHOLDER_USER_GREETING, normalize};
pub use types::{
    ChatMessage, HistoryProfile, Protocol, ProviderKind, Role, StreamChunk, Usage,
};
