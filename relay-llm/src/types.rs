use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamChunk {
    Delta { content: String },
    Done { usage: Usage },
}

/// Configured LLM backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    DeepSeek,
    /// Stateful assistant-run provider (server-side threads and runs).
    Assistant,
}

/// Wire protocol a provider family speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    ChatCompletion,
    AssistantRun,
}

/// Constraint set applied to history before it is sent to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryProfile {
    Passthrough,
    /// No leading assistant turn, strict user/assistant alternation.
    StrictAlternation,
}

impl ProviderKind {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProviderKind::Assistant => Protocol::AssistantRun,
            ProviderKind::OpenAi | ProviderKind::Anthropic | ProviderKind::DeepSeek => {
                Protocol::ChatCompletion
            }
        }
    }

    pub fn history_profile(&self, model: &str) -> HistoryProfile {
        match self {
            ProviderKind::Anthropic => HistoryProfile::StrictAlternation,
            ProviderKind::DeepSeek if model.to_ascii_lowercase().contains("reasoner") => {
                HistoryProfile::StrictAlternation
            }
            _ => HistoryProfile::Passthrough,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Assistant => "assistant",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = crate::error::LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "deepseek" => Ok(ProviderKind::DeepSeek),
            "assistant" | "assistants" => Ok(ProviderKind::Assistant),
            other => Err(crate::error::LlmError::InvalidInput(format!(
                "unknown provider: {other}"
            ))),
        }
    }
}
