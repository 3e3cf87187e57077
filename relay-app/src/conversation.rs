//! Durable conversation and turn records.

use chrono::{DateTime, Utc};
use relay_channels::ChannelKind;
use relay_llm::{ChatMessage, Role};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const UNTITLED_CONVERSATION: &str = "New conversation";
const TITLE_MAX_CHARS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    /// Provider-issued thread id, or a locally synthesized one. Unique.
    pub thread_handle: String,
    pub channel: ChannelKind,
    pub owner_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Derived from recency; there is no stored status column.
    pub fn status(
        &self,
        now: DateTime<Utc>,
        active_window: chrono::Duration,
    ) -> ConversationStatus {
        if now.signed_duration_since(self.last_message_at) <= active_window {
            ConversationStatus::Active
        } else {
            ConversationStatus::Archived
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub thread_handle: String,
    pub channel: ChannelKind,
    pub owner_id: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    /// Written by an operator on the assistant's behalf.
    Admin,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::Admin => "admin",
        }
    }

    /// Providers only know user and assistant; operator turns speak as the assistant.
    pub fn provider_role(&self) -> Role {
        match self {
            TurnRole::User => Role::User,
            TurnRole::Assistant | TurnRole::Admin => Role::Assistant,
        }
    }
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(TurnRole::User),
            "assistant" => Ok(TurnRole::Assistant),
            "admin" => Ok(TurnRole::Admin),
            other => Err(format!("unknown turn role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub id: i64,
    pub conversation_id: i64,
    pub role: TurnRole,
    pub content: String,
    pub image_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set for an assistant turn created empty and not yet patched.
    pub pending: bool,
}

impl Turn {
    /// Pending assistant placeholders carry no content yet and are left out.
    pub fn to_chat_message(&self) -> Option<ChatMessage> {
        if self.pending {
            return None;
        }
        let content = match (self.content.trim().is_empty(), self.image_ref.as_deref()) {
            (false, _) => self.content.clone(),
            (true, Some(image_ref)) => format!("[image: {image_ref}]"),
            (true, None) => return None,
        };
        Some(ChatMessage::new(self.role.provider_role(), content))
    }
}

pub fn history_view(turns: &[Turn]) -> Vec<ChatMessage> {
    turns.iter().filter_map(Turn::to_chat_message).collect()
}

/// First characters of the triggering message, or a placeholder for empty or
/// image-only messages.
pub fn conversation_title(first_message: &str) -> String {
    let collapsed = first_message.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return UNTITLED_CONVERSATION.to_string();
    }
    if collapsed.chars().count() <= TITLE_MAX_CHARS {
        return collapsed;
    }
    let truncated: String = collapsed.chars().take(TITLE_MAX_CHARS).collect();
    format!("{}...", truncated.trim_end())
}
