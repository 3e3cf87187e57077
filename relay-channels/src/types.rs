use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(SenderId);
id_newtype!(ThreadHandle);

/// Channel a conversation is bound to. Fixed for the lifetime of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Web,
    Telegram,
    WhatsApp,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Web => "web",
            ChannelKind::Telegram => "telegram",
            ChannelKind::WhatsApp => "whatsapp",
        }
    }

    /// Messaging channels keep no client-side storage, so the client can never hand back
    /// a thread handle of its own.
    pub fn has_client_storage(&self) -> bool {
        matches!(self, ChannelKind::Web)
    }

    /// Channels that render partial output as it arrives.
    pub fn streams_deltas(&self) -> bool {
        matches!(self, ChannelKind::Web)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" | "webchat" => Ok(ChannelKind::Web),
            "telegram" => Ok(ChannelKind::Telegram),
            "whatsapp" => Ok(ChannelKind::WhatsApp),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub channel: ChannelKind,
    /// Stable identity of the person writing; owns the conversations created for them.
    pub sender_id: SenderId,
    /// Address replies go to. Also keys the interactive session binding.
    pub session_id: String,
    /// Thread handle the client kept from an earlier exchange, if any.
    #[serde(default)]
    pub thread_hint: Option<ThreadHandle>,
    pub content: String,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        channel: ChannelKind,
        sender_id: impl Into<SenderId>,
        session_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: MessageId::new(uuid::Uuid::new_v4().to_string()),
            channel,
            sender_id: sender_id.into(),
            session_id: session_id.into(),
            thread_hint: None,
            content: content.into(),
            image_ref: None,
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    /// Logical id shared by every delta and the final message of one reply.
    #[serde(default)]
    pub message_ref: Option<String>,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
    /// Thread handle the client may keep for later messages.
    #[serde(default)]
    pub thread_handle: Option<ThreadHandle>,
    #[serde(default)]
    pub is_error: bool,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}
