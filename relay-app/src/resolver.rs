//! Thread/conversation resolver.
//!
//! Maps a channel identity to the durable conversation a message belongs to. Candidate
//! sources are tried in priority order; the first one that passes validation wins and a
//! new conversation is created when none does.

use crate::conversation::{Conversation, NewConversation, conversation_title};
use crate::session::SessionBindings;
use crate::store::{ConversationStore, StoreError};
use relay_channels::ChannelKind;
use relay_llm::{AssistantBackend, LlmError};
use std::sync::Arc;

const HANDLE_IDENTITY_MAX_CHARS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    /// Handle bound to the current interactive session.
    Session,
    /// Handle the client kept in its own storage.
    ClientHint,
    /// Owner's most recent conversation on a channel without client storage.
    LatestOnChannel,
    Created,
}

impl ResolvedVia {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedVia::Session => "session",
            ResolvedVia::ClientHint => "client_hint",
            ResolvedVia::LatestOnChannel => "latest_on_channel",
            ResolvedVia::Created => "created",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolveRequest<'a> {
    pub channel: ChannelKind,
    pub owner_id: &'a str,
    pub session_key: &'a str,
    pub client_hint: Option<&'a str>,
    /// Message that triggered resolution; titles a newly created conversation.
    pub first_message: &'a str,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub conversation: Conversation,
    pub via: ResolvedVia,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("conversation storage failed: {0}")]
    Storage(#[from] StoreError),

    #[error("provider thread creation failed: {0}")]
    Provider(#[from] LlmError),
}

pub struct ConversationResolver {
    store: Arc<dyn ConversationStore>,
    sessions: Arc<SessionBindings>,
    /// Set for the assistant-run family: handles are provider threads that can vanish.
    threads: Option<Arc<dyn AssistantBackend>>,
}

impl ConversationResolver {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        sessions: Arc<SessionBindings>,
        threads: Option<Arc<dyn AssistantBackend>>,
    ) -> Self {
        Self {
            store,
            sessions,
            threads,
        }
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(channel = %req.channel, owner_id = %req.owner_id)
    )]
    pub async fn resolve(&self, req: &ResolveRequest<'_>) -> Result<Resolution, ResolveError> {
        for via in [
            ResolvedVia::Session,
            ResolvedVia::ClientHint,
            ResolvedVia::LatestOnChannel,
        ] {
            let candidate = match self.lookup(via, req).await {
                Ok(Some(candidate)) => candidate,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        %e,
                        source = via.as_str(),
                        "candidate lookup failed; trying next source"
                    );
                    continue;
                }
            };
            if self.is_usable(&candidate, req, via).await {
                tracing::debug!(
                    conversation_id = candidate.id,
                    source = via.as_str(),
                    "conversation resolved"
                );
                return Ok(Resolution {
                    conversation: candidate,
                    via,
                });
            }
        }

        let conversation = self.create(req).await?;
        tracing::info!(
            conversation_id = conversation.id,
            thread_handle = %conversation.thread_handle,
            "conversation created"
        );
        Ok(Resolution {
            conversation,
            via: ResolvedVia::Created,
        })
    }

    async fn lookup(
        &self,
        via: ResolvedVia,
        req: &ResolveRequest<'_>,
    ) -> Result<Option<Conversation>, StoreError> {
        match via {
            ResolvedVia::Session => match self.sessions.get(req.channel, req.session_key) {
                Some(handle) => self.store.find_conversation(&handle).await,
                None => Ok(None),
            },
            ResolvedVia::ClientHint => {
                let hint = req
                    .client_hint
                    .map(str::trim)
                    .filter(|h| !h.is_empty() && req.channel.has_client_storage());
                match hint {
                    Some(handle) => self.store.find_conversation(handle).await,
                    None => Ok(None),
                }
            }
            ResolvedVia::LatestOnChannel => {
                if req.channel.has_client_storage() {
                    return Ok(None);
                }
                self.store
                    .latest_conversation(req.channel, req.owner_id)
                    .await
            }
            ResolvedVia::Created => Ok(None),
        }
    }

    async fn is_usable(
        &self,
        candidate: &Conversation,
        req: &ResolveRequest<'_>,
        via: ResolvedVia,
    ) -> bool {
        let rejection = if candidate.is_deleted() {
            Some("deleted")
        } else if candidate.channel != req.channel {
            Some("channel mismatch")
        } else if candidate.owner_id != req.owner_id {
            Some("owner mismatch")
        } else {
            None
        };
        if let Some(reason) = rejection {
            tracing::info!(
                conversation_id = candidate.id,
                source = via.as_str(),
                reason,
                "candidate conversation rejected"
            );
            return false;
        }

        let Some(threads) = &self.threads else {
            return true;
        };
        match threads.thread_exists(&candidate.thread_handle).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::info!(
                    conversation_id = candidate.id,
                    thread_handle = %candidate.thread_handle,
                    "provider no longer knows the thread"
                );
                false
            }
            Err(e) => {
                tracing::warn!(%e, conversation_id = candidate.id, "thread liveness check failed");
                false
            }
        }
    }

    async fn create(&self, req: &ResolveRequest<'_>) -> Result<Conversation, ResolveError> {
        let thread_handle = match &self.threads {
            Some(threads) => threads.create_thread().await?,
            None => synthesize_handle(req.channel, req.owner_id),
        };
        let conversation = self
            .store
            .create_conversation(&NewConversation {
                thread_handle,
                channel: req.channel,
                owner_id: req.owner_id.to_string(),
                title: conversation_title(req.first_message),
            })
            .await?;
        Ok(conversation)
    }
}

/// `{channel}-{identity}-{millis}-{random}` for providers without server-side threads.
pub fn synthesize_handle(channel: ChannelKind, identity: &str) -> String {
    let identity: String = identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(HANDLE_IDENTITY_MAX_CHARS)
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}-{}",
        channel.as_str(),
        identity,
        chrono::Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}
