//! Assistant agent: takes one inbound message from quota check to the terminal event.
//!
//! Order per message: quota (web only), thread guard, conversation resolution, user turn,
//! empty assistant turn, generation, patch of the assistant turn, guard release, then
//! exactly one terminal event. A message that never reaches generation gives its quota
//! charge back.

use crate::config::{RelayConfig, RunMode};
use crate::conversation::{Turn, TurnRole, history_view};
use crate::driver::{ProviderClient, RunContext, RunDriver, RunLimits};
use crate::events::{EventSink, StreamEvent};
use crate::guard::{Acquire, BUSY_MESSAGE, ThreadLocks, thread_key};
use crate::quota::{QuotaCheck, QuotaDecision};
use crate::recovery::RecoveryCache;
use crate::resolver::{ConversationResolver, ResolveRequest};
use crate::session::SessionBindings;
use crate::store::{ConversationStore, StoreError};
use anyhow::Result;
use chrono::Utc;
use relay_channels::{ChannelKind, InboundMessage};
use relay_llm::{ChatMessage, Protocol};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

const STORAGE_ERROR_MESSAGE: &str =
    "Sorry, I couldn't save your message. Please try again in a moment.";

/// How handling of one inbound message ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Replied {
        conversation_id: i64,
        turn_id: i64,
    },
    /// Generation ran and failed; the error text is the persisted assistant turn.
    Failed {
        conversation_id: i64,
        turn_id: i64,
    },
    Busy,
    QuotaBlocked,
    /// Nothing could be persisted; the user got an error event.
    NotStarted,
    /// Neither text nor image; nothing was emitted.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverOutcome {
    Recovered,
    /// The turn already has final content; the cached copy was dropped.
    AlreadyPersisted,
    TurnMissing,
    NothingCached,
}

pub struct AssistantAgent {
    cfg: RelayConfig,
    store: Arc<dyn ConversationStore>,
    sessions: Arc<SessionBindings>,
    resolver: ConversationResolver,
    locks: ThreadLocks,
    driver: RunDriver,
    quota: Option<Arc<dyn QuotaCheck>>,
    recovery_cache: RecoveryCache,
}

impl AssistantAgent {
    pub fn new(
        cfg: RelayConfig,
        store: Arc<dyn ConversationStore>,
        provider: ProviderClient,
        limits: RunLimits,
    ) -> Result<Self> {
        let sessions = Arc::new(SessionBindings::new());
        let resolver = ConversationResolver::new(
            store.clone(),
            sessions.clone(),
            provider.assistant_backend().cloned(),
        );
        let driver = RunDriver::new(provider, limits)
            .map_err(|e| anyhow::anyhow!("build fragment cleaner: {e}"))?;
        Ok(Self {
            locks: ThreadLocks::new(cfg.locks.prune_threshold),
            cfg,
            store,
            sessions,
            resolver,
            driver,
            quota: None,
            recovery_cache: RecoveryCache::new(),
        })
    }

    pub fn with_quota(mut self, quota: Option<Arc<dyn QuotaCheck>>) -> Self {
        self.quota = quota;
        self
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionBindings> {
        &self.sessions
    }

    pub fn locks(&self) -> &ThreadLocks {
        &self.locks
    }

    pub fn recovery_cache(&self) -> &RecoveryCache {
        &self.recovery_cache
    }

    pub fn protocol(&self) -> Protocol {
        self.driver.client().protocol()
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            channel = %inbound.channel,
            sender_id = %inbound.sender_id.as_str(),
            message_id = %inbound.message_id.as_str(),
            mode = ?mode
        )
    )]
    pub async fn handle(
        &self,
        inbound: &InboundMessage,
        mode: RunMode,
        sink: &dyn EventSink,
    ) -> TurnOutcome {
        if inbound.content.trim().is_empty() && inbound.image_ref.is_none() {
            tracing::info!("ignoring message with neither text nor image");
            return TurnOutcome::Ignored;
        }
        let reply_id = Uuid::new_v4().to_string();
        let owner_id = inbound.sender_id.as_str();

        let mut extra_instructions = None;
        let mut charged = false;
        if inbound.channel == ChannelKind::Web {
            if let Some(quota) = &self.quota {
                match quota.check_and_increment(owner_id).await {
                    Ok(QuotaDecision::Allowed) => charged = true,
                    Ok(QuotaDecision::Warning) => {
                        charged = true;
                        extra_instructions = Some(self.cfg.quota.warning_instruction.clone());
                    }
                    Ok(QuotaDecision::Blocked) => {
                        emit_terminal(
                            sink,
                            StreamEvent::error(&reply_id, self.cfg.quota.upgrade_message.clone()),
                        )
                        .await;
                        return TurnOutcome::QuotaBlocked;
                    }
                    Err(e) => tracing::warn!(%e, "quota check failed; allowing message"),
                }
            }
        }

        let permit = match self.locks.try_acquire(&thread_key(inbound.channel, owner_id)) {
            Acquire::Held(permit) => permit,
            Acquire::Busy => {
                self.refund_quota(owner_id, charged).await;
                emit_terminal(sink, StreamEvent::error(&reply_id, BUSY_MESSAGE)).await;
                return TurnOutcome::Busy;
            }
        };

        let resolution = match self
            .resolver
            .resolve(&ResolveRequest {
                channel: inbound.channel,
                owner_id,
                session_key: &inbound.session_id,
                client_hint: inbound.thread_hint.as_ref().map(|h| h.as_str()),
                first_message: &inbound.content,
            })
            .await
        {
            Ok(resolution) => resolution,
            Err(e) => {
                tracing::error!(%e, "conversation resolution failed");
                drop(permit);
                self.refund_quota(owner_id, charged).await;
                emit_terminal(sink, StreamEvent::error(&reply_id, STORAGE_ERROR_MESSAGE)).await;
                return TurnOutcome::NotStarted;
            }
        };
        let conversation = resolution.conversation;
        self.sessions.bind(
            inbound.channel,
            &inbound.session_id,
            &conversation.thread_handle,
        );
        tracing::debug!(
            conversation_id = conversation.id,
            via = resolution.via.as_str(),
            status = ?conversation.status(Utc::now(), self.cfg.active_window()),
            "conversation ready"
        );

        let (user_turn, reply_turn) = match self.open_turns(conversation.id, inbound).await {
            Ok(turns) => turns,
            Err(e) => {
                tracing::error!(%e, conversation_id = conversation.id, "failed to persist turns");
                drop(permit);
                self.refund_quota(owner_id, charged).await;
                emit_terminal(
                    sink,
                    StreamEvent::error(&reply_id, STORAGE_ERROR_MESSAGE)
                        .with_thread_handle(Some(&conversation.thread_handle)),
                )
                .await;
                return TurnOutcome::NotStarted;
            }
        };

        let user_message = user_turn
            .to_chat_message()
            .unwrap_or_else(|| ChatMessage::user(inbound.content.clone()));
        let history = match self.protocol() {
            Protocol::ChatCompletion => self.load_history(conversation.id, &user_message).await,
            Protocol::AssistantRun => Vec::new(),
        };

        let settings = self
            .cfg
            .run_settings(mode)
            .with_additional_instructions(extra_instructions);
        let ctx = RunContext {
            message_id: &reply_id,
            thread_handle: &conversation.thread_handle,
            history: &history,
            user_message: &user_message.content,
            sink,
        };

        let started = Instant::now();
        let (final_text, failed) = match self.driver.drive(&settings, &ctx).await {
            Ok(text) => (text, false),
            Err(e) => {
                tracing::error!(%e, conversation_id = conversation.id, "generation failed");
                (e.user_message(), true)
            }
        };
        tracing::info!(
            conversation_id = conversation.id,
            turn_id = reply_turn.id,
            failed,
            latency_ms = started.elapsed().as_millis() as u64,
            "generation finished"
        );

        if let Err(e) = self
            .store
            .patch_turn_content(reply_turn.id, &final_text)
            .await
        {
            tracing::error!(%e, turn_id = reply_turn.id, "failed to persist reply");
            self.recovery_cache.store(reply_turn.id, final_text.clone());
        }
        drop(permit);

        let event = if failed {
            StreamEvent::error(&reply_id, final_text)
        } else {
            StreamEvent::complete(&reply_id, final_text)
        };
        emit_terminal(
            sink,
            event.with_thread_handle(Some(&conversation.thread_handle)),
        )
        .await;

        if failed {
            TurnOutcome::Failed {
                conversation_id: conversation.id,
                turn_id: reply_turn.id,
            }
        } else {
            TurnOutcome::Replied {
                conversation_id: conversation.id,
                turn_id: reply_turn.id,
            }
        }
    }

    async fn refund_quota(&self, owner_id: &str, charged: bool) {
        let Some(quota) = self.quota.as_ref().filter(|_| charged) else {
            return;
        };
        if let Err(e) = quota.refund(owner_id).await {
            tracing::warn!(%e, owner_id, "quota refund failed");
        }
    }

    /// Persists the user turn, then the empty assistant turn the reply will fill.
    async fn open_turns(
        &self,
        conversation_id: i64,
        inbound: &InboundMessage,
    ) -> Result<(Turn, Turn), StoreError> {
        let user_turn = self
            .store
            .append_turn(
                conversation_id,
                TurnRole::User,
                &inbound.content,
                inbound.image_ref.as_deref(),
            )
            .await?;
        let reply_turn = self
            .store
            .append_turn(conversation_id, TurnRole::Assistant, "", None)
            .await?;
        Ok((user_turn, reply_turn))
    }

    async fn load_history(&self, conversation_id: i64, latest: &ChatMessage) -> Vec<ChatMessage> {
        match self
            .store
            .list_turns(conversation_id, Some(self.cfg.conversations.history_limit))
            .await
        {
            Ok(turns) => history_view(&turns),
            Err(e) => {
                tracing::warn!(
                    %e,
                    conversation_id,
                    "history unavailable; sending latest message only"
                );
                vec![latest.clone()]
            }
        }
    }

    /// Persists a reply that was generated but could not be saved at the time.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn recover_turn(&self, turn_id: i64) -> Result<RecoverOutcome> {
        let Some(text) = self.recovery_cache.get(turn_id) else {
            return Ok(RecoverOutcome::NothingCached);
        };
        match self.store.patch_turn_content(turn_id, &text).await {
            Ok(()) => {
                self.recovery_cache.remove(turn_id);
                tracing::info!(turn_id, "cached reply persisted");
                Ok(RecoverOutcome::Recovered)
            }
            Err(StoreError::Conflict(_)) => {
                self.recovery_cache.remove(turn_id);
                Ok(RecoverOutcome::AlreadyPersisted)
            }
            Err(StoreError::NotFound(_)) => {
                self.recovery_cache.remove(turn_id);
                Ok(RecoverOutcome::TurnMissing)
            }
            Err(e) => Err(anyhow::anyhow!("persist cached reply for turn {turn_id}: {e}")),
        }
    }
}

async fn emit_terminal(sink: &dyn EventSink, event: StreamEvent) {
    if let Err(e) = sink.emit(event).await {
        tracing::warn!(%e, "failed to deliver terminal event");
    }
}
