//! Recovery ladder for assistant runs whose stream broke or ran out of time, and the
//! cache of replies that were generated but could not be persisted.

use crate::driver::{
    FragmentCleaner, RunContext, RunError, RunLimits, RunProgress, cancel_best_effort,
};
use dashmap::DashMap;
use relay_llm::{AssistantBackend, RunStatus};
use std::sync::Arc;
use std::time::Instant;

pub struct RecoveryLadder {
    limits: RunLimits,
    cleaner: Arc<FragmentCleaner>,
}

impl RecoveryLadder {
    pub fn new(limits: RunLimits, cleaner: Arc<FragmentCleaner>) -> Self {
        Self { limits, cleaner }
    }

    /// Finds out how the run really ended. A completed run's reply is replayed to the
    /// channel as small chunks and returned; anything else becomes an error.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(thread_id = %thread_id, run_id = progress.run_id.as_deref().unwrap_or(""))
    )]
    pub async fn recover(
        &self,
        backend: &dyn AssistantBackend,
        thread_id: &str,
        progress: &RunProgress,
        cause: &str,
        ctx: &RunContext<'_>,
    ) -> Result<String, RunError> {
        let Some(run_id) = progress.run_id.as_deref() else {
            tracing::error!(cause, "no run id captured; cannot recover");
            return Err(RunError::NoRunId(cause.to_string()));
        };

        let status = self.await_terminal(backend, thread_id, run_id).await?;
        if status != RunStatus::Completed {
            tracing::warn!(%status, "run ended unsuccessfully during recovery");
            return Err(RunError::RunFailed {
                status,
                reason: Some(cause.to_string()),
            });
        }

        let message = backend.latest_message(thread_id).await?;
        let text = match message {
            Some(message) if message.is_assistant() => self.cleaner.clean(&message.text),
            Some(message) => {
                tracing::warn!(role = %message.role, "latest thread message is not the reply");
                return Err(RunError::NotAssistantAuthored {
                    run_id: run_id.to_string(),
                });
            }
            None => {
                return Err(RunError::NotAssistantAuthored {
                    run_id: run_id.to_string(),
                });
            }
        };
        if text.trim().is_empty() {
            return Err(RunError::EmptyResponse);
        }

        let unseen = text.strip_prefix(progress.text.as_str()).unwrap_or(&text);
        self.replay(ctx, unseen).await;
        tracing::info!(
            chars = text.chars().count(),
            replayed_chars = unseen.chars().count(),
            "recovered completed run"
        );
        Ok(text)
    }

    /// Polls until the run is terminal. On expiry an active run is cancelled, best effort.
    async fn await_terminal(
        &self,
        backend: &dyn AssistantBackend,
        thread_id: &str,
        run_id: &str,
    ) -> Result<RunStatus, RunError> {
        let started = Instant::now();
        let deadline = started + self.limits.recovery_timeout;
        let mut polls = 0usize;
        let mut last_status: Option<RunStatus> = None;

        loop {
            polls = polls.saturating_add(1);
            match backend.get_run_status(thread_id, run_id).await {
                Ok(status) if status.is_terminal() => {
                    tracing::debug!(
                        %status,
                        polls,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "run status resolved"
                    );
                    return Ok(status);
                }
                Ok(status) => last_status = Some(status),
                Err(e) => tracing::warn!(%e, polls, "run status poll failed"),
            }

            if Instant::now() >= deadline {
                tracing::error!(
                    polls,
                    last_status = last_status.map(|s| s.as_str()).unwrap_or("unknown"),
                    timeout_ms = self.limits.recovery_timeout.as_millis() as u64,
                    "timed out waiting for run to settle"
                );
                if last_status.is_none_or(|s| s.is_active()) {
                    cancel_best_effort(backend, thread_id, run_id).await;
                }
                return Err(RunError::RecoveryTimedOut {
                    run_id: run_id.to_string(),
                    waited: self.limits.recovery_timeout,
                });
            }
            tokio::time::sleep(self.limits.poll_interval).await;
        }
    }

    async fn replay(&self, ctx: &RunContext<'_>, text: &str) {
        let chars: Vec<char> = text.chars().collect();
        let size = self.limits.replay_chunk_chars.max(1);
        for (i, chunk) in chars.chunks(size).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.limits.replay_chunk_delay).await;
            }
            let chunk: String = chunk.iter().collect();
            ctx.forward_delta(&chunk).await;
        }
    }
}

/// Final replies keyed by assistant turn id, held until they are persisted.
#[derive(Default)]
pub struct RecoveryCache {
    pending: DashMap<i64, String>,
}

impl RecoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, turn_id: i64, text: String) {
        tracing::warn!(turn_id, "caching reply that could not be persisted");
        self.pending.insert(turn_id, text);
    }

    pub fn get(&self, turn_id: i64) -> Option<String> {
        self.pending.get(&turn_id).map(|t| t.clone())
    }

    pub fn remove(&self, turn_id: i64) -> Option<String> {
        self.pending.remove(&turn_id).map(|(_, text)| text)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
