//! Provider run driver.
//!
//! The provider family is picked once per request. Chat-completion providers get the
//! normalized history and stream fragments; assistant-run providers get the new user
//! message appended to their server-side thread and stream a run, falling back to the
//! recovery ladder when the stream breaks or the run budget runs out.

use crate::config::RelayConfig;
use crate::events::{EventSink, StreamEvent};
use crate::recovery::RecoveryLadder;
use futures_util::StreamExt;
use regex::Regex;
use relay_llm::{
    AssistantBackend, AssistantsClient, ChatBackend, ChatMessage, HistoryProfile, LlmClient,
    LlmError, Protocol, ProviderKind, RunEvent, RunRequest, RunStatus, normalize,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Provider, model and prompt choices for one generation, resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub provider: ProviderKind,
    pub model: String,
    pub history_profile: HistoryProfile,
    pub system_preamble: Option<String>,
    /// Extra instruction for this request only (e.g. the quota warning).
    pub additional_instructions: Option<String>,
    pub streaming: bool,
    /// Wall-clock ceiling on an assistant run's primary stream.
    pub run_timeout: Duration,
    pub assistant_id: Option<String>,
}

impl RunSettings {
    pub fn with_additional_instructions(mut self, instructions: Option<String>) -> Self {
        self.additional_instructions = instructions.filter(|i| !i.trim().is_empty());
        self
    }

    fn chat_preamble(&self) -> Option<String> {
        match (
            self.system_preamble.as_deref(),
            self.additional_instructions.as_deref(),
        ) {
            (Some(p), Some(extra)) => Some(format!("{p}\n\n{extra}")),
            (Some(p), None) => Some(p.to_string()),
            (None, Some(extra)) => Some(extra.to_string()),
            (None, None) => None,
        }
    }
}

/// Polling and replay bounds shared by every assistant run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLimits {
    pub poll_interval: Duration,
    pub pre_run_wait: Duration,
    pub recovery_timeout: Duration,
    pub replay_chunk_chars: usize,
    pub replay_chunk_delay: Duration,
}

pub enum ProviderClient {
    Chat(Arc<dyn ChatBackend>),
    Assistant(Arc<dyn AssistantBackend>),
}

impl ProviderClient {
    pub fn from_config(cfg: &RelayConfig) -> anyhow::Result<Self> {
        let api_key = cfg.api_key().ok_or_else(|| {
            anyhow::anyhow!("no api key configured for provider {}", cfg.general.provider)
        })?;
        let timeout = Duration::from_secs(cfg.general.request_timeout_secs);
        match cfg.general.provider.protocol() {
            Protocol::ChatCompletion => {
                let client = LlmClient::new(cfg.general.provider, &api_key, timeout)?
                    .with_endpoint(cfg.general.endpoint.clone());
                Ok(Self::Chat(Arc::new(client)))
            }
            Protocol::AssistantRun => {
                let client = AssistantsClient::new(&api_key, timeout)?
                    .with_base_url(cfg.assistant.base_url.clone());
                Ok(Self::Assistant(Arc::new(client)))
            }
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ProviderClient::Chat(_) => Protocol::ChatCompletion,
            ProviderClient::Assistant(_) => Protocol::AssistantRun,
        }
    }

    /// Present only for the assistant-run family, whose threads live provider-side.
    pub fn assistant_backend(&self) -> Option<&Arc<dyn AssistantBackend>> {
        match self {
            ProviderClient::Assistant(backend) => Some(backend),
            ProviderClient::Chat(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("provider request failed: {0}")]
    Provider(#[from] LlmError),

    #[error("run ended with status {status}{}", reason_suffix(.reason))]
    RunFailed {
        status: RunStatus,
        reason: Option<String>,
    },

    #[error("run failed before a run id was captured: {0}")]
    NoRunId(String),

    #[error("run {run_id} did not settle within {waited:?}")]
    RecoveryTimedOut { run_id: String, waited: Duration },

    #[error("latest thread message of run {run_id} is not assistant-authored")]
    NotAssistantAuthored { run_id: String },

    #[error("provider returned an empty reply")]
    EmptyResponse,

    #[error("run misconfigured: {0}")]
    Config(String),
}

impl RunError {
    /// Text shown to the user and persisted as the assistant turn.
    pub fn user_message(&self) -> String {
        match self {
            RunError::Provider(LlmError::Timeout(_)) | RunError::RecoveryTimedOut { .. } => {
                "Sorry, the assistant took too long to answer. Please try again.".to_string()
            }
            RunError::Provider(_) => {
                "Sorry, I couldn't reach the assistant service. Please try again.".to_string()
            }
            RunError::RunFailed { status, .. } => format!(
                "Sorry, the assistant couldn't complete this reply (run {status}). Please try again."
            ),
            RunError::NoRunId(_) => {
                "Sorry, the reply could not be started. Please try again.".to_string()
            }
            RunError::NotAssistantAuthored { .. } | RunError::EmptyResponse => {
                "Sorry, no reply was produced for your message. Please try again.".to_string()
            }
            RunError::Config(_) => {
                "Sorry, the assistant is not configured correctly. Please contact support."
                    .to_string()
            }
        }
    }
}

/// Strips markdown decoration from streamed text. Works per fragment, so markers split
/// across two fragments survive.
pub struct FragmentCleaner {
    code_fence: Regex,
    header: Regex,
    horizontal_rule: Regex,
    emphasis: Regex,
}

impl FragmentCleaner {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            code_fence: Regex::new(r"```[A-Za-z0-9_+\-]*")?,
            header: Regex::new(r"(?m)^[ \t]{0,3}#{1,6}[ \t]+")?,
            horizontal_rule: Regex::new(r"(?m)^[ \t]*(?:-{3,}|\*{3,}|_{3,})[ \t]*$")?,
            // Single underscores are kept.
            emphasis: Regex::new(r"\*\*|__|~~|\*")?,
        })
    }

    pub fn clean(&self, fragment: &str) -> String {
        let text = self.code_fence.replace_all(fragment, "");
        let text = self.horizontal_rule.replace_all(&text, "");
        let text = self.header.replace_all(&text, "");
        self.emphasis.replace_all(&text, "").into_owned()
    }
}

/// Per-request inputs of a generation.
pub struct RunContext<'a> {
    /// Logical id of the reply; every event carries it.
    pub message_id: &'a str,
    pub thread_handle: &'a str,
    /// Stored history, newest last, the current user turn included.
    pub history: &'a [ChatMessage],
    /// The current user message as sent to an assistant thread.
    pub user_message: &'a str,
    pub sink: &'a dyn EventSink,
}

impl RunContext<'_> {
    /// Delivery failures do not abort generation; the text still gets persisted.
    pub async fn forward_delta(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Err(e) = self
            .sink
            .emit(StreamEvent::delta(self.message_id, text))
            .await
        {
            tracing::warn!(%e, message_id = self.message_id, "failed to deliver delta");
        }
    }
}

/// What an assistant run produced before it ended or was cut off.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunProgress {
    pub run_id: Option<String>,
    /// Cleaned text already forwarded as deltas.
    pub text: String,
}

enum StreamFailure {
    Transport(LlmError),
    Ended {
        status: RunStatus,
        reason: Option<String>,
    },
}

pub struct RunDriver {
    client: ProviderClient,
    limits: RunLimits,
    cleaner: Arc<FragmentCleaner>,
    recovery: RecoveryLadder,
}

impl RunDriver {
    pub fn new(client: ProviderClient, limits: RunLimits) -> Result<Self, regex::Error> {
        let cleaner = Arc::new(FragmentCleaner::new()?);
        let recovery = RecoveryLadder::new(limits.clone(), cleaner.clone());
        Ok(Self {
            client,
            limits,
            cleaner,
            recovery,
        })
    }

    pub fn client(&self) -> &ProviderClient {
        &self.client
    }

    /// Runs one generation and returns the final text. Never emits the terminal event.
    pub async fn drive(
        &self,
        settings: &RunSettings,
        ctx: &RunContext<'_>,
    ) -> Result<String, RunError> {
        match &self.client {
            ProviderClient::Chat(chat) => self.drive_chat(chat.as_ref(), settings, ctx).await,
            ProviderClient::Assistant(backend) => {
                self.drive_assistant_run(backend.as_ref(), settings, ctx)
                    .await
            }
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            provider = %settings.provider,
            model = %settings.model,
            streaming = settings.streaming
        )
    )]
    async fn drive_chat(
        &self,
        chat: &dyn ChatBackend,
        settings: &RunSettings,
        ctx: &RunContext<'_>,
    ) -> Result<String, RunError> {
        let preamble = settings.chat_preamble();
        let messages = normalize(ctx.history, settings.history_profile, preamble.as_deref());
        let started = Instant::now();

        if !settings.streaming {
            let text = chat.complete_chat(&settings.model, &messages).await?;
            return non_empty(self.cleaner.clean(&text));
        }

        let mut stream = chat.stream_chat(&settings.model, &messages).await?;
        let mut full = String::new();
        let mut fragments = 0usize;
        while let Some(fragment) = stream.next().await {
            let cleaned = self.cleaner.clean(&fragment?);
            if cleaned.is_empty() {
                continue;
            }
            fragments = fragments.saturating_add(1);
            full.push_str(&cleaned);
            ctx.forward_delta(&cleaned).await;
        }
        tracing::info!(
            fragments,
            chars = full.chars().count(),
            latency_ms = started.elapsed().as_millis() as u64,
            "chat completion stream finished"
        );
        non_empty(full)
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            thread_handle = %ctx.thread_handle,
            run_timeout_ms = settings.run_timeout.as_millis() as u64
        )
    )]
    async fn drive_assistant_run(
        &self,
        backend: &dyn AssistantBackend,
        settings: &RunSettings,
        ctx: &RunContext<'_>,
    ) -> Result<String, RunError> {
        let assistant_id = settings
            .assistant_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| RunError::Config("assistant id is not set".to_string()))?;
        let thread_id = ctx.thread_handle;

        // A thread refuses new messages while a run is active on it.
        self.settle_previous_run(backend, thread_id).await;
        backend
            .create_thread_message(thread_id, ctx.user_message)
            .await?;

        let request = RunRequest {
            assistant_id,
            model: Some(settings.model.clone()),
            instructions: None,
            additional_instructions: settings.additional_instructions.clone(),
        };

        let mut progress = RunProgress::default();
        let outcome = tokio::time::timeout(
            settings.run_timeout,
            self.stream_run(backend, thread_id, &request, ctx, &mut progress),
        )
        .await;

        let cause = match outcome {
            Ok(Ok(())) => return non_empty(progress.text),
            Ok(Err(StreamFailure::Ended { status, reason })) => {
                tracing::warn!(
                    run_id = progress.run_id.as_deref().unwrap_or(""),
                    %status,
                    reason = reason.as_deref().unwrap_or(""),
                    "run ended without completing"
                );
                if status.is_active() {
                    if let Some(run_id) = progress.run_id.as_deref() {
                        cancel_best_effort(backend, thread_id, run_id).await;
                    }
                }
                return Err(RunError::RunFailed { status, reason });
            }
            Ok(Err(StreamFailure::Transport(e))) => format!("run stream failed: {e}"),
            Err(_) => format!("run exceeded {:?}", settings.run_timeout),
        };

        tracing::warn!(
            run_id = progress.run_id.as_deref().unwrap_or(""),
            streamed_chars = progress.text.chars().count(),
            cause = %cause,
            "entering recovery"
        );
        self.recovery
            .recover(backend, thread_id, &progress, &cause, ctx)
            .await
    }

    async fn stream_run(
        &self,
        backend: &dyn AssistantBackend,
        thread_id: &str,
        request: &RunRequest,
        ctx: &RunContext<'_>,
        progress: &mut RunProgress,
    ) -> Result<(), StreamFailure> {
        let mut events = backend
            .create_run(thread_id, request)
            .await
            .map_err(StreamFailure::Transport)?;

        while let Some(event) = events.next().await {
            match event.map_err(StreamFailure::Transport)? {
                RunEvent::Created { run_id } => {
                    if progress.run_id.is_none() {
                        tracing::debug!(run_id = %run_id, "run created");
                        progress.run_id = Some(run_id);
                    }
                }
                RunEvent::TextDelta { text } => {
                    let cleaned = self.cleaner.clean(&text);
                    progress.text.push_str(&cleaned);
                    ctx.forward_delta(&cleaned).await;
                }
                RunEvent::Completed => return Ok(()),
                RunEvent::Ended { status, reason } => {
                    return Err(StreamFailure::Ended { status, reason });
                }
            }
        }
        Err(StreamFailure::Transport(LlmError::StreamParse(
            "run stream ended before a terminal event".to_string(),
        )))
    }

    /// Cancels an active run left on the thread, then waits (bounded) for it to end.
    async fn settle_previous_run(&self, backend: &dyn AssistantBackend, thread_id: &str) {
        let latest = match backend.latest_run(thread_id).await {
            Ok(Some(run)) => run,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(%e, thread_id, "could not inspect latest run; continuing");
                return;
            }
        };
        if latest.status.is_terminal() {
            return;
        }
        if latest.status.is_active() {
            tracing::info!(run_id = %latest.id, status = %latest.status, "cancelling previous run");
            cancel_best_effort(backend, thread_id, &latest.id).await;
        }

        let deadline = Instant::now() + self.limits.pre_run_wait;
        let mut polls = 0usize;
        loop {
            if Instant::now() >= deadline {
                tracing::warn!(
                    run_id = %latest.id,
                    polls,
                    wait_ms = self.limits.pre_run_wait.as_millis() as u64,
                    "previous run did not settle in time; starting anyway"
                );
                return;
            }
            tokio::time::sleep(self.limits.poll_interval).await;
            polls = polls.saturating_add(1);
            match backend.get_run_status(thread_id, &latest.id).await {
                Ok(status) if status.is_terminal() => {
                    tracing::debug!(run_id = %latest.id, %status, polls, "previous run settled");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(%e, run_id = %latest.id, "previous run status poll failed");
                }
            }
        }
    }
}

pub(crate) async fn cancel_best_effort(
    backend: &dyn AssistantBackend,
    thread_id: &str,
    run_id: &str,
) {
    if let Err(e) = backend.cancel_run(thread_id, run_id).await {
        tracing::warn!(%e, thread_id, run_id, "run cancel failed");
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
}

fn non_empty(text: String) -> Result<String, RunError> {
    if text.trim().is_empty() {
        return Err(RunError::EmptyResponse);
    }
    Ok(text)
}
