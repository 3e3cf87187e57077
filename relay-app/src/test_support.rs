//! Scripted provider backends and a recording event sink for unit tests.

use crate::driver::RunLimits;
use crate::events::{EventSink, StreamEvent};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use relay_llm::{
    AssistantBackend, ChatBackend, ChatMessage, LlmError, RunEvent, RunEventStream, RunInfo,
    RunRequest, RunStatus, TextStream, ThreadMessage,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn fast_limits() -> RunLimits {
    RunLimits {
        poll_interval: Duration::from_millis(5),
        pre_run_wait: Duration::from_millis(200),
        recovery_timeout: Duration::from_millis(500),
        replay_chunk_chars: 12,
        replay_chunk_delay: Duration::from_millis(1),
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StreamEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().expect("sink lock").clone()
    }

    pub fn finals(&self) -> Vec<StreamEvent> {
        self.events().into_iter().filter(|e| e.is_final).collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: StreamEvent) -> anyhow::Result<()> {
        self.events.lock().expect("sink lock").push(event);
        Ok(())
    }
}

pub struct ScriptedChat {
    fragments: Vec<Result<String, String>>,
    completion: String,
    calls: AtomicUsize,
    last_messages: Mutex<Vec<ChatMessage>>,
}

impl ScriptedChat {
    pub fn fragments(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| Ok(f.to_string())).collect(),
            completion: fragments.concat(),
            calls: AtomicUsize::new(0),
            last_messages: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_after(fragments: &[&str], error: &str) -> Self {
        let mut chat = Self::fragments(fragments);
        chat.fragments.push(Err(error.to_string()));
        chat
    }

    pub fn complete(text: &str) -> Self {
        Self {
            completion: text.to_string(),
            ..Self::fragments(&[text])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.last_messages.lock().expect("messages lock").clone()
    }

    fn record(&self, messages: &[ChatMessage]) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().expect("messages lock") = messages.to_vec();
    }
}

#[async_trait]
impl ChatBackend for ScriptedChat {
    async fn stream_chat(
        &self,
        _model: &str,
        messages: &[ChatMessage],
    ) -> relay_llm::Result<TextStream> {
        self.record(messages);
        let items: Vec<relay_llm::Result<String>> = self
            .fragments
            .iter()
            .map(|f| f.clone().map_err(LlmError::Http))
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }

    async fn complete_chat(
        &self,
        _model: &str,
        messages: &[ChatMessage],
    ) -> relay_llm::Result<String> {
        self.record(messages);
        Ok(self.completion.clone())
    }
}

/// Assistant-run provider with a fixed run script. The last scripted status repeats.
pub struct ScriptedAssistant {
    events: Vec<Result<RunEvent, String>>,
    hang: bool,
    statuses: Mutex<VecDeque<RunStatus>>,
    latest_run: Option<RunInfo>,
    latest_message: Option<ThreadMessage>,
    known_threads: bool,
    thread_prefix: &'static str,
    status_polls: AtomicUsize,
    threads_created: AtomicUsize,
    runs_created: AtomicUsize,
    cancelled: Mutex<Vec<String>>,
    posted: Mutex<Vec<String>>,
}

impl ScriptedAssistant {
    pub fn streaming(events: Vec<Result<RunEvent, String>>) -> Self {
        Self {
            events,
            hang: false,
            statuses: Mutex::new(VecDeque::new()),
            latest_run: None,
            latest_message: None,
            known_threads: true,
            thread_prefix: "thread_",
            status_polls: AtomicUsize::new(0),
            threads_created: AtomicUsize::new(0),
            runs_created: AtomicUsize::new(0),
            cancelled: Mutex::new(Vec::new()),
            posted: Mutex::new(Vec::new()),
        }
    }

    /// Run stream stays open after the scripted events.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn with_statuses(self, statuses: &[RunStatus]) -> Self {
        *self.statuses.lock().expect("status lock") = statuses.iter().copied().collect();
        self
    }

    pub fn with_latest_run(mut self, run: RunInfo) -> Self {
        self.latest_run = Some(run);
        self
    }

    pub fn with_latest_message(mut self, message: ThreadMessage) -> Self {
        self.latest_message = Some(message);
        self
    }

    /// Every thread lookup reports the thread as gone.
    pub fn forgetting_threads(mut self) -> Self {
        self.known_threads = false;
        self
    }

    pub fn with_thread_prefix(mut self, prefix: &'static str) -> Self {
        self.thread_prefix = prefix;
        self
    }

    pub fn status_polls(&self) -> usize {
        self.status_polls.load(Ordering::SeqCst)
    }

    pub fn threads_created(&self) -> usize {
        self.threads_created.load(Ordering::SeqCst)
    }

    pub fn runs_created(&self) -> usize {
        self.runs_created.load(Ordering::SeqCst)
    }

    pub fn cancelled_runs(&self) -> Vec<String> {
        self.cancelled.lock().expect("cancel lock").clone()
    }

    pub fn posted_messages(&self) -> Vec<String> {
        self.posted.lock().expect("posted lock").clone()
    }
}

#[async_trait]
impl AssistantBackend for ScriptedAssistant {
    async fn create_thread(&self) -> relay_llm::Result<String> {
        let n = self.threads_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}{n}", self.thread_prefix))
    }

    async fn thread_exists(&self, _thread_id: &str) -> relay_llm::Result<bool> {
        Ok(self.known_threads)
    }

    async fn create_thread_message(
        &self,
        _thread_id: &str,
        content: &str,
    ) -> relay_llm::Result<String> {
        let mut posted = self.posted.lock().expect("posted lock");
        posted.push(content.to_string());
        Ok(format!("msg_user_{}", posted.len()))
    }

    async fn latest_run(&self, _thread_id: &str) -> relay_llm::Result<Option<RunInfo>> {
        Ok(self.latest_run.clone())
    }

    async fn create_run(
        &self,
        _thread_id: &str,
        _request: &RunRequest,
    ) -> relay_llm::Result<RunEventStream> {
        self.runs_created.fetch_add(1, Ordering::SeqCst);
        let items: Vec<relay_llm::Result<RunEvent>> = self
            .events
            .iter()
            .map(|e| e.clone().map_err(LlmError::Http))
            .collect();
        if self.hang {
            Ok(Box::pin(stream::iter(items).chain(stream::pending())))
        } else {
            Ok(Box::pin(stream::iter(items)))
        }
    }

    async fn get_run_status(
        &self,
        _thread_id: &str,
        _run_id: &str,
    ) -> relay_llm::Result<RunStatus> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().expect("status lock");
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().copied()
        };
        status.ok_or_else(|| LlmError::Http("no run status scripted".to_string()))
    }

    async fn cancel_run(&self, _thread_id: &str, run_id: &str) -> relay_llm::Result<()> {
        self.cancelled
            .lock()
            .expect("cancel lock")
            .push(run_id.to_string());
        Ok(())
    }

    async fn latest_message(&self, _thread_id: &str) -> relay_llm::Result<Option<ThreadMessage>> {
        Ok(self.latest_message.clone())
    }
}
