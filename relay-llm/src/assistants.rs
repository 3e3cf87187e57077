//! Assistant-run client (OpenAI Assistants v2 wire format).

use crate::backend::{
    AssistantBackend, RunEvent, RunEventStream, RunInfo, RunRequest, RunStatus, ThreadMessage,
};
use crate::error::{LlmError, Result};
use crate::sse::{SseFrame, decode_sse};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const ASSISTANTS_BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");

#[derive(Clone)]
pub struct AssistantsClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AssistantsClient {
    pub fn new(api_key: &str, request_timeout: Duration) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput(
                "api key for assistant provider is empty".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            base_url: OPENAI_API_BASE.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
            self.base_url = url.trim_end_matches('/').to_string();
        }
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .header(ASSISTANTS_BETA_HEADER.0, ASSISTANTS_BETA_HEADER.1)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .header(ASSISTANTS_BETA_HEADER.0, ASSISTANTS_BETA_HEADER.1)
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
    what: &str,
) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(LlmError::Http(format!(
            "assistants {what} status={status} body={body}"
        )));
    }
    Ok(serde_json::from_str(&body)?)
}

#[async_trait]
impl AssistantBackend for AssistantsClient {
    #[tracing::instrument(level = "info", skip_all)]
    async fn create_thread(&self) -> Result<String> {
        let response = self
            .post("threads")
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let thread: IdObject = read_json(response, "create thread").await?;
        tracing::info!(thread_id = %thread.id, "provider thread created");
        Ok(thread.id)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(thread_id = %thread_id))]
    async fn thread_exists(&self, thread_id: &str) -> Result<bool> {
        let response = self.get(&format!("threads/{thread_id}")).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(LlmError::Http(format!(
                    "assistants retrieve thread status={status} body={body}"
                )))
            }
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(thread_id = %thread_id))]
    async fn create_thread_message(&self, thread_id: &str, content: &str) -> Result<String> {
        let response = self
            .post(&format!("threads/{thread_id}/messages"))
            .json(&serde_json::json!({ "role": "user", "content": content }))
            .send()
            .await?;
        let message: IdObject = read_json(response, "create message").await?;
        Ok(message.id)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(thread_id = %thread_id))]
    async fn latest_run(&self, thread_id: &str) -> Result<Option<RunInfo>> {
        let response = self
            .get(&format!("threads/{thread_id}/runs"))
            .query(&[("limit", "1"), ("order", "desc")])
            .send()
            .await?;
        let runs: ListResponse<RunObject> = read_json(response, "list runs").await?;
        Ok(runs.data.into_iter().next().map(|r| RunInfo {
            id: r.id,
            status: r.status,
        }))
    }

    #[tracing::instrument(level = "info", skip_all, fields(thread_id = %thread_id))]
    async fn create_run(&self, thread_id: &str, request: &RunRequest) -> Result<RunEventStream> {
        let body = CreateRunBody {
            assistant_id: &request.assistant_id,
            model: request.model.as_deref(),
            instructions: request.instructions.as_deref(),
            additional_instructions: request.additional_instructions.as_deref(),
            stream: true,
        };
        let response = self
            .post(&format!("threads/{thread_id}/runs"))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "assistants create run status={status} body={body}"
            )));
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        let events = sse.filter_map(|frame| async move {
            match frame {
                Ok(frame) => parse_run_event(&frame).transpose(),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(events))
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(thread_id = %thread_id, run_id = %run_id)
    )]
    async fn get_run_status(&self, thread_id: &str, run_id: &str) -> Result<RunStatus> {
        let response = self
            .get(&format!("threads/{thread_id}/runs/{run_id}"))
            .send()
            .await?;
        let run: RunObject = read_json(response, "retrieve run").await?;
        Ok(run.status)
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(thread_id = %thread_id, run_id = %run_id)
    )]
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<()> {
        let response = self
            .post(&format!("threads/{thread_id}/runs/{run_id}/cancel"))
            .send()
            .await?;
        let _run: RunObject = read_json(response, "cancel run").await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(thread_id = %thread_id))]
    async fn latest_message(&self, thread_id: &str) -> Result<Option<ThreadMessage>> {
        let response = self
            .get(&format!("threads/{thread_id}/messages"))
            .query(&[("limit", "1"), ("order", "desc")])
            .send()
            .await?;
        let messages: ListResponse<MessageObject> = read_json(response, "list messages").await?;
        Ok(messages.data.into_iter().next().map(MessageObject::into_thread_message))
    }
}

fn parse_run_event(frame: &SseFrame) -> Result<Option<RunEvent>> {
    match frame.event.as_str() {
        "thread.run.created" => {
            let run: RunObject = serde_json::from_str(&frame.data)?;
            Ok(Some(RunEvent::Created { run_id: run.id }))
        }
        "thread.message.delta" => {
            let delta: MessageDeltaObject = serde_json::from_str(&frame.data)?;
            let text: String = delta
                .delta
                .content
                .into_iter()
                .filter_map(|part| part.text.and_then(|t| t.value))
                .collect();
            if text.is_empty() {
                return Ok(None);
            }
            Ok(Some(RunEvent::TextDelta { text }))
        }
        "thread.run.completed" => Ok(Some(RunEvent::Completed)),
        "thread.run.failed"
        | "thread.run.cancelled"
        | "thread.run.expired"
        | "thread.run.incomplete"
        | "thread.run.requires_action" => {
            let run: RunObject = serde_json::from_str(&frame.data)?;
            let reason = run.last_error.map(|e| e.message).or_else(|| {
                (run.status == RunStatus::RequiresAction)
                    .then(|| "run requested tool calls, which are not supported".to_string())
            });
            Ok(Some(RunEvent::Ended {
                status: run.status,
                reason,
            }))
        }
        "error" => {
            let message = serde_json::from_str::<ErrorObject>(&frame.data)
                .map(|e| e.message)
                .unwrap_or_else(|_| frame.data.clone());
            Err(LlmError::Provider(format!("assistants stream error: {message}")))
        }
        _ => Ok(None),
    }
}

#[derive(Debug, Serialize)]
struct CreateRunBody<'a> {
    assistant_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_instructions: Option<&'a str>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    status: RunStatus,
    #[serde(default)]
    last_error: Option<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    id: String,
    role: String,
    #[serde(default)]
    content: Vec<ContentPart>,
}

impl MessageObject {
    fn into_thread_message(self) -> ThreadMessage {
        let text = self
            .content
            .into_iter()
            .filter_map(|part| part.text.and_then(|t| t.value))
            .collect::<Vec<_>>()
            .join("\n");
        ThreadMessage {
            id: self.id,
            role: self.role,
            text,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageDeltaObject {
    delta: MessageDelta,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<TextPart>,
}

#[derive(Debug, Deserialize)]
struct TextPart {
    #[serde(default)]
    value: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn run_created_event_carries_the_run_id() {
        let event = parse_run_event(&frame(
            "thread.run.created",
            r#"{"id":"run_abc","object":"thread.run","status":"queued"}"#,
        ))
        .expect("parse")
        .expect("event");
        assert_eq!(
            event,
            RunEvent::Created {
                run_id: "run_abc".to_string()
            }
        );
    }

    #[test]
    fn message_delta_text_parts_are_concatenated() {
        let event = parse_run_event(&frame(
            "thread.message.delta",
            r#"{"id":"msg_1","delta":{"content":[{"index":0,"type":"text","text":{"value":"Bon"}},{"index":1,"type":"text","text":{"value":"jour"}}]}}"#,
        ))
        .expect("parse")
        .expect("event");
        assert_eq!(
            event,
            RunEvent::TextDelta {
                text: "Bonjour".to_string()
            }
        );
    }

    #[test]
    fn failed_run_reports_last_error() {
        let event = parse_run_event(&frame(
            "thread.run.failed",
            r#"{"id":"run_abc","status":"failed","last_error":{"code":"server_error","message":"boom"}}"#,
        ))
        .expect("parse")
        .expect("event");
        assert_eq!(
            event,
            RunEvent::Ended {
                status: RunStatus::Failed,
                reason: Some("boom".to_string())
            }
        );
    }

    #[test]
    fn unrelated_events_are_skipped_and_error_events_fail() {
        assert!(
            parse_run_event(&frame("thread.run.step.created", "{}"))
                .expect("parse")
                .is_none()
        );
        assert!(parse_run_event(&frame("done", "[DONE]")).expect("parse").is_none());
        let err = parse_run_event(&frame("error", r#"{"message":"rate limited"}"#))
            .expect_err("error event");
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn latest_message_flattens_text_content() {
        let parsed: ListResponse<MessageObject> = serde_json::from_str(
            r#"{"data":[{"id":"msg_9","role":"assistant","content":[{"type":"text","text":{"value":"X","annotations":[]}}]}]}"#,
        )
        .expect("parse list");
        let message = parsed
            .data
            .into_iter()
            .next()
            .expect("one message")
            .into_thread_message();
        assert!(message.is_assistant());
        assert_eq!(message.text, "X");
    }
}
