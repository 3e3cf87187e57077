use crate::error::{LlmError, Result};
use crate::sse::{SseFrame, decode_sse};
use crate::types::{ChatMessage, StreamChunk, Usage};
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub(crate) const OPENAI_CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
pub(crate) const DEEPSEEK_CHAT_COMPLETIONS_URL: &str = "https://api.deepseek.com/chat/completions";

/// Client for any endpoint speaking the OpenAI chat-completions wire format.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, api_key: &str, endpoint: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %model))]
    pub async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<(String, Usage)> {
        let req = OpenAiChatRequest::new(model, messages, false);

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "openai chat status={status} body={body}"
            )));
        }

        let parsed: OpenAiChatResponse = serde_json::from_str(&body)?;
        parsed.into_text()
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %model))]
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let req = OpenAiChatRequest::new(model, messages, true);

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "openai stream status={status} body={body}"
            )));
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        let stream = futures_util::stream::unfold(
            (sse, None::<Usage>),
            |(mut sse, mut usage)| async move {
                loop {
                    let next = sse.as_mut().next().await?;
                    let SseFrame { data, .. } = match next {
                        Ok(frame) => frame,
                        Err(e) => return Some((Err(e), (sse, usage))),
                    };

                    if data.trim() == "[DONE]" {
                        let done_usage = usage.clone().unwrap_or_default();
                        return Some((Ok(StreamChunk::Done { usage: done_usage }), (sse, usage)));
                    }

                    let chunk: OpenAiStreamResponseChunk = match serde_json::from_str(&data) {
                        Ok(v) => v,
                        Err(e) => {
                            return Some((
                                Err(LlmError::StreamParse(format!(
                                    "openai chunk json error={e} data={data}"
                                ))),
                                (sse, usage),
                            ));
                        }
                    };

                    if let Some(u) = chunk.usage.as_ref() {
                        usage = Some(Usage {
                            prompt_tokens: u.prompt_tokens.unwrap_or(0) as u32,
                            completion_tokens: u.completion_tokens.unwrap_or(0) as u32,
                        });
                    }

                    let Some(choice) = chunk.choices.first() else {
                        continue;
                    };
                    if let Some(content) = choice.delta.content.as_ref() {
                        if !content.is_empty() {
                            return Some((
                                Ok(StreamChunk::Delta {
                                    content: content.clone(),
                                }),
                                (sse, usage),
                            ));
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAiStreamOptions>,
}

#[derive(Debug, Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

impl OpenAiChatRequest {
    fn new(model: &str, messages: &[ChatMessage], stream: bool) -> Self {
        let mut out = Self {
            model: model.to_string(),
            messages: messages
                .iter()
                .map(|m| OpenAiMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            stream: None,
            stream_options: None,
        };

        if stream {
            out.stream = Some(true);
            out.stream_options = Some(OpenAiStreamOptions {
                include_usage: true,
            });
        }

        out
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl OpenAiChatResponse {
    fn into_text(self) -> Result<(String, Usage)> {
        let choice = self.choices.into_iter().next().ok_or_else(|| {
            LlmError::ResponseFormat("openai response missing choices".to_string())
        })?;
        let usage = self
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        Ok((choice.message.content.unwrap_or_default(), usage))
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponseChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiStreamUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn stream_request_asks_for_usage() {
        let req = OpenAiChatRequest::new(
            "deepseek-chat",
            &[ChatMessage::new(Role::System, "be brief"), ChatMessage::user("hi")],
            true,
        );
        let json = serde_json::to_value(&req).expect("serialize request");
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
    }

    #[test]
    fn non_stream_response_requires_a_choice() {
        let parsed: OpenAiChatResponse =
            serde_json::from_str(r#"{"choices":[]}"#).expect("parse response");
        assert!(parsed.into_text().is_err());

        let parsed: OpenAiChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"Bonjour"}}],"usage":{"prompt_tokens":3,"completion_tokens":1}}"#,
        )
        .expect("parse response");
        let (text, usage) = parsed.into_text().expect("text");
        assert_eq!(text, "Bonjour");
        assert_eq!(usage.completion_tokens, 1);
    }
}
