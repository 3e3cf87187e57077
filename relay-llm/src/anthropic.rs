use crate::error::{LlmError, Result};
use crate::sse::{SseFrame, decode_sse};
use crate::types::{ChatMessage, Role, StreamChunk, Usage};
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 2048;

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %model))]
    pub async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<(String, Usage)> {
        let req = AnthropicRequest::new(model, messages, false);

        let response = self
            .http
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "anthropic chat status={status} body={body}"
            )));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&body)?;
        let text = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text),
                AnthropicContentBlock::Other => None,
            })
            .collect::<String>();
        Ok((
            text,
            Usage {
                prompt_tokens: parsed.usage.input_tokens as u32,
                completion_tokens: parsed.usage.output_tokens as u32,
            },
        ))
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %model))]
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let req = AnthropicRequest::new(model, messages, true);

        let response = self
            .http
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "anthropic stream status={status} body={body}"
            )));
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        let stream = futures_util::stream::unfold(
            (sse, Usage::default()),
            |(mut sse, mut usage)| async move {
                loop {
                    let next = sse.as_mut().next().await?;
                    let SseFrame { event, data } = match next {
                        Ok(frame) => frame,
                        Err(e) => return Some((Err(e), (sse, usage))),
                    };

                    match event.as_str() {
                        "message_start" => {
                            if let Ok(v) = serde_json::from_str::<AnthropicMessageStart>(&data) {
                                usage.prompt_tokens = v.message.usage.input_tokens as u32;
                                usage.completion_tokens = v.message.usage.output_tokens as u32;
                            }
                        }
                        "content_block_delta" => {
                            let v: AnthropicContentBlockDelta = match serde_json::from_str(&data) {
                                Ok(v) => v,
                                Err(e) => {
                                    return Some((
                                        Err(LlmError::StreamParse(format!(
                                            "anthropic delta json error={e} data={data}"
                                        ))),
                                        (sse, usage),
                                    ));
                                }
                            };
                            if let AnthropicDelta::TextDelta { text } = v.delta {
                                if !text.is_empty() {
                                    return Some((
                                        Ok(StreamChunk::Delta { content: text }),
                                        (sse, usage),
                                    ));
                                }
                            }
                        }
                        "message_delta" => {
                            if let Ok(v) = serde_json::from_str::<AnthropicMessageDelta>(&data) {
                                if let Some(u) = v.usage {
                                    usage.completion_tokens = u.output_tokens as u32;
                                }
                            }
                        }
                        "message_stop" => {
                            let done = usage.clone();
                            return Some((Ok(StreamChunk::Done { usage: done }), (sse, usage)));
                        }
                        "error" => {
                            return Some((
                                Err(LlmError::Provider(format!("anthropic stream error: {data}"))),
                                (sse, usage),
                            ));
                        }
                        _ => {}
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

impl AnthropicRequest {
    fn new(model: &str, messages: &[ChatMessage], stream: bool) -> Self {
        let mut system = String::new();
        let mut out_messages = Vec::new();

        for m in messages {
            match m.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(m.content.trim());
                }
                Role::User | Role::Assistant => out_messages.push(AnthropicMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                }),
            }
        }

        Self {
            model: model.to_string(),
            max_tokens: ANTHROPIC_MAX_TOKENS,
            system,
            messages: out_messages,
            stream: if stream { Some(true) } else { None },
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStart {
    message: AnthropicMessageStartMessage,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStartMessage {
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlockDelta {
    delta: AnthropicDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_are_lifted_out_of_the_turn_list() {
        let req = AnthropicRequest::new(
            "claude-sonnet-4",
            &[
                ChatMessage::system("You are helpful."),
                ChatMessage::system("Answer in French."),
                ChatMessage::user("Bonjour"),
            ],
            true,
        );
        assert_eq!(req.system, "You are helpful.\nAnswer in French.");
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, "user");
        assert_eq!(req.stream, Some(true));
    }

    #[test]
    fn unknown_delta_types_are_tolerated() {
        let v: AnthropicContentBlockDelta =
            serde_json::from_str(r#"{"delta":{"type":"input_json_delta","partial_json":"{"}}"#)
                .expect("parse delta");
        assert!(matches!(v.delta, AnthropicDelta::Other));
    }
}
