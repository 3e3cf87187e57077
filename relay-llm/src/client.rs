use crate::anthropic::AnthropicClient;
use crate::backend::{ChatBackend, TextStream};
use crate::error::{LlmError, Result};
use crate::openai::{DEEPSEEK_CHAT_COMPLETIONS_URL, OPENAI_CHAT_COMPLETIONS_URL, OpenAiClient};
use crate::types::{ChatMessage, ProviderKind, StreamChunk};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;

/// Chat-completion client for every provider that streams tokens for a full history.
#[derive(Clone)]
pub struct LlmClient {
    provider: ProviderKind,
    api_key: String,
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all, fields(provider = %provider))]
    pub fn new(provider: ProviderKind, api_key: &str, request_timeout: Duration) -> Result<Self> {
        if provider == ProviderKind::Assistant {
            return Err(LlmError::InvalidInput(
                "assistant provider is served by AssistantsClient".to_string(),
            ));
        }
        if api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput(format!(
                "api key for provider {provider} is empty"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            provider,
            api_key: api_key.to_string(),
            endpoint: None,
            client,
        })
    }

    /// Overrides the chat-completions URL for OpenAI-compatible providers.
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint.filter(|e| !e.trim().is_empty());
        self
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn openai_compatible(&self) -> OpenAiClient {
        let default_endpoint = match self.provider {
            ProviderKind::DeepSeek => DEEPSEEK_CHAT_COMPLETIONS_URL,
            _ => OPENAI_CHAT_COMPLETIONS_URL,
        };
        let endpoint = self.endpoint.as_deref().unwrap_or(default_endpoint);
        OpenAiClient::new(self.client.clone(), &self.api_key, endpoint)
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat_stream_chunks(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<StreamChunk>> + Send>>>
    {
        match self.provider {
            ProviderKind::Anthropic => {
                AnthropicClient::new(self.client.clone(), &self.api_key)
                    .chat_stream(model, messages)
                    .await
            }
            _ => self.openai_compatible().chat_stream(model, messages).await,
        }
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn stream_chat(&self, model: &str, messages: &[ChatMessage]) -> Result<TextStream> {
        let chunks = self.chat_stream_chunks(model, messages).await?;
        let provider = self.provider;
        let text = chunks.filter_map(move |chunk| async move {
            match chunk {
                Ok(StreamChunk::Delta { content }) => Some(Ok(content)),
                Ok(StreamChunk::Done { usage }) => {
                    tracing::debug!(
                        provider = %provider,
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        "chat stream finished"
                    );
                    None
                }
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(text))
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(provider = %self.provider, model = %model)
    )]
    async fn complete_chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let (text, usage) = match self.provider {
            ProviderKind::Anthropic => {
                AnthropicClient::new(self.client.clone(), &self.api_key)
                    .chat(model, messages)
                    .await?
            }
            _ => self.openai_compatible().chat(model, messages).await?,
        };
        tracing::debug!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            content_len = text.len(),
            "chat completion finished"
        );
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_provider_is_rejected() {
        let err = LlmClient::new(ProviderKind::Assistant, "sk-test", Duration::from_secs(5))
            .err()
            .expect("assistant provider should be rejected");
        assert!(err.to_string().contains("AssistantsClient"));
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(LlmClient::new(ProviderKind::OpenAi, "  ", Duration::from_secs(5)).is_err());
    }

    #[test]
    fn blank_endpoint_override_is_ignored() {
        let client = LlmClient::new(ProviderKind::DeepSeek, "sk-test", Duration::from_secs(5))
            .expect("client")
            .with_endpoint(Some("  ".to_string()));
        assert!(client.endpoint.is_none());
        assert_eq!(client.provider(), ProviderKind::DeepSeek);
    }
}
