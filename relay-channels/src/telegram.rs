use crate::traits::ChannelAdapter;
use crate::types::{ChannelKind, InboundMessage, OutboundMessage};
use anyhow::Result;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;
const TELEGRAM_NON_TEXT_PLACEHOLDER: &str = "[telegram non-text message]";
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
        })
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "https://api.telegram.org/bot{}/{}",
            self.bot_token, method
        ))?)
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let url = self.api_url("sendMessage")?;
        let body = serde_json::json!({
            "chat_id": recipient_id,
            "text": message.content,
        });
        let resp = self.http.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "telegram send failed: status={status} body={text}"
            ));
        }
        Ok(())
    }
}

/// Why one `getUpdates` call produced nothing.
#[derive(Debug)]
enum PollFailure {
    /// Network errors, 429, 408, 5xx and unreadable payloads: retried with backoff.
    Transient(String),
    /// Anything else, e.g. a revoked token: retried on a fixed slow cadence.
    Rejected(String),
}

impl TelegramAdapter {
    async fn fetch_updates(&self, offset: i64) -> Result<Vec<TelegramUpdate>, PollFailure> {
        let url = self
            .api_url("getUpdates")
            .map_err(|e| PollFailure::Rejected(e.to_string()))?;
        let response = self
            .http
            .get(url)
            .query(&[
                ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                ("offset", &offset.to_string()),
                ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
            ])
            .send()
            .await
            .map_err(|e| PollFailure::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<unreadable body: {e}>"));
            let detail = format!("status={status} body={body}");
            return Err(if is_transient_status(status) {
                PollFailure::Transient(detail)
            } else {
                PollFailure::Rejected(detail)
            });
        }

        let mut updates = response
            .json::<TelegramGetUpdatesResponse>()
            .await
            .map_err(|e| PollFailure::Transient(format!("payload parse failed: {e}")))?
            .result;
        updates.sort_by_key(|update| update.update_id);
        Ok(updates)
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut failures: u32 = 0;

        loop {
            let updates = match self.fetch_updates(offset).await {
                Ok(updates) => {
                    failures = 0;
                    updates
                }
                Err(PollFailure::Transient(detail)) => {
                    failures = failures.saturating_add(1);
                    let delay = transient_retry_delay(failures);
                    tracing::warn!(
                        %detail,
                        attempt = failures,
                        ?delay,
                        "telegram getUpdates failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(PollFailure::Rejected(detail)) => {
                    failures = 0;
                    tracing::error!(
                        %detail,
                        delay = ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates rejected"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                    continue;
                }
            };

            for update in &updates {
                if update.update_id < offset {
                    continue;
                }
                // The offset moves past an update before conversion so a malformed one
                // is never fetched again.
                offset = update.update_id.saturating_add(1);
                let Some(inbound) = to_inbound(update) else {
                    continue;
                };
                tx.send(inbound)
                    .await
                    .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn to_inbound(update: &TelegramUpdate) -> Option<InboundMessage> {
    let update_id = update.update_id;
    let message = update.message.as_ref()?;
    let chat = message.chat.as_ref()?;
    let image_ref = message.largest_photo_id();
    let content = match extract_message_content(message) {
        Some(content) => content,
        // Image-only messages carry no text but still start a turn.
        None if image_ref.is_some() => String::new(),
        None => return None,
    };
    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", chat.id));
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{update_id}:message"));

    let mut inbound = InboundMessage::new(
        ChannelKind::Telegram,
        sender_id,
        chat.id.to_string(),
        content,
    );
    inbound.message_id = message_id.into();
    inbound.image_ref = image_ref;
    inbound.metadata = serde_json::json!({
        "chat_type": chat.r#type,
        "update_id": update_id,
    });
    Some(inbound)
}

fn extract_message_content(message: &TelegramMessage) -> Option<String> {
    if let Some(text) = message.text.as_deref().map(str::trim) {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(caption) = message.caption.as_deref().map(str::trim) {
        if !caption.is_empty() {
            return Some(caption.to_string());
        }
    }
    if message.has_unsupported_payload() {
        return Some(TELEGRAM_NON_TEXT_PLACEHOLDER.to_string());
    }
    None
}

#[derive(Debug, Deserialize)]
struct TelegramGetUpdatesResponse {
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<TelegramPhotoSize>,
    #[serde(default)]
    sticker: Option<serde_json::Value>,
    #[serde(default)]
    audio: Option<serde_json::Value>,
    #[serde(default)]
    document: Option<serde_json::Value>,
    #[serde(default)]
    video: Option<serde_json::Value>,
    #[serde(default)]
    voice: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TelegramPhotoSize {
    file_id: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}

impl TelegramMessage {
    fn largest_photo_id(&self) -> Option<String> {
        self.photo
            .iter()
            .max_by_key(|p| u64::from(p.width) * u64::from(p.height))
            .map(|p| p.file_id.clone())
    }

    fn has_unsupported_payload(&self) -> bool {
        self.sticker.is_some()
            || self.audio.is_some()
            || self.document.is_some()
            || self.video.is_some()
            || self.voice.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        TELEGRAM_NON_TEXT_PLACEHOLDER, TelegramChat, TelegramGetUpdatesResponse, TelegramMessage,
        TelegramPhotoSize, TelegramUpdate, extract_message_content, is_transient_status, to_inbound,
        transient_retry_delay,
    };
    use crate::types::ChannelKind;

    fn private_chat(id: i64) -> Option<TelegramChat> {
        Some(TelegramChat {
            id,
            r#type: "private".to_string(),
        })
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        assert_eq!(transient_retry_delay(1).as_millis(), 250);
        assert_eq!(transient_retry_delay(2).as_millis(), 500);
        assert_eq!(transient_retry_delay(3).as_millis(), 1000);
        assert_eq!(transient_retry_delay(20).as_millis(), 30000);
    }

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        assert!(is_transient_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(reqwest::StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn message_content_prefers_text_then_caption_then_placeholder() {
        let mut message = TelegramMessage {
            message_id: Some(5),
            chat: private_chat(10),
            text: Some(" hello ".to_string()),
            caption: Some("caption".to_string()),
            ..TelegramMessage::default()
        };
        assert_eq!(
            extract_message_content(&message).as_deref(),
            Some("hello"),
            "text should win when present"
        );

        message.text = None;
        assert_eq!(
            extract_message_content(&message).as_deref(),
            Some("caption"),
            "caption should be used when text is absent"
        );

        message.caption = None;
        message.voice = Some(serde_json::json!({"file_id":"v1"}));
        assert_eq!(
            extract_message_content(&message).as_deref(),
            Some(TELEGRAM_NON_TEXT_PLACEHOLDER)
        );
    }

    #[test]
    fn photo_message_uses_largest_size_as_image_ref() {
        let update = TelegramUpdate {
            update_id: 100,
            message: Some(TelegramMessage {
                message_id: None,
                chat: private_chat(777),
                photo: vec![
                    TelegramPhotoSize {
                        file_id: "small".to_string(),
                        width: 90,
                        height: 60,
                    },
                    TelegramPhotoSize {
                        file_id: "large".to_string(),
                        width: 1280,
                        height: 853,
                    },
                ],
                ..TelegramMessage::default()
            }),
        };

        let inbound = to_inbound(&update).expect("photo starts a turn");
        assert_eq!(inbound.channel, ChannelKind::Telegram);
        assert_eq!(inbound.content, "");
        assert_eq!(inbound.image_ref.as_deref(), Some("large"));
        assert_eq!(inbound.sender_id.as_str(), "chat:777");
        assert_eq!(inbound.session_id, "777");
        assert_eq!(inbound.message_id.as_str(), "update:100:message");
    }

    #[test]
    fn updates_without_message_or_chat_are_skipped() {
        let parsed: TelegramGetUpdatesResponse = serde_json::from_str(
            r#"{"ok":true,"result":[
                {"update_id":1,"message_reaction":{"chat":{"id":1,"type":"private"}}},
                {"update_id":2,"message":{"message_id":3,"text":"no chat"}},
                {"update_id":3,"message":{"message_id":4,"from":{"id":55},"chat":{"id":9,"type":"private"},"text":"Bonjour"}}
            ]}"#,
        )
        .expect("parse updates");
        let inbound: Vec<_> = parsed.result.iter().filter_map(to_inbound).collect();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].sender_id.as_str(), "55");
        assert_eq!(inbound[0].session_id, "9");
        assert_eq!(inbound[0].content, "Bonjour");
        assert!(inbound[0].thread_hint.is_none());
    }
}
