use crate::traits::ChannelAdapter;
use crate::types::{ChannelKind, InboundMessage, OutboundMessage};
use anyhow::{Context, Result, anyhow};
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use tokio::sync::mpsc;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v20.0";
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Clone)]
pub struct WhatsAppCloudAdapter {
    http: reqwest::Client,
    access_token: String,
    phone_number_id: String,
    verify_token: String,
    app_secret: Option<String>,
    inbound_tx: Arc<tokio::sync::RwLock<Option<mpsc::Sender<InboundMessage>>>>,
}

impl WhatsAppCloudAdapter {
    pub fn new(access_token: &str, phone_number_id: &str, verify_token: &str) -> Result<Self> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(anyhow!("whatsapp access token is required"));
        }
        let phone_number_id = phone_number_id.trim();
        if phone_number_id.is_empty() {
            return Err(anyhow!("whatsapp phone number id is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            access_token: access_token.to_string(),
            phone_number_id: phone_number_id.to_string(),
            verify_token: verify_token.trim().to_string(),
            app_secret: None,
            inbound_tx: Arc::new(tokio::sync::RwLock::new(None)),
        })
    }

    /// Require `X-Hub-Signature-256` on webhook deliveries, signed with the app secret.
    pub fn with_app_secret(mut self, app_secret: Option<String>) -> Self {
        self.app_secret = app_secret.filter(|s| !s.trim().is_empty());
        self
    }

    /// Router serving the Cloud API webhook at `/webhooks/whatsapp`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(
                "/webhooks/whatsapp",
                get(handle_verify).post(handle_webhook),
            )
            .with_state(self)
    }

    fn messages_url(&self) -> Result<Url> {
        Url::parse(&format!(
            "{GRAPH_API_BASE}/{}/messages",
            self.phone_number_id
        ))
        .map_err(|e| anyhow!("invalid whatsapp graph API URL: {e}"))
    }

    fn verify_subscription(&self, query: &VerifyQuery) -> Option<String> {
        let mode = query.hub_mode.as_deref().unwrap_or("");
        let observed = query.hub_verify_token.as_deref().map(str::trim).unwrap_or("");
        if mode == "subscribe" && !self.verify_token.is_empty() && observed == self.verify_token {
            return Some(query.hub_challenge.clone().unwrap_or_default());
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    hub_mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    hub_verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    hub_challenge: Option<String>,
}

async fn handle_verify(
    State(adapter): State<Arc<WhatsAppCloudAdapter>>,
    Query(query): Query<VerifyQuery>,
) -> impl IntoResponse {
    match adapter.verify_subscription(&query) {
        Some(challenge) => (StatusCode::OK, challenge).into_response(),
        None => {
            tracing::warn!("whatsapp webhook verification failed");
            (StatusCode::FORBIDDEN, "verification failed").into_response()
        }
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn handle_webhook(
    State(adapter): State<Arc<WhatsAppCloudAdapter>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    if let Some(app_secret) = adapter.app_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or("");
        if let Err(e) = verify_signature(body.as_bytes(), signature, app_secret) {
            tracing::warn!(%e, "whatsapp webhook signature rejected");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let payload: WebhookPayload = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(%e, "whatsapp webhook payload is not valid json");
            return StatusCode::BAD_REQUEST;
        }
    };

    let inbound = inbound_messages(payload);
    let Some(tx) = adapter.inbound_tx.read().await.clone() else {
        tracing::error!("whatsapp adapter started without inbound queue");
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    for message in inbound {
        if let Err(e) = tx.send(message).await {
            tracing::error!(%e, "whatsapp inbound queue closed");
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    }
    // Meta retries anything that is not a 200, so status updates and unsupported
    // message types are acknowledged too.
    StatusCode::OK
}

fn verify_signature(payload: &[u8], signature_header: &str, secret: &str) -> Result<()> {
    let digest_hex = signature_header
        .strip_prefix("sha256=")
        .ok_or_else(|| anyhow!("signature must use sha256=<hex> format"))?;
    let expected = hex::decode(digest_hex).context("signature digest is not valid hex")?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("failed to initialize hmac verifier: {e}"))?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| anyhow!("signature verification failed"))
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
struct WebhookChange {
    #[serde(default)]
    value: WebhookValue,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookValue {
    #[serde(default)]
    messages: Vec<WebhookMessage>,
}

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    id: String,
    from: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<WebhookText>,
    #[serde(default)]
    image: Option<WebhookImage>,
}

#[derive(Debug, Deserialize)]
struct WebhookText {
    body: String,
}

#[derive(Debug, Deserialize)]
struct WebhookImage {
    id: String,
    #[serde(default)]
    caption: Option<String>,
}

fn inbound_messages(payload: WebhookPayload) -> Vec<InboundMessage> {
    payload
        .entry
        .into_iter()
        .flat_map(|entry| entry.changes)
        .flat_map(|change| change.value.messages)
        .filter_map(|message| {
            let (content, image_ref) = match message.kind.as_str() {
                "text" => (message.text?.body, None),
                "image" => {
                    let image = message.image?;
                    (image.caption.unwrap_or_default(), Some(image.id))
                }
                other => {
                    tracing::debug!(message_type = other, "whatsapp message type ignored");
                    return None;
                }
            };
            let mut inbound = InboundMessage::new(
                ChannelKind::WhatsApp,
                message.from.clone(),
                message.from,
                content.trim(),
            );
            inbound.message_id = message.id.into();
            inbound.image_ref = image_ref;
            if let Some(received_at) = message
                .timestamp
                .as_deref()
                .and_then(|t| t.parse::<i64>().ok())
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            {
                inbound.received_at = received_at;
            }
            Some(inbound)
        })
        .collect()
}

#[async_trait::async_trait]
impl ChannelAdapter for WhatsAppCloudAdapter {
    fn channel(&self) -> ChannelKind {
        ChannelKind::WhatsApp
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.inbound_tx.write().await = Some(tx);
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let to = recipient_id.trim();
        if to.is_empty() {
            return Err(anyhow!("recipient_id (E.164 phone number) is required"));
        }
        let text = message.content.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let url = self.messages_url()?;
        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": text,
            }
        });

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("whatsapp send failed: status={status} body={body}"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> WhatsAppCloudAdapter {
        WhatsAppCloudAdapter::new("token", "1234", "verify-me").expect("adapter")
    }

    fn sign(secret: &str, body: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("mac");
        mac.update(body.as_bytes());
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn constructor_requires_credentials() {
        assert!(WhatsAppCloudAdapter::new(" ", "1234", "v").is_err());
        assert!(WhatsAppCloudAdapter::new("token", "", "v").is_err());
    }

    #[test]
    fn subscription_echoes_challenge_only_for_matching_token() {
        let adapter = adapter();
        let ok = VerifyQuery {
            hub_mode: Some("subscribe".to_string()),
            hub_verify_token: Some("verify-me".to_string()),
            hub_challenge: Some("1158201444".to_string()),
        };
        assert_eq!(adapter.verify_subscription(&ok).as_deref(), Some("1158201444"));

        let wrong = VerifyQuery {
            hub_verify_token: Some("nope".to_string()),
            ..ok
        };
        assert!(adapter.verify_subscription(&wrong).is_none());
    }

    #[test]
    fn signature_verification_accepts_only_matching_digest() {
        let body = r#"{"entry":[]}"#;
        assert!(verify_signature(body.as_bytes(), &sign("s3cret", body), "s3cret").is_ok());
        assert!(verify_signature(body.as_bytes(), &sign("other", body), "s3cret").is_err());
        assert!(verify_signature(body.as_bytes(), "md5=abc", "s3cret").is_err());
        assert!(verify_signature(body.as_bytes(), "sha256=zz", "s3cret").is_err());
    }

    #[test]
    fn webhook_payload_yields_text_and_image_messages() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{"object":"whatsapp_business_account","entry":[{"id":"1","changes":[{"field":"messages","value":{
                "messaging_product":"whatsapp",
                "messages":[
                    {"from":"15551234567","id":"wamid.1","timestamp":"1700000000","type":"text","text":{"body":" Bonjour "}},
                    {"from":"15551234567","id":"wamid.2","type":"image","image":{"id":"media-9","mime_type":"image/jpeg"}},
                    {"from":"15551234567","id":"wamid.3","type":"sticker","sticker":{"id":"s"}}
                ]}}]},
                {"id":"2","changes":[{"field":"messages","value":{"statuses":[{"id":"wamid.0","status":"read"}]}}]}]}"#,
        )
        .expect("parse payload");

        let inbound = inbound_messages(payload);
        assert_eq!(inbound.len(), 2);
        assert_eq!(inbound[0].channel, ChannelKind::WhatsApp);
        assert_eq!(inbound[0].content, "Bonjour");
        assert_eq!(inbound[0].sender_id.as_str(), "15551234567");
        assert_eq!(inbound[0].session_id, "15551234567");
        assert_eq!(inbound[0].message_id.as_str(), "wamid.1");
        assert_eq!(inbound[0].received_at.timestamp(), 1_700_000_000);
        assert_eq!(inbound[1].content, "");
        assert_eq!(inbound[1].image_ref.as_deref(), Some("media-9"));
    }

    #[tokio::test]
    async fn send_rejects_empty_content_before_any_request() {
        let err = adapter()
            .send("15551234567", OutboundMessage::text("   "))
            .await
            .expect_err("empty message");
        assert!(err.to_string().contains("empty"));
    }
}
