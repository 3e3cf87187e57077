use crate::traits::ChannelAdapter;
use crate::types::{ChannelKind, InboundMessage, OutboundMessage, ThreadHandle};
use anyhow::{Result, anyhow};
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Clone)]
struct WebChatState {
    inbound_tx: Arc<tokio::sync::RwLock<Option<mpsc::Sender<InboundMessage>>>>,
    connections: Arc<DashMap<String, mpsc::UnboundedSender<Message>>>,
    /// Receives the session id of every socket that closed.
    disconnects: Option<mpsc::UnboundedSender<String>>,
}

#[derive(Clone)]
pub struct WebChatAdapter {
    state: WebChatState,
}

impl Default for WebChatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl WebChatAdapter {
    pub fn new() -> Self {
        Self {
            state: WebChatState {
                inbound_tx: Arc::new(tokio::sync::RwLock::new(None)),
                connections: Arc::new(DashMap::new()),
                disconnects: None,
            },
        }
    }

    pub fn with_disconnect_notifier(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.state.disconnects = Some(tx);
        self
    }

    /// Router that serves the WebChat WebSocket at `/ws`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/ws", get(ws_upgrade)).with_state(self)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    fn register(&self, session_id: &str, outbound_tx: mpsc::UnboundedSender<Message>) {
        self.state
            .connections
            .insert(session_id.to_string(), outbound_tx);
    }

    /// Forgets the connection and reports the closed session once.
    fn close_session(&self, session_id: &str) {
        self.state.connections.remove(session_id);
        if let Some(tx) = &self.state.disconnects {
            if tx.send(session_id.to_string()).is_err() {
                tracing::debug!(session_id, "disconnect listener gone");
            }
        }
    }

    fn push(&self, recipient_id: &str, payload: serde_json::Value) -> Result<()> {
        let Some(conn) = self.state.connections.get(recipient_id) else {
            return Err(anyhow!(
                "webchat connection not found for recipient_id={recipient_id}"
            ));
        };
        conn.send(Message::Text(payload.to_string().into()))
            .map_err(|_| anyhow!("webchat send failed: socket closed"))
    }
}

/// Frames a browser client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Message {
        #[serde(default)]
        content: String,
        /// Handle the client stored locally after an earlier reply.
        #[serde(default)]
        thread_handle: Option<String>,
        #[serde(default)]
        image_ref: Option<String>,
        /// Account id asserted by the client and taken as-is, so the socket must be
        /// authenticated upstream. Anonymous sessions fall back to the connection id.
        #[serde(default)]
        user_id: Option<String>,
    },
}

fn inbound_from_frame(session_id: &str, raw: &str) -> Result<InboundMessage> {
    let parsed: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| anyhow!("webchat received invalid json: {e}"))?;
    let frame: ClientFrame = serde_json::from_value(parsed.clone())
        .map_err(|e| anyhow!("webchat invalid payload: {e}"))?;

    let ClientFrame::Message {
        content,
        thread_handle,
        image_ref,
        user_id,
    } = frame;
    let image_ref = image_ref.filter(|r| !r.trim().is_empty());
    if content.trim().is_empty() && image_ref.is_none() {
        return Err(anyhow!("webchat message has neither content nor image"));
    }

    let owner = user_id
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| session_id.to_string());
    let mut inbound = InboundMessage::new(ChannelKind::Web, owner, session_id, content);
    inbound.thread_hint = thread_handle
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .map(ThreadHandle::new);
    inbound.image_ref = image_ref;
    inbound.metadata = parsed;
    Ok(inbound)
}

/// Binds the connection to the owner of its first message; later frames may not switch.
fn pin_owner(pinned: &mut Option<String>, inbound: &InboundMessage) -> Result<()> {
    let owner = inbound.sender_id.as_str();
    if let Some(existing) = pinned.as_deref() {
        if existing != owner {
            return Err(anyhow!(
                "webchat owner changed mid-connection from {existing} to {owner}"
            ));
        }
        return Ok(());
    }
    *pinned = Some(owner.to_string());
    Ok(())
}

fn delta_frame(message_ref: &str, delta: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "delta",
        "message_id": message_ref,
        "content": delta,
        "is_final": false,
    })
}

fn final_frame(message: &OutboundMessage) -> serde_json::Value {
    serde_json::json!({
        "type": "message",
        "message_id": message.message_ref,
        "is_final": true,
        "full_response": message.content,
        "thread_handle": message.thread_handle,
        "error": message.is_error,
    })
}

async fn ws_upgrade(
    State(adapter): State<Arc<WebChatAdapter>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(adapter, socket))
}

#[tracing::instrument(level = "info", skip_all)]
async fn handle_socket(adapter: Arc<WebChatAdapter>, socket: WebSocket) {
    let session_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    adapter.register(&session_id, outbound_tx);

    let hello = serde_json::json!({ "type": "hello", "session_id": session_id });
    if ws_sender
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        adapter.close_session(&session_id);
        return;
    }

    let adapter_out = adapter.clone();
    let session_id_out = session_id.clone();
    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
        adapter_out.state.connections.remove(&session_id_out);
    });

    let mut owner = None;
    while let Some(Ok(msg)) = ws_receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };

        let inbound = match inbound_from_frame(&session_id, &text)
            .and_then(|inbound| pin_owner(&mut owner, &inbound).map(|()| inbound))
        {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::error!(%e, session_id = %session_id, "webchat frame rejected");
                break;
            }
        };

        let tx = adapter.state.inbound_tx.read().await.clone();
        if let Some(tx) = tx {
            if let Err(e) = tx.send(inbound).await {
                tracing::error!(%e, session_id = %session_id, "webchat inbound queue closed");
                break;
            }
        } else {
            tracing::error!(
                session_id = %session_id,
                "webchat adapter started without inbound queue"
            );
            break;
        }
    }

    outbound_task.abort();
    adapter.close_session(&session_id);
    tracing::debug!(session_id = %session_id, "webchat socket closed");
}

#[async_trait::async_trait]
impl ChannelAdapter for WebChatAdapter {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Web
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.state.inbound_tx.write().await = Some(tx);
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        self.push(recipient_id, final_frame(&message))
    }

    async fn send_delta(&self, recipient_id: &str, message_ref: &str, delta: &str) -> Result<()> {
        self.push(recipient_id, delta_frame(message_ref, delta))
    }

    fn supports_streaming_deltas(&self) -> bool {
        true
    }
}
