//! Events a generation emits toward the originating channel.

use async_trait::async_trait;
use relay_channels::{ChannelAdapter, MessageId, OutboundMessage, ThreadHandle};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// Logical id shared by every event of one reply.
    pub message_id: String,
    /// Fragment text for incremental events; empty on the terminal event.
    pub content: String,
    pub is_final: bool,
    /// Complete reply (or error text) carried by the terminal event.
    pub full_response: Option<String>,
    pub is_error: bool,
    pub thread_handle: Option<String>,
}

impl StreamEvent {
    pub fn delta(message_id: &str, content: impl Into<String>) -> Self {
        Self {
            message_id: message_id.to_string(),
            content: content.into(),
            is_final: false,
            full_response: None,
            is_error: false,
            thread_handle: None,
        }
    }

    pub fn complete(message_id: &str, full_response: impl Into<String>) -> Self {
        Self {
            message_id: message_id.to_string(),
            content: String::new(),
            is_final: true,
            full_response: Some(full_response.into()),
            is_error: false,
            thread_handle: None,
        }
    }

    pub fn error(message_id: &str, message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::complete(message_id, message)
        }
    }

    pub fn with_thread_handle(mut self, thread_handle: Option<&str>) -> Self {
        self.thread_handle = thread_handle.map(str::to_string);
        self
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: StreamEvent) -> anyhow::Result<()>;
}

/// Delivers events through a channel adapter: deltas only when the channel renders
/// them, the terminal event as one complete message.
pub struct ChannelSink {
    adapter: Arc<dyn ChannelAdapter>,
    recipient: String,
    reply_to: Option<MessageId>,
    stream_deltas: bool,
}

impl ChannelSink {
    pub fn new(
        adapter: Arc<dyn ChannelAdapter>,
        recipient: impl Into<String>,
        reply_to: Option<MessageId>,
        streaming: bool,
    ) -> Self {
        let stream_deltas = streaming
            && adapter.channel().streams_deltas()
            && adapter.supports_streaming_deltas();
        Self {
            adapter,
            recipient: recipient.into(),
            reply_to,
            stream_deltas,
        }
    }

    pub fn streams_deltas(&self) -> bool {
        self.stream_deltas
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: StreamEvent) -> anyhow::Result<()> {
        if !event.is_final {
            if self.stream_deltas && !event.content.is_empty() {
                self.adapter
                    .send_delta(&self.recipient, &event.message_id, &event.content)
                    .await?;
            }
            return Ok(());
        }

        let message = OutboundMessage {
            content: event.full_response.unwrap_or_default(),
            message_ref: Some(event.message_id),
            reply_to_message_id: self.reply_to.clone(),
            thread_handle: event.thread_handle.map(ThreadHandle::new),
            is_error: event.is_error,
        };
        self.adapter.send(&self.recipient, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_channels::{ChannelKind, InboundMessage};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CapturingAdapter {
        kind: Option<ChannelKind>,
        deltas: Mutex<Vec<(String, String)>>,
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl ChannelAdapter for CapturingAdapter {
        fn channel(&self) -> ChannelKind {
            self.kind.unwrap_or(ChannelKind::Web)
        }

        async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send(&self, _recipient_id: &str, message: OutboundMessage) -> anyhow::Result<()> {
            self.sent.lock().expect("sent lock").push(message);
            Ok(())
        }

        async fn send_delta(
            &self,
            _recipient_id: &str,
            message_ref: &str,
            delta: &str,
        ) -> anyhow::Result<()> {
            self.deltas
                .lock()
                .expect("delta lock")
                .push((message_ref.to_string(), delta.to_string()));
            Ok(())
        }

        fn supports_streaming_deltas(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn web_sink_streams_deltas_then_sends_final() {
        let adapter = Arc::new(CapturingAdapter::default());
        let sink = ChannelSink::new(adapter.clone(), "sess-1", None, true);
        assert!(sink.streams_deltas());

        sink.emit(StreamEvent::delta("m1", "Bon")).await.expect("delta");
        sink.emit(StreamEvent::complete("m1", "Bonjour").with_thread_handle(Some("h1")))
            .await
            .expect("final");

        assert_eq!(
            *adapter.deltas.lock().expect("delta lock"),
            vec![("m1".to_string(), "Bon".to_string())]
        );
        let sent = adapter.sent.lock().expect("sent lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "Bonjour");
        assert_eq!(sent[0].message_ref.as_deref(), Some("m1"));
        assert_eq!(sent[0].thread_handle.as_ref().map(|h| h.as_str()), Some("h1"));
        assert!(!sent[0].is_error);
    }

    #[tokio::test]
    async fn messaging_channels_only_get_the_final_text() {
        let adapter = Arc::new(CapturingAdapter {
            kind: Some(ChannelKind::Telegram),
            ..CapturingAdapter::default()
        });
        let sink = ChannelSink::new(adapter.clone(), "42", None, true);
        assert!(!sink.streams_deltas());

        sink.emit(StreamEvent::delta("m1", "Bon")).await.expect("delta");
        sink.emit(StreamEvent::error("m1", "Something went wrong"))
            .await
            .expect("final");

        assert!(adapter.deltas.lock().expect("delta lock").is_empty());
        let sent = adapter.sent.lock().expect("sent lock");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_error);
    }

    #[test]
    fn terminal_events_carry_the_full_response() {
        let done = StreamEvent::complete("m", "Bonjour!");
        assert!(done.is_final);
        assert_eq!(done.full_response.as_deref(), Some("Bonjour!"));
        assert!(StreamEvent::error("m", "x").is_error);
        assert!(!StreamEvent::delta("m", "x").is_final);
    }
}
