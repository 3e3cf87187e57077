use crate::types::{ChannelKind, InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> ChannelKind;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a complete message to a specific recipient on this platform.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;

    /// Send a streaming delta chunk belonging to the reply `message_ref`.
    /// Adapters that do not support chunked updates should keep the default.
    async fn send_delta(
        &self,
        _recipient_id: &str,
        _message_ref: &str,
        _delta: &str,
    ) -> Result<()> {
        Err(anyhow::anyhow!(
            "send_delta is not supported by this channel"
        ))
    }

    fn supports_streaming_deltas(&self) -> bool {
        false
    }
}
