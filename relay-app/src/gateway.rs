//! Session multiplexer: all channel adapters feed into a single inbound queue.
//!
//! Each message is handled on its own task so the per-thread guard, not queue order,
//! decides what runs concurrently.

use crate::assistant::AssistantAgent;
use crate::config::RunMode;
use crate::events::ChannelSink;
use anyhow::Result;
use relay_channels::{ChannelAdapter, ChannelKind, InboundMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Gateway {
    streaming: bool,
    assistant: Arc<AssistantAgent>,
    channels: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        streaming: bool,
        assistant: Arc<AssistantAgent>,
        channels: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            streaming,
            assistant,
            channels,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
            shutdown,
        }
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop().await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(self: &Arc<Self>) -> Result<()> {
        loop {
            let msg = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        tracing::info!("gateway shutting down");
                        return Ok(());
                    }
                    msg = rx.recv() => msg,
                }
            };
            let Some(inbound) = msg else {
                return Ok(());
            };

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_inbound(inbound).await {
                    tracing::warn!(%e, "handle_inbound failed");
                }
            });
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(channel = %inbound.channel))]
    async fn handle_inbound(&self, inbound: InboundMessage) -> Result<()> {
        let adapter = self
            .channels
            .get(&inbound.channel)
            .ok_or_else(|| anyhow::anyhow!("unknown channel: {}", inbound.channel))?
            .clone();
        let sink = ChannelSink::new(
            adapter,
            inbound.session_id.clone(),
            Some(inbound.message_id.clone()),
            self.streaming,
        );
        let outcome = self
            .assistant
            .handle(&inbound, RunMode::Interactive, &sink)
            .await;
        tracing::debug!(?outcome, "inbound message handled");
        Ok(())
    }
}
