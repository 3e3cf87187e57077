//! Relay server.
//!
//! Wires storage, the provider client and channel adapters into the assistant pipeline,
//! then serves the webchat socket, the WhatsApp webhook and the operator routes.

use crate::assistant::AssistantAgent;
use crate::config::{RelayConfig, RunMode};
use crate::driver::ProviderClient;
use crate::events::ChannelSink;
use crate::gateway::Gateway;
use crate::quota::{DailyMessageQuota, QuotaCheck};
use crate::routes;
use crate::session::SessionBindings;
use crate::store::{ConversationStore, RetryingStore, SqliteStore};
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use relay_channels::{
    ChannelAdapter, ChannelKind, InboundMessage, TelegramAdapter, WebChatAdapter,
    WhatsAppCloudAdapter,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub assistant: Arc<AssistantAgent>,
    pub channels: Vec<ChannelKind>,
    pub active_window: chrono::Duration,
    pub started_at: Instant,
}

struct LoadedChannels {
    adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
    routers: Vec<axum::Router>,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayConfig::load_with_path(config_path).await?;
    let store_path = cfg.storage_path();
    SqliteStore::open(&store_path)
        .map_err(|e| anyhow::anyhow!("open store {}: {e}", store_path.display()))?;
    ProviderClient::from_config(&cfg)?;
    tracing::info!(
        provider = %cfg.general.provider,
        model = %cfg.general.model,
        store_path = %store_path.display(),
        webchat_enabled = cfg.channels.webchat.enabled,
        telegram_enabled = cfg.channels.telegram.enabled,
        whatsapp_enabled = cfg.channels.whatsapp.enabled,
        quota_enabled = cfg.quota.enabled,
        config_path = %path.display(),
        "config ok"
    );
    Ok(())
}

/// Background-triggered generation: runs under the background budget and delivers the
/// reply as one message.
pub async fn remind(
    config_path: Option<PathBuf>,
    channel: &str,
    recipient: &str,
    prompt: &str,
) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let channel = channel
        .parse::<ChannelKind>()
        .map_err(|e| anyhow::anyhow!(e))?;
    let adapter: Arc<dyn ChannelAdapter> = match channel {
        ChannelKind::Telegram => Arc::new(TelegramAdapter::new(&cfg.channels.telegram.bot_token)?),
        ChannelKind::WhatsApp => Arc::new(WhatsAppCloudAdapter::new(
            &cfg.channels.whatsapp.access_token,
            &cfg.channels.whatsapp.phone_number_id,
            &cfg.channels.whatsapp.verify_token,
        )?),
        ChannelKind::Web => {
            return Err(anyhow::anyhow!(
                "reminders need a messaging channel; webchat has no offline delivery"
            ));
        }
    };

    let assistant = build_assistant(&cfg)?;
    let inbound = InboundMessage::new(channel, recipient, recipient, prompt);
    let sink = ChannelSink::new(adapter, recipient, None, false);
    let outcome = assistant.handle(&inbound, RunMode::Background, &sink).await;
    tracing::info!(%channel, recipient, ?outcome, "reminder handled");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = RelayConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr = cfg.channels.webchat.bind_addr()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        provider = %cfg.general.provider,
        model = %cfg.general.model,
        streaming = cfg.general.streaming,
        bind_addr = %addr,
        http_timeout_secs = cfg.channels.webchat.http_timeout_secs,
        http_max_in_flight = cfg.channels.webchat.max_in_flight,
        webchat_enabled = cfg.channels.webchat.enabled,
        telegram_enabled = cfg.channels.telegram.enabled,
        whatsapp_enabled = cfg.channels.whatsapp.enabled,
        quota_enabled = cfg.quota.enabled,
        interactive_timeout_secs = cfg.assistant.interactive_timeout_secs,
        recovery_timeout_secs = cfg.assistant.recovery_timeout_secs,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let assistant = build_assistant(&cfg)?;
    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let LoadedChannels { adapters, routers } =
        load_channels(&cfg, inbound_tx, assistant.sessions()).await?;
    let mut channel_kinds: Vec<ChannelKind> = adapters.keys().copied().collect();
    channel_kinds.sort_by_key(|c| c.as_str());
    tracing::info!(channels = ?channel_kinds, "channels loaded");

    let shutdown = CancellationToken::new();
    let gateway = Arc::new(Gateway::new(
        cfg.general.streaming,
        assistant.clone(),
        adapters,
        inbound_rx,
        shutdown.child_token(),
    ));
    let gateway_handle = gateway.start();

    let state = Arc::new(AppState {
        assistant,
        channels: channel_kinds,
        active_window: cfg.active_window(),
        started_at,
    });
    let mut router = routes::router().layer(Extension(state));
    for channel_router in routers {
        router = router.merge(channel_router);
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = router
        .layer(GlobalConcurrencyLimitLayer::new(
            cfg.channels.webchat.max_in_flight,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.channels.webchat.http_timeout_secs),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "relay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    Ok(())
}

fn build_assistant(cfg: &RelayConfig) -> Result<Arc<AssistantAgent>> {
    let store_path = cfg.storage_path();
    let sqlite = SqliteStore::open(&store_path)
        .map_err(|e| anyhow::anyhow!("open store {}: {e}", store_path.display()))?;
    let store: Arc<dyn ConversationStore> = Arc::new(RetryingStore::new(Arc::new(sqlite)));
    tracing::info!(store_path = %store_path.display(), "conversation store opened");

    let provider = ProviderClient::from_config(cfg)?;
    let quota: Option<Arc<dyn QuotaCheck>> = if cfg.quota.enabled {
        Some(Arc::new(DailyMessageQuota::from_config(&cfg.quota)))
    } else {
        None
    };
    let assistant = AssistantAgent::new(cfg.clone(), store, provider, cfg.run_limits())?
        .with_quota(quota);
    tracing::info!(protocol = ?assistant.protocol(), "assistant pipeline ready");
    Ok(Arc::new(assistant))
}

async fn load_channels(
    cfg: &RelayConfig,
    inbound_tx: mpsc::Sender<InboundMessage>,
    sessions: &Arc<SessionBindings>,
) -> Result<LoadedChannels> {
    let mut adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>> = HashMap::new();
    let mut routers = Vec::new();

    if cfg.channels.webchat.enabled {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        tokio::spawn(sessions.clone().release_closed(ChannelKind::Web, closed_rx));
        let webchat = Arc::new(WebChatAdapter::new().with_disconnect_notifier(closed_tx));
        webchat.start(inbound_tx.clone()).await?;
        routers.push(webchat.clone().router());
        adapters.insert(ChannelKind::Web, webchat);
    }
    if cfg.channels.telegram.enabled {
        let telegram = Arc::new(TelegramAdapter::new(&cfg.channels.telegram.bot_token)?);
        telegram.start(inbound_tx.clone()).await?;
        adapters.insert(ChannelKind::Telegram, telegram);
    }
    if cfg.channels.whatsapp.enabled {
        let wa = &cfg.channels.whatsapp;
        let whatsapp = Arc::new(
            WhatsAppCloudAdapter::new(&wa.access_token, &wa.phone_number_id, &wa.verify_token)?
                .with_app_secret(wa.app_secret.clone()),
        );
        whatsapp.start(inbound_tx.clone()).await?;
        routers.push(whatsapp.clone().router());
        adapters.insert(ChannelKind::WhatsApp, whatsapp);
    }

    if adapters.is_empty() {
        return Err(anyhow::anyhow!("no channels enabled"));
    }
    Ok(LoadedChannels { adapters, routers })
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to install SIGTERM handler; falling back to ctrl_c only"
                );
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
