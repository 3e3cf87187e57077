//! Interactive-session thread bindings, keyed by (channel, session key).
//!
//! A binding remembers which conversation the current connection or chat is talking in, so
//! follow-up messages skip the rest of the resolver chain.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_channels::ChannelKind;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionScope {
    channel: ChannelKind,
    session_key: String,
}

impl SessionScope {
    fn new(channel: ChannelKind, session_key: &str) -> Self {
        Self {
            channel,
            session_key: session_key.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Binding {
    thread_handle: String,
    bound_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct SessionBindings {
    bindings: DashMap<SessionScope, Binding>,
}

impl SessionBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel: ChannelKind, session_key: &str) -> Option<String> {
        self.bindings
            .get(&SessionScope::new(channel, session_key))
            .map(|b| b.thread_handle.clone())
    }

    pub fn bind(&self, channel: ChannelKind, session_key: &str, thread_handle: &str) {
        let previous = self.bindings.insert(
            SessionScope::new(channel, session_key),
            Binding {
                thread_handle: thread_handle.to_string(),
                bound_at: Utc::now(),
            },
        );
        if previous
            .as_ref()
            .is_some_and(|p| p.thread_handle != thread_handle)
        {
            tracing::debug!(
                %channel,
                session_key,
                thread_handle,
                "session rebound to a different conversation"
            );
        }
    }

    pub fn unbind(&self, channel: ChannelKind, session_key: &str) -> bool {
        self.bindings
            .remove(&SessionScope::new(channel, session_key))
            .is_some()
    }

    /// Drops the binding of every session reported closed until the sender goes away.
    pub async fn release_closed(
        self: Arc<Self>,
        channel: ChannelKind,
        mut closed: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(session_key) = closed.recv().await {
            if self.unbind(channel, &session_key) {
                tracing::debug!(%channel, session_key, "session binding released");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Most recently bound first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .bindings
            .iter()
            .map(|entry| {
                let (scope, binding) = entry.pair();
                SessionSummary {
                    channel: scope.channel,
                    session_key: scope.session_key.clone(),
                    thread_handle: binding.thread_handle.clone(),
                    bound_at: binding.bound_at,
                }
            })
            .collect();
        out.sort_by_key(|s| std::cmp::Reverse(s.bound_at));
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub channel: ChannelKind,
    pub session_key: String,
    pub thread_handle: String,
    pub bound_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_are_scoped_per_channel() {
        let sessions = SessionBindings::new();
        sessions.bind(ChannelKind::Web, "sess-1", "web-u1-1");
        assert_eq!(
            sessions.get(ChannelKind::Web, "sess-1").as_deref(),
            Some("web-u1-1")
        );
        assert!(sessions.get(ChannelKind::Telegram, "sess-1").is_none());
        assert!(sessions.get(ChannelKind::Web, "sess-2").is_none());
    }

    #[test]
    fn rebinding_replaces_and_unbind_removes() {
        let sessions = SessionBindings::new();
        sessions.bind(ChannelKind::Telegram, "42", "thread_a");
        sessions.bind(ChannelKind::Telegram, "42", "thread_b");
        assert_eq!(sessions.len(), 1);
        assert_eq!(
            sessions.get(ChannelKind::Telegram, "42").as_deref(),
            Some("thread_b")
        );

        assert!(sessions.unbind(ChannelKind::Telegram, "42"));
        assert!(!sessions.unbind(ChannelKind::Telegram, "42"));
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn closed_sessions_lose_their_binding() {
        let sessions = Arc::new(SessionBindings::new());
        sessions.bind(ChannelKind::Web, "sess-1", "web-u1-1");
        sessions.bind(ChannelKind::Web, "sess-2", "web-u2-1");
        sessions.bind(ChannelKind::Telegram, "sess-1", "thread_a");

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("sess-1".to_string()).expect("send");
        tx.send("unknown".to_string()).expect("send");
        drop(tx);
        sessions.clone().release_closed(ChannelKind::Web, rx).await;

        assert!(sessions.get(ChannelKind::Web, "sess-1").is_none());
        assert!(sessions.get(ChannelKind::Web, "sess-2").is_some());
        assert!(sessions.get(ChannelKind::Telegram, "sess-1").is_some());
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn list_reports_every_binding() {
        let sessions = SessionBindings::new();
        sessions.bind(ChannelKind::Web, "a", "h1");
        sessions.bind(ChannelKind::WhatsApp, "331234", "h2");
        let listed = sessions.list();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|s| s.thread_handle == "h2"
            && s.channel == ChannelKind::WhatsApp
            && s.session_key == "331234"));
    }
}
