//! Relay configuration loader.
//!
//! TOML file, then `.env`, then environment overrides, then `validate()`.

use crate::driver::{RunLimits, RunSettings};
use relay_llm::ProviderKind;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub conversations: ConversationsConfig,
    #[serde(default)]
    pub locks: LocksConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Stream fragments to channels that can render them. Off means one final reply.
    #[serde(default = "default_true")]
    pub streaming: bool,
    /// Overrides the chat-completions URL for OpenAI-compatible providers.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            system_prompt: default_system_prompt(),
            streaming: true,
            endpoint: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_provider() -> ProviderKind {
    ProviderKind::OpenAi
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. Answer in the language the user writes in.".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub deepseek_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_interactive_timeout_secs")]
    pub interactive_timeout_secs: u64,
    #[serde(default = "default_background_timeout_secs")]
    pub background_timeout_secs: u64,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Ceiling on waiting for a previous run to settle before a new one starts.
    #[serde(default = "default_pre_run_wait_secs")]
    pub pre_run_wait_secs: u64,
    #[serde(default = "default_replay_chunk_chars")]
    pub replay_chunk_chars: usize,
    #[serde(default = "default_replay_chunk_delay_ms")]
    pub replay_chunk_delay_ms: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            assistant_id: None,
            base_url: None,
            interactive_timeout_secs: default_interactive_timeout_secs(),
            background_timeout_secs: default_background_timeout_secs(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            pre_run_wait_secs: default_pre_run_wait_secs(),
            replay_chunk_chars: default_replay_chunk_chars(),
            replay_chunk_delay_ms: default_replay_chunk_delay_ms(),
        }
    }
}

fn default_interactive_timeout_secs() -> u64 {
    120
}

fn default_background_timeout_secs() -> u64 {
    60
}

fn default_recovery_timeout_secs() -> u64 {
    45
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_pre_run_wait_secs() -> u64 {
    10
}

fn default_replay_chunk_chars() -> usize {
    12
}

fn default_replay_chunk_delay_ms() -> u64 {
    15
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub webchat: WebChatConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebChatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Applies to plain HTTP requests; websocket sessions outlive it once upgraded.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for WebChatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: default_port(),
            http_timeout_secs: default_http_timeout_secs(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl WebChatConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let raw = format!("{}:{}", self.bind.trim(), self.port);
        raw.parse()
            .map_err(|e| anyhow::anyhow!("invalid channels.webchat bind address {raw}: {e}"))
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_max_in_flight() -> usize {
    256
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
    #[serde(default)]
    pub verify_token: String,
    #[serde(default)]
    pub app_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// SQLite file. Default: `~/.relay/data/relay.db`
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,
    #[serde(default = "default_upgrade_message")]
    pub upgrade_message: String,
    #[serde(default = "default_warning_instruction")]
    pub warning_instruction: String,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            daily_limit: default_daily_limit(),
            warning_threshold: default_warning_threshold(),
            upgrade_message: default_upgrade_message(),
            warning_instruction: default_warning_instruction(),
        }
    }
}

fn default_daily_limit() -> u32 {
    50
}

fn default_warning_threshold() -> u32 {
    40
}

fn default_upgrade_message() -> String {
    "You have reached today's message limit. Upgrade your plan to keep chatting.".to_string()
}

fn default_warning_instruction() -> String {
    "The user is close to their daily message limit. Mention briefly at the end of your reply \
     that they can upgrade their plan for more messages."
        .to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationsConfig {
    /// A conversation with no message for longer than this is archived.
    #[serde(default = "default_active_window_hours")]
    pub active_window_hours: u64,
    /// Turns loaded into a provider request for chat-completion providers.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for ConversationsConfig {
    fn default() -> Self {
        Self {
            active_window_hours: default_active_window_hours(),
            history_limit: default_history_limit(),
        }
    }
}

fn active_window_from_hours(hours: u64) -> Option<chrono::Duration> {
    i64::try_from(hours).ok().and_then(chrono::Duration::try_hours)
}

fn default_active_window_hours() -> u64 {
    24 * 7
}

fn default_history_limit() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocksConfig {
    /// Idle lock entries are pruned once the table grows past this size.
    #[serde(default = "default_prune_threshold")]
    pub prune_threshold: usize,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            prune_threshold: default_prune_threshold(),
        }
    }
}

fn default_prune_threshold() -> usize {
    10_000
}

/// Which budget a generation runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Interactive,
    Background,
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (cfg, _) = Self::load_with_path(path).await?;
        Ok(cfg)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(%e, "failed to load .env file");
            }
        }

        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    config_path = %path.display(),
                    "config file not found; using defaults and environment"
                );
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RELAY_PROVIDER") {
            match v.parse::<ProviderKind>() {
                Ok(provider) => self.general.provider = provider,
                Err(e) => tracing::warn!(%e, value = %v, "ignoring RELAY_PROVIDER"),
            }
        }
        if let Some(v) = get("RELAY_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = get("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = get("DEEPSEEK_API_KEY") {
            self.keys.deepseek_api_key = Some(v);
        }
        if let Some(v) = get("RELAY_ASSISTANT_ID") {
            self.assistant.assistant_id = Some(v);
        }
        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.channels.telegram.bot_token = v;
            self.channels.telegram.enabled = true;
        }
        if let Some(v) = get("WHATSAPP_ACCESS_TOKEN") {
            self.channels.whatsapp.access_token = v;
            self.channels.whatsapp.enabled = true;
        }
        if let Some(v) = get("WHATSAPP_PHONE_NUMBER_ID") {
            self.channels.whatsapp.phone_number_id = v;
        }
        if let Some(v) = get("WHATSAPP_VERIFY_TOKEN") {
            self.channels.whatsapp.verify_token = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.api_key().is_none() {
            return Err(anyhow::anyhow!(
                "no api key configured for provider {}",
                self.general.provider
            ));
        }
        if self.general.provider == ProviderKind::Assistant
            && self
                .assistant
                .assistant_id
                .as_deref()
                .is_none_or(|id| id.trim().is_empty())
        {
            return Err(anyhow::anyhow!(
                "assistant.assistant_id is required for the assistant provider"
            ));
        }
        if self.channels.webchat.enabled && self.channels.webchat.port == 0 {
            return Err(anyhow::anyhow!("channels.webchat.port must be > 0"));
        }
        if self.channels.webchat.max_in_flight == 0 {
            return Err(anyhow::anyhow!("channels.webchat.max_in_flight must be > 0"));
        }
        if self.channels.telegram.enabled && self.channels.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("channels.telegram.bot_token is required"));
        }
        if self.channels.whatsapp.enabled {
            let wa = &self.channels.whatsapp;
            if wa.phone_number_id.trim().is_empty() || wa.verify_token.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "channels.whatsapp requires phone_number_id and verify_token"
                ));
            }
        }
        if self.assistant.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("assistant.poll_interval_ms must be > 0"));
        }
        if self.assistant.replay_chunk_chars == 0 {
            return Err(anyhow::anyhow!("assistant.replay_chunk_chars must be > 0"));
        }
        if active_window_from_hours(self.conversations.active_window_hours).is_none() {
            return Err(anyhow::anyhow!(
                "conversations.active_window_hours is out of range"
            ));
        }
        if self.quota.enabled && self.quota.warning_threshold > self.quota.daily_limit {
            return Err(anyhow::anyhow!(
                "quota.warning_threshold must not exceed quota.daily_limit"
            ));
        }
        Ok(())
    }

    /// Key for the configured provider. The assistant-run family is served by OpenAI.
    pub fn api_key(&self) -> Option<String> {
        let key = match self.general.provider {
            ProviderKind::OpenAi | ProviderKind::Assistant => &self.keys.openai_api_key,
            ProviderKind::Anthropic => &self.keys.anthropic_api_key,
            ProviderKind::DeepSeek => &self.keys.deepseek_api_key,
        };
        key.clone().filter(|s| !s.trim().is_empty())
    }

    pub fn run_settings(&self, mode: RunMode) -> RunSettings {
        let run_timeout = match mode {
            RunMode::Interactive => self.assistant.interactive_timeout_secs,
            RunMode::Background => self.assistant.background_timeout_secs,
        };
        let system_preamble = Some(self.general.system_prompt.trim().to_string())
            .filter(|p| !p.is_empty());
        RunSettings {
            provider: self.general.provider,
            model: self.general.model.clone(),
            history_profile: self.general.provider.history_profile(&self.general.model),
            system_preamble,
            additional_instructions: None,
            streaming: self.general.streaming && mode == RunMode::Interactive,
            run_timeout: Duration::from_secs(run_timeout),
            assistant_id: self.assistant.assistant_id.clone(),
        }
    }

    pub fn run_limits(&self) -> RunLimits {
        RunLimits {
            poll_interval: Duration::from_millis(self.assistant.poll_interval_ms),
            pre_run_wait: Duration::from_secs(self.assistant.pre_run_wait_secs),
            recovery_timeout: Duration::from_secs(self.assistant.recovery_timeout_secs),
            replay_chunk_chars: self.assistant.replay_chunk_chars,
            replay_chunk_delay: Duration::from_millis(self.assistant.replay_chunk_delay_ms),
        }
    }

    /// Saturates for windows `validate` would reject.
    pub fn active_window(&self) -> chrono::Duration {
        active_window_from_hours(self.conversations.active_window_hours)
            .unwrap_or_else(chrono::Duration::max_value)
    }

    pub fn storage_path(&self) -> PathBuf {
        match self.storage.path.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => expand_home(p),
            _ => default_data_dir().join("relay.db"),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".relay").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".relay").join("data")
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_llm::HistoryProfile;
    use std::collections::HashMap;

    fn with_key(mut cfg: RelayConfig) -> RelayConfig {
        cfg.keys.openai_api_key = Some("sk-test".to_string());
        cfg
    }

    #[test]
    fn empty_file_yields_documented_defaults() {
        let cfg = RelayConfig::parse("").expect("parse empty config");
        assert_eq!(cfg.general.provider, ProviderKind::OpenAi);
        assert_eq!(cfg.assistant.interactive_timeout_secs, 120);
        assert_eq!(cfg.assistant.background_timeout_secs, 60);
        assert_eq!(cfg.assistant.recovery_timeout_secs, 45);
        assert!(cfg.channels.webchat.enabled);
        assert!(!cfg.quota.enabled);
        assert_eq!(
            cfg.channels.webchat.bind_addr().expect("bind addr"),
            "127.0.0.1:3000".parse::<SocketAddr>().expect("socket addr")
        );
        assert!(with_key(cfg).validate().is_ok());
    }

    #[test]
    fn toml_sections_are_parsed() {
        let cfg = RelayConfig::parse(
            r#"
[general]
provider = "deepseek"
model = "deepseek-reasoner"
streaming = false

[keys]
deepseek_api_key = "ds-key"

[channels.whatsapp]
enabled = true
access_token = "wa"
phone_number_id = "1234"
verify_token = "v"

[quota]
enabled = true
daily_limit = 10
warning_threshold = 8
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.general.provider, ProviderKind::DeepSeek);
        assert_eq!(cfg.api_key().as_deref(), Some("ds-key"));
        assert!(cfg.validate().is_ok());

        let settings = cfg.run_settings(RunMode::Interactive);
        assert_eq!(settings.history_profile, HistoryProfile::StrictAlternation);
        assert!(!settings.streaming);
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RELAY_PROVIDER", "assistant"),
            ("RELAY_MODEL", "gpt-4.1"),
            ("OPENAI_API_KEY", "sk-env"),
            ("RELAY_ASSISTANT_ID", "asst_123"),
            ("TELEGRAM_BOT_TOKEN", "tg"),
            ("WHATSAPP_VERIFY_TOKEN", "  "),
        ]);
        let mut cfg = RelayConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.general.provider, ProviderKind::Assistant);
        assert_eq!(cfg.general.model, "gpt-4.1");
        assert_eq!(cfg.assistant.assistant_id.as_deref(), Some("asst_123"));
        assert!(cfg.channels.telegram.enabled);
        assert!(cfg.channels.whatsapp.verify_token.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_rejects_incomplete_setups() {
        let cfg = RelayConfig::default();
        assert!(cfg.validate().is_err(), "missing api key");

        let mut cfg = with_key(RelayConfig::default());
        cfg.general.provider = ProviderKind::Assistant;
        assert!(cfg.validate().is_err(), "missing assistant id");

        let mut cfg = with_key(RelayConfig::default());
        cfg.quota.enabled = true;
        cfg.quota.warning_threshold = cfg.quota.daily_limit + 1;
        assert!(cfg.validate().is_err(), "warning above limit");
    }

    #[test]
    fn oversized_active_window_is_rejected_without_panicking() {
        let mut cfg = with_key(RelayConfig::default());
        cfg.conversations.active_window_hours = u64::MAX / 2;
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.active_window(), chrono::Duration::max_value());

        cfg.conversations.active_window_hours = 48;
        assert_eq!(cfg.active_window(), chrono::Duration::hours(48));
    }

    #[test]
    fn background_runs_use_the_shorter_budget_and_never_stream() {
        let cfg = with_key(RelayConfig::default());
        let interactive = cfg.run_settings(RunMode::Interactive);
        let background = cfg.run_settings(RunMode::Background);
        assert_eq!(interactive.run_timeout, Duration::from_secs(120));
        assert_eq!(background.run_timeout, Duration::from_secs(60));
        assert!(interactive.streaming);
        assert!(!background.streaming);
        assert_eq!(cfg.run_limits().recovery_timeout, Duration::from_secs(45));
    }
}
