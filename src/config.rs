//! # Configuration Management
//!
//! Loads bridge configuration from layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` / `config.json` in the working directory
//! - `APP_`-prefixed environment variables (`APP_AGENT__MODEL=...`)
//! - The deployment variables the telephony platform already sets
//!   (`OPENAI_API_KEY`, `WAYBEO_AUTH_TOKEN`, `PORT`, ...)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (see [`DEPLOYMENT_OVERRIDES`])
//! 2. `APP_` environment variables, with `__` between section and field
//! 3. Configuration file
//! 4. Default values
//!
//! Loading never fails on a missing transfer token: transfers are switched off
//! with a warning instead. A missing agent API key is fatal.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Deployment environment variables and the config keys they override.
pub const DEPLOYMENT_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("OPENAI_API_KEY", "agent.api_key"),
    ("VOICEAGENT_MODEL", "agent.model"),
    ("VAD_THRESHOLD", "agent.vad_threshold"),
    ("VAD_PREFIX_PADDING_MS", "agent.vad_prefix_padding_ms"),
    ("VAD_SILENCE_DURATION_MS", "agent.vad_silence_duration_ms"),
    ("ENABLE_CALL_TRANSFER", "transfer.enabled"),
    ("WAYBEO_WEBHOOK_URL", "transfer.webhook_url"),
    ("WAYBEO_AUTH_TOKEN", "transfer.auth_token"),
];

const REDACTED: &str = "***";

const DEFAULT_INSTRUCTIONS: &str = "You are a friendly phone assistant. Greet the caller, \
find out what they need, and collect their name and the reason for their call. Confirm each \
detail back to the caller. Once you have what you need, or whenever the caller asks for a \
person, tell them you are connecting them to a colleague and call the transfer_call function.";

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub transfer: TransferConfig,
    pub audio: AudioConfig,
    pub storage: StorageConfig,
    pub performance: PerformanceConfig,
}

/// HTTP listener settings.
///
/// ## Fields:
/// - `host`: bind address; `0.0.0.0` so the carrier can reach the bridge
/// - `port`: TCP port
/// - `ws_path`: path the carrier opens its media WebSocket on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
}

/// Realtime speech agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// WebSocket endpoint, without the `model` query parameter
    pub url: String,
    pub model: String,
    pub api_key: String,
    pub voice: String,
    pub temperature: f32,
    /// Model that transcribes caller audio
    pub transcription_model: String,
    pub instructions: String,
    /// When set, instructions are read from this file instead
    pub instructions_file: String,
    /// Budget for connect plus `session.update`
    pub handshake_timeout_ms: u64,
    pub vad_threshold: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,
}

/// Human handoff through the PBX webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub enabled: bool,
    pub webhook_url: String,
    pub auth_token: String,
    /// Delay between the agent's request and the webhook call
    pub grace_period_ms: u64,
    pub request_timeout_ms: u64,
}

/// Audio path tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Edge fade applied to every 8kHz chunk sent to the caller
    pub fade_ms: u32,
    /// Sinc interpolation length of the resampler
    pub sinc_len: usize,
    /// Some carriers open with a frame of line noise
    pub drop_first_media_frame: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Where transcripts and queue items are written
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_calls: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8081,
                ws_path: "/ws".to_string(),
            },
            agent: AgentConfig {
                url: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-realtime".to_string(),
                api_key: String::new(),
                voice: "alloy".to_string(),
                temperature: 0.7,
                transcription_model: "whisper-1".to_string(),
                instructions: DEFAULT_INSTRUCTIONS.to_string(),
                instructions_file: String::new(),
                handshake_timeout_ms: 5_000,
                vad_threshold: 0.5,
                vad_prefix_padding_ms: 300,
                vad_silence_duration_ms: 600,
            },
            transfer: TransferConfig {
                enabled: true,
                webhook_url: "https://pbx-uat.waybeo.com/bot-call".to_string(),
                auth_token: String::new(),
                grace_period_ms: 5_000,
                request_timeout_ms: 10_000,
            },
            audio: AudioConfig {
                fade_ms: 2,
                sinc_len: 128,
                drop_first_media_frame: false,
            },
            storage: StorageConfig {
                data_dir: "data/calls".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_calls: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`: override `server.port`
    /// - `APP_TRANSFER__GRACE_PERIOD_MS=3000`: override `transfer.grace_period_ms`
    /// - `OPENAI_API_KEY=sk-...`: the agent key, as most deployments set it
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        for (var, key) in DEPLOYMENT_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(*key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(anyhow!("WebSocket path must start with '/'"));
        }

        if self.agent.api_key.trim().is_empty() {
            return Err(anyhow!(
                "Speech agent API key is missing (set OPENAI_API_KEY or APP_AGENT__API_KEY)"
            ));
        }

        if self.agent.handshake_timeout_ms == 0 {
            return Err(anyhow!("Agent handshake timeout must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.agent.vad_threshold) {
            return Err(anyhow!(
                "VAD threshold must be between 0.0 and 1.0, got {}",
                self.agent.vad_threshold
            ));
        }

        if !(0.0..=2.0).contains(&self.agent.temperature) {
            return Err(anyhow!(
                "Agent temperature must be between 0.0 and 2.0, got {}",
                self.agent.temperature
            ));
        }

        if self.audio.sinc_len == 0 {
            return Err(anyhow!("Resampler sinc length must be greater than 0"));
        }

        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow!("Max concurrent calls must be greater than 0"));
        }

        if self.transfer_enabled() && self.transfer.webhook_url.trim().is_empty() {
            return Err(anyhow!("Transfer webhook URL is empty"));
        }

        Ok(())
    }

    /// Transfers run only when enabled and a webhook token is configured.
    pub fn transfer_enabled(&self) -> bool {
        self.transfer.enabled && !self.transfer.auth_token.trim().is_empty()
    }

    /// Instruction text for the agent, read from `instructions_file` when set.
    pub fn resolve_instructions(&self) -> Result<String> {
        if self.agent.instructions_file.trim().is_empty() {
            return Ok(self.agent.instructions.clone());
        }
        let path = PathBuf::from(&self.agent.instructions_file);
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read agent instructions from {}", path.display()))
    }

    /// The configuration as JSON with secrets masked.
    pub fn redacted(&self) -> serde_json::Value {
        let mut copy = self.clone();
        if !copy.agent.api_key.is_empty() {
            copy.agent.api_key = REDACTED.to_string();
        }
        if !copy.transfer.auth_token.is_empty() {
            copy.transfer.auth_token = REDACTED.to_string();
        }
        serde_json::to_value(copy).unwrap_or(serde_json::Value::Null)
    }
}

impl AgentConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl TransferConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
