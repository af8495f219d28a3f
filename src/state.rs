//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every telephony socket.
//!
//! ## Key Components:
//! - **config**: the validated configuration, immutable after startup
//! - **relay**: the [`RelayContext`] every call runs against (registry,
//!   resampler, agent connector, transfer orchestrator, transcript store)
//! - **metrics**: lock-free relay counters ([`RelayMetrics`])
//! - **http_metrics**: per-endpoint request statistics, updated by the metrics middleware
//!
//! ## Thread Safety Pattern:
//! Everything is behind `Arc`; cloning `AppState` for each actix worker is cheap.
//! Counters on the audio path are atomics so no frame ever waits on a lock.

use crate::audio::{ResamplerConfig, SampleRateConverter};
use crate::audio::buffer::SampleRate;
use crate::config::AppConfig;
use crate::relay::agent::{AgentConnector, RealtimeConnector};
use crate::relay::orchestrator::{RelayContext, RelaySettings};
use crate::relay::protocol::SessionConfig;
use crate::relay::registry::SessionRegistry;
use crate::relay::transcript::{FileTranscriptStore, TranscriptStore};
use crate::relay::transfer::{HttpTransferWebhook, TransferOrchestrator, TransferWebhook};
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub relay: RelayContext,
    pub metrics: Arc<RelayMetrics>,
    pub http_metrics: Arc<RwLock<HttpMetrics>>,
    pub start_time: Instant,
}

impl AppState {
    /// Build production state: real agent connector, HTTP webhook, file store.
    pub fn new(config: AppConfig) -> Result<Self> {
        let metrics = Arc::new(RelayMetrics::default());

        let webhook: Option<Arc<dyn TransferWebhook>> = if config.transfer_enabled() {
            Some(Arc::new(HttpTransferWebhook::new(
                config.transfer.webhook_url.clone(),
                config.transfer.auth_token.clone(),
                config.transfer.request_timeout(),
            )?))
        } else {
            if config.transfer.enabled {
                warn!("No transfer auth token configured, call transfer is disabled");
            } else {
                info!("Call transfer is disabled by configuration");
            }
            None
        };
        let transfers = TransferOrchestrator::new(
            webhook,
            config.transfer.grace_period(),
            config.transfer.request_timeout(),
            metrics.clone(),
        );

        let connector: Arc<dyn AgentConnector> = Arc::new(RealtimeConnector::new(&config.agent));
        let transcripts: Arc<dyn TranscriptStore> =
            Arc::new(FileTranscriptStore::new(&config.storage.data_dir));

        Self::with_parts(config, connector, transfers, transcripts, metrics)
    }

    /// Assemble state around caller-supplied peers (used by tests).
    pub fn with_parts(
        config: AppConfig,
        connector: Arc<dyn AgentConnector>,
        transfers: TransferOrchestrator,
        transcripts: Arc<dyn TranscriptStore>,
        metrics: Arc<RelayMetrics>,
    ) -> Result<Self> {
        let instructions = config.resolve_instructions()?;
        let converter = SampleRateConverter::new(ResamplerConfig {
            sinc_len: config.audio.sinc_len,
            fade_len: SampleRate::Telephony.samples_for_ms(config.audio.fade_ms),
            ..ResamplerConfig::default()
        });

        let relay = RelayContext {
            registry: Arc::new(SessionRegistry::new(config.performance.max_concurrent_calls)),
            converter: Arc::new(converter),
            transfers: Arc::new(transfers),
            connector,
            transcripts,
            metrics: metrics.clone(),
            settings: Arc::new(RelaySettings {
                handshake_timeout: config.agent.handshake_timeout(),
                session: SessionConfig::new(&config.agent, instructions),
                drop_first_media_frame: config.audio.drop_first_media_frame,
            }),
        };

        Ok(Self {
            config: Arc::new(config),
            relay,
            metrics,
            http_metrics: Arc::new(RwLock::new(HttpMetrics::default())),
            start_time: Instant::now(),
        })
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Record one HTTP request (called by the metrics middleware).
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.http_metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn get_http_metrics_snapshot(&self) -> HttpMetrics {
        self.http_metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Counters for everything that happens on calls.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    calls_accepted: AtomicU64,
    calls_rejected: AtomicU64,
    calls_completed: AtomicU64,
    agent_connect_failures: AtomicU64,
    telephony_frames: AtomicU64,
    caller_audio_frames: AtomicU64,
    agent_audio_frames: AtomicU64,
    malformed_frames: AtomicU64,
    transfers_requested: AtomicU64,
    transfers_succeeded: AtomicU64,
    transfers_failed: AtomicU64,
    transfers_deduplicated: AtomicU64,
    transfers_disabled: AtomicU64,
    transcripts_saved: AtomicU64,
    transcripts_failed: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelayMetricsSnapshot {
    pub calls_accepted: u64,
    pub calls_rejected: u64,
    pub calls_completed: u64,
    pub agent_connect_failures: u64,
    pub telephony_frames: u64,
    pub caller_audio_frames: u64,
    pub agent_audio_frames: u64,
    pub malformed_frames: u64,
    pub transfers_requested: u64,
    pub transfers_succeeded: u64,
    pub transfers_failed: u64,
    pub transfers_deduplicated: u64,
    pub transfers_disabled: u64,
    pub transcripts_saved: u64,
    pub transcripts_failed: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RelayMetrics {
    pub fn record_call_accepted(&self) {
        bump(&self.calls_accepted);
    }

    pub fn record_call_rejected(&self) {
        bump(&self.calls_rejected);
    }

    pub fn record_call_completed(&self) {
        bump(&self.calls_completed);
    }

    pub fn record_agent_connect_failure(&self) {
        bump(&self.agent_connect_failures);
    }

    pub fn record_telephony_frame(&self) {
        bump(&self.telephony_frames);
    }

    /// Caller audio forwarded to the agent
    pub fn record_caller_audio(&self) {
        bump(&self.caller_audio_frames);
    }

    /// Agent audio forwarded to the caller
    pub fn record_agent_audio(&self) {
        bump(&self.agent_audio_frames);
    }

    pub fn record_malformed_frame(&self) {
        bump(&self.malformed_frames);
    }

    pub fn record_transfer_requested(&self) {
        bump(&self.transfers_requested);
    }

    pub fn record_transfer_succeeded(&self) {
        bump(&self.transfers_succeeded);
    }

    pub fn record_transfer_failed(&self) {
        bump(&self.transfers_failed);
    }

    pub fn record_transfer_deduplicated(&self) {
        bump(&self.transfers_deduplicated);
    }

    pub fn record_transfer_disabled(&self) {
        bump(&self.transfers_disabled);
    }

    pub fn record_transcript_saved(&self) {
        bump(&self.transcripts_saved);
    }

    pub fn record_transcript_failed(&self) {
        bump(&self.transcripts_failed);
    }

    pub fn snapshot(&self) -> RelayMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RelayMetricsSnapshot {
            calls_accepted: load(&self.calls_accepted),
            calls_rejected: load(&self.calls_rejected),
            calls_completed: load(&self.calls_completed),
            agent_connect_failures: load(&self.agent_connect_failures),
            telephony_frames: load(&self.telephony_frames),
            caller_audio_frames: load(&self.caller_audio_frames),
            agent_audio_frames: load(&self.agent_audio_frames),
            malformed_frames: load(&self.malformed_frames),
            transfers_requested: load(&self.transfers_requested),
            transfers_succeeded: load(&self.transfers_succeeded),
            transfers_failed: load(&self.transfers_failed),
            transfers_deduplicated: load(&self.transfers_deduplicated),
            transfers_disabled: load(&self.transfers_disabled),
            transcripts_saved: load(&self.transcripts_saved),
            transcripts_failed: load(&self.transcripts_failed),
        }
    }
}

/// HTTP request statistics across all endpoints.
#[derive(Debug, Default, Clone)]
pub struct HttpMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: `"GET /api/v1/calls"` style endpoint name
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
