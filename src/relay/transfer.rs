//! # Call Transfer
//!
//! Hands a caller over to a human agent through the PBX webhook. A transfer is a
//! background job: wait out a grace period so the agent can finish its goodbye,
//! then POST `{"command":"transfer","callId":...}` with a bearer token.
//!
//! ## Key Rules:
//! - **One in flight per call**: repeated requests while a job runs are deduplicated
//! - **Abortable**: a job can be cancelled per call or aborted at shutdown
//! - **Bounded**: the webhook call is cut off after the request timeout
//! - **Disabled is explicit**: without a webhook no job is ever scheduled

use crate::relay::protocol::TransferReason;
use crate::state::RelayMetrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};

/// Status and body of a webhook response.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

/// The PBX endpoint that performs transfers.
#[async_trait]
pub trait TransferWebhook: Send + Sync {
    async fn request_transfer(&self, call_id: &str) -> Result<WebhookResponse>;
}

/// Webhook over HTTPS with a bearer token.
pub struct HttpTransferWebhook {
    client: reqwest::Client,
    url: String,
    auth_token: String,
}

impl HttpTransferWebhook {
    pub fn new(url: String, auth_token: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build transfer webhook client")?;
        Ok(Self { client, url, auth_token })
    }
}

#[async_trait]
impl TransferWebhook for HttpTransferWebhook {
    async fn request_transfer(&self, call_id: &str) -> Result<WebhookResponse> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.auth_token)
            .json(&json!({ "command": "transfer", "callId": call_id }))
            .send()
            .await
            .context("Transfer webhook request failed")?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(WebhookResponse { status, body })
    }
}

/// How a transfer job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    /// Webhook answered 200
    Transferred,
    /// Webhook answered with any other status
    Rejected { status: u16, body: String },
    /// Transport error or timeout
    Failed(String),
}

impl TransferOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferOutcome::Transferred => "transferred",
            TransferOutcome::Rejected { .. } => "rejected",
            TransferOutcome::Failed(_) => "failed",
        }
    }
}

/// Result of asking for a transfer.
#[derive(Debug)]
pub enum TransferTicket {
    /// A new job was started
    Scheduled(TransferJob),
    /// A job for this call is already running
    AlreadyInFlight,
    /// Transfers are turned off
    Disabled,
}

/// Handle to a running transfer job. Dropping it detaches the job.
#[derive(Debug)]
pub struct TransferJob {
    handle: JoinHandle<TransferOutcome>,
}

impl TransferJob {
    /// Wait for the job. `None` if it was cancelled or aborted.
    pub async fn outcome(self) -> Option<TransferOutcome> {
        self.handle.await.ok()
    }
}

struct InFlight {
    generation: u64,
    abort: Option<AbortHandle>,
}

type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

/// Clears the in-flight entry when the job finishes or is aborted.
struct InFlightGuard {
    in_flight: InFlightMap,
    call_id: String,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.in_flight);
        if in_flight.get(&self.call_id).map(|entry| entry.generation) == Some(self.generation) {
            in_flight.remove(&self.call_id);
        }
    }
}

/// Schedules and tracks transfer jobs for every call in the process.
pub struct TransferOrchestrator {
    webhook: Option<Arc<dyn TransferWebhook>>,
    grace_period: Duration,
    request_timeout: Duration,
    in_flight: InFlightMap,
    next_generation: AtomicU64,
    metrics: Arc<RelayMetrics>,
}

impl TransferOrchestrator {
    /// ## Parameters:
    /// - **webhook**: `None` turns transfers off
    /// - **grace_period**: delay before the webhook is called
    /// - **request_timeout**: upper bound on the webhook call itself
    pub fn new(
        webhook: Option<Arc<dyn TransferWebhook>>,
        grace_period: Duration,
        request_timeout: Duration,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            webhook,
            grace_period,
            request_timeout,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn disabled(metrics: Arc<RelayMetrics>) -> Self {
        Self::new(None, Duration::ZERO, Duration::ZERO, metrics)
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook.is_some()
    }

    /// Schedule a transfer for `call_id` unless one is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn request_transfer(&self, call_id: &str, reason: TransferReason) -> TransferTicket {
        let Some(webhook) = self.webhook.clone() else {
            self.metrics.record_transfer_disabled();
            warn!(call_id = %call_id, "Transfer requested but transfers are disabled");
            return TransferTicket::Disabled;
        };

        let mut in_flight = lock(&self.in_flight);
        if in_flight.contains_key(call_id) {
            self.metrics.record_transfer_deduplicated();
            info!(call_id = %call_id, "Transfer already in flight, ignoring request");
            return TransferTicket::AlreadyInFlight;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        // Entry exists before the task can possibly finish and drop its guard
        in_flight.insert(call_id.to_string(), InFlight { generation, abort: None });

        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            call_id: call_id.to_string(),
            generation,
        };
        let job_call_id = call_id.to_string();
        let grace_period = self.grace_period;
        let request_timeout = self.request_timeout;
        let metrics = self.metrics.clone();

        self.metrics.record_transfer_requested();
        info!(
            call_id = %call_id,
            reason = reason.as_str(),
            grace_ms = grace_period.as_millis() as u64,
            "Transfer scheduled"
        );

        let handle = tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(grace_period).await;

            info!(call_id = %job_call_id, "Calling transfer webhook");
            let outcome =
                match tokio::time::timeout(request_timeout, webhook.request_transfer(&job_call_id)).await {
                    Ok(Ok(response)) if response.status == 200 => TransferOutcome::Transferred,
                    Ok(Ok(response)) => TransferOutcome::Rejected {
                        status: response.status,
                        body: response.body,
                    },
                    Ok(Err(e)) => TransferOutcome::Failed(format!("{:#}", e)),
                    Err(_) => TransferOutcome::Failed(format!(
                        "webhook timed out after {}ms",
                        request_timeout.as_millis()
                    )),
                };

            match &outcome {
                TransferOutcome::Transferred => {
                    metrics.record_transfer_succeeded();
                    info!(call_id = %job_call_id, "Transfer accepted by PBX");
                }
                TransferOutcome::Rejected { status, body } => {
                    metrics.record_transfer_failed();
                    warn!(call_id = %job_call_id, status = *status, body = %body, "Transfer rejected by PBX");
                }
                TransferOutcome::Failed(reason) => {
                    metrics.record_transfer_failed();
                    error!(call_id = %job_call_id, error = %reason, "Transfer webhook failed");
                }
            }
            outcome
        });

        if let Some(entry) = in_flight.get_mut(call_id) {
            if entry.generation == generation {
                entry.abort = Some(handle.abort_handle());
            }
        }

        TransferTicket::Scheduled(TransferJob { handle })
    }

    pub fn is_in_flight(&self, call_id: &str) -> bool {
        lock(&self.in_flight).contains_key(call_id)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Abort the job for `call_id`, if any.
    pub fn cancel(&self, call_id: &str) -> bool {
        let entry = lock(&self.in_flight).remove(call_id);
        match entry.and_then(|entry| entry.abort) {
            Some(abort) => {
                abort.abort();
                info!(call_id = %call_id, "Transfer cancelled");
                true
            }
            None => false,
        }
    }

    /// Abort every job. Used at shutdown.
    pub fn abort_all(&self) -> usize {
        let entries: Vec<(String, InFlight)> = lock(&self.in_flight).drain().collect();
        for (call_id, entry) in &entries {
            if let Some(abort) = &entry.abort {
                abort.abort();
            }
            info!(call_id = %call_id, "Transfer aborted at shutdown");
        }
        entries.len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Records every call and answers with a fixed status.
    pub(crate) struct FakeWebhook {
        pub calls: AtomicUsize,
        pub call_ids: Mutex<Vec<String>>,
        pub status: u16,
        pub delay: Duration,
    }

    impl FakeWebhook {
        pub(crate) fn with_status(status: u16) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                call_ids: Mutex::new(Vec::new()),
                status,
                delay: Duration::ZERO,
            })
        }

        pub(crate) fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                call_ids: Mutex::new(Vec::new()),
                status: 200,
                delay,
            })
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TransferWebhook for FakeWebhook {
        async fn request_transfer(&self, call_id: &str) -> Result<WebhookResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_ids.lock().unwrap().push(call_id.to_string());
            tokio::time::sleep(self.delay).await;
            Ok(WebhookResponse {
                status: self.status,
                body: "ok".to_string(),
            })
        }
    }

    fn orchestrator(webhook: Arc<FakeWebhook>, grace: Duration) -> TransferOrchestrator {
        TransferOrchestrator::new(
            Some(webhook),
            grace,
            Duration::from_millis(500),
            Arc::new(RelayMetrics::default()),
        )
    }

    #[tokio::test]
    async fn test_transfer_calls_webhook_after_grace() {
        let webhook = FakeWebhook::with_status(200);
        let transfers = orchestrator(webhook.clone(), Duration::from_millis(20));

        let job = match transfers.request_transfer("call-1", TransferReason::DataCollected) {
            TransferTicket::Scheduled(job) => job,
            other => panic!("expected a scheduled job, got {:?}", other),
        };
        assert!(transfers.is_in_flight("call-1"));
        assert_eq!(webhook.call_count(), 0);

        let outcome = job.outcome().await;
        assert_eq!(outcome, Some(TransferOutcome::Transferred));
        assert_eq!(outcome.map(|o| o.as_str()), Some("transferred"));
        assert_eq!(webhook.call_count(), 1);
        assert_eq!(webhook.call_ids.lock().unwrap().as_slice(), ["call-1"]);
        assert!(!transfers.is_in_flight("call-1"));
    }

    #[tokio::test]
    async fn test_duplicate_requests_are_deduplicated() {
        let webhook = FakeWebhook::with_status(200);
        let transfers = orchestrator(webhook.clone(), Duration::from_millis(50));

        let first = transfers.request_transfer("call-1", TransferReason::DataCollected);
        let second = transfers.request_transfer("call-1", TransferReason::CustomerRequest);
        assert!(matches!(second, TransferTicket::AlreadyInFlight));

        // Another call is independent
        let other = transfers.request_transfer("call-2", TransferReason::DataCollected);
        assert!(matches!(other, TransferTicket::Scheduled(_)));
        assert_eq!(transfers.in_flight_count(), 2);

        if let TransferTicket::Scheduled(job) = first {
            job.outcome().await;
        }
        if let TransferTicket::Scheduled(job) = other {
            job.outcome().await;
        }
        assert_eq!(webhook.call_count(), 2);

        // A finished transfer does not block a new one
        assert!(matches!(
            transfers.request_transfer("call-1", TransferReason::DataCollected),
            TransferTicket::Scheduled(_)
        ));
    }

    #[tokio::test]
    async fn test_non_200_is_rejected() {
        let webhook = FakeWebhook::with_status(503);
        let transfers = orchestrator(webhook, Duration::ZERO);

        let TransferTicket::Scheduled(job) = transfers.request_transfer("call-1", TransferReason::DataCollected)
        else {
            panic!("expected a scheduled job");
        };
        assert_eq!(
            job.outcome().await,
            Some(TransferOutcome::Rejected { status: 503, body: "ok".to_string() })
        );
    }

    #[tokio::test]
    async fn test_slow_webhook_times_out() {
        let webhook = FakeWebhook::slow(Duration::from_secs(5));
        let transfers = TransferOrchestrator::new(
            Some(webhook),
            Duration::ZERO,
            Duration::from_millis(20),
            Arc::new(RelayMetrics::default()),
        );

        let TransferTicket::Scheduled(job) = transfers.request_transfer("call-1", TransferReason::DataCollected)
        else {
            panic!("expected a scheduled job");
        };
        match job.outcome().await {
            Some(TransferOutcome::Failed(reason)) => assert!(reason.contains("timed out")),
            other => panic!("expected a timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_prevents_webhook_call() {
        let webhook = FakeWebhook::with_status(200);
        let transfers = orchestrator(webhook.clone(), Duration::from_millis(200));

        let TransferTicket::Scheduled(job) = transfers.request_transfer("call-1", TransferReason::DataCollected)
        else {
            panic!("expected a scheduled job");
        };
        assert!(transfers.cancel("call-1"));
        assert!(!transfers.cancel("call-1"));

        assert_eq!(job.outcome().await, None);
        assert_eq!(webhook.call_count(), 0);
        assert_eq!(transfers.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_all_at_shutdown() {
        let webhook = FakeWebhook::with_status(200);
        let transfers = orchestrator(webhook.clone(), Duration::from_millis(200));

        transfers.request_transfer("call-1", TransferReason::DataCollected);
        transfers.request_transfer("call-2", TransferReason::DataCollected);
        assert_eq!(transfers.abort_all(), 2);
        assert_eq!(transfers.in_flight_count(), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(webhook.call_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_never_schedules() {
        let transfers = TransferOrchestrator::disabled(Arc::new(RelayMetrics::default()));
        assert!(!transfers.is_enabled());
        assert!(matches!(
            transfers.request_transfer("call-1", TransferReason::DataCollected),
            TransferTicket::Disabled
        ));
        assert_eq!(transfers.in_flight_count(), 0);
    }
}
