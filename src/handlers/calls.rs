//! Live call inspection and forced close.

use crate::{
    error::{AppError, AppResult},
    relay::session::CallSnapshot,
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct CallView {
    #[serde(flatten)]
    pub snapshot: CallSnapshot,
    pub transfer_in_flight: bool,
}

fn view(state: &AppState, snapshot: CallSnapshot) -> CallView {
    let transfer_in_flight = state.relay.transfers.is_in_flight(&snapshot.call_id);
    CallView {
        snapshot,
        transfer_in_flight,
    }
}

pub async fn list_calls(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let calls: Vec<CallView> = state
        .relay
        .registry
        .snapshots()
        .into_iter()
        .map(|snapshot| view(&state, snapshot))
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active": calls.len(),
        "max": state.relay.registry.max_calls(),
        "calls": calls
    })))
}

pub async fn get_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let call_id = path.into_inner();
    let session = state
        .relay
        .registry
        .get(&call_id)
        .ok_or_else(|| AppError::NotFound(format!("Call '{}' not found", call_id)))?;

    Ok(HttpResponse::Ok().json(view(&state, session.snapshot())))
}

/// Ask the call's relay to tear down and cancel any transfer still waiting on
/// its grace period. Returns before teardown completes.
pub async fn end_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let call_id = path.into_inner();
    let session = state
        .relay
        .registry
        .get(&call_id)
        .ok_or_else(|| AppError::NotFound(format!("Call '{}' not found", call_id)))?;

    session.request_close();
    let transfer_cancelled = state.relay.transfers.cancel(&call_id);
    info!(call_id = %call_id, transfer_cancelled, "Forced close requested");

    Ok(HttpResponse::Accepted().json(json!({
        "status": "closing",
        "call_id": call_id,
        "transfer_cancelled": transfer_cancelled,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::relay::protocol::TransferReason;
    use crate::relay::session::TelephonyHandle;
    use crate::relay::transcript::FileTranscriptStore;
    use crate::relay::transfer::tests::FakeWebhook;
    use crate::relay::transfer::{TransferOrchestrator, TransferTicket};
    use crate::state::tests::{test_state, UnreachableConnector};
    use crate::state::RelayMetrics;
    use std::sync::Arc;
    use actix_web::{test, App};
    use std::time::Duration;
    use tokio::sync::mpsc;

    macro_rules! calls_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .route("/calls", web::get().to(list_calls))
                    .route("/calls/{id}", web::get().to(get_call))
                    .route("/calls/{id}", web::delete().to(end_call)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_list_and_get_call() {
        let state = test_state(4);
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = state.relay.registry.open(TelephonyHandle::new(tx)).unwrap();
        let app = calls_app!(state.clone());

        let req = test::TestRequest::get().uri("/calls").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["active"], 1);
        assert_eq!(body["calls"][0]["call_id"], session.id());
        assert_eq!(body["calls"][0]["state"], "connecting");
        assert_eq!(body["calls"][0]["transfer_in_flight"], false);

        let req = test::TestRequest::get()
            .uri(&format!("/calls/{}", session.id()))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["call_id"], session.id());
        assert_eq!(body["transcript_entries"], 0);
    }

    #[actix_web::test]
    async fn test_unknown_call_is_404() {
        let app = calls_app!(test_state(4));

        let req = test::TestRequest::get().uri("/calls/nope").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);

        let req = test::TestRequest::delete().uri("/calls/nope").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn test_end_call_requests_close() {
        let state = test_state(4);
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = state.relay.registry.open(TelephonyHandle::new(tx)).unwrap();
        let app = calls_app!(state.clone());

        let req = test::TestRequest::delete()
            .uri(&format!("/calls/{}", session.id()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 202);

        tokio::time::timeout(Duration::from_secs(1), session.close_requested())
            .await
            .expect("close was requested");
    }

    #[actix_web::test]
    async fn test_end_call_cancels_pending_transfer() {
        let webhook = FakeWebhook::with_status(200);
        let metrics = Arc::new(RelayMetrics::default());
        let mut config = AppConfig::default();
        config.agent.api_key = "sk-test".to_string();
        let state = AppState::with_parts(
            config,
            Arc::new(UnreachableConnector),
            TransferOrchestrator::new(
                Some(webhook.clone()),
                Duration::from_millis(200),
                Duration::from_millis(500),
                metrics.clone(),
            ),
            Arc::new(FileTranscriptStore::new(std::env::temp_dir())),
            metrics,
        )
        .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let session = state.relay.registry.open(TelephonyHandle::new(tx)).unwrap();
        let ticket = state
            .relay
            .transfers
            .request_transfer(&session.id(), TransferReason::CustomerRequest);
        let TransferTicket::Scheduled(job) = ticket else {
            panic!("expected a scheduled transfer");
        };
        let app = calls_app!(state.clone());

        let req = test::TestRequest::delete()
            .uri(&format!("/calls/{}", session.id()))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "closing");
        assert_eq!(body["transfer_cancelled"], true);

        assert_eq!(job.outcome().await, None);
        assert_eq!(webhook.call_count(), 0);
        assert!(!state.relay.transfers.is_in_flight(&session.id()));
    }
}
