use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration, secrets masked.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.config.redacted(),
        "transfer_active": state.relay.transfers.is_enabled()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_hides_api_key() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(3)))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["config"]["agent"]["api_key"], "***");
        assert_eq!(body["config"]["performance"]["max_concurrent_calls"], 3);
        assert_eq!(body["transfer_active"], false);
    }
}
