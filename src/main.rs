//! # Voice Bridge - Main Application Entry Point
//!
//! Bridges carrier telephony calls (8kHz PCM16 over WebSocket) to a realtime
//! speech agent (24kHz PCM16 over WebSocket), one agent session per call.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared application state and metrics
//! - **audio**: PCM encoding and 8kHz <-> 24kHz resampling
//! - **relay**: call sessions, registry, agent client, transfers, transcripts
//! - **websocket**: the carrier-facing WebSocket actor
//! - **health**, **handlers**: operational HTTP endpoints
//! - **middleware**: request metrics
//! - **error**: HTTP error responses and call end reasons

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod relay;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::config::AppConfig;
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handlers; polled by [`wait_for_shutdown`].
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup:
/// 1. **Loads configuration** from defaults, `config.toml` and the environment
/// 2. **Sets up logging**
/// 3. **Builds shared state** (registry, resampler, agent connector, transfers)
/// 4. **Serves** the telephony socket and the operational API
///
/// ## Shutdown:
/// Live calls are asked to close, the server stops gracefully and any transfer
/// still waiting on its grace period is aborted.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!("Starting voice-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{} (agent model {}, transfer {})",
        config.server.host,
        config.server.port,
        config.agent.model,
        if config.transfer_enabled() { "enabled" } else { "disabled" }
    );

    let app_state = AppState::new(config.clone()).context("Failed to build application state")?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let ws_path = config.server.ws_path.clone();

    setup_signal_handlers();

    info!("Starting HTTP server on {} (telephony socket at {})", bind_addr, ws_path);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .route(&ws_path, web::get().to(websocket::telephony_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/calls", web::get().to(handlers::list_calls))
                    .route("/calls/{id}", web::get().to(handlers::get_call))
                    .route("/calls/{id}", web::delete().to(handlers::end_call))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            let closing = app_state.relay.registry.close_all();
            info!("Shutdown signal received, closing {} live call(s) and stopping server...", closing);
            server_handle.stop(true).await;
        }
    }

    let aborted = app_state.relay.transfers.abort_all();
    if aborted > 0 {
        warn!("Aborted {} pending transfer(s) at shutdown", aborted);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` overrides the default filter `voice_bridge=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialise tracing")?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise [`SHUTDOWN_SIGNAL`].
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                    }
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    log_ctrl_c(tokio::signal::ctrl_c().await);
                }
            }
        }

        #[cfg(not(unix))]
        log_ctrl_c(tokio::signal::ctrl_c().await);

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

fn log_ctrl_c(result: std::io::Result<()>) {
    match result {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => error!("Failed to listen for SIGINT: {}", e),
    }
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
