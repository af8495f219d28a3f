//! # Telephony WebSocket Handler
//!
//! The carrier opens one WebSocket per phone call on `server.ws_path`. Each
//! connection is one actor and one Call Session.
//!
//! ## Connection Lifecycle:
//! 1. **Upgrade**: refused with 503 when the registry is at capacity
//! 2. **Started**: the session is registered and its relay task spawned
//! 3. **Streaming**: text frames are handed to the relay in arrival order;
//!    8kHz audio from the relay is written back as `media` events
//! 4. **Stopped**: the relay is told the carrier is gone and tears the call down
//!
//! ## Message Format:
//! - **Carrier → Bridge**: JSON text frames (`start`, `media`, `stop`, `clearBuffer`, ...)
//! - **Bridge → Carrier**: `{"event":"media","data":{"samples":[...]}}`

use crate::error::AppError;
use crate::relay::orchestrator::RelayContext;
use crate::relay::protocol::{PeerSignal, TelephonyOutbound};
use crate::relay::session::{TelephonyDirective, TelephonyHandle};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(45);
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// One carrier connection.
pub struct TelephonyWebSocket {
    relay: RelayContext,
    /// Id assigned at accept time, for logging only
    call_id: Option<String>,
    /// Frames for the relay; `None` until the call is registered
    signals: Option<mpsc::UnboundedSender<PeerSignal>>,
    last_heartbeat: Instant,
}

impl TelephonyWebSocket {
    pub fn new(relay: RelayContext) -> Self {
        Self {
            relay,
            call_id: None,
            signals: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn forward(&self, signal: PeerSignal) {
        if let Some(signals) = &self.signals {
            // The relay may already have finished; the frame is moot then.
            let _ = signals.send(signal);
        }
    }

    fn send_media(&self, samples: Vec<i16>, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(&TelephonyOutbound::Media { samples }) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(call_id = ?self.call_id, error = %e, "Failed to encode media frame"),
        }
    }
}

impl Actor for TelephonyWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (directive_tx, directive_rx) = mpsc::unbounded_channel();

        let session = match self.relay.open_call(TelephonyHandle::new(directive_tx)) {
            Ok(session) => session,
            Err(e) => {
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Again,
                    description: Some(e.to_string()),
                }));
                ctx.stop();
                return;
            }
        };

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        self.signals = Some(signal_tx);
        self.call_id = Some(session.id());
        ctx.add_stream(UnboundedReceiverStream::new(directive_rx));

        let relay = self.relay.clone();
        actix_web::rt::spawn(async move {
            let call_id = session.id();
            let reason = relay.run_call(session, signal_rx).await;
            debug!(call_id = %call_id, reason = %reason, "Relay task finished");
        });

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(call_id = ?act.call_id, "Telephony heartbeat timeout, closing connection");
                act.forward(PeerSignal::Failed("heartbeat timeout".to_string()));
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(call_id = ?self.call_id, "Telephony connection stopped");
        self.forward(PeerSignal::Closed);
    }
}

/// Frames from the carrier.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TelephonyWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.forward(PeerSignal::Frame(text.to_string()));
            }
            Ok(ws::Message::Binary(data)) => {
                debug!(call_id = ?self.call_id, bytes = data.len(), "Ignoring binary telephony frame");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(call_id = ?self.call_id, reason = ?reason, "Carrier closed the connection");
                self.forward(PeerSignal::Closed);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(call_id = ?self.call_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(call_id = ?self.call_id, error = %err, "Telephony protocol error");
                self.forward(PeerSignal::Failed(err.to_string()));
                ctx.stop();
            }
        }
    }
}

/// Directives from the relay.
impl StreamHandler<TelephonyDirective> for TelephonyWebSocket {
    fn handle(&mut self, directive: TelephonyDirective, ctx: &mut Self::Context) {
        match directive {
            TelephonyDirective::Media(samples) => self.send_media(samples, ctx),
            TelephonyDirective::Close => {
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }

    // The directive stream ends once the session is dropped after teardown.
    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.stop();
    }
}

/// Upgrade a carrier connection.
pub async fn telephony_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "Telephony connection request");

    let registry = &app_state.relay.registry;
    if registry.is_full() {
        app_state.metrics.record_call_rejected();
        warn!(max_calls = registry.max_calls(), "At call capacity, refusing telephony connection");
        return Err(AppError::ServiceUnavailable(format!(
            "At capacity ({} concurrent calls)",
            registry.max_calls()
        ))
        .into());
    }

    ws::WsResponseBuilder::new(TelephonyWebSocket::new(app_state.relay.clone()), &req, stream)
        .frame_size(MAX_FRAME_SIZE)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_refuses_upgrade_at_capacity() {
        let state = test_state(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let _session = state.relay.registry.open(TelephonyHandle::new(tx)).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(telephony_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 503);
        assert_eq!(state.metrics.snapshot().calls_rejected, 1);
    }

    #[actix_web::test]
    async fn test_plain_get_is_not_an_upgrade() {
        let state = test_state(1);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(telephony_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
        assert!(state.relay.registry.is_empty());
    }
}
