//! # Speech Agent Connection
//!
//! Client side of the realtime speech API. The relay only sees two channel
//! halves, an [`AgentSender`] for commands and a receiver of [`PeerSignal`]s, so
//! tests can drive a call with an in-memory agent.
//!
//! ## Connection Tasks:
//! - **Writer**: serializes [`AgentCommand`]s onto the socket; sends the close
//!   frame exactly once, when asked or when every sender is gone
//! - **Reader**: forwards text frames as [`PeerSignal::Frame`] and reports how
//!   the connection ended

use crate::config::AgentConfig;
use crate::relay::protocol::{AgentCommand, PeerSignal};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

/// Buffered commands/events per direction before senders wait.
const CHANNEL_CAPACITY: usize = 256;

/// Opens agent connections.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Connect on behalf of `call_id`. The handshake itself is sent by the caller.
    async fn connect(&self, call_id: &str) -> Result<AgentLink>;
}

/// Relay-side halves of one agent connection.
pub struct AgentLink {
    pub sender: AgentSender,
    pub events: mpsc::Receiver<PeerSignal>,
}

/// Transport-side halves, driven by the socket tasks (or a test double).
pub struct AgentEndpoint {
    pub commands: mpsc::Receiver<AgentCommand>,
    pub close: oneshot::Receiver<()>,
    pub events: mpsc::Sender<PeerSignal>,
}

impl AgentLink {
    /// Create a connected pair of link and endpoint.
    pub fn pair() -> (AgentLink, AgentEndpoint) {
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();

        let link = AgentLink {
            sender: AgentSender {
                commands: command_tx,
                close: Arc::new(Mutex::new(Some(close_tx))),
            },
            events: event_rx,
        };
        let endpoint = AgentEndpoint {
            commands: command_rx,
            close: close_rx,
            events: event_tx,
        };
        (link, endpoint)
    }
}

/// Cloneable handle for sending commands to the agent.
#[derive(Debug, Clone)]
pub struct AgentSender {
    commands: mpsc::Sender<AgentCommand>,
    close: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AgentSender {
    /// Queue a command. Fails once the connection is closed or gone.
    pub async fn send(&self, command: AgentCommand) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("agent connection already closed"));
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("agent connection is gone"))
    }

    /// Close the connection. Only the first call has any effect and returns `true`.
    pub fn close(&self) -> bool {
        let close = self.close.lock().unwrap_or_else(PoisonError::into_inner).take();
        match close {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close.lock().unwrap_or_else(PoisonError::into_inner).is_none() || self.commands.is_closed()
    }
}

/// Connects to the realtime speech API over TLS WebSockets.
pub struct RealtimeConnector {
    url: String,
    model: String,
    api_key: String,
}

impl RealtimeConnector {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            url: config.url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn endpoint_url(&self) -> String {
        format!("{}?model={}", self.url, self.model)
    }
}

#[async_trait]
impl AgentConnector for RealtimeConnector {
    async fn connect(&self, call_id: &str) -> Result<AgentLink> {
        info!(call_id = %call_id, model = %self.model, "Connecting to speech agent");

        let mut request = self
            .endpoint_url()
            .into_client_request()
            .map_err(|e| anyhow!("Failed to build WebSocket request: {e}"))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.api_key)
                .parse()
                .map_err(|e| anyhow!("Invalid auth header: {e}"))?,
        );
        request.headers_mut().insert(
            "OpenAI-Beta",
            "realtime=v1".parse().map_err(|e| anyhow!("Invalid header: {e}"))?,
        );

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| anyhow!("Failed to connect to speech agent: {e}"))?;
        let (ws_sender, ws_receiver) = ws_stream.split();

        let (link, endpoint) = AgentLink::pair();
        let AgentEndpoint { commands, close, events } = endpoint;

        let writer_id = call_id.to_string();
        tokio::spawn(async move {
            writer_loop(commands, close, ws_sender, writer_id).await;
        });

        let reader_id = call_id.to_string();
        tokio::spawn(async move {
            reader_loop(ws_receiver, events, reader_id).await;
        });

        info!(call_id = %call_id, "Speech agent connected");
        Ok(link)
    }
}

/// Serialize commands onto the socket until closed, then send one close frame.
async fn writer_loop<S>(
    mut commands: mpsc::Receiver<AgentCommand>,
    mut close: oneshot::Receiver<()>,
    mut sink: S,
    call_id: String,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut close_armed = true;
    loop {
        tokio::select! {
            biased;
            signal = &mut close, if close_armed => {
                if signal.is_ok() {
                    break;
                }
                // Every sender is gone without closing; drain what is queued
                close_armed = false;
            }
            command = commands.recv() => {
                let Some(command) = command else { break };
                let json = match serde_json::to_string(&command) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(call_id = %call_id, error = %e, "Failed to serialize agent command");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                    warn!(call_id = %call_id, error = %e, "Agent send failed, closing writer");
                    break;
                }
            }
        }
    }

    let _ = sink.send(WsMessage::Close(None)).await;
    let _ = sink.close().await;
    debug!(call_id = %call_id, "Agent writer terminated");
}

/// Forward text frames as signals and report how the connection ended.
async fn reader_loop<S, E>(mut stream: S, events: mpsc::Sender<PeerSignal>, call_id: String)
where
    S: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: std::fmt::Display,
{
    let ending = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                if events.send(PeerSignal::Frame(text.to_string())).await.is_err() {
                    debug!(call_id = %call_id, "Agent event receiver dropped");
                    return;
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                info!(call_id = %call_id, close_frame = ?frame, "Speech agent closed the connection");
                break PeerSignal::Closed;
            }
            Some(Ok(_)) => {
                // Ping/pong are answered by tungstenite; binary frames are not part of the protocol
            }
            Some(Err(e)) => {
                error!(call_id = %call_id, error = %e, "Speech agent WebSocket error");
                break PeerSignal::Failed(e.to_string());
            }
            None => break PeerSignal::Closed,
        }
    };

    let _ = events.send(ending).await;
    debug!(call_id = %call_id, "Agent reader terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::pin::Pin;

    type Recorded = Arc<Mutex<Vec<WsMessage>>>;

    fn recording_sink() -> (Pin<Box<dyn Sink<WsMessage, Error = String> + Send>>, Recorded) {
        let frames: Recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = futures_util::sink::unfold(frames.clone(), |frames, msg: WsMessage| async move {
            frames.lock().unwrap().push(msg);
            Ok::<_, String>(frames)
        });
        (Box::pin(sink), frames)
    }

    #[tokio::test]
    async fn test_sender_delivers_commands_in_order() {
        let (link, mut endpoint) = AgentLink::pair();
        link.sender.send(AgentCommand::ClearAudio).await.unwrap();
        link.sender.send(AgentCommand::CreateResponse).await.unwrap();

        assert_eq!(endpoint.commands.recv().await, Some(AgentCommand::ClearAudio));
        assert_eq!(endpoint.commands.recv().await, Some(AgentCommand::CreateResponse));
    }

    #[tokio::test]
    async fn test_close_fires_once_and_blocks_sends() {
        let (link, mut endpoint) = AgentLink::pair();
        let clone = link.sender.clone();

        assert!(link.sender.close());
        assert!(!clone.close());
        assert!(clone.is_closed());
        assert!(clone.send(AgentCommand::ClearAudio).await.is_err());
        assert!((&mut endpoint.close).await.is_ok());
    }

    #[tokio::test]
    async fn test_writer_sends_single_close_frame() {
        let (link, endpoint) = AgentLink::pair();
        let (sink, recorded) = recording_sink();

        link.sender.send(AgentCommand::CreateResponse).await.unwrap();
        link.sender.close();
        link.sender.close();

        writer_loop(endpoint.commands, endpoint.close, sink, "call-1".into()).await;

        let frames = recorded.lock().unwrap().clone();
        let closes = frames.iter().filter(|f| matches!(f, WsMessage::Close(_))).count();
        assert_eq!(closes, 1);
        assert!(matches!(frames.last(), Some(WsMessage::Close(_))));
    }

    #[tokio::test]
    async fn test_writer_closes_when_senders_dropped() {
        let (link, endpoint) = AgentLink::pair();
        let (sink, recorded) = recording_sink();

        link.sender.send(AgentCommand::ClearAudio).await.unwrap();
        drop(link);

        writer_loop(endpoint.commands, endpoint.close, sink, "call-1".into()).await;

        let frames = recorded.lock().unwrap().clone();
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            WsMessage::Text(text) => assert!(text.contains("input_audio_buffer.clear")),
            other => panic!("expected text frame, got {:?}", other),
        }
        assert!(matches!(frames[1], WsMessage::Close(_)));
    }

    #[tokio::test]
    async fn test_reader_forwards_text_then_reports_close() {
        let frames: Vec<Result<WsMessage, String>> = vec![
            Ok(WsMessage::Text(r#"{"type":"session.created"}"#.to_string().into())),
            Ok(WsMessage::Ping(vec![1].into())),
            Ok(WsMessage::Close(None)),
            Ok(WsMessage::Text("ignored after close".to_string().into())),
        ];
        let (tx, mut rx) = mpsc::channel(8);

        reader_loop(stream::iter(frames), tx, "call-1".into()).await;

        assert_eq!(
            rx.recv().await,
            Some(PeerSignal::Frame(r#"{"type":"session.created"}"#.to_string()))
        );
        assert_eq!(rx.recv().await, Some(PeerSignal::Closed));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_reader_reports_transport_error() {
        let frames: Vec<Result<WsMessage, String>> = vec![Err("connection reset".to_string())];
        let (tx, mut rx) = mpsc::channel(8);

        reader_loop(stream::iter(frames), tx, "call-1".into()).await;

        assert_eq!(rx.recv().await, Some(PeerSignal::Failed("connection reset".to_string())));
    }

    #[test]
    fn test_endpoint_url_carries_model() {
        let mut config = crate::config::AppConfig::default().agent;
        config.model = "gpt-realtime".to_string();
        let connector = RealtimeConnector::new(&config);
        assert_eq!(
            connector.endpoint_url(),
            "wss://api.openai.com/v1/realtime?model=gpt-realtime"
        );
    }
}
