//! # Relay Orchestrator
//!
//! Drives one call from socket accept to teardown:
//!
//! 1. **Open**: register a session for the accepted telephony socket
//! 2. **Handshake**: connect to the agent and send `session.update`, bounded by a timeout
//! 3. **Relay**: run the inbound pump (carrier -> agent) and the outbound pump
//!    (agent -> carrier) until either side ends or a close is requested
//! 4. **Teardown**: exactly once, close both peers, persist the transcript and
//!    leave the registry
//!
//! Each pump processes its frames strictly in arrival order. A function-call
//! result and the follow-up `response.create` are both queued before the outbound
//! pump looks at the next agent event.

use crate::audio::buffer::{decode_base64, encode_base64};
use crate::audio::SampleRateConverter;
use crate::error::EndReason;
use crate::relay::agent::AgentConnector;
use crate::relay::protocol::{
    AgentCommand, AgentEvent, ConversationItem, FunctionResult, PeerSignal, SessionConfig,
    TelephonyCommand, TelephonyEvent, TelephonyMessage, TransferReason, TRANSFER_TOOL_NAME,
};
use crate::relay::registry::{Rebind, RegistryError, SessionRegistry};
use crate::relay::session::{CallSession, CallState, Role, TelephonyHandle};
use crate::relay::transcript::{TranscriptRecord, TranscriptStore};
use crate::relay::transfer::{TransferOrchestrator, TransferTicket};
use crate::state::RelayMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Per-call behaviour that comes from configuration.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub handshake_timeout: Duration,
    pub session: SessionConfig,
    pub drop_first_media_frame: bool,
}

/// Everything a call needs, shared by all calls in the process.
#[derive(Clone)]
pub struct RelayContext {
    pub registry: Arc<SessionRegistry>,
    pub converter: Arc<SampleRateConverter>,
    pub transfers: Arc<TransferOrchestrator>,
    pub connector: Arc<dyn AgentConnector>,
    pub transcripts: Arc<dyn TranscriptStore>,
    pub metrics: Arc<RelayMetrics>,
    pub settings: Arc<RelaySettings>,
}

impl RelayContext {
    /// Register a new call for an accepted telephony socket.
    pub fn open_call(&self, telephony: TelephonyHandle) -> Result<Arc<CallSession>, RegistryError> {
        match self.registry.open(telephony) {
            Ok(session) => {
                self.metrics.record_call_accepted();
                info!(
                    call_id = %session.id(),
                    active_calls = self.registry.len(),
                    "Call accepted"
                );
                Ok(session)
            }
            Err(e) => {
                self.metrics.record_call_rejected();
                warn!(error = %e, "Call refused");
                Err(e)
            }
        }
    }

    /// Drive `session` until it ends, then tear it down. Returns why it ended.
    ///
    /// `telephony` carries frames from the carrier socket.
    pub async fn run_call(
        &self,
        session: Arc<CallSession>,
        mut telephony: mpsc::UnboundedReceiver<PeerSignal>,
    ) -> EndReason {
        let relay = CallRelay::new(self, session);
        let reason = relay.drive(&mut telephony).await;
        relay.teardown(&reason).await;
        reason
    }
}

/// Whether a pump keeps going after a frame.
enum Step {
    Continue,
    End(EndReason),
}

struct CallRelay<'a> {
    ctx: &'a RelayContext,
    session: Arc<CallSession>,
    first_media_seen: AtomicBool,
}

impl<'a> CallRelay<'a> {
    fn new(ctx: &'a RelayContext, session: Arc<CallSession>) -> Self {
        Self {
            ctx,
            session,
            first_media_seen: AtomicBool::new(false),
        }
    }

    async fn drive(&self, telephony: &mut mpsc::UnboundedReceiver<PeerSignal>) -> EndReason {
        let mut agent_events = match self.connect_agent().await {
            Ok(events) => events,
            Err(reason) => return reason,
        };

        self.session.set_state(CallState::Active);
        info!(call_id = %self.session.id(), "Call active, relaying audio");

        tokio::select! {
            reason = self.inbound_pump(telephony) => reason,
            reason = self.outbound_pump(&mut agent_events) => reason,
            _ = self.session.close_requested() => EndReason::ForcedClose,
        }
    }

    /// Connect and send the handshake within the configured timeout.
    async fn connect_agent(&self) -> Result<mpsc::Receiver<PeerSignal>, EndReason> {
        let call_id = self.session.id();
        let timeout = self.ctx.settings.handshake_timeout;

        let handshake = async {
            let link = self.ctx.connector.connect(&call_id).await?;
            link.sender
                .send(AgentCommand::SessionUpdate {
                    session: self.ctx.settings.session.clone(),
                })
                .await?;
            Ok::<_, anyhow::Error>(link)
        };

        let result = tokio::select! {
            result = tokio::time::timeout(timeout, handshake) => result,
            _ = self.session.close_requested() => return Err(EndReason::ForcedClose),
        };

        let failure = match result {
            Ok(Ok(link)) => {
                self.session.attach_agent(link.sender);
                debug!(call_id = %call_id, "Agent handshake sent");
                return Ok(link.events);
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => format!("handshake timed out after {}ms", timeout.as_millis()),
        };

        self.ctx.metrics.record_agent_connect_failure();
        error!(call_id = %call_id, error = %failure, "Speech agent handshake failed");
        Err(EndReason::AgentConnectFailed(failure))
    }

    // ── Inbound: carrier -> agent ──────────────────────────────────

    async fn inbound_pump(&self, telephony: &mut mpsc::UnboundedReceiver<PeerSignal>) -> EndReason {
        loop {
            let frame = match telephony.recv().await {
                Some(PeerSignal::Frame(frame)) => frame,
                Some(PeerSignal::Closed) | None => return EndReason::TelephonyHangup,
                Some(PeerSignal::Failed(e)) => return EndReason::TelephonyError(e),
            };
            if let Step::End(reason) = self.handle_telephony_frame(&frame).await {
                return reason;
            }
        }
    }

    async fn handle_telephony_frame(&self, frame: &str) -> Step {
        if !self.session.is_active() {
            return Step::Continue;
        }
        self.ctx.metrics.record_telephony_frame();

        let message = match serde_json::from_str::<TelephonyMessage>(frame) {
            Ok(message) => message,
            Err(e) => {
                self.ctx.metrics.record_malformed_frame();
                warn!(call_id = %self.session.id(), error = %e, "Malformed telephony frame");
                return Step::Continue;
            }
        };

        match message {
            TelephonyMessage::Event(event @ TelephonyEvent::Start { .. }) => {
                match event.call_id() {
                    Some(call_id) => self.bind_call_id(call_id),
                    None => warn!(call_id = %self.session.id(), "Start event without a call identifier"),
                }
                Step::Continue
            }
            TelephonyMessage::Event(TelephonyEvent::Media { data }) => {
                self.forward_caller_audio(data.samples).await
            }
            TelephonyMessage::Event(TelephonyEvent::Stop) => {
                info!(call_id = %self.session.id(), "Carrier sent stop");
                Step::End(EndReason::TelephonyStop)
            }
            TelephonyMessage::Event(TelephonyEvent::Unknown) => {
                debug!(call_id = %self.session.id(), "Ignoring unknown telephony event");
                Step::Continue
            }
            TelephonyMessage::Command(TelephonyCommand::ClearBuffer) => {
                debug!(call_id = %self.session.id(), "Clearing agent input buffer");
                self.send_to_agent(AgentCommand::ClearAudio).await
            }
            TelephonyMessage::Command(TelephonyCommand::CallDisconnect) => {
                info!(call_id = %self.session.id(), "Carrier requested disconnect");
                Step::End(EndReason::TelephonyStop)
            }
            TelephonyMessage::Command(TelephonyCommand::Unknown) => {
                debug!(call_id = %self.session.id(), "Ignoring unknown telephony command");
                Step::Continue
            }
        }
    }

    fn bind_call_id(&self, call_id: &str) {
        match self.ctx.registry.rebind(&self.session, call_id) {
            Rebind::Rebound { previous } => {
                info!(call_id = %call_id, provisional_id = %previous, "Call identifier bound");
            }
            Rebind::Unchanged => {}
            Rebind::AlreadyBound { current } => {
                warn!(call_id = %current, requested = %call_id, "Call identifier already bound, keeping it");
            }
            Rebind::Conflict => {
                warn!(
                    call_id = %self.session.id(),
                    requested = %call_id,
                    "Call identifier belongs to another live call, keeping provisional id"
                );
            }
            Rebind::NotRegistered => {
                warn!(call_id = %self.session.id(), "Session left the registry before binding");
            }
        }
    }

    async fn forward_caller_audio(&self, samples: Vec<i16>) -> Step {
        if self.ctx.settings.drop_first_media_frame && !self.first_media_seen.swap(true, Ordering::SeqCst) {
            debug!(call_id = %self.session.id(), "Dropping first media frame");
            return Step::Continue;
        }
        if samples.is_empty() {
            return Step::Continue;
        }

        let upsampled = match self.ctx.converter.upsample(&samples) {
            Ok(upsampled) => upsampled,
            Err(e) => {
                warn!(call_id = %self.session.id(), error = %e, "Failed to upsample caller audio");
                return Step::Continue;
            }
        };

        self.ctx.metrics.record_caller_audio();
        self.send_to_agent(AgentCommand::AppendAudio {
            audio: encode_base64(&upsampled),
        })
        .await
    }

    async fn send_to_agent(&self, command: AgentCommand) -> Step {
        let Some(agent) = self.session.agent() else {
            return Step::Continue;
        };
        match agent.send(command).await {
            Ok(()) => Step::Continue,
            Err(e) => Step::End(EndReason::AgentError(e.to_string())),
        }
    }

    // ── Outbound: agent -> carrier ─────────────────────────────────

    async fn outbound_pump(&self, events: &mut mpsc::Receiver<PeerSignal>) -> EndReason {
        loop {
            let frame = match events.recv().await {
                Some(PeerSignal::Frame(frame)) => frame,
                Some(PeerSignal::Closed) | None => return EndReason::AgentHangup,
                Some(PeerSignal::Failed(e)) => return EndReason::AgentError(e),
            };
            if let Step::End(reason) = self.handle_agent_frame(&frame).await {
                return reason;
            }
        }
    }

    async fn handle_agent_frame(&self, frame: &str) -> Step {
        if !self.session.is_active() {
            return Step::Continue;
        }

        let event = match serde_json::from_str::<AgentEvent>(frame) {
            Ok(event) => event,
            Err(e) => {
                self.ctx.metrics.record_malformed_frame();
                warn!(call_id = %self.session.id(), error = %e, "Malformed agent event");
                return Step::Continue;
            }
        };

        match event {
            AgentEvent::SessionCreated => {
                debug!(call_id = %self.session.id(), "Agent session created");
                Step::Continue
            }
            AgentEvent::SessionUpdated => {
                debug!(call_id = %self.session.id(), "Agent session configured");
                Step::Continue
            }
            AgentEvent::TranscriptionCompleted { transcript } => {
                if !transcript.trim().is_empty() {
                    info!(call_id = %self.session.id(), text = %transcript, "Caller said");
                    self.session.append_transcript(Role::User, &transcript);
                }
                Step::Continue
            }
            AgentEvent::AudioDelta { delta } => self.forward_agent_audio(&delta),
            AgentEvent::AudioTranscriptDelta { delta } => {
                self.session.append_transcript(Role::Assistant, &delta);
                Step::Continue
            }
            AgentEvent::FunctionCallArgumentsDone { name, call_id, arguments } => {
                self.handle_function_call(&name, call_id, &arguments).await
            }
            AgentEvent::SpeechStarted => {
                debug!(call_id = %self.session.id(), "Caller started speaking");
                Step::Continue
            }
            AgentEvent::SpeechStopped => {
                debug!(call_id = %self.session.id(), "Caller stopped speaking");
                Step::Continue
            }
            AgentEvent::Error { error } => {
                warn!(call_id = %self.session.id(), error = %error, "Speech agent reported an error");
                Step::Continue
            }
            AgentEvent::Ignored => {
                trace!(call_id = %self.session.id(), "Ignoring agent event");
                Step::Continue
            }
        }
    }

    fn forward_agent_audio(&self, delta: &str) -> Step {
        let samples = match decode_base64(delta) {
            Ok(samples) => samples,
            Err(e) => {
                self.ctx.metrics.record_malformed_frame();
                warn!(call_id = %self.session.id(), error = %e, "Agent audio is not valid base64");
                return Step::Continue;
            }
        };
        if samples.is_empty() {
            return Step::Continue;
        }

        let downsampled = match self.ctx.converter.downsample_for_telephony(&samples) {
            Ok(downsampled) => downsampled,
            Err(e) => {
                warn!(call_id = %self.session.id(), error = %e, "Failed to downsample agent audio");
                return Step::Continue;
            }
        };

        if !self.session.telephony().send_media(downsampled) {
            return Step::End(EndReason::TelephonyHangup);
        }
        self.ctx.metrics.record_agent_audio();
        Step::Continue
    }

    /// Answer a tool call with exactly one result, then ask for a new response.
    async fn handle_function_call(&self, name: &str, tool_call_id: String, arguments: &str) -> Step {
        let result = if name == TRANSFER_TOOL_NAME {
            self.request_transfer(TransferReason::from_arguments(arguments))
        } else {
            warn!(call_id = %self.session.id(), function = %name, "Agent called an unknown function");
            FunctionResult::failed(format!("Unknown function: {}", name))
        };

        let output = AgentCommand::CreateItem {
            item: ConversationItem::FunctionCallOutput {
                call_id: tool_call_id,
                output: result.to_output(),
            },
        };
        if let Step::End(reason) = self.send_to_agent(output).await {
            return Step::End(reason);
        }
        self.send_to_agent(AgentCommand::CreateResponse).await
    }

    fn request_transfer(&self, reason: TransferReason) -> FunctionResult {
        let call_id = self.session.id();
        info!(call_id = %call_id, reason = reason.as_str(), "Agent requested a transfer");

        match self.ctx.transfers.request_transfer(&call_id, reason) {
            TransferTicket::Scheduled(job) => {
                self.session.mark_transferring();
                self.session.record_transfer("pending");
                // The call never waits on the job; only its status is kept
                let session = self.session.clone();
                tokio::spawn(async move {
                    let status = job.outcome().await.map_or("cancelled", |outcome| outcome.as_str());
                    session.record_transfer(status);
                });
                FunctionResult::ok("Transfer initiated")
            }
            TransferTicket::AlreadyInFlight => FunctionResult::ok("Transfer already in progress"),
            TransferTicket::Disabled => FunctionResult::failed("Call transfer is not available"),
        }
    }

    // ── Teardown ───────────────────────────────────────────────────

    /// Release everything the call holds. Only the first invocation does work.
    async fn teardown(&self, reason: &EndReason) {
        if !self.session.deactivate() {
            return;
        }
        self.session.set_state(CallState::Closing);
        let call_id = self.session.id();
        info!(call_id = %call_id, reason = %reason, "Tearing down call");

        if let Some(agent) = self.session.agent() {
            agent.close();
        }
        self.session.telephony().close();

        if let Some(record) = TranscriptRecord::from_session(&self.session) {
            match self.ctx.transcripts.save(&record).await {
                Ok(()) => self.ctx.metrics.record_transcript_saved(),
                Err(e) => {
                    self.ctx.metrics.record_transcript_failed();
                    error!(call_id = %call_id, error = %format!("{:#}", e), "Failed to save transcript");
                }
            }
        }

        let removed = self.ctx.registry.remove(&self.session);
        self.session.set_state(CallState::Closed);
        self.ctx.metrics.record_call_completed();
        info!(
            call_id = %call_id,
            duration_ms = self.session.duration_ms(),
            removed,
            active_calls = self.ctx.registry.len(),
            "Call closed"
        );
    }
}
