//! # Call Session
//!
//! Per-call state shared between the two relay pumps, the registry, and the HTTP
//! handlers. A session is always held behind an `Arc` and every field uses interior
//! mutability, so the pumps never need `&mut` access.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: telephony socket accepted, agent handshake in progress
//! 2. **Active**: audio is flowing in both directions
//! 3. **Transferring**: a transfer was scheduled, audio still flows
//! 4. **Closing**: teardown has started, no more frames are forwarded
//! 5. **Closed**: resources released and the registry entry is gone

use crate::relay::agent::AgentSender;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};

/// Current phase of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Connecting,
    Active,
    Transferring,
    Closing,
    Closed,
}

/// Who said a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The caller
    User,
    /// The speech agent
    Assistant,
}

/// One line of the conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
}

/// What the relay can ask the telephony socket to do.
#[derive(Debug, Clone, PartialEq)]
pub enum TelephonyDirective {
    /// Play 8kHz samples to the caller
    Media(Vec<i16>),
    /// Close the telephony connection
    Close,
}

/// Sending half of the telephony socket, owned by the session.
///
/// The socket adapter owns the receiving half and turns directives into frames.
#[derive(Debug, Clone)]
pub struct TelephonyHandle {
    tx: mpsc::UnboundedSender<TelephonyDirective>,
}

impl TelephonyHandle {
    pub fn new(tx: mpsc::UnboundedSender<TelephonyDirective>) -> Self {
        Self { tx }
    }

    /// Queue audio for the caller. Returns `false` once the socket is gone.
    pub fn send_media(&self, samples: Vec<i16>) -> bool {
        self.tx.send(TelephonyDirective::Media(samples)).is_ok()
    }

    /// Ask the socket to close. Harmless if it already has.
    pub fn close(&self) {
        let _ = self.tx.send(TelephonyDirective::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// State of one bridged call.
pub struct CallSession {
    /// Registry key; replaced once when the carrier announces its own identifier
    id: RwLock<String>,

    /// Set once the id came from the carrier rather than being generated
    id_bound: AtomicBool,

    telephony: TelephonyHandle,

    /// Set exactly once, after the agent handshake succeeds
    agent: OnceLock<AgentSender>,

    transcript: Mutex<Vec<TranscriptEntry>>,

    state: RwLock<CallState>,

    /// Status of the most recent transfer job
    last_transfer: Mutex<Option<&'static str>>,

    /// Cleared exactly once when teardown starts
    active: AtomicBool,

    started_at: DateTime<Utc>,
    started: Instant,

    close_requested: Notify,
}

impl CallSession {
    /// Create a session for a freshly accepted telephony connection.
    ///
    /// ## Parameters:
    /// - **id**: provisional identifier, normally a generated UUID
    /// - **telephony**: where outbound audio and the final close go
    pub fn new(id: String, telephony: TelephonyHandle) -> Self {
        Self {
            id: RwLock::new(id),
            id_bound: AtomicBool::new(false),
            telephony,
            agent: OnceLock::new(),
            transcript: Mutex::new(Vec::new()),
            state: RwLock::new(CallState::Connecting),
            last_transfer: Mutex::new(None),
            active: AtomicBool::new(true),
            started_at: Utc::now(),
            started: Instant::now(),
            close_requested: Notify::new(),
        }
    }

    pub fn id(&self) -> String {
        read(&self.id).clone()
    }

    /// Whether the carrier's identifier has replaced the provisional one.
    pub fn is_id_bound(&self) -> bool {
        self.id_bound.load(Ordering::SeqCst)
    }

    /// Replace the identifier. Only the registry calls this, under its own lock.
    pub(crate) fn bind_id(&self, id: String) {
        *write(&self.id) = id;
        self.id_bound.store(true, Ordering::SeqCst);
    }

    pub fn telephony(&self) -> &TelephonyHandle {
        &self.telephony
    }

    /// Attach the agent connection. Returns `false` if one is already attached.
    pub fn attach_agent(&self, sender: AgentSender) -> bool {
        self.agent.set(sender).is_ok()
    }

    pub fn agent(&self) -> Option<&AgentSender> {
        self.agent.get()
    }

    pub fn state(&self) -> CallState {
        *read(&self.state)
    }

    pub fn set_state(&self, state: CallState) {
        *write(&self.state) = state;
    }

    /// Move to `Transferring`, but only from `Active`.
    pub fn mark_transferring(&self) -> bool {
        let mut state = write(&self.state);
        if *state == CallState::Active {
            *state = CallState::Transferring;
            true
        } else {
            false
        }
    }

    pub fn record_transfer(&self, status: &'static str) {
        *lock(&self.last_transfer) = Some(status);
    }

    pub fn last_transfer(&self) -> Option<&'static str> {
        *lock(&self.last_transfer)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Clear the active flag. Only the first caller gets `true`.
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    /// Append a transcript line. Blank text is skipped.
    pub fn append_transcript(&self, role: Role, content: &str) {
        if content.trim().is_empty() {
            return;
        }
        lock(&self.transcript).push(TranscriptEntry {
            timestamp: Utc::now(),
            role,
            content: content.to_string(),
        });
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        lock(&self.transcript).clone()
    }

    pub fn transcript_len(&self) -> usize {
        lock(&self.transcript).len()
    }

    pub fn duration_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Ask the relay driving this call to tear it down.
    pub fn request_close(&self) {
        self.close_requested.notify_one();
    }

    /// Resolves once [`request_close`](Self::request_close) has been called.
    pub async fn close_requested(&self) {
        self.close_requested.notified().await;
    }

    /// Serializable view for the HTTP API.
    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.id(),
            state: self.state(),
            id_bound: self.is_id_bound(),
            agent_connected: self.agent().is_some(),
            started_at: self.started_at,
            duration_ms: self.duration_ms(),
            transcript_entries: self.transcript_len(),
            last_transfer: self.last_transfer(),
        }
    }
}

/// Point-in-time summary of a call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: String,
    pub state: CallState,
    pub id_bound: bool,
    pub agent_connected: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub transcript_entries: usize,
    pub last_transfer: Option<&'static str>,
}

// Every critical section is a single assignment or push; poisoned locks are recovered.

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) fn test_session(id: &str) -> (CallSession, mpsc::UnboundedReceiver<TelephonyDirective>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CallSession::new(id.to_string(), TelephonyHandle::new(tx)), rx)
}
