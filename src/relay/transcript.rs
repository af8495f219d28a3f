//! # Transcript Persistence
//!
//! When a call ends with a non-empty transcript, the relay hands a
//! [`TranscriptRecord`] to a [`TranscriptStore`]. The file store writes two JSON
//! documents per call into the data directory:
//!
//! - `call_<id>_<ts>_transcript.json`: the full conversation
//! - `call_<id>_<ts>_queue.json`: a pending work item for downstream processing

use crate::relay::session::{CallSession, TranscriptEntry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

/// Everything persisted about a finished call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptRecord {
    pub call_id: String,
    pub timestamp_ms: i64,
    pub duration_ms: u64,
    /// What was said, in order; speakers are only in `rich_transcript`
    pub transcripts: Vec<String>,
    pub rich_transcript: Vec<TranscriptEntry>,
}

impl TranscriptRecord {
    /// Build a record from a session. `None` when nothing was said.
    pub fn from_session(session: &CallSession) -> Option<Self> {
        let entries = session.transcript();
        if entries.is_empty() {
            return None;
        }

        let transcripts = entries.iter().map(|entry| entry.content.clone()).collect();

        Some(Self {
            call_id: session.id(),
            timestamp_ms: Utc::now().timestamp_millis(),
            duration_ms: session.duration_ms(),
            transcripts,
            rich_transcript: entries,
        })
    }
}

/// Where finished transcripts go.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn save(&self, record: &TranscriptRecord) -> Result<()>;
}

/// Writes transcripts as JSON files under a data directory.
pub struct FileTranscriptStore {
    data_dir: PathBuf,
}

impl FileTranscriptStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    fn file_stem(record: &TranscriptRecord) -> String {
        let safe_id: String = record
            .call_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("call_{}_{}", safe_id, record.timestamp_ms)
    }
}

#[async_trait]
impl TranscriptStore for FileTranscriptStore {
    async fn save(&self, record: &TranscriptRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", self.data_dir.display()))?;

        let stem = Self::file_stem(record);
        let transcript_name = format!("{}_transcript.json", stem);
        let transcript_path = self.data_dir.join(&transcript_name);
        let queue_path = self.data_dir.join(format!("{}_queue.json", stem));

        let transcript_json = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&transcript_path, transcript_json)
            .await
            .with_context(|| format!("Failed to write {}", transcript_path.display()))?;

        let queue_item = json!({
            "callId": record.call_id,
            "timestampMs": record.timestamp_ms,
            "transcriptFile": transcript_name,
            "status": "pending",
        });
        tokio::fs::write(&queue_path, serde_json::to_vec_pretty(&queue_item)?)
            .await
            .with_context(|| format!("Failed to write {}", queue_path.display()))?;

        info!(
            call_id = %record.call_id,
            entries = record.rich_transcript.len(),
            path = %transcript_path.display(),
            "Transcript saved"
        );
        Ok(())
    }
}
