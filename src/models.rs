//! Core data models used throughout Ragline.
//!
//! These types represent the documents, chunks, jobs, and stream events that
//! flow through the ingestion, retrieval, and relay pipelines.

use serde::{Deserialize, Serialize};

/// A document registered for ingestion, as stored in SQLite.
///
/// Immutable once ingested; the only mutation is deletion, which removes
/// the row together with its chunks and vectors.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub conversation_id: Option<String>,
    pub file_name: String,
    pub content_type: String,
    pub body: String,
    pub size: i64,
    pub created_at: i64,
}

/// Fields supplied by a caller when registering a new document.
#[derive(Debug, Clone, Deserialize)]
pub struct NewDocument {
    pub owner_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub file_name: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub body: String,
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

/// A chunk of a document's body text.
///
/// Derived deterministically from the document body and the chunking config,
/// so re-chunking with the same config reproduces identical boundaries.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub char_len: i64,
    pub hash: String,
}

/// What kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Chunk, embed, and index a registered document.
    Ingest,
    /// Remove a document's chunks and vectors from the store.
    Delete,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Ingest => "ingest",
            JobKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<JobKind> {
        match s {
            "ingest" => Some(JobKind::Ingest),
            "delete" => Some(JobKind::Delete),
            _ => None,
        }
    }
}

/// Job lifecycle state.
///
/// `queued → active → completed`, or `queued → active → queued` on a
/// transient failure (until attempts run out), or `active → failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<JobState> {
        match s {
            "queued" => Some(JobState::Queued),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    /// Terminal states are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// A unit of ingestion work owned by the queue.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub document_id: String,
    pub kind: JobKind,
    pub payload: String,
    pub state: JobState,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub run_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A scored chunk returned from a similarity query, with document provenance.
///
/// Ephemeral: produced per query, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub document_id: String,
    pub file_name: String,
    pub chunk_index: i64,
    pub text: String,
    /// Cosine similarity in `[-1.0, 1.0]`; higher is more similar.
    pub score: f64,
}

/// One discrete unit of a streaming completion response.
///
/// Every relay session emits zero or more `Delta` events followed by exactly
/// one terminal event (`Done` or `Error`).
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental piece of model output.
    Delta(String),
    /// Terminal: the upstream request failed; description is client-safe.
    Error(String),
    /// Terminal: the completion finished normally.
    Done,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Delta(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_roundtrip() {
        for state in [
            JobState::Queued,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn test_stream_event_terminality() {
        assert!(!StreamEvent::Delta("hi".into()).is_terminal());
        assert!(StreamEvent::Done.is_terminal());
        assert!(StreamEvent::Error("boom".into()).is_terminal());
    }
}
