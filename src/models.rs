//! Core data models used throughout docpipe.
//!
//! These types represent the jobs, per-step events, documents, chunks, and
//! citations that flow through the ingestion pipeline. Statuses and steps are
//! stored as lowercase strings in SQLite, so each enum carries an
//! `as_str`/`parse` pair instead of relying on serde for the database side.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Overall status of an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "success" => Some(JobStatus::Success),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Pipeline step within one file, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStep {
    Parse,
    Chunk,
    Embed,
    Cite,
}

impl IngestionStep {
    /// All steps in the order they run for a file.
    pub const ALL: [IngestionStep; 4] = [
        IngestionStep::Parse,
        IngestionStep::Chunk,
        IngestionStep::Embed,
        IngestionStep::Cite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStep::Parse => "parse",
            IngestionStep::Chunk => "chunk",
            IngestionStep::Embed => "embed",
            IngestionStep::Cite => "cite",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parse" => Some(IngestionStep::Parse),
            "chunk" => Some(IngestionStep::Chunk),
            "embed" => Some(IngestionStep::Embed),
            "cite" => Some(IngestionStep::Cite),
            _ => None,
        }
    }

    /// Position in the step order, used to sort events for display.
    pub fn ordinal(&self) -> usize {
        match self {
            IngestionStep::Parse => 0,
            IngestionStep::Chunk => 1,
            IngestionStep::Embed => 2,
            IngestionStep::Cite => 3,
        }
    }
}

/// Status of one (job, file, step) event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Running => "running",
            EventStatus::Success => "success",
            EventStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EventStatus::Pending),
            "running" => Some(EventStatus::Running),
            "success" => Some(EventStatus::Success),
            "failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Success | EventStatus::Failed)
    }
}

/// One request to ingest a source (file or directory) into a collection.
#[derive(Debug, Clone)]
pub struct IngestionJob {
    pub id: String,
    pub source: String,
    pub collection: String,
    pub chunk_size: i64,
    pub chunk_overlap: i64,
    pub submitted_by: Option<String>,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub parameters: Option<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Persisted status record for one (job, file, step) tuple.
///
/// Created lazily in `pending` on first touch of a step and updated in place
/// thereafter; never deleted while the job exists. The repository guarantees
/// monotonic transitions: a terminal status is never overwritten.
#[derive(Debug, Clone)]
pub struct IngestionEvent {
    pub id: String,
    pub job_id: String,
    pub document_id: Option<String>,
    pub document_title: Option<String>,
    pub document_path: String,
    pub step: IngestionStep,
    pub status: EventStatus,
    pub detail: Option<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Stored document metadata. One row per (file, job); the same file ingested
/// by two jobs yields two documents sharing one cache entry.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub source_path: String,
    pub collection: String,
    pub job_id: String,
    pub content_hash: String,
    pub page_count: i64,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

/// Citation linking a chunk back to its originating page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub label: String,
    pub page_number: i64,
    pub preview_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_path: Option<String>,
}

/// A bounded slice of one page's text, the atomic unit for embedding and
/// retrieval. Offsets are character offsets into the sanitized page text;
/// indices are assigned at assembly time and never change.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub page_number: i64,
    /// Index of this chunk within its page.
    pub page_index: i64,
    /// Index of this chunk across the whole document.
    pub chunk_index: i64,
    pub char_start: i64,
    pub char_end: i64,
    pub content: String,
    pub metadata: serde_json::Value,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub citation: Option<Citation>,
}

/// A single parsed page: sanitized text plus whatever structural metadata the
/// parser propagated, and the cached render for this page if one was made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedPage {
    pub number: i64,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render: Option<PathBuf>,
}

/// In-memory parse result: an ordered sequence of pages. Not persisted as its
/// own entity — its only durable traces are the cache entry it was loaded
/// from and the chunks derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub title: String,
    pub pages: Vec<ParsedPage>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ParsedDocument {
    /// Look up a page by its 1-based number.
    pub fn page(&self, number: i64) -> Option<&ParsedPage> {
        self.pages.iter().find(|p| p.number == number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("done"), None);
    }

    #[test]
    fn test_step_order() {
        let ordinals: Vec<usize> = IngestionStep::ALL.iter().map(|s| s.ordinal()).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3]);
        assert_eq!(IngestionStep::parse("embed"), Some(IngestionStep::Embed));
    }

    #[test]
    fn test_terminal_event_statuses() {
        assert!(EventStatus::Success.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
        assert!(!EventStatus::Pending.is_terminal());
        assert!(!EventStatus::Running.is_terminal());
    }
}
