//! Error taxonomy for the ingestion pipeline.
//!
//! Most failures are file-scoped: they are recorded on the failing step's
//! event and stop further steps for that file only. `InvalidConfig` and a
//! repository failure on the job record itself are job-fatal and reject the
//! job before any file is touched.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    /// The file's extension maps to no parser variant.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The parser or converter rejected the file's content.
    #[error("parse failed: {0}")]
    Parse(String),

    /// Bad chunking parameters (size/overlap) at submit or assembly time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The embedding backend failed after its own retry policy was exhausted.
    #[error("embedding backend failed: {0}")]
    EmbeddingBackend(String),

    /// A write through the repository failed.
    #[error("repository write failed: {0}")]
    RepositoryWrite(#[from] sqlx::Error),
}

impl IngestError {
    /// Whether this error rejects the whole job rather than a single file.
    /// File-scoped errors land on the failing step's event; job-fatal errors
    /// surface on the job record before any file processing starts.
    pub fn is_job_fatal(&self) -> bool {
        matches!(self, Self::InvalidConfig(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_is_job_fatal() {
        assert!(IngestError::InvalidConfig("overlap >= size".into()).is_job_fatal());
        assert!(!IngestError::Parse("bad bytes".into()).is_job_fatal());
        assert!(!IngestError::UnsupportedFormat("exe".into()).is_job_fatal());
        assert!(!IngestError::EmbeddingBackend("timeout".into()).is_job_fatal());
    }
}
