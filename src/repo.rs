//! Repository over SQLite: jobs, documents, chunks, and step events.
//!
//! All pipeline state goes through here — the orchestrator never issues raw
//! storage commands. Two guarantees live at this layer:
//!
//! - **Monotonic events**: `update_event_status` is the only event mutator
//!   and refuses to overwrite a terminal status, so a poller can never
//!   observe `success` followed by `running`.
//! - **Per-file atomicity**: a document and its chunks are committed in one
//!   transaction; a failed file contributes zero rows.

use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::embedder::{blob_to_vec, vec_to_blob};
use crate::error::IngestError;
use crate::models::{
    Chunk, Citation, Document, EventStatus, IngestionEvent, IngestionJob, IngestionStep, JobStatus,
};

#[derive(Clone)]
pub struct DocumentRepository {
    pool: SqlitePool,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl DocumentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Collections ============

    /// Create the collection if it does not exist yet.
    pub async fn ensure_collection(&self, name: &str) -> Result<(), IngestError> {
        sqlx::query("INSERT OR IGNORE INTO collections (id, name, created_at) VALUES (?, ?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(name)
            .bind(now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ============ Jobs ============

    pub async fn create_job(
        &self,
        source: &str,
        collection: &str,
        chunk_size: usize,
        chunk_overlap: usize,
        submitted_by: Option<&str>,
        parameters: Option<&serde_json::Value>,
    ) -> Result<IngestionJob, IngestError> {
        let id = Uuid::new_v4().to_string();
        let ts = now();
        sqlx::query(
            r#"
            INSERT INTO ingestion_jobs
                (id, source, collection, chunk_size, chunk_overlap, submitted_by,
                 status, parameters_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(source)
        .bind(collection)
        .bind(chunk_size as i64)
        .bind(chunk_overlap as i64)
        .bind(submitted_by)
        .bind(parameters.map(|p| p.to_string()))
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        self.get_job(&id)
            .await?
            .ok_or_else(|| IngestError::RepositoryWrite(sqlx::Error::RowNotFound))
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<IngestionJob>, IngestError> {
        let row = sqlx::query("SELECT * FROM ingestion_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(job_from_row))
    }

    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<IngestionJob>, IngestError> {
        let rows = sqlx::query("SELECT * FROM ingestion_jobs ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(job_from_row).collect())
    }

    /// Claim the oldest pending job, transitioning it to `running`. Returns
    /// `None` when nothing is pending or another worker won the claim.
    pub async fn claim_pending_job(&self) -> Result<Option<IngestionJob>, IngestError> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM ingestion_jobs WHERE status = 'pending' ORDER BY created_at LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(id) = id else { return Ok(None) };

        let claimed = sqlx::query(
            "UPDATE ingestion_jobs SET status = 'running', updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(now())
        .bind(&id)
        .execute(&self.pool)
        .await?;

        if claimed.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_job(&id).await
    }

    pub async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<(), IngestError> {
        sqlx::query(
            "UPDATE ingestion_jobs SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flag a job for cancellation. Observed by the orchestrator at file
    /// boundaries; in-flight files complete.
    pub async fn request_cancel(&self, id: &str) -> Result<bool, IngestError> {
        let result = sqlx::query(
            "UPDATE ingestion_jobs SET cancel_requested = 1, updated_at = ? WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cancel_requested(&self, id: &str) -> Result<bool, IngestError> {
        let flag: Option<i64> =
            sqlx::query_scalar("SELECT cancel_requested FROM ingestion_jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(flag.unwrap_or(0) != 0)
    }

    // ============ Events ============

    /// Create the (job, file, step) event in `pending` if absent. Idempotent:
    /// a concurrent insert loses to the UNIQUE constraint and both callers
    /// see the same row.
    pub async fn ensure_event(
        &self,
        job_id: &str,
        document_path: &str,
        step: IngestionStep,
    ) -> Result<IngestionEvent, IngestError> {
        let ts = now();
        sqlx::query(
            r#"
            INSERT INTO ingestion_events (id, job_id, document_path, step, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?)
            ON CONFLICT(job_id, document_path, step) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(job_id)
        .bind(document_path)
        .bind(step.as_str())
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM ingestion_events WHERE job_id = ? AND document_path = ? AND step = ?",
        )
        .bind(job_id)
        .bind(document_path)
        .bind(step.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(event_from_row(row))
    }

    /// Sole event mutator. The SQL guard keeps transitions monotonic: once an
    /// event is `success` or `failed` it never changes again; an attempted
    /// regression is logged and dropped.
    pub async fn update_event_status(
        &self,
        event_id: &str,
        status: EventStatus,
        detail: Option<&serde_json::Value>,
        document_id: Option<&str>,
        document_title: Option<&str>,
    ) -> Result<(), IngestError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_events
            SET status = ?,
                detail_json = COALESCE(?, detail_json),
                document_id = COALESCE(?, document_id),
                document_title = COALESCE(?, document_title),
                updated_at = ?
            WHERE id = ? AND status NOT IN ('success', 'failed')
            "#,
        )
        .bind(status.as_str())
        .bind(detail.map(|d| d.to_string()))
        .bind(document_id)
        .bind(document_title)
        .bind(now())
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(event_id, status = status.as_str(), "ignored status transition on terminal event");
        }
        Ok(())
    }

    /// Events for a job, ordered by file then step order.
    pub async fn list_job_events(&self, job_id: &str) -> Result<Vec<IngestionEvent>, IngestError> {
        let rows = sqlx::query("SELECT * FROM ingestion_events WHERE job_id = ?")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        let mut events: Vec<IngestionEvent> = rows.into_iter().map(event_from_row).collect();
        events.sort_by(|a, b| {
            a.document_path
                .cmp(&b.document_path)
                .then(a.step.ordinal().cmp(&b.step.ordinal()))
        });
        Ok(events)
    }

    // ============ Documents & chunks ============

    /// Commit one file's document row and all of its chunks atomically.
    pub async fn commit_document_chunks(
        &self,
        document: &Document,
        chunks: &[Chunk],
    ) -> Result<(), IngestError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents
                (id, title, source_path, collection, job_id, content_hash, page_count, metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&document.id)
        .bind(&document.title)
        .bind(&document.source_path)
        .bind(&document.collection)
        .bind(&document.job_id)
        .bind(&document.content_hash)
        .bind(document.page_count)
        .bind(document.metadata.to_string())
        .bind(document.created_at)
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (id, document_id, page_number, page_index, chunk_index, char_start, char_end,
                     content, metadata_json, embedding, embedding_model, citation_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.page_number)
            .bind(chunk.page_index)
            .bind(chunk.chunk_index)
            .bind(chunk.char_start)
            .bind(chunk.char_end)
            .bind(&chunk.content)
            .bind(chunk.metadata.to_string())
            .bind(chunk.embedding.as_ref().map(|v| vec_to_blob(v)))
            .bind(chunk.embedding_model.as_deref())
            .bind(
                chunk
                    .citation
                    .as_ref()
                    .and_then(|c| serde_json::to_string(c).ok()),
            )
            .bind(now())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>, IngestError> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(document_from_row))
    }

    pub async fn documents_for_job(&self, job_id: &str) -> Result<Vec<Document>, IngestError> {
        let rows = sqlx::query("SELECT * FROM documents WHERE job_id = ? ORDER BY source_path")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(document_from_row).collect())
    }

    pub async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, IngestError> {
        let rows =
            sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(chunk_from_row).collect())
    }

    pub async fn chunk_count_for_job(&self, job_id: &str) -> Result<i64, IngestError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE document_id IN (SELECT id FROM documents WHERE job_id = ?)",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Remove a job with its documents, chunks, and events. The content cache
    /// is untouched: entries are content-keyed and shared across jobs.
    pub async fn delete_job(&self, job_id: &str) -> Result<bool, IngestError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM chunks WHERE document_id IN (SELECT id FROM documents WHERE job_id = ?)",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM ingestion_events WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM ingestion_jobs WHERE id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }
}

fn job_from_row(row: sqlx::sqlite::SqliteRow) -> IngestionJob {
    let status: String = row.get("status");
    let parameters: Option<String> = row.get("parameters_json");
    IngestionJob {
        id: row.get("id"),
        source: row.get("source"),
        collection: row.get("collection"),
        chunk_size: row.get("chunk_size"),
        chunk_overlap: row.get("chunk_overlap"),
        submitted_by: row.get("submitted_by"),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        error_message: row.get("error_message"),
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        parameters: parameters.and_then(|p| serde_json::from_str(&p).ok()),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn event_from_row(row: sqlx::sqlite::SqliteRow) -> IngestionEvent {
    let step: String = row.get("step");
    let status: String = row.get("status");
    let detail: Option<String> = row.get("detail_json");
    IngestionEvent {
        id: row.get("id"),
        job_id: row.get("job_id"),
        document_id: row.get("document_id"),
        document_title: row.get("document_title"),
        document_path: row.get("document_path"),
        step: IngestionStep::parse(&step).unwrap_or(IngestionStep::Parse),
        status: EventStatus::parse(&status).unwrap_or(EventStatus::Failed),
        detail: detail.and_then(|d| serde_json::from_str(&d).ok()),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn document_from_row(row: sqlx::sqlite::SqliteRow) -> Document {
    let metadata: String = row.get("metadata_json");
    Document {
        id: row.get("id"),
        title: row.get("title"),
        source_path: row.get("source_path"),
        collection: row.get("collection"),
        job_id: row.get("job_id"),
        content_hash: row.get("content_hash"),
        page_count: row.get("page_count"),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: row.get("created_at"),
    }
}

fn chunk_from_row(row: sqlx::sqlite::SqliteRow) -> Chunk {
    let metadata: String = row.get("metadata_json");
    let embedding: Option<Vec<u8>> = row.get("embedding");
    let citation: Option<String> = row.get("citation_json");
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        page_number: row.get("page_number"),
        page_index: row.get("page_index"),
        chunk_index: row.get("chunk_index"),
        char_start: row.get("char_start"),
        char_end: row.get("char_end"),
        content: row.get("content"),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
        embedding_model: row.get("embedding_model"),
        citation: citation.and_then(|c| serde_json::from_str::<Citation>(&c).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    async fn test_repo() -> (tempfile::TempDir, DocumentRepository) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("test.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, DocumentRepository::new(pool))
    }

    fn sample_document(job_id: &str) -> Document {
        Document {
            id: Uuid::new_v4().to_string(),
            title: "Doc".to_string(),
            source_path: "/tmp/doc.txt".to_string(),
            collection: "default".to_string(),
            job_id: job_id.to_string(),
            content_hash: "hash".to_string(),
            page_count: 1,
            metadata: serde_json::json!({}),
            created_at: 0,
        }
    }

    fn sample_chunk(document_id: &str, index: i64) -> Chunk {
        Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            page_number: 1,
            page_index: index,
            chunk_index: index,
            char_start: index * 10,
            char_end: (index + 1) * 10,
            content: format!("chunk {}", index),
            metadata: serde_json::json!({}),
            embedding: Some(vec![0.5, -0.5, index as f32]),
            embedding_model: Some("test-model".to_string()),
            citation: Some(Citation {
                label: format!("p1#{}", index + 1),
                page_number: 1,
                preview_url: "/documents/x/pages/1/preview".to_string(),
                render_path: None,
            }),
        }
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let (_tmp, repo) = test_repo().await;
        let job = repo
            .create_job("/tmp/docs", "default", 1200, 150, Some("alice"), None)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.chunk_size, 1200);

        let claimed = repo.claim_pending_job().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);

        // Nothing left to claim
        assert!(repo.claim_pending_job().await.unwrap().is_none());

        repo.update_job_status(&job.id, JobStatus::Success, None)
            .await
            .unwrap();
        let done = repo.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn test_ensure_event_is_idempotent() {
        let (_tmp, repo) = test_repo().await;
        let job = repo
            .create_job("/tmp/docs", "default", 1200, 150, None, None)
            .await
            .unwrap();

        let first = repo
            .ensure_event(&job.id, "/tmp/docs/a.txt", IngestionStep::Parse)
            .await
            .unwrap();
        let second = repo
            .ensure_event(&job.id, "/tmp/docs/a.txt", IngestionStep::Parse)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, EventStatus::Pending);

        let events = repo.list_job_events(&job.id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_event_status_is_monotonic() {
        let (_tmp, repo) = test_repo().await;
        let job = repo
            .create_job("/tmp/docs", "default", 1200, 150, None, None)
            .await
            .unwrap();
        let event = repo
            .ensure_event(&job.id, "a.txt", IngestionStep::Embed)
            .await
            .unwrap();

        repo.update_event_status(&event.id, EventStatus::Running, None, None, None)
            .await
            .unwrap();
        repo.update_event_status(
            &event.id,
            EventStatus::Success,
            Some(&serde_json::json!({"embedded_chunks": 3})),
            None,
            None,
        )
        .await
        .unwrap();

        // Regression attempt must be dropped
        repo.update_event_status(&event.id, EventStatus::Running, None, None, None)
            .await
            .unwrap();

        let events = repo.list_job_events(&job.id).await.unwrap();
        assert_eq!(events[0].status, EventStatus::Success);
        assert_eq!(events[0].detail.as_ref().unwrap()["embedded_chunks"], 3);
    }

    #[tokio::test]
    async fn test_events_sorted_by_file_then_step() {
        let (_tmp, repo) = test_repo().await;
        let job = repo
            .create_job("/tmp/docs", "default", 1200, 150, None, None)
            .await
            .unwrap();
        repo.ensure_event(&job.id, "b.txt", IngestionStep::Chunk)
            .await
            .unwrap();
        repo.ensure_event(&job.id, "a.txt", IngestionStep::Embed)
            .await
            .unwrap();
        repo.ensure_event(&job.id, "a.txt", IngestionStep::Parse)
            .await
            .unwrap();

        let events = repo.list_job_events(&job.id).await.unwrap();
        let keys: Vec<(String, &str)> = events
            .iter()
            .map(|e| (e.document_path.clone(), e.step.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a.txt".to_string(), "parse"),
                ("a.txt".to_string(), "embed"),
                ("b.txt".to_string(), "chunk"),
            ]
        );
    }

    #[tokio::test]
    async fn test_commit_and_read_chunks() {
        let (_tmp, repo) = test_repo().await;
        let job = repo
            .create_job("/tmp/docs", "default", 1200, 150, None, None)
            .await
            .unwrap();
        let document = sample_document(&job.id);
        let chunks = vec![sample_chunk(&document.id, 0), sample_chunk(&document.id, 1)];

        repo.commit_document_chunks(&document, &chunks).await.unwrap();

        let stored = repo.chunks_for_document(&document.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].content, "chunk 0");
        assert_eq!(stored[1].chunk_index, 1);
        assert_eq!(stored[0].embedding.as_ref().unwrap(), &vec![0.5, -0.5, 0.0]);
        assert_eq!(stored[1].citation.as_ref().unwrap().label, "p1#2");
        assert_eq!(repo.chunk_count_for_job(&job.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_index_rolls_back() {
        let (_tmp, repo) = test_repo().await;
        let job = repo
            .create_job("/tmp/docs", "default", 1200, 150, None, None)
            .await
            .unwrap();
        let document = sample_document(&job.id);
        let mut chunks = vec![sample_chunk(&document.id, 0), sample_chunk(&document.id, 0)];
        chunks[1].id = Uuid::new_v4().to_string();

        assert!(repo.commit_document_chunks(&document, &chunks).await.is_err());
        // All-or-nothing: neither document nor chunks persisted
        assert!(repo.get_document(&document.id).await.unwrap().is_none());
        assert_eq!(repo.chunk_count_for_job(&job.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_job_removes_children() {
        let (_tmp, repo) = test_repo().await;
        let job = repo
            .create_job("/tmp/docs", "default", 1200, 150, None, None)
            .await
            .unwrap();
        let document = sample_document(&job.id);
        repo.commit_document_chunks(&document, &[sample_chunk(&document.id, 0)])
            .await
            .unwrap();
        repo.ensure_event(&job.id, "/tmp/doc.txt", IngestionStep::Parse)
            .await
            .unwrap();

        assert!(repo.delete_job(&job.id).await.unwrap());
        assert!(repo.get_job(&job.id).await.unwrap().is_none());
        assert!(repo.get_document(&document.id).await.unwrap().is_none());
        assert!(repo.list_job_events(&job.id).await.unwrap().is_empty());
        // Deleting again reports nothing deleted
        assert!(!repo.delete_job(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_flag() {
        let (_tmp, repo) = test_repo().await;
        let job = repo
            .create_job("/tmp/docs", "default", 1200, 150, None, None)
            .await
            .unwrap();
        assert!(!repo.cancel_requested(&job.id).await.unwrap());
        assert!(repo.request_cancel(&job.id).await.unwrap());
        assert!(repo.cancel_requested(&job.id).await.unwrap());

        // Terminal jobs can no longer be cancelled
        repo.update_job_status(&job.id, JobStatus::Success, None)
            .await
            .unwrap();
        assert!(!repo.request_cancel(&job.id).await.unwrap());
    }
}
