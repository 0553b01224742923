//! Ingestion service: the surface an HTTP layer (or the CLI) talks to.
//!
//! Validates submissions before anything is persisted, exposes job status
//! with nested step events for progress polling, and serves the page-render
//! read path from the content cache.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::cache::ContentCache;
use crate::chunker;
use crate::config::{ChunkingConfig, Config};
use crate::db;
use crate::error::IngestError;
use crate::models::{IngestionEvent, IngestionJob};
use crate::pipeline::IngestionPipeline;
use crate::repo::DocumentRepository;
use crate::worker;

/// Parameters for a job submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub source: String,
    pub collection: String,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub submitted_by: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// A job with its step events, for progress polling.
#[derive(Debug, Clone)]
pub struct JobWithEvents {
    pub job: IngestionJob,
    pub events: Vec<IngestionEvent>,
}

pub struct IngestionService {
    repo: DocumentRepository,
    cache: Arc<ContentCache>,
    defaults: ChunkingConfig,
}

impl IngestionService {
    pub fn new(repo: DocumentRepository, cache: Arc<ContentCache>, defaults: ChunkingConfig) -> Self {
        Self {
            repo,
            cache,
            defaults,
        }
    }

    /// Validate and enqueue a job. Rejects bad parameters with
    /// `InvalidConfig` before any row is written or file touched.
    pub async fn submit_job(&self, request: SubmitRequest) -> Result<IngestionJob, IngestError> {
        if request.source.trim().is_empty() {
            return Err(IngestError::InvalidConfig("source is required".to_string()));
        }
        if request.collection.trim().is_empty() {
            return Err(IngestError::InvalidConfig(
                "collection is required".to_string(),
            ));
        }

        let chunk_size = request.chunk_size.unwrap_or(self.defaults.default_size);
        let chunk_overlap = request
            .chunk_overlap
            .unwrap_or(self.defaults.default_overlap);
        chunker::validate_params(chunk_size, chunk_overlap)?;

        self.repo.ensure_collection(&request.collection).await?;
        self.repo
            .create_job(
                &request.source,
                &request.collection,
                chunk_size,
                chunk_overlap,
                request.submitted_by.as_deref(),
                request.metadata.as_ref(),
            )
            .await
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<Option<JobWithEvents>, IngestError> {
        let Some(job) = self.repo.get_job(job_id).await? else {
            return Ok(None);
        };
        let events = self.repo.list_job_events(job_id).await?;
        Ok(Some(JobWithEvents { job, events }))
    }

    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<IngestionJob>, IngestError> {
        self.repo.list_jobs(limit).await
    }

    /// Ask a pending/running job to stop at the next file boundary.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool, IngestError> {
        self.repo.request_cancel(job_id).await
    }

    /// Remove the job with its documents, chunks, and events. Cache entries
    /// are content-keyed and shared across jobs, so they are never touched.
    pub async fn delete_job(&self, job_id: &str) -> Result<bool, IngestError> {
        self.repo.delete_job(job_id).await
    }

    /// Serve a cached page render for a document: `(bytes, mime type)`.
    /// Returns `None` when the document is unknown or no render was produced
    /// for that page at parse time.
    pub async fn get_page_render(
        &self,
        document_id: &str,
        page_number: i64,
    ) -> Result<Option<(Vec<u8>, String)>, IngestError> {
        let Some(document) = self.repo.get_document(document_id).await? else {
            return Ok(None);
        };
        let Some(path) = self.cache.page_render(&document.content_hash, page_number) else {
            return Ok(None);
        };
        let bytes = std::fs::read(&path)
            .map_err(|e| IngestError::Parse(format!("cannot read render {}: {}", path.display(), e)))?;
        let mime = mime_for_extension(
            path.extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default(),
        );
        Ok(Some((bytes, mime.to_string())))
    }
}

async fn build_service(config: &Config) -> Result<(DocumentRepository, Arc<ContentCache>, IngestionService)> {
    let pool = db::connect(&config.db.path).await?;
    let repo = DocumentRepository::new(pool);
    let cache = Arc::new(ContentCache::new(config.storage.cache_dir.clone()));
    let service = IngestionService::new(repo.clone(), Arc::clone(&cache), config.chunking.clone());
    Ok((repo, cache, service))
}

/// Entry point for `docpipe submit`.
pub async fn run_submit(
    config: &Config,
    source: String,
    collection: String,
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
    now: bool,
) -> Result<()> {
    let (repo, cache, service) = build_service(config).await?;
    let job = service
        .submit_job(SubmitRequest {
            source,
            collection,
            chunk_size,
            chunk_overlap,
            submitted_by: None,
            metadata: None,
        })
        .await?;

    println!("submit");
    println!("  job: {}", job.id);
    println!("  source: {}", job.source);
    println!("  collection: {}", job.collection);
    println!(
        "  chunking: size {} overlap {}",
        job.chunk_size, job.chunk_overlap
    );

    if now {
        let pipeline = IngestionPipeline::from_config(config, repo.clone(), cache)?;
        if let Some(claimed) = repo.claim_pending_job().await? {
            worker::process_job(&pipeline, &repo, &claimed).await?;
        }
        if let Some(finished) = repo.get_job(&job.id).await? {
            println!("  status: {}", finished.status.as_str());
        }
    }
    println!("ok");
    Ok(())
}

/// Entry point for `docpipe status`.
pub async fn run_status(config: &Config, job_id: &str) -> Result<()> {
    let (_, _, service) = build_service(config).await?;
    let Some(status) = service.get_job_status(job_id).await? else {
        eprintln!("job not found: {}", job_id);
        std::process::exit(1);
    };

    let job = &status.job;
    println!("job {}", job.id);
    println!("  status: {}", job.status.as_str());
    println!("  source: {}", job.source);
    println!("  collection: {}", job.collection);
    if let Some(message) = &job.error_message {
        println!("  error: {}", message);
    }
    for event in &status.events {
        let detail = event
            .detail
            .as_ref()
            .map(|d| format!("  {}", d))
            .unwrap_or_default();
        println!(
            "  {}  {}  {}{}",
            event.document_path,
            event.step.as_str(),
            event.status.as_str(),
            detail
        );
    }
    Ok(())
}

/// Entry point for `docpipe jobs`.
pub async fn run_jobs(config: &Config, limit: i64) -> Result<()> {
    let (_, _, service) = build_service(config).await?;
    let jobs = service.list_jobs(limit).await?;
    println!("jobs ({})", jobs.len());
    for job in jobs {
        println!(
            "  {}  {}  {} -> {}",
            job.id,
            job.status.as_str(),
            job.source,
            job.collection
        );
    }
    Ok(())
}

/// Entry point for `docpipe cancel`.
pub async fn run_cancel(config: &Config, job_id: &str) -> Result<()> {
    let (_, _, service) = build_service(config).await?;
    if service.cancel_job(job_id).await? {
        println!("cancel requested for {}", job_id);
    } else {
        eprintln!("job not cancellable: {}", job_id);
        std::process::exit(1);
    }
    Ok(())
}

/// Entry point for `docpipe delete`.
pub async fn run_delete(config: &Config, job_id: &str) -> Result<()> {
    let (_, _, service) = build_service(config).await?;
    if service.delete_job(job_id).await? {
        println!("deleted {}", job_id);
    } else {
        eprintln!("job not found: {}", job_id);
        std::process::exit(1);
    }
    Ok(())
}

/// Entry point for `docpipe preview`. Writes the cached render to `output`
/// (default `page-<n>.<ext>` in the working directory).
pub async fn run_preview(
    config: &Config,
    document_id: &str,
    page: i64,
    output: Option<PathBuf>,
) -> Result<()> {
    let (_, _, service) = build_service(config).await?;
    let Some((bytes, mime)) = service.get_page_render(document_id, page).await? else {
        eprintln!("no render for document {} page {}", document_id, page);
        std::process::exit(1);
    };

    let ext = match mime.as_str() {
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        _ => "png",
    };
    let path = output.unwrap_or_else(|| PathBuf::from(format!("page-{}.{}", page, ext)));
    std::fs::write(&path, bytes)?;
    println!("wrote {} ({})", path.display(), mime);
    Ok(())
}

fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "image/png",
    }
}
