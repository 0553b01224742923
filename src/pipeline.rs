//! Ingestion pipeline orchestration.
//!
//! Drives one job end to end: enumerate files at the source, then run each
//! file through cache/parse → chunk → embed → cite, updating the file's step
//! events around every stage and committing the document with its chunks in
//! one transaction once citation enrichment succeeds.
//!
//! Files fan out under a bounded semaphore; steps within a file are strictly
//! ordered. A failing step records its error on the event and short-circuits
//! that file only — sibling files keep going. Cancellation is honored at
//! file boundaries: in-flight files complete, queued files are skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::Semaphore;
use tracing::{error, info};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::cache::ContentCache;
use crate::chunker;
use crate::citation;
use crate::config::Config;
use crate::embedder::EmbeddingClient;
use crate::error::IngestError;
use crate::models::{Chunk, Document, EventStatus, IngestionJob, IngestionStep, ParsedDocument};
use crate::parser::{ConvertOptions, DocumentConverter, ParserAdapter};
use crate::repo::DocumentRepository;

/// Outcome of one `run` call, aggregated by the worker into the job status.
#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    pub files_total: usize,
    pub files_succeeded: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
    pub chunks_written: u64,
    pub cancelled: bool,
}

enum FileOutcome {
    Done(u64),
    Failed,
    Skipped,
}

pub struct IngestionPipeline {
    repo: DocumentRepository,
    cache: Arc<ContentCache>,
    converter: Arc<dyn DocumentConverter>,
    embedder: Arc<dyn EmbeddingClient>,
    convert_options: ConvertOptions,
    parse_timeout: Duration,
    batch_size: usize,
    workers: usize,
    include_globs: Vec<String>,
    exclude_globs: Vec<String>,
    follow_symlinks: bool,
}

impl IngestionPipeline {
    /// Build a pipeline with the bundled PDF converter and the configured
    /// embedding client. The CLI entry points use this; tests inject their
    /// own converter and embedder through [`IngestionPipeline::new`].
    pub fn from_config(
        config: &Config,
        repo: DocumentRepository,
        cache: Arc<ContentCache>,
    ) -> anyhow::Result<Self> {
        let converter: Arc<dyn DocumentConverter> = Arc::new(crate::parser::PdfTextConverter);
        let embedder = crate::embedder::create_client(&config.embedding)?;
        Ok(Self::new(repo, cache, converter, embedder, config))
    }

    pub fn new(
        repo: DocumentRepository,
        cache: Arc<ContentCache>,
        converter: Arc<dyn DocumentConverter>,
        embedder: Arc<dyn EmbeddingClient>,
        config: &Config,
    ) -> Self {
        Self {
            repo,
            cache,
            converter,
            embedder,
            convert_options: ConvertOptions::from(&config.converter),
            parse_timeout: Duration::from_secs(config.converter.timeout_secs),
            batch_size: config.embedding.batch_size.max(1),
            workers: config.pipeline.workers.max(1),
            include_globs: config.sources.include_globs.clone(),
            exclude_globs: config.sources.exclude_globs.clone(),
            follow_symlinks: config.sources.follow_symlinks,
        }
    }

    /// Process every file under the job's source. Returns `Err` only for
    /// job-fatal conditions (nothing to ingest, bad chunk parameters);
    /// per-file failures are absorbed into the summary.
    pub async fn run(&self, job: &IngestionJob) -> Result<PipelineSummary, IngestError> {
        chunker::validate_params(job.chunk_size as usize, job.chunk_overlap as usize)?;

        let files = self.discover_sources(&job.source)?;
        if files.is_empty() {
            return Err(IngestError::Parse(format!(
                "no documents discovered at {}",
                job.source
            )));
        }

        info!(job_id = %job.id, files = files.len(), "starting ingestion");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let tasks = files.iter().map(|path| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");

                // Cancellation is checked once the file is about to start, so
                // in-flight files complete and queued files are skipped.
                match self.repo.cancel_requested(&job.id).await {
                    Ok(true) => {
                        info!(job_id = %job.id, file = %path.display(), "skipping file, job cancelled");
                        return FileOutcome::Skipped;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "cancel check failed");
                        return FileOutcome::Failed;
                    }
                }

                match self.process_file(job, path).await {
                    Ok(chunks) => {
                        info!(job_id = %job.id, file = %path.display(), chunks, "file ingested");
                        FileOutcome::Done(chunks)
                    }
                    Err(e) => {
                        error!(job_id = %job.id, file = %path.display(), error = %e, "file failed");
                        FileOutcome::Failed
                    }
                }
            }
        });

        let outcomes = join_all(tasks).await;

        let mut summary = PipelineSummary {
            files_total: files.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                FileOutcome::Done(chunks) => {
                    summary.files_succeeded += 1;
                    summary.chunks_written += chunks;
                }
                FileOutcome::Failed => summary.files_failed += 1,
                FileOutcome::Skipped => summary.files_skipped += 1,
            }
        }
        // A cancel that arrived after every file already ran had no effect;
        // the job is only "cancelled" if it actually skipped work.
        summary.cancelled = summary.files_skipped > 0;
        Ok(summary)
    }

    /// Enumerate files at the source: a file is itself, a directory is
    /// walked recursively through the include/exclude globs. Sorted for
    /// deterministic processing order.
    fn discover_sources(&self, source: &str) -> Result<Vec<PathBuf>, IngestError> {
        let root = Path::new(source);
        if root.is_file() {
            return Ok(vec![root.to_path_buf()]);
        }
        if !root.is_dir() {
            return Err(IngestError::Parse(format!("source not found: {}", source)));
        }

        let include = build_globset(&self.include_globs)?;
        let exclude = build_globset(&self.exclude_globs)?;

        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(self.follow_symlinks) {
            let entry =
                entry.map_err(|e| IngestError::Parse(format!("walk failed: {}", e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy();
            if exclude.is_match(rel_str.as_ref()) {
                continue;
            }
            if !include.is_match(rel_str.as_ref()) {
                continue;
            }
            files.push(path.to_path_buf());
        }

        files.sort();
        Ok(files)
    }

    /// Drive one file through all four steps. Any error has already been
    /// recorded on the failing step's event by the time it propagates.
    async fn process_file(&self, job: &IngestionJob, path: &Path) -> Result<u64, IngestError> {
        let path_str = path.display().to_string();

        // parse
        let parse_event = self
            .repo
            .ensure_event(&job.id, &path_str, IngestionStep::Parse)
            .await?;
        self.mark_running(&parse_event.id).await?;

        let parsed = match self.parse_file(path).await {
            Ok(parsed) => parsed,
            Err(e) => {
                self.mark_failed(&parse_event.id, &e).await?;
                return Err(e);
            }
        };

        let content_hash = parsed
            .metadata
            .get("content_hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let document = Document {
            id: Uuid::new_v4().to_string(),
            title: parsed.title.clone(),
            source_path: path_str.clone(),
            collection: job.collection.clone(),
            job_id: job.id.clone(),
            content_hash: content_hash.clone(),
            page_count: parsed.pages.len() as i64,
            metadata: serde_json::Value::Object(parsed.metadata.clone()),
            created_at: chrono::Utc::now().timestamp(),
        };

        self.repo
            .update_event_status(
                &parse_event.id,
                EventStatus::Success,
                Some(&serde_json::json!({
                    "pages": parsed.pages.len(),
                    "content_hash": content_hash,
                })),
                Some(&document.id),
                Some(&document.title),
            )
            .await?;

        // chunk
        let chunk_event = self
            .repo
            .ensure_event(&job.id, &path_str, IngestionStep::Chunk)
            .await?;
        self.mark_running(&chunk_event.id).await?;

        let chunk_size = job.chunk_size as usize;
        let chunk_overlap = job.chunk_overlap as usize;
        let mut chunks = match chunker::assemble(&parsed, &document, chunk_size, chunk_overlap) {
            Ok(chunks) => chunks,
            Err(e) => {
                self.mark_failed(&chunk_event.id, &e).await?;
                return Err(e);
            }
        };
        if chunks.is_empty() {
            let e = IngestError::Parse("document contains no chunkable content".to_string());
            self.repo
                .update_event_status(
                    &chunk_event.id,
                    EventStatus::Failed,
                    Some(&serde_json::json!({
                        "chunks": 0,
                        "chunk_size": chunk_size,
                        "chunk_overlap": chunk_overlap,
                        "reason": "no chunkable content",
                    })),
                    None,
                    None,
                )
                .await?;
            return Err(e);
        }

        self.repo
            .update_event_status(
                &chunk_event.id,
                EventStatus::Success,
                Some(&serde_json::json!({
                    "chunks": chunks.len(),
                    "chunk_size": chunk_size,
                    "chunk_overlap": chunk_overlap,
                })),
                None,
                None,
            )
            .await?;

        // embed
        let embed_event = self
            .repo
            .ensure_event(&job.id, &path_str, IngestionStep::Embed)
            .await?;
        self.mark_running(&embed_event.id).await?;

        if let Err(e) = self.embed_chunks(&mut chunks).await {
            self.mark_failed(&embed_event.id, &e).await?;
            return Err(e);
        }

        self.repo
            .update_event_status(
                &embed_event.id,
                EventStatus::Success,
                Some(&serde_json::json!({
                    "embedded_chunks": chunks.len(),
                    "embedding_model": self.embedder.model_name(),
                })),
                None,
                None,
            )
            .await?;

        // cite + commit
        let cite_event = self
            .repo
            .ensure_event(&job.id, &path_str, IngestionStep::Cite)
            .await?;
        self.mark_running(&cite_event.id).await?;

        for chunk in chunks.iter_mut() {
            let cite = citation::enrich(&*chunk, &parsed);
            chunk.citation = Some(cite);
        }

        if let Err(e) = self.repo.commit_document_chunks(&document, &chunks).await {
            self.mark_failed(&cite_event.id, &e).await?;
            return Err(e);
        }

        self.repo
            .update_event_status(
                &cite_event.id,
                EventStatus::Success,
                Some(&serde_json::json!({ "citations": chunks.len() })),
                None,
                None,
            )
            .await?;

        Ok(chunks.len() as u64)
    }

    async fn parse_file(&self, path: &Path) -> Result<ParsedDocument, IngestError> {
        let adapter = ParserAdapter::for_path(path, &self.converter)?;
        self.cache
            .lookup_or_parse(path, &adapter, &self.convert_options, self.parse_timeout)
            .await
    }

    /// Batch chunk texts and attach the returned vectors strictly by
    /// position. A length mismatch from the backend is an error, never a
    /// silent re-pairing.
    async fn embed_chunks(&self, chunks: &mut [Chunk]) -> Result<(), IngestError> {
        let model = self.embedder.model_name().to_string();
        for batch in chunks.chunks_mut(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(IngestError::EmbeddingBackend(format!(
                    "backend returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (chunk, vector) in batch.iter_mut().zip(vectors) {
                chunk.embedding = Some(vector);
                chunk.embedding_model = Some(model.clone());
            }
        }
        Ok(())
    }

    async fn mark_running(&self, event_id: &str) -> Result<(), IngestError> {
        self.repo
            .update_event_status(event_id, EventStatus::Running, None, None, None)
            .await
    }

    async fn mark_failed(&self, event_id: &str, error: &IngestError) -> Result<(), IngestError> {
        self.repo
            .update_event_status(
                event_id,
                EventStatus::Failed,
                Some(&serde_json::json!({ "error": error.to_string() })),
                None,
                None,
            )
            .await
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, IngestError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| IngestError::InvalidConfig(format!("bad glob '{}': {}", pattern, e)))?,
        );
    }
    builder
        .build()
        .map_err(|e| IngestError::InvalidConfig(format!("bad glob set: {}", e)))
}
