//! Background worker for ingestion jobs.
//!
//! Claims pending jobs from the repository one at a time, runs the pipeline,
//! and finalizes the job status: `success` only when every file succeeded,
//! `failed` as soon as any file failed or the job was cancelled. Files that
//! succeeded under a failed job keep their persisted chunks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use crate::cache::ContentCache;
use crate::config::Config;
use crate::db;
use crate::models::{IngestionJob, JobStatus};
use crate::pipeline::IngestionPipeline;
use crate::repo::DocumentRepository;

/// Run one claimed job to completion and persist its final status.
pub async fn process_job(
    pipeline: &IngestionPipeline,
    repo: &DocumentRepository,
    job: &IngestionJob,
) -> Result<()> {
    info!(job_id = %job.id, source = %job.source, "processing ingestion job");

    match pipeline.run(job).await {
        Ok(summary) => {
            if summary.cancelled {
                let message = format!(
                    "cancelled after {} of {} files",
                    summary.files_succeeded + summary.files_failed,
                    summary.files_total
                );
                repo.update_job_status(&job.id, JobStatus::Failed, Some(&message))
                    .await?;
            } else if summary.files_failed > 0 {
                let message = format!(
                    "{} of {} files failed",
                    summary.files_failed, summary.files_total
                );
                repo.update_job_status(&job.id, JobStatus::Failed, Some(&message))
                    .await?;
            } else {
                repo.update_job_status(&job.id, JobStatus::Success, None)
                    .await?;
            }
            info!(
                job_id = %job.id,
                succeeded = summary.files_succeeded,
                failed = summary.files_failed,
                chunks = summary.chunks_written,
                "job finished"
            );
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "ingestion job failed");
            repo.update_job_status(&job.id, JobStatus::Failed, Some(&e.to_string()))
                .await?;
        }
    }
    Ok(())
}

/// Entry point for `docpipe worker`.
pub async fn run_worker(config: &Config, once: bool) -> Result<()> {
    let pool = db::connect(&config.db.path).await?;
    let repo = DocumentRepository::new(pool);
    let cache = Arc::new(ContentCache::new(config.storage.cache_dir.clone()));
    let pipeline = IngestionPipeline::from_config(config, repo.clone(), cache)?;
    let poll = Duration::from_secs(config.pipeline.poll_secs);
    run_worker_loop(&pipeline, &repo, poll, once).await
}

/// Poll for pending jobs and process them. With `once`, drains the queue and
/// returns instead of sleeping.
pub async fn run_worker_loop(
    pipeline: &IngestionPipeline,
    repo: &DocumentRepository,
    poll_interval: Duration,
    once: bool,
) -> Result<()> {
    loop {
        match repo.claim_pending_job().await? {
            Some(job) => {
                process_job(pipeline, repo, &job).await?;
            }
            None => {
                if once {
                    return Ok(());
                }
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}
