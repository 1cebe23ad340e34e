//! Asynchronous ingestion queue.
//!
//! Jobs are persisted in the `jobs` table and executed by a fixed-size pool
//! of workers. Lifecycle per job:
//!
//! ```text
//! queued → active → completed
//! queued → active → queued     (transient failure, attempt+1, backoff)
//!          active → failed     (fatal failure, or attempts exhausted)
//! ```
//!
//! Claiming is a single `UPDATE … RETURNING` statement, so no two workers
//! can hold the same job active at once. When the durable backend is
//! unreachable at enqueue time the job runs synchronously in-process
//! instead — an explicit, observable fallback ([`EnqueueOutcome::Inline`],
//! logged at WARN) that trades durability for availability on a single
//! node: a crash during inline execution loses the job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::PipelineError;
use crate::models::{Job, JobKind, JobState};

/// Executes the work a claimed job describes.
///
/// Implemented by the ingestion pipeline; the queue stays agnostic of what
/// jobs actually do.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<(), PipelineError>;
}

/// What happened when a job was submitted.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// The job was persisted and will be picked up by a worker.
    Queued { job_id: String },
    /// The durable backend was unreachable; the job ran synchronously
    /// in-process and this is its terminal result.
    Inline { result: Result<(), PipelineError> },
}

pub struct IngestQueue {
    pool: SqlitePool,
    config: QueueConfig,
    executor: Arc<dyn JobExecutor>,
}

impl IngestQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig, executor: Arc<dyn JobExecutor>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            executor,
        })
    }

    /// Submit a job. Falls back to synchronous in-process execution when the
    /// jobs table cannot be written.
    pub async fn enqueue(
        &self,
        document_id: &str,
        kind: JobKind,
        payload: serde_json::Value,
    ) -> EnqueueOutcome {
        let now = Utc::now().timestamp();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            kind,
            payload: payload.to_string(),
            state: JobState::Queued,
            attempts: 0,
            last_error: None,
            run_at: now,
            created_at: now,
            updated_at: now,
        };

        let inserted = sqlx::query(
            "INSERT INTO jobs (id, document_id, kind, payload, state, attempts, run_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.document_id)
        .bind(job.kind.as_str())
        .bind(&job.payload)
        .bind(JobState::Queued.as_str())
        .bind(job.run_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                debug!(job_id = %job.id, kind = job.kind.as_str(), "job enqueued");
                EnqueueOutcome::Queued { job_id: job.id }
            }
            Err(e) => {
                warn!(
                    document_id,
                    kind = kind.as_str(),
                    error = %e,
                    "queue backend unreachable, running job inline (not durable)"
                );
                let result = self.executor.execute(&job).await;
                if let Err(ref err) = result {
                    error!(document_id, error = %err, "inline job execution failed");
                }
                EnqueueOutcome::Inline { result }
            }
        }
    }

    /// Spawn the fixed-size worker pool. Workers run until `shutdown`
    /// flips to `true`; a claimed job always reaches a terminal state or a
    /// requeue before its worker checks for shutdown again.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker_id| {
                let queue = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    queue.worker_loop(worker_id, shutdown).await;
                })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        debug!(worker_id, "ingestion worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.claim_next().await {
                Ok(Some(job)) => {
                    self.run_job(job).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "failed to poll job queue");
                    tokio::time::sleep(poll).await;
                }
            }
        }

        debug!(worker_id, "ingestion worker stopped");
    }

    /// Atomically claim the next due job: `queued → active`.
    async fn claim_next(&self) -> Result<Option<Job>, sqlx::Error> {
        let now = Utc::now().timestamp();
        let row = sqlx::query(
            r#"
            UPDATE jobs SET state = 'active', updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'queued' AND run_at <= ?
                ORDER BY run_at, created_at
                LIMIT 1
            )
            RETURNING id, document_id, kind, payload, state, attempts,
                      last_error, run_at, created_at, updated_at
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| job_from_row(&row)))
    }

    /// Execute a claimed job and drive it to its next state.
    async fn run_job(&self, job: Job) {
        let result = self.executor.execute(&job).await;
        let attempts = job.attempts + 1;

        match result {
            Ok(()) => {
                debug!(job_id = %job.id, attempts, "job completed");
                if let Err(e) = self.mark_terminal(&job.id, JobState::Completed, None).await {
                    error!(job_id = %job.id, error = %e, "failed to record job completion");
                }
            }
            Err(err) => {
                if should_retry(&err, attempts, self.config.max_attempts) {
                    let delay = backoff_delay(attempts);
                    warn!(
                        job_id = %job.id,
                        attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %err,
                        "job failed transiently, requeueing"
                    );
                    if let Err(e) = self.requeue(&job.id, attempts, &err, delay).await {
                        error!(job_id = %job.id, error = %e, "failed to requeue job");
                    }
                } else {
                    warn!(job_id = %job.id, attempts, error = %err, "job failed permanently");
                    if let Err(e) = self
                        .mark_terminal(&job.id, JobState::Failed, Some(&err.to_string()))
                        .await
                    {
                        error!(job_id = %job.id, error = %e, "failed to record job failure");
                    }
                    if let Err(e) = self.prune_terminal().await {
                        debug!(error = %e, "failed to prune terminal jobs");
                    }
                }
            }
        }
    }

    async fn mark_terminal(
        &self,
        job_id: &str,
        state: JobState,
        last_error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE jobs SET state = ?, attempts = attempts + 1, last_error = ?, updated_at = ? \
             WHERE id = ? AND state = 'active'",
        )
        .bind(state.as_str())
        .bind(last_error)
        .bind(Utc::now().timestamp())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue(
        &self,
        job_id: &str,
        attempts: i64,
        err: &PipelineError,
        delay: Duration,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "UPDATE jobs SET state = 'queued', attempts = ?, last_error = ?, run_at = ?, updated_at = ? \
             WHERE id = ? AND state = 'active'",
        )
        .bind(attempts)
        .bind(err.to_string())
        .bind(now + delay.as_secs() as i64)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Discard completed jobs and keep only the most recent failed jobs.
    async fn prune_terminal(&self) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM jobs WHERE state = 'completed'")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "DELETE FROM jobs WHERE state = 'failed' AND id NOT IN ( \
                 SELECT id FROM jobs WHERE state = 'failed' \
                 ORDER BY updated_at DESC LIMIT ? \
             )",
        )
        .bind(self.config.keep_failed_jobs as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Whether a failed execution should go back to `queued`.
fn should_retry(err: &PipelineError, attempts: i64, max_attempts: u32) -> bool {
    err.is_transient() && attempts < max_attempts as i64
}

/// Exponential backoff: 2s, 4s, 8s, ... capped at 64s.
fn backoff_delay(attempts: i64) -> Duration {
    let exp = attempts.clamp(1, 6) as u32;
    Duration::from_secs(1 << exp)
}

/// Fetch a job by id.
pub async fn fetch_job(pool: &SqlitePool, job_id: &str) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, document_id, kind, payload, state, attempts, last_error, run_at, created_at, updated_at \
         FROM jobs WHERE id = ?",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| job_from_row(&row)))
}

/// List jobs, optionally filtered by state, newest first.
pub async fn list_jobs(
    pool: &SqlitePool,
    state: Option<JobState>,
    limit: i64,
) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, document_id, kind, payload, state, attempts, last_error, run_at, created_at, updated_at \
         FROM jobs WHERE (? IS NULL OR state = ?) ORDER BY created_at DESC LIMIT ?",
    )
    .bind(state.map(|s| s.as_str()))
    .bind(state.map(|s| s.as_str()))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(job_from_row).collect())
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Job {
    let kind_str: String = row.get("kind");
    let state_str: String = row.get("state");
    Job {
        id: row.get("id"),
        document_id: row.get("document_id"),
        kind: JobKind::parse(&kind_str).unwrap_or(JobKind::Ingest),
        payload: row.get("payload"),
        state: JobState::parse(&state_str).unwrap_or(JobState::Failed),
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        run_at: row.get("run_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
