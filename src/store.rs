//! The job store: the only module that touches persisted state.

use crate::errors::StoreError;
use crate::schema::{Job, JobStatus, NewJob, QueueStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const COLUMNS: &str = "id, grouping_key, target, payload, due_time, status, attempts, \
                       error_log, created_at, updated_at, completed_at, result_reference";

/// A partial update applied to exactly one job.
///
/// Only the fields that are set are written; `updated_at` is always touched.
/// The error log can only be appended to, never replaced.
#[derive(Debug, Default, Clone)]
pub struct JobUpdate {
    status: Option<JobStatus>,
    attempts: Option<i64>,
    due_time: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result_reference: Option<String>,
    error_append: Option<String>,
}

impl JobUpdate {
    /// Set the job's status.
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the attempt counter.
    pub fn attempts(mut self, attempts: i64) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Move the due time. The processor only ever moves it forward.
    pub fn due_time(mut self, due_time: DateTime<Utc>) -> Self {
        self.due_time = Some(due_time);
        self
    }

    /// Record the terminal-transition timestamp.
    pub fn completed_at(mut self, completed_at: DateTime<Utc>) -> Self {
        self.completed_at = Some(completed_at);
        self
    }

    /// Record the published-post reference.
    pub fn result_reference(mut self, reference: impl Into<String>) -> Self {
        self.result_reference = Some(reference.into());
        self
    }

    /// Append a line to the job's error log.
    pub fn append_error(mut self, line: impl Into<String>) -> Self {
        self.error_append = Some(line.into());
        self
    }
}

/// Durable, queryable persistence for jobs, backed by SQLite.
///
/// Safe under the crate's concurrency model: one long-lived serialized writer
/// (the processor), occasional short-lived writers (enqueue, cancel, purge)
/// and many concurrent readers. SQLite's own write serialization plus the
/// single-processor scheduling model is the whole locking story.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (creating if necessary) the database at `url` and run migrations.
    ///
    /// In-memory databases get a single-connection pool, since each SQLite
    /// memory connection is its own database.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let memory = url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));
        if !memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(if memory { 1 } else { 5 })
            .connect_with(options)
            .await?;

        let store = JobStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Build a store on top of an existing pool and run migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = JobStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create the jobs table and its indexes. Idempotent.
    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                grouping_key TEXT NOT NULL,
                target TEXT NOT NULL,
                payload TEXT NOT NULL,
                due_time TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                error_log TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT,
                completed_at TEXT,
                result_reference TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        // (status, due_time) keeps fetch_due cheap, grouping_key keeps the
        // cleanup pending-count cheap, created_at supports the purge scan.
        for index in [
            "CREATE INDEX IF NOT EXISTS idx_jobs_status_due ON jobs (status, due_time)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_grouping_key ON jobs (grouping_key)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs (created_at)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        info!("Job store initialized");
        Ok(())
    }

    /// Atomically persist a batch of new jobs, returning their ids in order.
    ///
    /// On error the whole batch is rolled back; no partial batch is ever
    /// visible.
    pub async fn insert_batch(&self, jobs: &[NewJob]) -> Result<Vec<i64>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(jobs.len());

        for job in jobs {
            let id = sqlx::query_scalar::<_, i64>(
                r"
                INSERT INTO jobs (grouping_key, target, payload, due_time, status, attempts, error_log, created_at)
                VALUES (?, ?, ?, ?, 'pending', 0, '', ?)
                RETURNING id
                ",
            )
            .bind(&job.grouping_key)
            .bind(&job.target)
            .bind(&job.payload)
            .bind(job.due_time)
            .bind(job.created_at)
            .fetch_one(&mut *tx)
            .await?;

            ids.push(id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Pending jobs whose due time has passed, oldest-due first (ties broken
    /// by id), capped at `limit`.
    pub async fn fetch_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r"
            SELECT {COLUMNS} FROM jobs
            WHERE status = 'pending' AND due_time <= ?
            ORDER BY due_time ASC, id ASC
            LIMIT ?
            ",
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Apply a partial update to exactly one job.
    pub async fn update(&self, job_id: i64, update: JobUpdate) -> Result<(), StoreError> {
        let mut sets = vec!["updated_at = ?"];
        if update.status.is_some() {
            sets.push("status = ?");
        }
        if update.attempts.is_some() {
            sets.push("attempts = ?");
        }
        if update.due_time.is_some() {
            sets.push("due_time = ?");
        }
        if update.completed_at.is_some() {
            sets.push("completed_at = ?");
        }
        if update.result_reference.is_some() {
            sets.push("result_reference = ?");
        }
        if update.error_append.is_some() {
            sets.push("error_log = error_log || ?");
        }

        let sql = format!("UPDATE jobs SET {} WHERE id = ?", sets.join(", "));

        let mut query = sqlx::query(&sql).bind(Utc::now());
        if let Some(status) = update.status {
            query = query.bind(status);
        }
        if let Some(attempts) = update.attempts {
            query = query.bind(attempts);
        }
        if let Some(due_time) = update.due_time {
            query = query.bind(due_time);
        }
        if let Some(completed_at) = update.completed_at {
            query = query.bind(completed_at);
        }
        if let Some(reference) = update.result_reference {
            query = query.bind(reference);
        }
        if let Some(line) = update.error_append {
            query = query.bind(line);
        }

        let result = query.bind(job_id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job_id));
        }

        Ok(())
    }

    /// Number of jobs sharing `grouping_key` that are still pending.
    pub async fn count_pending_for_key(&self, grouping_key: &str) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs WHERE grouping_key = ? AND status = 'pending'",
        )
        .bind(grouping_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Mark a pending job cancelled.
    ///
    /// Returns `true` if the job was cancelled, `false` if it already reached
    /// a terminal status (a no-op, not an error).
    pub async fn cancel(&self, job_id: i64) -> Result<bool, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r"
            UPDATE jobs SET status = 'cancelled', updated_at = ?, completed_at = ?
            WHERE id = ? AND status = 'pending'
            ",
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!(job.id = job_id, "Job cancelled");
            return Ok(true);
        }

        let status = sqlx::query_scalar::<_, JobStatus>("SELECT status FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        match status {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(job_id)),
        }
    }

    /// Fetch a single job by id.
    pub async fn get(&self, job_id: i64) -> Result<Job, StoreError> {
        sqlx::query_as::<_, Job>(&format!("SELECT {COLUMNS} FROM jobs WHERE id = ?"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(job_id))
    }

    /// Most recently created jobs, newest first, capped at `limit`.
    pub async fn list(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {COLUMNS} FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?",
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Per-status job counts.
    pub async fn status_counts(&self) -> Result<QueueStatus, StoreError> {
        let rows = sqlx::query_as::<_, (JobStatus, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueStatus::default();
        for (status, count) in rows {
            match status {
                JobStatus::Pending => counts.pending = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
                JobStatus::Cancelled => counts.cancelled = count,
            }
            counts.total += count;
        }

        Ok(counts)
    }

    /// Delete terminal jobs whose completion predates `threshold`.
    ///
    /// Pending jobs are never deleted, regardless of age.
    pub async fn delete_terminal_older_than(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND completed_at IS NOT NULL
              AND completed_at < ?
            ",
        )
        .bind(threshold)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
