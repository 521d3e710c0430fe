//! The enqueue path and the administrative/monitoring façade.

use crate::errors::StoreError;
use crate::schema::{Job, NewJob, PostContent, QueueStatus};
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Scheduling knobs for one enqueue call.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueOptions {
    /// Delay before the first job becomes due.
    pub start_delay: Duration,
    /// Gap between consecutive targets' due times.
    pub interval: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        EnqueueOptions {
            start_delay: Duration::ZERO,
            interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Creates job batches and answers monitoring/maintenance queries.
///
/// An explicitly constructed instance owning its store handle; hosts that
/// want single-instance-per-process semantics simply construct one and share
/// it.
#[derive(Debug, Clone)]
pub struct Scheduler {
    store: Arc<JobStore>,
}

impl Scheduler {
    /// Build a scheduler on top of a job store.
    pub fn new(store: Arc<JobStore>) -> Self {
        Scheduler { store }
    }

    /// Queue one job per target, staggered by `opts.interval`.
    ///
    /// Job `i` becomes due at `now + start_delay + i * interval`, so the post
    /// rolls out across platforms over time instead of all at once. All jobs
    /// in the batch share a freshly generated grouping key. The batch is
    /// inserted atomically; on error no job is created.
    #[instrument(name = "queue.enqueue", skip(self, content, targets), fields(targets = targets.len()))]
    pub async fn enqueue(
        &self,
        content: &PostContent,
        targets: &[String],
        opts: EnqueueOptions,
    ) -> Result<Vec<i64>, StoreError> {
        let now = Utc::now();
        let grouping_key = Uuid::new_v4().to_string();
        let payload = serde_json::to_value(content)?;

        let jobs: Vec<NewJob> = targets
            .iter()
            .enumerate()
            .map(|(i, target)| {
                let delay = opts
                    .start_delay
                    .saturating_add(opts.interval.saturating_mul(i as u32));
                NewJob {
                    grouping_key: grouping_key.clone(),
                    target: target.clone(),
                    payload: payload.clone(),
                    due_time: saturating_after(now, delay),
                    created_at: now,
                }
            })
            .collect();

        let ids = self.store.insert_batch(&jobs).await?;
        info!(
            grouping_key = %grouping_key,
            jobs = ids.len(),
            "Queued post batch"
        );

        Ok(ids)
    }

    /// Cancel a pending job so it is never dispatched.
    ///
    /// Returns `true` if the job was cancelled, `false` if it had already
    /// reached a terminal status. Fails with [`StoreError::NotFound`] for an
    /// unknown id.
    pub async fn cancel(&self, job_id: i64) -> Result<bool, StoreError> {
        self.store.cancel(job_id).await
    }

    /// Fetch a single job.
    pub async fn get(&self, job_id: i64) -> Result<Job, StoreError> {
        self.store.get(job_id).await
    }

    /// Most recently created jobs, newest first.
    pub async fn list(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        self.store.list(limit).await
    }

    /// Per-status job counts.
    pub async fn status_counts(&self) -> Result<QueueStatus, StoreError> {
        self.store.status_counts().await
    }

    /// Delete terminal jobs completed more than `retention` ago.
    ///
    /// Returns the number deleted. Intended to run on an external periodic
    /// trigger; it never touches pending jobs.
    pub async fn purge(&self, retention: Duration) -> Result<u64, StoreError> {
        let threshold = saturating_before(Utc::now(), retention);
        let deleted = self.store.delete_terminal_older_than(threshold).await?;
        if deleted > 0 {
            info!(deleted, "Purged old terminal jobs");
        }
        Ok(deleted)
    }
}

/// `now + delay`, clamped instead of panicking on absurd inputs.
pub(crate) fn saturating_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn saturating_before(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
