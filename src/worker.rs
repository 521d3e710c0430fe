//! The background processor: polling loop, dispatch and retry/backoff.

use crate::cleaner::{MediaCleanup, run_cleanup_trigger};
use crate::errors::StoreError;
use crate::publisher::{PublishReceipt, PublisherRegistry};
use crate::scheduler::saturating_after;
use crate::schema::{Job, JobStatus, PostContent};
use crate::store::{JobStore, JobUpdate};
use anyhow::{Context as _, anyhow};
use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

/// Tuning for the processor loop.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    /// How long the loop sleeps between polling passes.
    pub poll_interval: Duration,
    /// Maximum random addition to each sleep, to de-synchronize from other
    /// periodic work in the host.
    pub jitter: Duration,
    /// Maximum number of due jobs claimed per pass.
    pub batch_limit: i64,
    /// Attempts allowed before a job is finalized as failed.
    pub max_attempts: u32,
    /// Delay added to a failed job's due time before it is retried.
    pub retry_backoff: Duration,
    /// Exit the loop once a pass finds no due jobs, instead of sleeping.
    pub shutdown_when_queue_empty: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            poll_interval: Duration::from_secs(60),
            jitter: Duration::from_millis(100),
            batch_limit: 50,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(10 * 60),
            shutdown_when_queue_empty: false,
        }
    }
}

/// Processes due jobs, one at a time, in due-time order.
///
/// The processor is the sole writer of job status, attempts, due time and
/// error log once a job exists. Dispatch is deliberately not fanned out
/// across a batch: in-order processing is what makes the staggered rollout
/// meaningful, and it keeps any one platform's rate limit honest.
pub struct Processor {
    store: Arc<JobStore>,
    registry: Arc<PublisherRegistry>,
    cleanup: Arc<dyn MediaCleanup>,
    config: ProcessorConfig,
}

impl Processor {
    /// Build a processor over a store, a publisher registry and a cleanup
    /// capability.
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<PublisherRegistry>,
        cleanup: Arc<dyn MediaCleanup>,
        config: ProcessorConfig,
    ) -> Self {
        Processor {
            store,
            registry,
            cleanup,
            config,
        }
    }

    /// Run one polling pass: claim due jobs and process each in order.
    ///
    /// Returns the number of jobs processed. Publish failures are absorbed
    /// into the retry state machine and never surface here; only storage
    /// failures do, and those end the pass.
    pub async fn tick(&self) -> Result<usize, StoreError> {
        let due = self
            .store
            .fetch_due(Utc::now(), self.config.batch_limit)
            .await?;

        if due.is_empty() {
            trace!("No due jobs");
            return Ok(0);
        }

        debug!(count = due.len(), "Found due jobs");
        let count = due.len();
        for job in due {
            self.process_job(job).await?;
        }

        Ok(count)
    }

    /// Run polling passes until shutdown is signalled.
    pub(crate) async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval = ?self.config.poll_interval,
            targets = ?self.registry.targets(),
            "Queue processor started"
        );

        loop {
            match self.tick().await {
                Ok(0) if self.config.shutdown_when_queue_empty => {
                    debug!("No due jobs remaining. Shutting down the processor…");
                    break;
                }
                Ok(_) => {}
                // Storage trouble: loud, but the loop keeps going. A missed
                // status write risks a reprocessed job, not a lost one.
                Err(error) => error!(%error, "Queue pass failed"),
            }

            let sleep_duration = self.sleep_duration_with_jitter();
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Shutdown requested, stopping queue processor…");
                    break;
                }
                () = sleep(sleep_duration) => {}
            }
        }

        info!("Queue processor stopped");
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.config.jitter.is_zero() {
            return self.config.poll_interval;
        }

        let jitter_millis = u64::try_from(self.config.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.config.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Process one job: dispatch, then record the outcome.
    ///
    /// `pending → completed` on success, `pending → pending` with a pushed-out
    /// due time on a retryable failure, `pending → failed` once attempts are
    /// exhausted. The cleanup trigger runs after every terminal transition.
    async fn process_job(&self, job: Job) -> Result<(), StoreError> {
        let span = info_span!("job", job.id = %job.id, job.target = %job.target);
        async {
            let attempts = job.attempts + 1;
            debug!(attempt = attempts, "Dispatching job…");

            match self.dispatch(&job).await {
                Ok(receipt) => {
                    self.store
                        .update(
                            job.id,
                            JobUpdate::default()
                                .status(JobStatus::Completed)
                                .attempts(attempts)
                                .completed_at(Utc::now())
                                .result_reference(receipt.reference),
                        )
                        .await?;
                    info!(attempt = attempts, "Job completed");
                    run_cleanup_trigger(&self.store, &self.cleanup, &job).await;
                }
                Err(publish_error) => {
                    let line = format!(
                        "\n[{}] Attempt {}: {:#}",
                        Utc::now().format("%Y-%m-%d %H:%M:%S"),
                        attempts,
                        publish_error
                    );

                    if attempts < i64::from(self.config.max_attempts) {
                        let due_time = saturating_after(Utc::now(), self.config.retry_backoff);
                        self.store
                            .update(
                                job.id,
                                JobUpdate::default()
                                    .status(JobStatus::Pending)
                                    .attempts(attempts)
                                    .due_time(due_time)
                                    .append_error(line),
                            )
                            .await?;
                        warn!(
                            %publish_error,
                            attempt = attempts,
                            retry_at = %due_time,
                            "Job failed, retry scheduled"
                        );
                    } else {
                        self.store
                            .update(
                                job.id,
                                JobUpdate::default()
                                    .status(JobStatus::Failed)
                                    .attempts(attempts)
                                    .completed_at(Utc::now())
                                    .append_error(line),
                            )
                            .await?;
                        error!(
                            %publish_error,
                            attempts,
                            "Job permanently failed"
                        );
                        run_cleanup_trigger(&self.store, &self.cleanup, &job).await;
                    }
                }
            }

            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Look up the job's publisher and run it, converting panics to errors.
    async fn dispatch(&self, job: &Job) -> anyhow::Result<PublishReceipt> {
        let publisher = self
            .registry
            .get(&job.target)
            .ok_or_else(|| anyhow!("no publisher registered for target '{}'", job.target))?;

        let content: PostContent = serde_json::from_value(job.payload.clone())
            .context("failed to decode job payload")?;

        AssertUnwindSafe(publisher.publish(&content))
            .catch_unwind()
            .await
            .map_err(|panic| panic_to_error(&*panic))
            .and_then(std::convert::identity)
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

fn panic_to_error(panic: &(dyn Any + Send)) -> anyhow::Error {
    if let Some(message) = panic.downcast_ref::<&str>() {
        anyhow!("publisher panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        anyhow!("publisher panicked: {message}")
    } else {
        anyhow!("publisher panicked")
    }
}
