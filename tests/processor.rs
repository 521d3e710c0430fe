#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use claims::{assert_none, assert_some};
use fanout::schema::{ContentKind, JobStatus, PostContent};
use fanout::{
    EnqueueOptions, JobStore, MediaCleanup, Processor, ProcessorConfig, PublishReceipt, Publisher,
    PublisherRegistry, Runner, Scheduler,
};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::timeout;

/// Fails its first `fail_first` calls, then succeeds.
#[derive(Default)]
struct FlakyPublisher {
    fail_first: u32,
    calls: AtomicU32,
}

impl FlakyPublisher {
    fn failing(fail_first: u32) -> Arc<Self> {
        Arc::new(FlakyPublisher {
            fail_first,
            calls: AtomicU32::new(0),
        })
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Publisher for FlakyPublisher {
    fn publish<'a>(
        &'a self,
        _content: &'a PostContent,
    ) -> BoxFuture<'a, anyhow::Result<PublishReceipt>> {
        async move {
            let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_first {
                anyhow::bail!("remote rejected the post (attempt {attempt})");
            }
            Ok(PublishReceipt {
                reference: format!("https://posts.example/{attempt}"),
            })
        }
        .boxed()
    }
}

struct PanickingPublisher;

impl Publisher for PanickingPublisher {
    fn publish<'a>(
        &'a self,
        _content: &'a PostContent,
    ) -> BoxFuture<'a, anyhow::Result<PublishReceipt>> {
        async { panic!("connection pool poisoned") }.boxed()
    }
}

/// Records every cleanup invocation and the artifact it was handed.
#[derive(Default)]
struct CountingCleanup {
    calls: AtomicU32,
    artifacts: Mutex<Vec<String>>,
}

impl CountingCleanup {
    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MediaCleanup for CountingCleanup {
    fn cleanup<'a>(&'a self, content: &'a PostContent) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(artifact) = &content.artifact {
                self.artifacts.lock().unwrap().push(artifact.clone());
            }
            Ok(())
        }
        .boxed()
    }
}

async fn memory_store() -> Arc<JobStore> {
    Arc::new(
        JobStore::connect("sqlite::memory:")
            .await
            .expect("in-memory store"),
    )
}

fn content(artifact: &str) -> PostContent {
    PostContent {
        kind: ContentKind::Photo,
        caption: Some("caption".into()),
        artifact: Some(artifact.into()),
        local_path: Some(format!("./media/{artifact}.jpg")),
        mime_type: Some("image/jpeg".into()),
        duration: None,
        width: None,
        height: None,
        file_size: None,
    }
}

/// All targets due immediately, no backoff, so every `tick` is one full pass.
fn immediate() -> EnqueueOptions {
    EnqueueOptions {
        start_delay: Duration::ZERO,
        interval: Duration::ZERO,
    }
}

fn processor(
    store: Arc<JobStore>,
    registry: PublisherRegistry,
    cleanup: Arc<CountingCleanup>,
    max_attempts: u32,
) -> Processor {
    Processor::new(
        store,
        Arc::new(registry),
        cleanup,
        ProcessorConfig {
            jitter: Duration::ZERO,
            retry_backoff: Duration::ZERO,
            max_attempts,
            ..ProcessorConfig::default()
        },
    )
}

#[tokio::test]
async fn flaky_target_retries_while_siblings_complete() -> anyhow::Result<()> {
    let store = memory_store().await;
    let scheduler = Scheduler::new(store.clone());
    let cleanup = Arc::new(CountingCleanup::default());

    let flaky = FlakyPublisher::failing(2);
    let mut registry = PublisherRegistry::new();
    registry.register("mastodon", flaky.clone());
    registry.register("bluesky", FlakyPublisher::failing(0));
    registry.register("reddit", FlakyPublisher::failing(0));

    let ids = scheduler
        .enqueue(
            &content("file-1"),
            &["mastodon".into(), "bluesky".into(), "reddit".into()],
            immediate(),
        )
        .await?;
    let processor = processor(store, registry, cleanup.clone(), 3);

    // First pass: mastodon fails and is re-armed, the other two complete.
    assert_eq!(processor.tick().await?, 3);
    let mastodon = scheduler.get(ids[0]).await?;
    assert_eq!(mastodon.status, JobStatus::Pending);
    assert_eq!(mastodon.attempts, 1);
    assert!(mastodon.error_log.contains("remote rejected"));
    assert_none!(mastodon.completed_at);
    for id in &ids[1..] {
        let job = scheduler.get(*id).await?;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
        assert_some!(job.result_reference);
    }
    // A sibling is still pending, so the media must not be cleaned up yet.
    assert_eq!(cleanup.call_count(), 0);

    // Second pass: mastodon fails again.
    assert_eq!(processor.tick().await?, 1);
    assert_eq!(scheduler.get(ids[0]).await?.attempts, 2);
    assert_eq!(cleanup.call_count(), 0);

    // Third pass: mastodon succeeds on its final allowed attempt, and with
    // the whole batch terminal the cleanup fires exactly once.
    assert_eq!(processor.tick().await?, 1);
    let mastodon = scheduler.get(ids[0]).await?;
    assert_eq!(mastodon.status, JobStatus::Completed);
    assert_eq!(mastodon.attempts, 3);
    assert_some!(mastodon.result_reference);
    assert_eq!(cleanup.call_count(), 1);
    assert_eq!(*cleanup.artifacts.lock().unwrap(), vec!["file-1".to_string()]);

    // Nothing left to do.
    assert_eq!(processor.tick().await?, 0);
    assert_eq!(cleanup.call_count(), 1);
    assert_eq!(flaky.call_count(), 3);

    Ok(())
}

#[tokio::test]
async fn single_attempt_budget_fails_the_job_immediately() -> anyhow::Result<()> {
    let store = memory_store().await;
    let scheduler = Scheduler::new(store.clone());
    let cleanup = Arc::new(CountingCleanup::default());

    let flaky = FlakyPublisher::failing(u32::MAX);
    let mut registry = PublisherRegistry::new();
    registry.register("mastodon", flaky.clone());

    let ids = scheduler
        .enqueue(&content("file-1"), &["mastodon".into()], immediate())
        .await?;
    let processor = processor(store, registry, cleanup.clone(), 1);

    assert_eq!(processor.tick().await?, 1);
    let job = scheduler.get(ids[0]).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_some!(job.completed_at);
    assert!(job.error_log.contains("Attempt 1"));
    // The failed job was the only one for its key, so cleanup fires.
    assert_eq!(cleanup.call_count(), 1);

    // A failed job stays failed; no further attempts are made.
    assert_eq!(processor.tick().await?, 0);
    assert_eq!(scheduler.get(ids[0]).await?.attempts, 1);
    assert_eq!(flaky.call_count(), 1);
    assert_eq!(cleanup.call_count(), 1);

    Ok(())
}

#[tokio::test]
async fn unregistered_target_counts_as_a_publish_failure() -> anyhow::Result<()> {
    let store = memory_store().await;
    let scheduler = Scheduler::new(store.clone());
    let cleanup = Arc::new(CountingCleanup::default());

    let ids = scheduler
        .enqueue(&content("file-1"), &["myspace".into()], immediate())
        .await?;
    let processor = processor(store, PublisherRegistry::new(), cleanup.clone(), 1);

    assert_eq!(processor.tick().await?, 1);
    let job = scheduler.get(ids[0]).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_log.contains("no publisher registered"));

    Ok(())
}

#[tokio::test]
async fn publisher_panic_is_treated_as_a_failure() -> anyhow::Result<()> {
    let store = memory_store().await;
    let scheduler = Scheduler::new(store.clone());
    let cleanup = Arc::new(CountingCleanup::default());

    let mut registry = PublisherRegistry::new();
    registry.register("mastodon", Arc::new(PanickingPublisher));

    let ids = scheduler
        .enqueue(&content("file-1"), &["mastodon".into()], immediate())
        .await?;
    let processor = processor(store, registry, cleanup.clone(), 2);

    // The panic is caught, logged into the error log, and retried.
    assert_eq!(processor.tick().await?, 1);
    let job = scheduler.get(ids[0]).await?;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.error_log.contains("panicked"));
    assert!(job.error_log.contains("connection pool poisoned"));

    // Second panic exhausts the budget.
    assert_eq!(processor.tick().await?, 1);
    assert_eq!(scheduler.get(ids[0]).await?.status, JobStatus::Failed);
    assert_eq!(cleanup.call_count(), 1);

    Ok(())
}

#[tokio::test]
async fn cancelled_jobs_are_never_dispatched() -> anyhow::Result<()> {
    let store = memory_store().await;
    let scheduler = Scheduler::new(store.clone());
    let cleanup = Arc::new(CountingCleanup::default());

    let flaky = FlakyPublisher::failing(0);
    let mut registry = PublisherRegistry::new();
    registry.register("mastodon", flaky.clone());

    let ids = scheduler
        .enqueue(&content("file-1"), &["mastodon".into()], immediate())
        .await?;
    assert!(scheduler.cancel(ids[0]).await?);

    let processor = processor(store, registry, cleanup.clone(), 3);
    assert_eq!(processor.tick().await?, 0);

    assert_eq!(scheduler.get(ids[0]).await?.status, JobStatus::Cancelled);
    assert_eq!(flaky.call_count(), 0);

    Ok(())
}

#[tokio::test]
async fn retry_moves_the_due_time_forward() -> anyhow::Result<()> {
    let store = memory_store().await;
    let scheduler = Scheduler::new(store.clone());
    let cleanup = Arc::new(CountingCleanup::default());

    let mut registry = PublisherRegistry::new();
    registry.register("mastodon", FlakyPublisher::failing(u32::MAX));

    let ids = scheduler
        .enqueue(&content("file-1"), &["mastodon".into()], immediate())
        .await?;
    let original_due = scheduler.get(ids[0]).await?.due_time;

    let processor = Processor::new(
        store,
        Arc::new(registry),
        cleanup,
        ProcessorConfig {
            jitter: Duration::ZERO,
            retry_backoff: Duration::from_secs(10 * 60),
            ..ProcessorConfig::default()
        },
    );

    assert_eq!(processor.tick().await?, 1);
    let job = scheduler.get(ids[0]).await?;
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.due_time > original_due);

    // Not due again until the backoff elapses.
    assert_eq!(processor.tick().await?, 0);
    assert_eq!(scheduler.get(ids[0]).await?.attempts, 1);

    Ok(())
}

#[tokio::test]
async fn cleanup_fires_once_per_grouping_key() -> anyhow::Result<()> {
    let store = memory_store().await;
    let scheduler = Scheduler::new(store.clone());
    let cleanup = Arc::new(CountingCleanup::default());

    let mut registry = PublisherRegistry::new();
    registry.register("mastodon", FlakyPublisher::failing(0));

    scheduler
        .enqueue(&content("file-1"), &["mastodon".into()], immediate())
        .await?;
    scheduler
        .enqueue(&content("file-2"), &["mastodon".into()], immediate())
        .await?;

    let processor = processor(store, registry, cleanup.clone(), 3);
    assert_eq!(processor.tick().await?, 2);

    // One cleanup per batch, each handed its own artifact.
    assert_eq!(cleanup.call_count(), 2);
    let mut artifacts = cleanup.artifacts.lock().unwrap().clone();
    artifacts.sort();
    assert_eq!(artifacts, vec!["file-1".to_string(), "file-2".to_string()]);

    Ok(())
}

#[tokio::test]
async fn runner_drains_the_queue_and_shuts_down() -> anyhow::Result<()> {
    let store = memory_store().await;
    let scheduler = Scheduler::new(store.clone());

    let flaky = FlakyPublisher::failing(1);
    let steady = FlakyPublisher::failing(0);

    let ids = scheduler
        .enqueue(
            &content("file-1"),
            &["mastodon".into(), "bluesky".into()],
            immediate(),
        )
        .await?;

    let handle = Runner::new(store, Arc::new(CountingCleanup::default()))
        .register_publisher("mastodon", flaky.clone())
        .register_publisher("bluesky", steady.clone())
        .poll_interval(Duration::from_millis(10))
        .jitter(Duration::ZERO)
        .retry_backoff(Duration::ZERO)
        .shutdown_when_queue_empty()
        .start();

    timeout(Duration::from_secs(10), handle.wait_for_shutdown())
        .await
        .expect("runner should drain the queue and stop");

    let mastodon = scheduler.get(ids[0]).await?;
    assert_eq!(mastodon.status, JobStatus::Completed);
    assert_eq!(mastodon.attempts, 2);
    assert_eq!(scheduler.get(ids[1]).await?.status, JobStatus::Completed);
    assert_eq!(flaky.call_count(), 2);
    assert_eq!(steady.call_count(), 1);

    Ok(())
}

#[tokio::test]
async fn shutdown_signal_stops_an_idle_runner() {
    let store = memory_store().await;

    let handle = Runner::new(store, Arc::new(CountingCleanup::default()))
        .register_publisher("mastodon", FlakyPublisher::failing(0))
        .poll_interval(Duration::from_millis(10))
        .jitter(Duration::ZERO)
        .start();

    handle.shutdown();
    timeout(Duration::from_secs(10), handle.wait_for_shutdown())
        .await
        .expect("runner should stop on shutdown");
}
