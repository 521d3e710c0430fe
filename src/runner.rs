//! Wiring: builds the processor from its collaborators and runs it.

use crate::cleaner::MediaCleanup;
use crate::publisher::{Publisher, PublisherRegistry};
use crate::store::JobStore;
use crate::worker::{Processor, ProcessorConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

/// Builder for the background queue processor.
///
/// Register one publisher per enabled target, tune the loop, then call
/// [`start`](Runner::start). One runner per store: the design assumes a
/// single processor instance owns all status writes.
pub struct Runner {
    store: Arc<JobStore>,
    registry: PublisherRegistry,
    cleanup: Arc<dyn MediaCleanup>,
    config: ProcessorConfig,
}

impl Runner {
    /// Create a runner over a store and a media-cleanup capability.
    pub fn new(store: Arc<JobStore>, cleanup: Arc<dyn MediaCleanup>) -> Self {
        Runner {
            store,
            registry: PublisherRegistry::new(),
            cleanup,
            config: ProcessorConfig::default(),
        }
    }

    /// Register the publisher for a target platform.
    pub fn register_publisher(
        mut self,
        target: impl Into<String>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        self.registry.register(target, publisher);
        self
    }

    /// Set how often the processor polls for due jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to each poll sleep.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Set the maximum number of due jobs claimed per polling pass.
    pub fn batch_limit(mut self, batch_limit: i64) -> Self {
        self.config.batch_limit = batch_limit;
        self
    }

    /// Set how many attempts a job gets before it is finalized as failed.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    /// Set the delay before a failed job becomes due again.
    pub fn retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.config.retry_backoff = retry_backoff;
        self
    }

    /// Stop the processor once a polling pass finds no due jobs.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.config.shutdown_when_queue_empty = true;
        self
    }

    /// Spawn the processor task.
    pub fn start(self) -> RunHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let processor = Processor::new(
            self.store,
            Arc::new(self.registry),
            self.cleanup,
            self.config,
        );

        info!("Starting queue processor…");
        let span = info_span!("processor");
        let handle = tokio::spawn(async move { processor.run(shutdown_rx).instrument(span).await });

        RunHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

/// Handle to the running processor task.
#[derive(Debug)]
pub struct RunHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RunHandle {
    /// Ask the processor to stop.
    ///
    /// Any pass already in flight finishes its current job first; the loop
    /// exits at the next poll boundary. Status writes are single-row updates
    /// and are never interrupted mid-write.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the processor task to finish.
    pub async fn wait_for_shutdown(self) {
        if let Err(error) = self.handle.await {
            warn!(%error, "Queue processor task panicked");
        }
    }
}
