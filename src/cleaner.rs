//! Shared-media cleanup: the capability trait and the post-completion trigger.

use crate::schema::{Job, PostContent};
use crate::store::JobStore;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// The capability to release the source media referenced by a job batch.
///
/// Invoked at most once per grouping key, after every job sharing that key
/// has reached a terminal status. Failures are logged and not retried.
pub trait MediaCleanup: Send + Sync {
    /// Release the artifact referenced by `content`.
    fn cleanup<'a>(&'a self, content: &'a PostContent) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// A cleanup that does nothing, for hosts that keep no local media.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCleanup;

impl MediaCleanup for NoopCleanup {
    fn cleanup<'a>(&'a self, _content: &'a PostContent) -> BoxFuture<'a, anyhow::Result<()>> {
        async { Ok(()) }.boxed()
    }
}

/// Run the cleanup trigger for a job that just reached a terminal status.
///
/// Fires the cleanup capability only when no job sharing the grouping key is
/// still pending. Because this runs inline in the single serialized processor
/// immediately after each terminal transition, cleanup cannot fire twice for
/// one key within a process.
pub(crate) async fn run_cleanup_trigger(
    store: &JobStore,
    cleanup: &Arc<dyn MediaCleanup>,
    job: &Job,
) {
    let pending = match store.count_pending_for_key(&job.grouping_key).await {
        Ok(pending) => pending,
        Err(error) => {
            error!(%error, grouping_key = %job.grouping_key, "Failed to check pending siblings for cleanup");
            return;
        }
    };

    if pending > 0 {
        debug!(
            grouping_key = %job.grouping_key,
            pending, "Siblings still pending, skipping cleanup"
        );
        return;
    }

    let content: PostContent = match serde_json::from_value(job.payload.clone()) {
        Ok(content) => content,
        Err(error) => {
            warn!(%error, job.id = job.id, "Could not decode payload for cleanup");
            return;
        }
    };

    match cleanup.cleanup(&content).await {
        Ok(()) => debug!(grouping_key = %job.grouping_key, "Cleaned up source media"),
        // Non-fatal: the job itself is already finalized.
        Err(error) => warn!(%error, grouping_key = %job.grouping_key, "Media cleanup failed"),
    }
}
