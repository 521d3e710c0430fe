//! The publishing capability and the typed registry of per-target publishers.

use crate::schema::PostContent;
use std::collections::HashMap;
use std::sync::Arc;

/// What a publisher hands back after a successful post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Identifier or URL of the published post on the remote platform.
    pub reference: String,
}

/// The capability to publish content to one target platform.
///
/// Implementations own their credentials, clients and timeouts; they must
/// return (or fail) rather than hang. Any error, including a panic inside
/// `publish`, is absorbed by the processor's retry machinery — at-least-once
/// delivery, with idempotency left to the platform integration.
pub trait Publisher: Send + Sync {
    /// Perform the post.
    fn publish<'a>(
        &'a self,
        content: &'a PostContent,
    ) -> futures_util::future::BoxFuture<'a, anyhow::Result<PublishReceipt>>;
}

/// Registry mapping target names to their publishers, built once at startup.
///
/// Which targets are enabled is decided here, at construction time; the
/// processor loop never branches on target strings beyond this lookup.
#[derive(Default, Clone)]
pub struct PublisherRegistry {
    publishers: HashMap<String, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the publisher for a target, replacing any previous one.
    pub fn register(&mut self, target: impl Into<String>, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(target.into(), publisher);
    }

    /// Look up the publisher for a target.
    pub fn get(&self, target: &str) -> Option<&Arc<dyn Publisher>> {
        self.publishers.get(target)
    }

    /// Names of all registered targets.
    pub fn targets(&self) -> Vec<&str> {
        self.publishers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for PublisherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherRegistry")
            .field("targets", &self.publishers.keys().collect::<Vec<_>>())
            .finish()
    }
}
