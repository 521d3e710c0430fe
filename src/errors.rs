use thiserror::Error;

/// Errors surfaced by the [`JobStore`](crate::JobStore) and the enqueue path.
///
/// Publish and cleanup failures never appear here: they are absorbed by the
/// processor's retry machinery and recorded in the job's error log instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced job does not exist.
    #[error("job #{0} not found")]
    NotFound(i64),

    /// The job payload could not be serialized or deserialized.
    #[error("failed to serialize job payload")]
    Serialization(#[from] serde_json::Error),

    /// The underlying database operation failed.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
