//! Database row types and the content payload carried by every job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Processing state of a job.
///
/// `Completed`, `Failed` and `Cancelled` are terminal: no further transition
/// is legal once a job reaches one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for its due time, or re-armed for a retry.
    Pending,
    /// Published successfully.
    Completed,
    /// Exhausted its retry budget.
    Failed,
    /// Cancelled externally before it was dispatched.
    Cancelled,
}

impl JobStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One scheduled unit of work: a single post to a single target platform.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier, assigned on insert.
    pub id: i64,
    /// Shared by all jobs created from the same trigger; gates media cleanup.
    pub grouping_key: String,
    /// The platform this job posts to.
    pub target: String,
    /// Opaque JSON snapshot of the content to post. Never mutated.
    pub payload: Value,
    /// Earliest time the job becomes eligible for processing.
    pub due_time: DateTime<Utc>,
    /// Current processing state.
    pub status: JobStatus,
    /// Number of processing attempts made so far.
    pub attempts: i64,
    /// Accumulated record of failures across attempts. Append-only.
    pub error_log: String,
    /// When the job was inserted.
    pub created_at: DateTime<Utc>,
    /// When the job was last modified.
    pub updated_at: Option<DateTime<Utc>>,
    /// Set once, on the transition into a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Identifier or URL of the published post. Set only on success.
    pub result_reference: Option<String>,
}

/// A job that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Shared grouping key for the batch this job belongs to.
    pub grouping_key: String,
    /// The platform this job posts to.
    pub target: String,
    /// Serialized [`PostContent`].
    pub payload: Value,
    /// When the job first becomes eligible.
    pub due_time: DateTime<Utc>,
    /// Insertion timestamp.
    pub created_at: DateTime<Utc>,
}

/// Per-status job counts, for monitoring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Jobs still waiting to be processed.
    pub pending: i64,
    /// Jobs that published successfully.
    pub completed: i64,
    /// Jobs that exhausted their retries.
    pub failed: i64,
    /// Jobs cancelled before dispatch.
    pub cancelled: i64,
    /// All jobs currently in the table.
    pub total: i64,
}

/// Kind of content being posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// A single image.
    Photo,
    /// A video clip.
    Video,
    /// An arbitrary file attachment.
    Document,
    /// Text only, no media.
    Text,
}

/// The content descriptor snapshotted into a job's payload at enqueue time.
///
/// Everything a publisher needs to perform the post. The processor only ever
/// reads this; it is immutable once the job exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostContent {
    /// What kind of media this is.
    pub kind: ContentKind,
    /// Caption or body text to post alongside the media.
    pub caption: Option<String>,
    /// Identifier of the source artifact, as issued by the inbound side.
    pub artifact: Option<String>,
    /// Path of the downloaded media file on local disk, if any.
    pub local_path: Option<String>,
    /// MIME type of the media file.
    pub mime_type: Option<String>,
    /// Video duration in seconds.
    pub duration: Option<u32>,
    /// Media width in pixels.
    pub width: Option<u32>,
    /// Media height in pixels.
    pub height: Option<u32>,
    /// Media file size in bytes.
    pub file_size: Option<u64>,
}

impl PostContent {
    /// A text-only content descriptor with the given caption.
    pub fn text(caption: impl Into<String>) -> Self {
        PostContent {
            kind: ContentKind::Text,
            caption: Some(caption.into()),
            artifact: None,
            local_path: None,
            mime_type: None,
            duration: None,
            width: None,
            height: None,
            file_size: None,
        }
    }
}
