#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod cleaner;
mod errors;
mod publisher;
mod runner;
mod scheduler;
/// Database schema definitions.
pub mod schema;
mod store;
mod worker;

/// The media-cleanup capability, invoked once per drained job batch.
pub use self::cleaner::{MediaCleanup, NoopCleanup};
/// Error type for store and enqueue operations.
pub use self::errors::StoreError;
/// The publishing capability and its per-target registry.
pub use self::publisher::{PublishReceipt, Publisher, PublisherRegistry};
/// The background task that hosts the processor loop.
pub use self::runner::{RunHandle, Runner};
/// The enqueue path and the administrative façade.
pub use self::scheduler::{EnqueueOptions, Scheduler};
/// The durable job store.
pub use self::store::{JobStore, JobUpdate};
/// The polling processor.
pub use self::worker::{Processor, ProcessorConfig};
