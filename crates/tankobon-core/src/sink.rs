//! Producer-facing entry point into the delivery scheduler.

use crate::{error::EnqueueError, models::Job};

/// Anything that accepts delivery jobs.
///
/// Implemented by the delivery engine and used by the discovery loop and the
/// command surface. `enqueue` never blocks.
pub trait JobSink: Send + Sync {
    /// Submits a job. Jobs for one recipient are processed in submission
    /// order.
    ///
    /// # Errors
    ///
    /// Returns `EnqueueError::RecipientBlocked` when the recipient has
    /// severed the channel, or `EnqueueError::Closed` during shutdown.
    fn enqueue(&self, job: Job) -> Result<(), EnqueueError>;

    /// Total jobs waiting across all recipients.
    fn queue_depth(&self) -> usize;
}
