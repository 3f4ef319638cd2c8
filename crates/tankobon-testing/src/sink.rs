//! Job sink that records instead of delivering.

use std::collections::HashSet;

use parking_lot::Mutex;
use tankobon_core::{EnqueueError, Job, JobSink, RecipientId};

/// [`JobSink`] that keeps every accepted job in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    jobs: Mutex<Vec<Job>>,
    blocked: Mutex<HashSet<RecipientId>>,
    closed: Mutex<bool>,
}

impl RecordingSink {
    /// Empty sink accepting everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse jobs for `recipient` with `RecipientBlocked`.
    pub fn block(&self, recipient: RecipientId) {
        self.blocked.lock().insert(recipient);
    }

    /// Refuse every job with `Closed`.
    pub fn close(&self) {
        *self.closed.lock() = true;
    }

    /// Accepted jobs in submission order.
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }

    /// Accepted jobs for one recipient, as chapter names.
    pub fn names_for(&self, recipient: RecipientId) -> Vec<String> {
        self.jobs
            .lock()
            .iter()
            .filter(|job| job.recipient == recipient)
            .map(|job| job.item.name.clone())
            .collect()
    }
}

impl JobSink for RecordingSink {
    fn enqueue(&self, job: Job) -> Result<(), EnqueueError> {
        if *self.closed.lock() {
            return Err(EnqueueError::Closed);
        }
        if self.blocked.lock().contains(&job.recipient) {
            return Err(EnqueueError::RecipientBlocked { recipient: job.recipient });
        }
        self.jobs.lock().push(job);
        Ok(())
    }

    fn queue_depth(&self) -> usize {
        self.jobs.lock().len()
    }
}
