//! Delivery workers.
//!
//! Each worker loops dequeue → pipeline → release until the queue closes or
//! cancellation is requested. The pipeline runs behind `catch_unwind` and an
//! optional timeout so that `release` happens exactly once per claim no
//! matter how processing ended.

use std::{collections::HashSet, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tankobon_core::RecipientId;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, ErrorCategory, Result},
    pipeline::{DeliveryOutcome, DeliveryPipeline},
    queue::{Claim, RecipientQueue},
    retry::RetryPolicy,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Retry policy for outbound channel calls.
    pub retry_policy: RetryPolicy,

    /// Upper bound on one job. `None` lets a job run as long as it needs.
    pub job_timeout: Option<Duration>,

    /// Maximum time to wait for workers to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            retry_policy: RetryPolicy::default(),
            job_timeout: None,
            shutdown_timeout: Duration::from_secs(crate::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
        }
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Number of running delivery workers.
    pub active_workers: usize,
    /// Jobs taken off the queue since startup.
    pub jobs_processed: u64,
    /// Jobs that reached the recipient.
    pub delivered: u64,
    /// Jobs that ended in a terminal error.
    pub failed: u64,
    /// Jobs whose source yielded nothing.
    pub content_unavailable: u64,
    /// Individual formats that failed to convert.
    pub conversion_failures: u64,
    /// Jobs dropped because the recipient blocked the channel.
    pub blocked_recipients: u64,
    /// Jobs being processed right now.
    pub in_flight: u64,
}

/// Recipients that severed the channel. Enqueues for them are refused until
/// they interact again.
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    inner: Arc<parking_lot::RwLock<HashSet<RecipientId>>>,
}

impl BlockList {
    /// Empty block list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `recipient` as blocked. Returns `true` if it was not already.
    pub fn block(&self, recipient: RecipientId) -> bool {
        self.inner.write().insert(recipient)
    }

    /// Clears the mark. Returns whether one was present.
    pub fn unblock(&self, recipient: RecipientId) -> bool {
        self.inner.write().remove(&recipient)
    }

    /// Whether `recipient` is blocked.
    pub fn contains(&self, recipient: RecipientId) -> bool {
        self.inner.read().contains(&recipient)
    }

    /// Number of blocked recipients.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True when nobody is blocked.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// A single worker pulling jobs from the shared queue.
pub struct DeliveryWorker {
    id: usize,
    queue: Arc<RecipientQueue>,
    pipeline: Arc<DeliveryPipeline>,
    job_timeout: Option<Duration>,
    blocked: BlockList,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    /// Creates a worker.
    pub fn new(
        id: usize,
        queue: Arc<RecipientQueue>,
        pipeline: Arc<DeliveryPipeline>,
        job_timeout: Option<Duration>,
        blocked: BlockList,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, queue, pipeline, job_timeout, blocked, stats, cancellation_token }
    }

    /// Main worker loop. Processes jobs until the queue closes or the token
    /// is cancelled. A job in progress is finished before exiting.
    ///
    /// # Errors
    ///
    /// Never fails today; job errors are handled per job.
    pub async fn run(&self) -> Result<()> {
        loop {
            let claim = tokio::select! {
                () = self.cancellation_token.cancelled() => {
                    info!(worker_id = self.id, "delivery worker received shutdown signal");
                    break;
                }
                claim = self.queue.dequeue(self.id) => claim,
            };

            let Some(claim) = claim else {
                debug!(worker_id = self.id, "queue closed, worker exiting");
                break;
            };

            self.process(claim).await;
        }

        Ok(())
    }

    /// Runs one claim to completion and releases its recipient.
    pub async fn process(&self, claim: Claim) {
        let Claim { job, recipient, .. } = claim;
        let span = info_span!(
            "delivery_job",
            worker_id = self.id,
            %recipient,
            job_id = %job.id,
            content_ref = %job.content_ref()
        );

        async {
            {
                let mut stats = self.stats.write().await;
                stats.jobs_processed += 1;
                stats.in_flight += 1;
            }

            let result = if self.blocked.contains(recipient) {
                debug!("recipient is blocked, skipping job");
                Err(DeliveryError::blocked(recipient))
            } else {
                self.guarded(&job).await
            };
            self.record(&result).await;

            match result {
                Ok(outcome) => debug!(?outcome, "job finished"),
                Err(error) if error.is_blocked() => {
                    if self.blocked.block(recipient) {
                        warn!("recipient blocked the channel, refusing further jobs");
                    }
                },
                Err(error) => {
                    error!(
                        error = %error,
                        category = %ErrorCategory::from(&error),
                        "delivery failed"
                    );
                    let report = self.pipeline.report(&job, &error);
                    let reported = match self.job_timeout {
                        Some(limit) => tokio::time::timeout(limit, report)
                            .await
                            .unwrap_or_else(|_| Err(DeliveryError::timeout(limit))),
                        None => report.await,
                    };
                    match reported {
                        Err(report_error) if report_error.is_blocked() => {
                            self.blocked.block(recipient);
                        },
                        Err(report_error) => {
                            debug!(error = %report_error, "failure notice not delivered");
                        },
                        Ok(()) => {},
                    }
                },
            }

            if let Err(error) = self.queue.release(recipient) {
                error!(error = %error, "failed to release recipient");
            }

            self.stats.write().await.in_flight -= 1;
        }
        .instrument(span)
        .await;
    }

    async fn guarded(&self, job: &tankobon_core::Job) -> Result<DeliveryOutcome> {
        let work = AssertUnwindSafe(self.pipeline.process(job)).catch_unwind();

        let caught = match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(caught) => caught,
                Err(_elapsed) => return Err(DeliveryError::timeout(limit)),
            },
            None => work.await,
        };

        caught.unwrap_or_else(|payload| {
            Err(DeliveryError::WorkerPanic { worker_id: self.id, error: panic_message(&*payload) })
        })
    }

    async fn record(&self, result: &Result<DeliveryOutcome>) {
        let mut stats = self.stats.write().await;
        match result {
            Ok(DeliveryOutcome::Delivered { failed, .. }) => {
                stats.delivered += 1;
                stats.conversion_failures += failed.iter().count() as u64;
            },
            Ok(DeliveryOutcome::Acknowledged) => stats.delivered += 1,
            Ok(DeliveryOutcome::NothingDelivered { failed }) => {
                stats.failed += 1;
                stats.conversion_failures += failed.iter().count() as u64;
            },
            Err(DeliveryError::RecipientBlocked { .. }) => stats.blocked_recipients += 1,
            Err(DeliveryError::ContentUnavailable { .. }) => {
                stats.failed += 1;
                stats.content_unavailable += 1;
            },
            Err(_) => stats.failed += 1,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
