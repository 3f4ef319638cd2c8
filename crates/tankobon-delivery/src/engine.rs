//! Delivery engine coordinating the queue, workers and block list.
//!
//! The engine is the scheduler's public face: producers hand it jobs through
//! [`JobSink`], and it owns the worker pool that drains the queue.

use std::sync::Arc;

use tankobon_core::{EnqueueError, Job, JobSink, RecipientId};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::Result,
    pipeline::DeliveryPipeline,
    queue::RecipientQueue,
    worker::{BlockList, DeliveryConfig, EngineStats},
    worker_pool::WorkerPool,
};

/// Main delivery engine.
pub struct DeliveryEngine {
    config: DeliveryConfig,
    queue: Arc<RecipientQueue>,
    pipeline: Arc<DeliveryPipeline>,
    blocked: BlockList,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates an engine around `pipeline`. Jobs may be enqueued before
    /// [`start`](Self::start); they wait for the workers.
    pub fn new(config: DeliveryConfig, pipeline: DeliveryPipeline) -> Self {
        Self {
            config,
            queue: Arc::new(RecipientQueue::new()),
            pipeline: Arc::new(pipeline),
            blocked: BlockList::new(),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
        }
    }

    /// Spawns the worker pool and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the worker pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.config.worker_count,
            job_timeout_ms = self.config.job_timeout.map(|t| t.as_millis()),
            "starting chapter delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.config.clone(),
            self.queue.clone(),
            self.pipeline.clone(),
            self.blocked.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
        );

        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Stops accepting jobs and waits for jobs in progress to finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers outlive the configured timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            self.queue.close();
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// The shared queue.
    pub fn queue(&self) -> &Arc<RecipientQueue> {
        &self.queue
    }

    /// The pipeline workers run.
    pub fn pipeline(&self) -> &Arc<DeliveryPipeline> {
        &self.pipeline
    }

    /// The block list consulted by [`JobSink::enqueue`].
    pub fn blocked(&self) -> &BlockList {
        &self.blocked
    }

    /// Token cancelled when the engine shuts down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Cloneable producer-side view of the engine.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            queue: self.queue.clone(),
            blocked: self.blocked.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl JobSink for DeliveryEngine {
    fn enqueue(&self, job: Job) -> std::result::Result<(), EnqueueError> {
        admit(&self.queue, &self.blocked, job)
    }

    fn queue_depth(&self) -> usize {
        self.queue.size()
    }
}

/// Shareable handle used by producers (discovery loop, command surface).
///
/// Stays valid after the engine shuts down; enqueues then fail with
/// `EnqueueError::Closed`.
#[derive(Clone)]
pub struct EngineHandle {
    queue: Arc<RecipientQueue>,
    blocked: BlockList,
    stats: Arc<RwLock<EngineStats>>,
}

impl EngineHandle {
    /// Enqueues a job the recipient asked for directly. A recipient that
    /// interacts again is no longer considered blocked.
    ///
    /// # Errors
    ///
    /// Returns `EnqueueError::Closed` during shutdown.
    pub fn enqueue_direct(&self, job: Job) -> std::result::Result<(), EnqueueError> {
        if self.blocked.unblock(job.recipient) {
            info!(recipient = %job.recipient, "recipient is reachable again");
        }
        self.queue.enqueue(job)
    }

    /// Whether `recipient` is currently refused.
    pub fn is_blocked(&self, recipient: RecipientId) -> bool {
        self.blocked.contains(recipient)
    }

    /// Current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }
}

impl JobSink for EngineHandle {
    fn enqueue(&self, job: Job) -> std::result::Result<(), EnqueueError> {
        admit(&self.queue, &self.blocked, job)
    }

    fn queue_depth(&self) -> usize {
        self.queue.size()
    }
}

fn admit(
    queue: &RecipientQueue,
    blocked: &BlockList,
    job: Job,
) -> std::result::Result<(), EnqueueError> {
    let recipient = job.recipient;
    if blocked.contains(recipient) {
        debug!(%recipient, "refusing job for blocked recipient");
        return Err(EnqueueError::RecipientBlocked { recipient });
    }
    queue.enqueue(job)
}
