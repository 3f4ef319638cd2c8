//! Worker pool management with structured concurrency.
//!
//! Spawns the delivery workers, tracks their handles, and shuts them down
//! with a bounded wait.

use std::{sync::Arc, time::Duration};

use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    pipeline::DeliveryPipeline,
    queue::RecipientQueue,
    worker::{BlockList, DeliveryConfig, DeliveryWorker, EngineStats},
};

/// Supervised set of delivery workers sharing one queue.
pub struct WorkerPool {
    config: DeliveryConfig,
    queue: Arc<RecipientQueue>,
    pipeline: Arc<DeliveryPipeline>,
    blocked: BlockList,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Creates a pool; no worker runs until [`spawn_workers`](Self::spawn_workers).
    pub fn new(
        config: DeliveryConfig,
        queue: Arc<RecipientQueue>,
        pipeline: Arc<DeliveryPipeline>,
        blocked: BlockList,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            queue,
            pipeline,
            blocked,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
        }
    }

    /// Spawns the configured number of workers and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for a zero worker count.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if self.config.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }

        info!(worker_count = self.config.worker_count, "spawning delivery workers");
        self.stats.write().await.active_workers = self.config.worker_count;

        for worker_id in 0..self.config.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.queue.clone(),
                self.pipeline.clone(),
                self.config.job_timeout,
                self.blocked.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
            );

            let handle = tokio::spawn(async move {
                info!(worker_id, "delivery worker starting");

                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                } else {
                    info!(worker_id, "delivery worker stopped gracefully");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned_workers = self.worker_handles.len(), "all delivery workers spawned");
        Ok(())
    }

    /// Closes the queue, cancels the workers and waits for jobs in progress
    /// to finish, up to `timeout`. Pending jobs are dropped.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` when workers are still running at the
    /// deadline.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            pending_jobs = self.queue.size(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.queue.close();
        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let shutdown_future = async move {
            let mut panicked = 0_usize;

            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Ok(Ok(())) => {},
                    Err(join_error) => {
                        panicked += 1;
                        let error =
                            DeliveryError::WorkerPanic { worker_id, error: join_error.to_string() };
                        error!(worker_id, error = %error, "worker task panicked during shutdown");
                    },
                }
            }

            stats.write().await.active_workers = 0;
            panicked
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(panicked) => {
                if panicked > 0 {
                    warn!(panicked, "some workers panicked before shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|handle| !handle.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active_count,
                "worker pool dropped with active workers, forcing cancellation"
            );
            self.queue.close();
            self.cancellation_token.cancel();
        }
    }
}
