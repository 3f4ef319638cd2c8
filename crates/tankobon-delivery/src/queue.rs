//! Per-recipient job queue with round-robin fairness.
//!
//! Each recipient owns a FIFO of pending jobs and an in-flight flag. A ring
//! holds the recipients that have pending work and are not in flight;
//! `dequeue` pops the ring head, so a prolific recipient cannot starve the
//! others. A recipient leaves the ring while one of its jobs is being
//! processed and re-enters at the tail on `release`, which serializes its
//! jobs without holding up anyone else.
//!
//! All bookkeeping sits behind one mutex held only for O(1) mutations and
//! never across an await.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tankobon_core::{EnqueueError, Job, RecipientId};
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::error::{DeliveryError, Result};

/// A job handed to one worker, together with the right to process its
/// recipient. Must be returned through [`RecipientQueue::release`].
#[derive(Debug)]
pub struct Claim {
    /// The job to process.
    pub job: Job,
    /// Recipient whose slot is now in flight.
    pub recipient: RecipientId,
    /// Worker holding the slot.
    pub worker_id: usize,
}

#[derive(Debug, Default)]
struct RecipientSlot {
    pending: VecDeque<Job>,
    in_flight: bool,
    in_ring: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    slots: HashMap<RecipientId, RecipientSlot>,
    ring: VecDeque<RecipientId>,
    pending_total: usize,
    in_flight_total: usize,
    closed: bool,
}

enum Poll {
    Claimed { claim: Claim, more_ready: bool },
    Empty,
    Closed,
}

/// Multi-producer, multi-consumer queue serializing jobs per recipient.
#[derive(Debug, Default)]
pub struct RecipientQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl RecipientQueue {
    /// Creates an empty, open queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `job` to its recipient's FIFO. Never blocks.
    ///
    /// No duplicate suppression happens here.
    ///
    /// # Errors
    ///
    /// Returns `EnqueueError::Closed` once [`close`](Self::close) was called.
    pub fn enqueue(&self, job: Job) -> std::result::Result<(), EnqueueError> {
        let recipient = job.recipient;
        let became_ready = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return Err(EnqueueError::Closed);
            }

            let slot = state.slots.entry(recipient).or_default();
            slot.pending.push_back(job);
            state.pending_total += 1;

            let became_ready = !slot.in_flight && !slot.in_ring;
            if became_ready {
                slot.in_ring = true;
                state.ring.push_back(recipient);
            }
            became_ready
        };

        if became_ready {
            self.ready.notify_one();
        }
        Ok(())
    }

    /// Waits for the next eligible recipient and claims its oldest job.
    ///
    /// Returns `None` once the queue is closed. Jobs still pending at that
    /// point are dropped; discovery re-derives them on the next run.
    pub async fn dequeue(&self, worker_id: usize) -> Option<Claim> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_claim(worker_id) {
                Poll::Claimed { claim, more_ready } => {
                    // Wake permits do not accumulate, so pass ours along.
                    if more_ready {
                        self.ready.notify_one();
                    }
                    debug!(
                        worker_id,
                        recipient = %claim.recipient,
                        job_id = %claim.job.id,
                        "claimed job"
                    );
                    return Some(claim);
                },
                Poll::Closed => return None,
                Poll::Empty => notified.await,
            }
        }
    }

    /// Claims without waiting. `None` when nothing is eligible or the queue
    /// is closed.
    pub fn try_dequeue(&self, worker_id: usize) -> Option<Claim> {
        match self.try_claim(worker_id) {
            Poll::Claimed { claim, more_ready } => {
                if more_ready {
                    self.ready.notify_one();
                }
                Some(claim)
            },
            Poll::Empty | Poll::Closed => None,
        }
    }

    fn try_claim(&self, worker_id: usize) -> Poll {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Poll::Closed;
        }

        while let Some(recipient) = state.ring.pop_front() {
            let Some(slot) = state.slots.get_mut(&recipient) else {
                error!(worker_id, %recipient, "ring referenced unknown recipient, skipping");
                continue;
            };
            slot.in_ring = false;

            if slot.in_flight {
                error!(worker_id, %recipient, "ring referenced in-flight recipient, skipping");
                continue;
            }
            let Some(job) = slot.pending.pop_front() else {
                error!(worker_id, %recipient, "ring referenced idle recipient, skipping");
                continue;
            };

            slot.in_flight = true;
            state.pending_total -= 1;
            state.in_flight_total += 1;

            return Poll::Claimed {
                claim: Claim { job, recipient, worker_id },
                more_ready: !state.ring.is_empty(),
            };
        }

        Poll::Empty
    }

    /// Returns the recipient's slot after processing, successful or not.
    ///
    /// If more jobs are pending the recipient goes to the tail of the ring.
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` when the recipient is not in flight. The
    /// ring is left untouched in that case.
    pub fn release(&self, recipient: RecipientId) -> Result<()> {
        let requeued = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let slot = match state.slots.get_mut(&recipient) {
                Some(slot) if slot.in_flight => slot,
                _ => {
                    error!(%recipient, "release of recipient that is not in flight");
                    return Err(DeliveryError::invariant(format!(
                        "release of recipient {recipient} that is not in flight"
                    )));
                },
            };

            slot.in_flight = false;
            state.in_flight_total -= 1;

            let requeued = !slot.pending.is_empty() && !slot.in_ring;
            if requeued {
                slot.in_ring = true;
                state.ring.push_back(recipient);
            }
            requeued
        };

        if requeued {
            self.ready.notify_one();
        }
        Ok(())
    }

    /// Stops accepting jobs and wakes every waiting worker.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_waiters();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Total pending jobs across all recipients.
    pub fn size(&self) -> usize {
        self.state.lock().pending_total
    }

    /// Number of recipients currently being processed.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight_total
    }

    /// Whether `recipient` currently holds a worker.
    pub fn is_in_flight(&self, recipient: RecipientId) -> bool {
        self.state.lock().slots.get(&recipient).is_some_and(|slot| slot.in_flight)
    }

    /// Pending jobs for one recipient.
    pub fn pending_for(&self, recipient: RecipientId) -> usize {
        self.state.lock().slots.get(&recipient).map_or(0, |slot| slot.pending.len())
    }

    /// Recipients waiting in the ring, head first.
    pub fn ring_snapshot(&self) -> Vec<RecipientId> {
        self.state.lock().ring.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tankobon_core::{ItemRef, SeriesRef};

    use super::*;

    fn job(recipient: i64, chapter: u32) -> Job {
        Job::new(
            RecipientId(recipient),
            ItemRef::new(
                format!("https://example.org/c/{chapter}"),
                format!("Chapter {chapter}"),
                SeriesRef::new("https://example.org/s", "Series"),
            ),
        )
    }

    #[tokio::test]
    async fn same_recipient_is_not_claimed_twice() {
        let queue = RecipientQueue::new();
        queue.enqueue(job(1, 1)).unwrap();
        queue.enqueue(job(1, 2)).unwrap();

        let first = queue.dequeue(0).await.unwrap();
        assert_eq!(first.job.item.name, "Chapter 1");
        assert!(queue.try_dequeue(1).is_none());
        assert_eq!(queue.size(), 1);

        queue.release(first.recipient).unwrap();
        let second = queue.try_dequeue(1).unwrap();
        assert_eq!(second.job.item.name, "Chapter 2");
    }

    #[tokio::test]
    async fn released_recipient_goes_to_ring_tail() {
        let queue = RecipientQueue::new();
        queue.enqueue(job(1, 1)).unwrap();
        queue.enqueue(job(1, 2)).unwrap();
        queue.enqueue(job(2, 1)).unwrap();

        let a = queue.try_dequeue(0).unwrap();
        queue.release(a.recipient).unwrap();

        assert_eq!(queue.ring_snapshot(), vec![RecipientId(2), RecipientId(1)]);
    }

    #[tokio::test]
    async fn job_enqueued_while_in_flight_waits_for_release() {
        let queue = RecipientQueue::new();
        queue.enqueue(job(1, 1)).unwrap();
        let claim = queue.try_dequeue(0).unwrap();

        queue.enqueue(job(1, 2)).unwrap();
        assert!(queue.ring_snapshot().is_empty());
        assert_eq!(queue.pending_for(RecipientId(1)), 1);

        queue.release(claim.recipient).unwrap();
        assert_eq!(queue.ring_snapshot(), vec![RecipientId(1)]);
    }

    #[test]
    fn releasing_idle_recipient_is_reported() {
        let queue = RecipientQueue::new();
        queue.enqueue(job(1, 1)).unwrap();

        let result = queue.release(RecipientId(1));
        assert!(matches!(result, Err(DeliveryError::InvariantViolation { .. })));
        assert!(matches!(queue.release(RecipientId(9)), Err(DeliveryError::InvariantViolation { .. })));
        assert_eq!(queue.ring_snapshot(), vec![RecipientId(1)]);
    }

    #[tokio::test]
    async fn dequeue_waits_for_enqueue() {
        let queue = Arc::new(RecipientQueue::new());
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue(0).await.map(|claim| claim.recipient) }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.enqueue(job(3, 1)).unwrap();
        let recipient = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(recipient, Some(RecipientId(3)));
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_rejects_jobs() {
        let queue = Arc::new(RecipientQueue::new());
        let waiters: Vec<_> = (0..3)
            .map(|id| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.dequeue(id).await.is_none() })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        for waiter in waiters {
            assert!(tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap());
        }
        assert_eq!(queue.enqueue(job(1, 1)), Err(EnqueueError::Closed));
    }

    #[tokio::test]
    async fn idle_workers_all_wake_for_burst() {
        let queue = Arc::new(RecipientQueue::new());
        let workers: Vec<_> = (0..4)
            .map(|id| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.dequeue(id).await.map(|claim| claim.recipient) })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        for recipient in 0..4 {
            queue.enqueue(job(recipient, 1)).unwrap();
        }

        let mut served = Vec::new();
        for worker in workers {
            let recipient = tokio::time::timeout(Duration::from_secs(1), worker)
                .await
                .expect("worker stayed asleep")
                .unwrap();
            served.push(recipient.unwrap());
        }
        served.sort();
        assert_eq!(served, (0..4).map(RecipientId).collect::<Vec<_>>());
        assert_eq!(queue.in_flight(), 4);
    }
}
