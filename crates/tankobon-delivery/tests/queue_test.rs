//! Scheduling properties of the per-recipient queue.

use std::{collections::HashMap, sync::Arc, time::Duration};

use proptest::prelude::*;
use tankobon_core::{ItemRef, Job, RecipientId};
use tankobon_delivery::{Claim, RecipientQueue};
use tankobon_testing::fixtures;

fn numbered(recipient: i64, seq: u32) -> Job {
    fixtures::job(recipient, seq)
}

fn chapter_of(item: &ItemRef) -> u32 {
    item.name.trim_start_matches("Chapter ").parse().unwrap_or(u32::MAX)
}

#[test]
fn fairness_single_job_is_not_starved_by_busy_recipient() {
    let queue = RecipientQueue::new();
    for seq in 0..10 {
        queue.enqueue(numbered(1, seq)).unwrap();
    }
    queue.enqueue(numbered(2, 0)).unwrap();

    let mut order = Vec::new();
    while let Some(claim) = queue.try_dequeue(0) {
        order.push(claim.recipient);
        queue.release(claim.recipient).unwrap();
    }

    let position = order.iter().position(|r| *r == RecipientId(2)).unwrap();
    assert!(position <= 1, "recipient 2 served at position {position}");
    assert_eq!(order.len(), 11);
}

#[test]
fn late_recipient_is_served_next_while_busy_one_keeps_growing() {
    let queue = RecipientQueue::new();
    queue.enqueue(numbered(1, 0)).unwrap();

    let mut order = Vec::new();
    for seq in 1..20 {
        let claim = queue.try_dequeue(0).unwrap();
        order.push(claim.recipient);
        queue.enqueue(numbered(1, seq)).unwrap();
        if seq == 5 {
            queue.enqueue(numbered(2, 0)).unwrap();
        }
        queue.release(claim.recipient).unwrap();
    }

    let position = order.iter().position(|r| *r == RecipientId(2)).unwrap();
    assert_eq!(position, 5, "recipient 2 served at position {position}");
    assert_eq!(order.iter().filter(|r| **r == RecipientId(2)).count(), 1);
}

#[test]
fn independent_recipients_are_claimed_in_parallel() {
    let queue = RecipientQueue::new();
    for recipient in 0..3 {
        queue.enqueue(numbered(recipient, 0)).unwrap();
    }

    let claims: Vec<Claim> = (0..3).filter_map(|worker| queue.try_dequeue(worker)).collect();

    assert_eq!(claims.len(), 3);
    assert_eq!(queue.in_flight(), 3);
}

proptest! {
    #[test]
    fn per_recipient_order_holds_under_any_interleaving(
        recipients in prop::collection::vec(0_i64..4, 1..60),
        steps in prop::collection::vec(any::<bool>(), 0..200),
    ) {
        let queue = RecipientQueue::new();
        let mut expected: HashMap<i64, Vec<u32>> = HashMap::new();
        for (seq, recipient) in recipients.iter().enumerate() {
            let seq = u32::try_from(seq).unwrap();
            queue.enqueue(numbered(*recipient, seq)).unwrap();
            expected.entry(*recipient).or_default().push(seq);
        }

        let mut held: Vec<Claim> = Vec::new();
        let mut seen: HashMap<i64, Vec<u32>> = HashMap::new();
        let mut steps = steps.into_iter();

        loop {
            // true claims, false releases the oldest held claim.
            let claim_next = steps.next().unwrap_or(false);
            if claim_next {
                if let Some(claim) = queue.try_dequeue(held.len()) {
                    prop_assert!(
                        held.iter().all(|h| h.recipient != claim.recipient),
                        "recipient {} claimed twice", claim.recipient
                    );
                    seen.entry(claim.recipient.0).or_default().push(chapter_of(&claim.job.item));
                    held.push(claim);
                    continue;
                }
            }
            if held.is_empty() {
                match queue.try_dequeue(0) {
                    Some(claim) => {
                        seen.entry(claim.recipient.0).or_default().push(chapter_of(&claim.job.item));
                        held.push(claim);
                    },
                    None => break,
                }
            } else {
                let claim = held.remove(0);
                queue.release(claim.recipient).unwrap();
            }
        }

        prop_assert_eq!(queue.size(), 0);
        prop_assert_eq!(seen, expected);
    }

    #[test]
    fn ring_never_holds_empty_or_in_flight_recipients(
        ops in prop::collection::vec((0_i64..3, 0_u8..3), 1..80),
    ) {
        let queue = RecipientQueue::new();
        let mut held: Vec<RecipientId> = Vec::new();

        for (seq, (recipient, op)) in ops.into_iter().enumerate() {
            match op {
                0 => queue.enqueue(numbered(recipient, u32::try_from(seq).unwrap())).unwrap(),
                1 => {
                    if let Some(claim) = queue.try_dequeue(0) {
                        held.push(claim.recipient);
                    }
                },
                _ => {
                    if !held.is_empty() {
                        queue.release(held.remove(0)).unwrap();
                    }
                },
            }

            for id in queue.ring_snapshot() {
                prop_assert!(queue.pending_for(id) > 0);
                prop_assert!(!queue.is_in_flight(id));
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_no_recipient_is_ever_claimed_twice() {
    const RECIPIENTS: i64 = 6;
    const PER_RECIPIENT: u32 = 40;

    let queue = Arc::new(RecipientQueue::new());
    let active: Arc<parking_lot::Mutex<HashMap<RecipientId, usize>>> = Arc::default();
    let violations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let processed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|worker_id| {
            let queue = queue.clone();
            let active = active.clone();
            let violations = violations.clone();
            let processed = processed.clone();
            tokio::spawn(async move {
                while let Some(claim) = queue.dequeue(worker_id).await {
                    {
                        let mut active = active.lock();
                        let count = active.entry(claim.recipient).or_default();
                        *count += 1;
                        if *count > 1 {
                            violations.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                    tokio::task::yield_now().await;
                    *active.lock().entry(claim.recipient).or_default() -= 1;
                    processed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    queue.release(claim.recipient).unwrap();
                }
            })
        })
        .collect();

    for seq in 0..PER_RECIPIENT {
        for recipient in 0..RECIPIENTS {
            queue.enqueue(numbered(recipient, seq)).unwrap();
        }
    }

    let total = usize::try_from(RECIPIENTS).unwrap() * PER_RECIPIENT as usize;
    tokio::time::timeout(Duration::from_secs(10), async {
        while processed.load(std::sync::atomic::Ordering::SeqCst) < total {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("workers did not drain the queue");

    queue.close();
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(violations.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(queue.in_flight(), 0);
}
