//! Clock abstraction so retry waits and discovery periods can be tested
//! without real sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of time for everything that waits.
///
/// Production code uses [`RealClock`]. Tests inject [`TestClock`], whose
/// `sleep` advances virtual time instead of blocking.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring elapsed time.
    fn now(&self) -> Instant;

    /// Wall-clock time for timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Clock backed by the system and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock for deterministic tests.
///
/// Every `sleep` advances the clock by the requested duration, records it,
/// and yields once so other tasks can make progress. Clones share state.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
    base_instant: Instant,
    base_utc: DateTime<Utc>,
}

impl TestClock {
    /// Creates a clock anchored at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a clock anchored at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
            base_instant: Instant::now(),
            base_utc: start,
        }
    }

    /// Moves virtual time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }

    /// Durations passed to `sleep`, in call order.
    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Sum of every recorded sleep.
    pub fn total_slept(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::MAX);
        self.base_utc + elapsed
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let start = Utc::now();
        let clock = TestClock::starting_at(start);
        let before = clock.now();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now().duration_since(before), Duration::from_secs(10));
        assert_eq!(clock.now_utc() - start, chrono::Duration::seconds(10));
    }

    #[tokio::test]
    async fn sleep_is_recorded_and_instant() {
        let clock = TestClock::new();
        let wall = Instant::now();

        clock.sleep(Duration::from_secs(300)).await;
        clock.sleep(Duration::from_secs(1)).await;

        assert!(wall.elapsed() < Duration::from_secs(1));
        assert_eq!(clock.elapsed(), Duration::from_secs(301));
        assert_eq!(clock.recorded_sleeps(), vec![
            Duration::from_secs(300),
            Duration::from_secs(1)
        ]);
        assert_eq!(clock.total_slept(), Duration::from_secs(301));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let other = clock.clone();

        other.advance(Duration::from_millis(250));

        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn real_clock_sleeps() {
        let clock = RealClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_millis(5)).await;
        assert!(clock.now().duration_since(start) >= Duration::from_millis(5));
    }
}
