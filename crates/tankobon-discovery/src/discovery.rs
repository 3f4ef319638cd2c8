//! Periodic discovery of new chapters.
//!
//! Every cycle lists all subscriptions, groups recipients by series URL,
//! asks the owning provider whether the series moved past its stored
//! marker, and enqueues one job per new item per subscriber, oldest first.
//! A URL seen for the first time only records a marker. Failures are
//! contained to the URL that caused them.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tankobon_core::{
    storage::{DiscoveryStateStore, SubscriptionStore},
    Clock, EnqueueError, ItemRef, Job, JobSink, RecipientId, SeriesRef,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{error::SourceError, provider::ProviderRegistry, SourceProvider};

/// Discovery loop timing and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Time between cycle starts.
    pub period: Duration,
    /// Most new items taken from one series per cycle.
    pub max_items: usize,
    /// Pause after each URL.
    pub courtesy_delay: Duration,
    /// Extra pause after seeding a URL's first marker.
    pub seed_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(300),
            max_items: 20,
            courtesy_delay: Duration::from_secs(1),
            seed_delay: Duration::from_secs(10),
        }
    }
}

/// Counters for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Distinct series URLs visited.
    pub urls_checked: usize,
    /// URLs that produced new items.
    pub urls_updated: usize,
    /// URLs that got their first marker.
    pub urls_seeded: usize,
    /// URLs whose provider or store failed.
    pub urls_failed: usize,
    /// URLs with no active provider.
    pub urls_unrouted: usize,
    /// Jobs handed to the sink.
    pub jobs_enqueued: usize,
    /// Recipients whose subscriptions were purged after a block.
    pub recipients_purged: usize,
    /// Set when the sink closed mid-cycle.
    pub aborted: bool,
}

enum UrlOutcome {
    Seeded,
    Unchanged,
    Updated(Vec<ItemRef>),
}

/// Producer that turns provider updates into delivery jobs.
pub struct DiscoveryLoop {
    registry: Arc<ProviderRegistry>,
    subscriptions: Arc<dyn SubscriptionStore>,
    markers: Arc<dyn DiscoveryStateStore>,
    sink: Arc<dyn JobSink>,
    clock: Arc<dyn Clock>,
    config: DiscoveryConfig,
}

impl DiscoveryLoop {
    /// Creates a loop; nothing runs until [`run`](Self::run) or
    /// [`run_cycle`](Self::run_cycle).
    pub fn new(
        registry: Arc<ProviderRegistry>,
        subscriptions: Arc<dyn SubscriptionStore>,
        markers: Arc<dyn DiscoveryStateStore>,
        sink: Arc<dyn JobSink>,
        clock: Arc<dyn Clock>,
        config: DiscoveryConfig,
    ) -> Self {
        Self { registry, subscriptions, markers, sink, clock, config }
    }

    /// Runs cycles until `cancel` fires, starting one every `period`.
    ///
    /// The wait after a cycle is `period - elapsed`, so slow cycles do not
    /// push the schedule back.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(period_secs = self.config.period.as_secs(), "discovery loop starting");

        loop {
            let started = self.clock.now();

            let report = tokio::select! {
                () = cancel.cancelled() => break,
                report = self.run_cycle() => report,
            };
            if report.aborted {
                info!("job sink closed, discovery loop stopping");
                break;
            }

            let elapsed = self.clock.now().saturating_duration_since(started);
            let wait = self.config.period.saturating_sub(elapsed);
            debug!(elapsed_ms = elapsed.as_millis(), wait_ms = wait.as_millis(), "next cycle scheduled");

            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.clock.sleep(wait) => {},
            }
        }

        info!("discovery loop stopped");
    }

    /// Runs one discovery cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let subscriptions = match self.subscriptions.list_subscriptions().await {
            Ok(subscriptions) => subscriptions,
            Err(error) => {
                error!(error = %error, "failed to list subscriptions, skipping cycle");
                return report;
            },
        };

        let mut by_url: BTreeMap<String, (SeriesRef, Vec<RecipientId>)> = BTreeMap::new();
        for subscription in subscriptions {
            by_url
                .entry(subscription.series.url.clone())
                .or_insert_with(|| (subscription.series.clone(), Vec::new()))
                .1
                .push(subscription.recipient);
        }

        let mut blocked: HashSet<RecipientId> = HashSet::new();

        for (url, (series, recipients)) in by_url {
            let Some(provider) = self.registry.route(&url) else {
                debug!(%url, "no active provider for series");
                report.urls_unrouted += 1;
                continue;
            };
            report.urls_checked += 1;

            match self.check(provider.as_ref(), &series).await {
                Ok(UrlOutcome::Seeded) => {
                    report.urls_seeded += 1;
                    self.clock.sleep(self.config.seed_delay).await;
                },
                Ok(UrlOutcome::Unchanged) => {},
                Ok(UrlOutcome::Updated(items)) => {
                    report.urls_updated += 1;
                    if !self.fan_out(&items, &recipients, &mut blocked, &mut report).await {
                        report.aborted = true;
                        return report;
                    }
                },
                Err(error) => {
                    warn!(%url, provider = %provider.id(), error = %error, "series check failed");
                    report.urls_failed += 1;
                },
            }

            self.clock.sleep(self.config.courtesy_delay).await;
        }

        info!(
            urls_checked = report.urls_checked,
            urls_updated = report.urls_updated,
            urls_seeded = report.urls_seeded,
            urls_failed = report.urls_failed,
            jobs_enqueued = report.jobs_enqueued,
            "discovery cycle finished"
        );
        report
    }

    async fn check(
        &self,
        provider: &dyn SourceProvider,
        series: &SeriesRef,
    ) -> Result<UrlOutcome, CheckError> {
        let url = series.url.as_str();

        let Some(marker) = self.markers.get_marker(url).await? else {
            let newest = provider.iterate_items_since(series, None).next().await.transpose()?;
            if let Some(newest) = newest {
                self.markers.set_marker(url, newest.content_ref).await?;
                debug!(%url, "seeded discovery marker");
            }
            return Ok(UrlOutcome::Seeded);
        };

        if !provider.has_changed(series, &marker).await? {
            return Ok(UrlOutcome::Unchanged);
        }

        let items: Vec<ItemRef> = provider
            .iterate_items_since(series, Some(&marker))
            .take(self.config.max_items)
            .try_collect()
            .await?;

        let Some(newest) = items.first() else {
            return Ok(UrlOutcome::Unchanged);
        };

        // Marker first: if it cannot be stored the jobs would repeat every cycle.
        self.markers.set_marker(url, newest.content_ref.clone()).await?;
        debug!(%url, new_items = items.len(), marker = %newest.content_ref, "series updated");

        Ok(UrlOutcome::Updated(items.into_iter().rev().collect()))
    }

    /// Enqueues `items` (oldest first) for every recipient. Returns `false`
    /// when the sink has closed.
    async fn fan_out(
        &self,
        items: &[ItemRef],
        recipients: &[RecipientId],
        blocked: &mut HashSet<RecipientId>,
        report: &mut CycleReport,
    ) -> bool {
        for &recipient in recipients {
            if blocked.contains(&recipient) {
                continue;
            }
            for item in items {
                match self.sink.enqueue(Job::new(recipient, item.clone())) {
                    Ok(()) => report.jobs_enqueued += 1,
                    Err(EnqueueError::RecipientBlocked { .. }) => {
                        blocked.insert(recipient);
                        self.purge(recipient, report).await;
                        break;
                    },
                    Err(EnqueueError::Closed) => return false,
                }
            }
        }
        true
    }

    async fn purge(&self, recipient: RecipientId, report: &mut CycleReport) {
        match self.subscriptions.remove_recipient(recipient).await {
            Ok(removed) => {
                report.recipients_purged += 1;
                info!(%recipient, removed, "purged subscriptions of blocked recipient");
            },
            Err(error) => {
                warn!(%recipient, error = %error, "failed to purge blocked recipient");
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CheckError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] tankobon_core::CoreError),
}
