//! Discovery cycle behaviour against in-memory doubles.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tankobon_core::{
    storage::{DiscoveryStateStore, SubscriptionStore},
    Clock, RecipientId, TestClock,
};
use tankobon_discovery::{DiscoveryConfig, DiscoveryLoop, ProviderRegistry};
use tankobon_testing::{fixtures, FailingStore, RecordingSink, StubProvider};
use tokio_util::sync::CancellationToken;

struct Setup {
    store: Arc<FailingStore>,
    provider: Arc<StubProvider>,
    registry: Arc<ProviderRegistry>,
    sink: Arc<RecordingSink>,
    clock: Arc<TestClock>,
}

impl Setup {
    fn new() -> Self {
        let provider = Arc::new(StubProvider::new("Alpha", "manga.example"));
        Self {
            store: Arc::new(FailingStore::new()),
            registry: Arc::new(ProviderRegistry::new().with(provider.clone())),
            provider,
            sink: Arc::new(RecordingSink::new()),
            clock: Arc::new(TestClock::new()),
        }
    }

    fn discovery(&self, config: DiscoveryConfig) -> DiscoveryLoop {
        DiscoveryLoop::new(
            self.registry.clone(),
            self.store.clone(),
            self.store.clone(),
            self.sink.clone(),
            self.clock.clone() as Arc<dyn Clock>,
            config,
        )
    }

    async fn follow(&self, series_n: u32, recipient: i64, chapters: u32) -> Result<()> {
        self.store.subscribe(fixtures::subscription(series_n, recipient)).await?;
        self.provider.set_items(
            &fixtures::series(series_n),
            fixtures::items_newest_first(series_n, 1, chapters),
        );
        Ok(())
    }

    async fn mark(&self, series_n: u32, chapter: u32) -> Result<()> {
        self.store
            .set_marker(&fixtures::series(series_n).url, fixtures::content_ref(series_n, chapter))
            .await?;
        Ok(())
    }

    async fn marker(&self, series_n: u32) -> Result<Option<tankobon_core::ContentRef>> {
        Ok(self.store.get_marker(&fixtures::series(series_n).url).await?)
    }
}

#[tokio::test]
async fn new_items_are_enqueued_oldest_first_and_marker_advances() -> Result<()> {
    let setup = Setup::new();
    setup.follow(1, 10, 5).await?;
    setup.mark(1, 3).await?;

    let report = setup.discovery(DiscoveryConfig::default()).run_cycle().await;

    assert_eq!(setup.sink.names_for(RecipientId(10)), ["Chapter 4", "Chapter 5"]);
    assert_eq!(setup.marker(1).await?, Some(fixtures::content_ref(1, 5)));
    assert_eq!(report.urls_updated, 1);
    assert_eq!(report.jobs_enqueued, 2);
    Ok(())
}

#[tokio::test]
async fn every_subscriber_gets_the_new_items() -> Result<()> {
    let setup = Setup::new();
    setup.follow(1, 10, 5).await?;
    setup.follow(1, 11, 5).await?;
    setup.mark(1, 4).await?;

    setup.discovery(DiscoveryConfig::default()).run_cycle().await;

    assert_eq!(setup.sink.names_for(RecipientId(10)), ["Chapter 5"]);
    assert_eq!(setup.sink.names_for(RecipientId(11)), ["Chapter 5"]);
    Ok(())
}

#[tokio::test]
async fn unknown_series_is_seeded_without_jobs() -> Result<()> {
    let setup = Setup::new();
    setup.follow(1, 10, 5).await?;
    let config = DiscoveryConfig::default();

    let report = setup.discovery(config.clone()).run_cycle().await;

    assert!(setup.sink.jobs().is_empty());
    assert_eq!(setup.marker(1).await?, Some(fixtures::content_ref(1, 5)));
    assert_eq!(report.urls_seeded, 1);
    assert_eq!(setup.clock.total_slept(), config.seed_delay + config.courtesy_delay);
    Ok(())
}

#[tokio::test]
async fn unchanged_series_enqueues_nothing() -> Result<()> {
    let setup = Setup::new();
    setup.follow(1, 10, 5).await?;
    setup.mark(1, 5).await?;

    let report = setup.discovery(DiscoveryConfig::default()).run_cycle().await;

    assert!(setup.sink.jobs().is_empty());
    assert_eq!(report.urls_checked, 1);
    assert_eq!(report.urls_updated, 0);
    Ok(())
}

#[tokio::test]
async fn failing_url_does_not_stop_the_others() -> Result<()> {
    let setup = Setup::new();
    setup.follow(1, 10, 5).await?;
    setup.follow(2, 10, 5).await?;
    setup.mark(1, 3).await?;
    setup.mark(2, 3).await?;
    setup.provider.fail(fixtures::series(1).url);

    let report = setup.discovery(DiscoveryConfig::default()).run_cycle().await;

    assert_eq!(report.urls_failed, 1);
    assert_eq!(report.urls_updated, 1);
    let jobs = setup.sink.jobs();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|job| job.item.series == fixtures::series(2)));
    assert_eq!(setup.marker(1).await?, Some(fixtures::content_ref(1, 3)));
    Ok(())
}

#[tokio::test]
async fn marker_write_failure_skips_the_enqueue() -> Result<()> {
    let setup = Setup::new();
    setup.follow(1, 10, 5).await?;
    setup.mark(1, 3).await?;
    setup.store.fail_markers_for(fixtures::series(1).url);

    let report = setup.discovery(DiscoveryConfig::default()).run_cycle().await;

    assert_eq!(report.urls_failed, 1);
    assert!(setup.sink.jobs().is_empty());
    Ok(())
}

#[tokio::test]
async fn new_items_are_capped_per_cycle() -> Result<()> {
    let setup = Setup::new();
    setup.follow(1, 10, 40).await?;
    setup.mark(1, 5).await?;

    let config = DiscoveryConfig { max_items: 20, ..DiscoveryConfig::default() };
    setup.discovery(config).run_cycle().await;

    let names = setup.sink.names_for(RecipientId(10));
    assert_eq!(names.len(), 20);
    assert_eq!(names.first().map(String::as_str), Some("Chapter 21"));
    assert_eq!(names.last().map(String::as_str), Some("Chapter 40"));
    assert_eq!(setup.marker(1).await?, Some(fixtures::content_ref(1, 40)));
    Ok(())
}

#[tokio::test]
async fn blocked_recipient_is_purged_and_others_still_served() -> Result<()> {
    let setup = Setup::new();
    setup.follow(1, 10, 5).await?;
    setup.follow(1, 11, 5).await?;
    setup.follow(2, 11, 5).await?;
    setup.mark(1, 3).await?;
    setup.mark(2, 3).await?;
    setup.sink.block(RecipientId(11));

    let report = setup.discovery(DiscoveryConfig::default()).run_cycle().await;

    assert_eq!(report.recipients_purged, 1);
    assert_eq!(setup.sink.names_for(RecipientId(10)), ["Chapter 4", "Chapter 5"]);
    assert!(setup.store.subscriptions_for(RecipientId(11)).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn paused_provider_is_not_polled() -> Result<()> {
    let setup = Setup::new();
    setup.follow(1, 10, 5).await?;
    setup.mark(1, 3).await?;
    setup.registry.pause("[EN] Alpha");

    let report = setup.discovery(DiscoveryConfig::default()).run_cycle().await;

    assert_eq!(report.urls_unrouted, 1);
    assert_eq!(setup.provider.list_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn closed_sink_aborts_the_cycle() -> Result<()> {
    let setup = Setup::new();
    setup.follow(1, 10, 5).await?;
    setup.mark(1, 3).await?;
    setup.sink.close();

    let report = setup.discovery(DiscoveryConfig::default()).run_cycle().await;

    assert!(report.aborted);
    Ok(())
}

#[tokio::test]
async fn subscription_outage_skips_the_cycle() {
    let setup = Setup::new();
    setup.store.fail_subscriptions(true);

    let report = setup.discovery(DiscoveryConfig::default()).run_cycle().await;

    assert_eq!(report.urls_checked, 0);
}

#[tokio::test]
async fn run_waits_the_remainder_of_the_period() -> Result<()> {
    let setup = Setup::new();
    setup.follow(1, 10, 5).await?;
    setup.mark(1, 5).await?;

    let config = DiscoveryConfig {
        period: Duration::from_secs(300),
        courtesy_delay: Duration::from_secs(1),
        ..DiscoveryConfig::default()
    };
    let discovery = Arc::new(setup.discovery(config));
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let discovery = discovery.clone();
        let cancel = cancel.clone();
        async move { discovery.run(cancel).await }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while setup.clock.recorded_sleeps().len() < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await?;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task).await??;

    let sleeps = setup.clock.recorded_sleeps();
    assert_eq!(sleeps[0], Duration::from_secs(1));
    assert_eq!(sleeps[1], Duration::from_secs(299));
    Ok(())
}
