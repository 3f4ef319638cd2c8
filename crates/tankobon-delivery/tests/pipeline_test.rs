//! Delivery pipeline behaviour against in-memory doubles.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tankobon_core::{
    storage::{ArtifactStore, PreferenceStore},
    ArtifactEntry, ArtifactHandle, Clock, Job, OutputFormat, OutputFormats, RecipientId,
};
use tankobon_delivery::{
    Attachment, ArtifactCache, ConverterSet, DeliveryError, DeliveryOutcome, DeliveryPipeline,
    RetryPolicy,
};
use tankobon_testing::{
    fixtures, FailingStore, PipelineHarness, Reply, Sent, StubChannel,
};

fn documents(sent: &Sent) -> Vec<(OutputFormat, bool)> {
    match sent {
        Sent::Documents { documents, .. } => documents
            .iter()
            .map(|document| (document.format, document.attachment.is_upload()))
            .collect(),
        Sent::Text { .. } => Vec::new(),
    }
}

#[tokio::test]
async fn cold_cache_produces_every_format_once() -> Result<()> {
    let harness = PipelineHarness::new();
    let pipeline = harness.pipeline();
    let job = fixtures::job(1, 7);

    let outcome = pipeline.process(&job).await?;

    assert_eq!(
        outcome,
        DeliveryOutcome::Delivered {
            sent: OutputFormats::ALL,
            produced: OutputFormats::ALL,
            failed: OutputFormats::NONE,
        }
    );
    assert_eq!(harness.producer.fetches(), 1);
    assert_eq!(harness.document.calls() + harness.archive.calls() + harness.web_link.calls(), 3);

    let sent = harness.channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(documents(&sent[0]), vec![(OutputFormat::Document, true), (OutputFormat::Archive, true)]);
    assert!(sent[0].text().contains("[Read on telegraph](https://read.example/"));
    assert!(sent[0].text().ends_with(&format!("[Read on website]({})", job.content_ref())));

    let cached = harness.store.get(job.content_ref()).await?.expect("entry cached");
    assert_eq!(cached.formats(), OutputFormats::ALL);
    assert_eq!(cached.document, Some(ArtifactHandle::new("upload-1")));
    assert_eq!(cached.archive, Some(ArtifactHandle::new("upload-2")));
    Ok(())
}

#[tokio::test]
async fn warm_cache_resends_handles_without_fetching() -> Result<()> {
    let harness = PipelineHarness::new();
    let pipeline = harness.pipeline();

    pipeline.process(&fixtures::job(1, 7)).await?;
    let outcome = pipeline.process(&fixtures::job(2, 7)).await?;

    assert!(matches!(outcome, DeliveryOutcome::Delivered { produced, .. } if produced.is_empty()));
    assert_eq!(harness.producer.fetches(), 1);

    let second = harness.channel.sent_to(RecipientId(2));
    assert_eq!(
        documents(&second[0]),
        vec![(OutputFormat::Document, false), (OutputFormat::Archive, false)]
    );
    Ok(())
}

#[tokio::test]
async fn only_missing_formats_are_produced() -> Result<()> {
    let harness = PipelineHarness::new();
    let job = fixtures::job(1, 3);
    harness.store.set_output_formats(job.recipient, OutputFormats::DOCUMENT | OutputFormats::ARCHIVE).await?;

    let mut entry = ArtifactEntry::new(job.content_ref().clone());
    entry.archive = Some(ArtifactHandle::new("zip-cached"));
    harness.store.upsert(entry).await?;

    harness.pipeline().process(&job).await?;

    assert_eq!(harness.document.calls(), 1);
    assert_eq!(harness.archive.calls(), 0);
    assert_eq!(harness.web_link.calls(), 0);

    let sent = harness.channel.sent();
    match &sent[0] {
        Sent::Documents { documents, caption, .. } => {
            assert_eq!(documents[1].attachment, Attachment::Cached(ArtifactHandle::new("zip-cached")));
            assert!(!caption.contains("telegraph"));
        },
        other => panic!("expected documents, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn empty_preference_only_acknowledges() -> Result<()> {
    let harness = PipelineHarness::new();
    let job = fixtures::job(4, 1);
    harness.store.set_output_formats(job.recipient, OutputFormats::NONE).await?;

    let outcome = harness.pipeline().process(&job).await?;

    assert_eq!(outcome, DeliveryOutcome::Acknowledged);
    assert_eq!(harness.producer.fetches(), 0);
    assert_eq!(
        harness.channel.sent(),
        vec![Sent::Text {
            recipient: job.recipient,
            text: format!("Series 1 - Chapter 1\n{}", job.content_ref()),
        }]
    );
    Ok(())
}

#[tokio::test]
async fn web_link_only_is_sent_as_text() -> Result<()> {
    let harness = PipelineHarness::new();
    let job = fixtures::job(5, 2);
    harness.store.set_output_formats(job.recipient, OutputFormats::WEB_LINK).await?;

    harness.pipeline().process(&job).await?;

    let sent = harness.channel.sent();
    assert!(matches!(&sent[..], [Sent::Text { text, .. }] if text.contains("Read on telegraph")));
    Ok(())
}

#[tokio::test]
async fn missing_content_ends_the_job_without_sending() {
    let harness = PipelineHarness::new();
    let job = fixtures::job(1, 9);
    harness.producer.set_missing(job.content_ref().clone());

    let result = harness.pipeline().process(&job).await;

    assert!(matches!(result, Err(DeliveryError::ContentUnavailable { .. })));
    assert!(harness.channel.sent().is_empty());
    assert_eq!(harness.document.calls(), 0);
}

#[tokio::test]
async fn failed_fetch_counts_as_unavailable_content() {
    let harness = PipelineHarness::new();
    let job = fixtures::job(1, 9);
    harness.producer.set_failing(job.content_ref().clone());

    let result = harness.pipeline().process(&job).await;

    assert!(matches!(result, Err(DeliveryError::ContentUnavailable { .. })));
}

#[tokio::test]
async fn conversion_failure_is_reported_and_other_formats_continue() -> Result<()> {
    let harness = PipelineHarness::new();
    harness.archive.set_failing(true);
    let job = fixtures::job(1, 5);

    let outcome = harness.pipeline().process(&job).await?;

    match outcome {
        DeliveryOutcome::Delivered { sent, failed, .. } => {
            assert_eq!(failed, OutputFormats::ARCHIVE);
            assert!(sent.contains(OutputFormats::DOCUMENT));
            assert!(!sent.contains(OutputFormats::ARCHIVE));
        },
        other => panic!("unexpected outcome {other:?}"),
    }

    let sent = harness.channel.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].text().starts_with("There was an error making the cbz for this chapter"));
    assert_eq!(documents(&sent[1]), vec![(OutputFormat::Document, true)]);

    let cached = harness.store.get(job.content_ref()).await?.expect("entry cached");
    assert!(cached.archive.is_none());
    Ok(())
}

#[tokio::test]
async fn every_format_failing_delivers_nothing() -> Result<()> {
    let harness = PipelineHarness::new();
    let job = fixtures::job(1, 5);
    harness.store.set_output_formats(job.recipient, OutputFormats::DOCUMENT).await?;
    harness.document.set_failing(true);

    let outcome = harness.pipeline().process(&job).await?;

    assert_eq!(outcome, DeliveryOutcome::NothingDelivered { failed: OutputFormats::DOCUMENT });
    assert_eq!(harness.channel.sent().len(), 1);
    Ok(())
}

#[tokio::test]
async fn channel_without_batch_gets_one_call_per_document() -> Result<()> {
    let harness = PipelineHarness::with_channel(StubChannel::new().without_batch());
    let job = fixtures::job(1, 1);

    harness.pipeline().process(&job).await?;

    let sent = harness.channel.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].text(), "");
    assert!(sent[1].text().contains("[Read on website]"));

    let cached = harness.store.get(job.content_ref()).await?.expect("entry cached");
    assert!(cached.document.is_some() && cached.archive.is_some());
    Ok(())
}

#[tokio::test]
async fn rate_limits_are_waited_out() -> Result<()> {
    let harness = PipelineHarness::new();
    harness.channel.script([
        Reply::RateLimited(Duration::from_secs(1)),
        Reply::RateLimited(Duration::from_secs(1)),
    ]);

    harness.pipeline().process(&fixtures::job(1, 1)).await?;

    assert_eq!(harness.channel.attempts(), 3);
    assert!(harness.clock.elapsed() >= Duration::from_secs(2));
    assert_eq!(harness.channel.sent().len(), 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_budget_surfaces_as_error() {
    let harness = PipelineHarness::new();
    harness.channel.script(std::iter::repeat(Reply::RateLimited(Duration::from_secs(4))).take(10));

    let result = harness
        .pipeline_with(RetryPolicy::with_total_budget(Duration::from_secs(10)))
        .process(&fixtures::job(1, 1))
        .await;

    assert!(matches!(result, Err(DeliveryError::RetriesExhausted { attempts: 3, .. })));
}

#[tokio::test]
async fn blocked_recipient_propagates() {
    let harness = PipelineHarness::new();
    harness.channel.block(RecipientId(1));

    let result = harness.pipeline().process(&fixtures::job(1, 1)).await;

    assert!(matches!(result, Err(DeliveryError::RecipientBlocked { recipient }) if recipient == RecipientId(1)));
}

#[tokio::test]
async fn scratch_space_is_removed_after_the_job() -> Result<()> {
    let harness = PipelineHarness::new();
    harness.archive.set_failing(true);

    harness.pipeline().process(&fixtures::job(1, 1)).await?;

    let dirs = harness.producer.scratch_dirs();
    assert_eq!(dirs.len(), 1);
    assert!(!dirs[0].exists());
    Ok(())
}

#[tokio::test]
async fn store_outage_degrades_to_fresh_production() -> Result<()> {
    let harness = PipelineHarness::new();
    let store = Arc::new(FailingStore::new());
    store.fail_artifacts(true);
    store.fail_preferences(true);

    let pipeline = DeliveryPipeline::new(
        ArtifactCache::new(store.clone()),
        store.clone(),
        harness.producer.clone(),
        ConverterSet::new().with(harness.document.clone()).with(harness.archive.clone()),
        harness.channel.clone(),
        RetryPolicy::default(),
        harness.clock.clone() as Arc<dyn Clock>,
    );

    let outcome = pipeline.process(&Job::new(RecipientId(1), fixtures::item(2, 1))).await?;

    // Web link was requested (preferences fell back to all formats) but has
    // no converter, so it fails while the files still go out.
    match outcome {
        DeliveryOutcome::Delivered { sent, failed, .. } => {
            assert_eq!(sent, OutputFormats::DOCUMENT | OutputFormats::ARCHIVE);
            assert_eq!(failed, OutputFormats::WEB_LINK);
        },
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(store.inner().artifact_count(), 0);
    Ok(())
}
