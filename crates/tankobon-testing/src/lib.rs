//! Deterministic test doubles for tankobon.
//!
//! Everything here is in-memory and scriptable: a channel that replays rate
//! limits and blocks, a provider backed by a map, a producer and converters
//! with switchable failures, a recording job sink, and a store wrapper that
//! fails on demand. Virtual time comes from
//! [`TestClock`](tankobon_core::TestClock).

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::sync::Arc;

use tankobon_core::{storage::MemoryStore, Clock, OutputFormat, TestClock};
use tankobon_delivery::{ArtifactCache, ConverterSet, DeliveryPipeline, RetryPolicy};

pub mod channel;
pub mod fixtures;
pub mod production;
pub mod provider;
pub mod sink;
pub mod store;

pub use channel::{Reply, Sent, StubChannel};
pub use production::{StubConverter, StubProducer};
pub use provider::StubProvider;
pub use sink::RecordingSink;
pub use store::FailingStore;

/// A pipeline wired entirely to doubles, with handles to each of them.
pub struct PipelineHarness {
    /// Backing store for artifacts and preferences.
    pub store: Arc<MemoryStore>,
    /// Channel double.
    pub channel: Arc<StubChannel>,
    /// Producer double.
    pub producer: Arc<StubProducer>,
    /// Document converter.
    pub document: Arc<StubConverter>,
    /// Archive converter.
    pub archive: Arc<StubConverter>,
    /// Web link converter.
    pub web_link: Arc<StubConverter>,
    /// Virtual clock used by the retry policy.
    pub clock: Arc<TestClock>,
}

impl PipelineHarness {
    /// Harness with a batching channel.
    pub fn new() -> Self {
        Self::with_channel(StubChannel::new())
    }

    /// Harness around a preconfigured channel.
    pub fn with_channel(channel: StubChannel) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            channel: Arc::new(channel),
            producer: Arc::new(StubProducer::new()),
            document: Arc::new(StubConverter::new(OutputFormat::Document)),
            archive: Arc::new(StubConverter::new(OutputFormat::Archive)),
            web_link: Arc::new(StubConverter::new(OutputFormat::WebLink)),
            clock: Arc::new(TestClock::new()),
        }
    }

    /// Builds a pipeline using the harness doubles and `retry`.
    pub fn pipeline_with(&self, retry: RetryPolicy) -> DeliveryPipeline {
        let converters = ConverterSet::new()
            .with(self.document.clone())
            .with(self.archive.clone())
            .with(self.web_link.clone());

        DeliveryPipeline::new(
            ArtifactCache::new(self.store.clone()),
            self.store.clone(),
            self.producer.clone(),
            converters,
            self.channel.clone(),
            retry,
            self.clock.clone() as Arc<dyn Clock>,
        )
    }

    /// Builds a pipeline with the default retry policy.
    pub fn pipeline(&self) -> DeliveryPipeline {
        self.pipeline_with(RetryPolicy::default())
    }
}

impl Default for PipelineHarness {
    fn default() -> Self {
        Self::new()
    }
}
