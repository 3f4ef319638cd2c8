//! Command surface wired to in-memory doubles.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use tankobon_api::{AppState, CommandDispatcher};
use tankobon_core::{storage::MemoryStore, Clock};
use tankobon_delivery::{ArtifactCache, DeliveryConfig, DeliveryEngine};
use tankobon_discovery::ProviderRegistry;
use tankobon_testing::{fixtures, PipelineHarness, StubProvider};

pub const TOKEN_CAPACITY: usize = 64;
pub const TOKEN_TTL: Duration = Duration::from_secs(600);

pub struct Surface {
    pub harness: PipelineHarness,
    pub provider: Arc<StubProvider>,
    pub registry: Arc<ProviderRegistry>,
    pub engine: DeliveryEngine,
    pub dispatcher: Arc<CommandDispatcher>,
}

impl Surface {
    /// Provider "[EN] Alpha" with series 1 (15 chapters) and series 2
    /// (3 chapters), an engine that is not started, and a dispatcher.
    pub fn new() -> Self {
        let harness = PipelineHarness::new();
        let provider = Arc::new(StubProvider::new("Alpha", "manga.example"));
        provider.set_items(&fixtures::series(1), fixtures::items_newest_first(1, 1, 15));
        provider.set_items(&fixtures::series(2), fixtures::items_newest_first(2, 1, 3));

        let registry = Arc::new(ProviderRegistry::new().with(provider.clone()));
        let engine = DeliveryEngine::new(
            DeliveryConfig { worker_count: 2, ..DeliveryConfig::default() },
            harness.pipeline(),
        );
        let dispatcher = Arc::new(CommandDispatcher::new(
            registry.clone(),
            harness.store.clone(),
            harness.store.clone(),
            ArtifactCache::new(harness.store.clone()),
            engine.handle(),
            TOKEN_CAPACITY,
            TOKEN_TTL,
            harness.clock.clone() as Arc<dyn Clock>,
        ));

        Self { harness, provider, registry, engine, dispatcher }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.harness.store
    }

    pub fn state(&self) -> AppState {
        AppState {
            dispatcher: self.dispatcher.clone(),
            engine: self.engine.handle(),
            database: None,
            clock: self.harness.clock.clone() as Arc<dyn Clock>,
        }
    }
}
