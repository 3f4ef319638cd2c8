//! Chapter delivery scheduler.
//!
//! Takes delivery jobs (one chapter for one recipient), serializes them per
//! recipient, runs them on a bounded worker pool, reuses previously uploaded
//! artifacts, and absorbs the outbound channel's rate limits.
//!
//! # Architecture
//!
//! 1. **Queue** - [`RecipientQueue`] keeps a FIFO per recipient and a
//!    round-robin ring of recipients that have work and are not in flight
//! 2. **Workers** - N symmetric tasks loop dequeue, pipeline, release
//! 3. **Pipeline** - [`DeliveryPipeline`] consults the [`ArtifactCache`],
//!    fetches and converts only missing formats, and sends the rest
//! 4. **Retry** - [`RetryPolicy`] honours the channel's declared wait on
//!    `RateLimited` and nothing else
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tankobon_core::{storage::MemoryStore, RealClock};
//! use tankobon_delivery::{
//!     ArtifactCache, ClientConfig, ContentProducer, ConverterSet, DeliveryConfig,
//!     DeliveryEngine, DeliveryError, DeliveryPipeline, HttpChannel, RetryPolicy,
//! };
//!
//! # async fn example(producer: Arc<dyn ContentProducer>) -> Result<(), DeliveryError> {
//! let store = Arc::new(MemoryStore::new());
//! let channel = Arc::new(HttpChannel::new(ClientConfig::default())?);
//! let pipeline = DeliveryPipeline::new(
//!     ArtifactCache::new(store.clone()),
//!     store,
//!     producer,
//!     ConverterSet::new(),
//!     channel,
//!     RetryPolicy::default(),
//!     Arc::new(RealClock::new()),
//! );
//!
//! let mut engine = DeliveryEngine::new(DeliveryConfig::default(), pipeline);
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod channel;
pub mod client;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod worker;
mod worker_pool;

pub use cache::ArtifactCache;
pub use channel::{Attachment, DeliveryReceipt, OutboundChannel, OutgoingDocument};
pub use client::{ClientConfig, HttpChannel};
pub use engine::{DeliveryEngine, EngineHandle};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use pipeline::{
    ContentProducer, Converter, ConverterSet, DeliveryOutcome, DeliveryPipeline, Produced,
    RawContent,
};
pub use queue::{Claim, RecipientQueue};
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::{BlockList, DeliveryConfig, EngineStats};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default cap on a single rate-limit wait, in seconds.
pub const DEFAULT_MAX_RETRY_WAIT_SECONDS: u64 = 300;

/// Default time allowed for workers to finish on shutdown, in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;
