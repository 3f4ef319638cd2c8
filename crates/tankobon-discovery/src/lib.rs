//! Chapter discovery for tankobon.
//!
//! [`SourceProvider`] abstracts one content site, [`ProviderRegistry`]
//! routes series URLs to providers, and [`DiscoveryLoop`] polls every
//! subscribed series on a fixed period and feeds new chapters to a
//! [`JobSink`](tankobon_core::JobSink).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod discovery;
pub mod error;
pub mod provider;

pub use discovery::{CycleReport, DiscoveryConfig, DiscoveryLoop};
pub use error::{Result, SourceError};
pub use provider::{
    paged_items_since, provider_id, ItemStream, ProviderRegistry, SourceFuture, SourceProvider,
};
