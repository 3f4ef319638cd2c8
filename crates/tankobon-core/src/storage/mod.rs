//! Persistent store interfaces.
//!
//! The scheduler treats every store as a remote service that may fail. No
//! in-process lock is held across a store call. Implementations must make
//! `upsert` and `set_marker` atomic per key.
//!
//! Two implementations ship with the crate: [`PgStore`] for production and
//! [`MemoryStore`] for tests and database-less runs.

use std::{future::Future, pin::Pin};

use crate::{
    error::Result,
    models::{ArtifactEntry, ContentRef, OutputFormats, RecipientId, Subscription},
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Boxed future returned by every store method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Cache of previously produced artifacts keyed by content identity.
pub trait ArtifactStore: Send + Sync {
    /// Returns the entry for `content_ref`, if any.
    fn get<'a>(&'a self, content_ref: &'a ContentRef) -> StoreFuture<'a, Option<ArtifactEntry>>;

    /// Merges `entry` into the stored one and returns the merged result.
    ///
    /// A handle already present is never replaced by an absent one.
    fn upsert(&self, entry: ArtifactEntry) -> StoreFuture<'_, ArtifactEntry>;

    /// Deletes the entry. Returns whether one existed.
    fn remove<'a>(&'a self, content_ref: &'a ContentRef) -> StoreFuture<'a, bool>;
}

/// Who follows which series.
pub trait SubscriptionStore: Send + Sync {
    /// Every subscription, for the discovery loop.
    fn list_subscriptions(&self) -> StoreFuture<'_, Vec<Subscription>>;

    /// Subscriptions of one recipient, ordered by series name.
    fn subscriptions_for(&self, recipient: RecipientId) -> StoreFuture<'_, Vec<Subscription>>;

    /// Adds a subscription. Returns `false` when it already existed.
    fn subscribe(&self, subscription: Subscription) -> StoreFuture<'_, bool>;

    /// Removes one subscription. Returns whether it existed.
    fn unsubscribe<'a>(
        &'a self,
        recipient: RecipientId,
        series_url: &'a str,
    ) -> StoreFuture<'a, bool>;

    /// Purges every subscription of a recipient. Returns how many were removed.
    fn remove_recipient(&self, recipient: RecipientId) -> StoreFuture<'_, u64>;
}

/// Last-seen item per series URL.
pub trait DiscoveryStateStore: Send + Sync {
    /// Current marker for `series_url`.
    fn get_marker<'a>(&'a self, series_url: &'a str) -> StoreFuture<'a, Option<ContentRef>>;

    /// Replaces the marker for `series_url`.
    fn set_marker<'a>(&'a self, series_url: &'a str, marker: ContentRef) -> StoreFuture<'a, ()>;
}

/// Per-recipient delivery preferences.
pub trait PreferenceStore: Send + Sync {
    /// Formats the recipient wants. Recipients who never chose get
    /// `OutputFormats::ALL`.
    fn output_formats(&self, recipient: RecipientId) -> StoreFuture<'_, OutputFormats>;

    /// Stores the recipient's format choice.
    fn set_output_formats(
        &self,
        recipient: RecipientId,
        formats: OutputFormats,
    ) -> StoreFuture<'_, ()>;
}

/// A backend implementing every store interface.
pub trait Store:
    ArtifactStore + SubscriptionStore + DiscoveryStateStore + PreferenceStore + 'static
{
}

impl<T> Store for T where
    T: ArtifactStore + SubscriptionStore + DiscoveryStateStore + PreferenceStore + 'static
{
}
