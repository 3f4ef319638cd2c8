//! Store wrapper with injectable failures.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tankobon_core::{
    storage::{
        ArtifactStore, DiscoveryStateStore, MemoryStore, PreferenceStore, StoreFuture,
        SubscriptionStore,
    },
    ArtifactEntry, ContentRef, CoreError, OutputFormats, RecipientId, Subscription,
};

/// Wraps a [`MemoryStore`] and fails selected calls with
/// `CoreError::Database`.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: Arc<MemoryStore>,
    artifacts_down: AtomicBool,
    preferences_down: AtomicBool,
    subscriptions_down: AtomicBool,
    marker_failures: Mutex<HashSet<String>>,
}

impl FailingStore {
    /// Healthy store around a fresh [`MemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped store, for seeding and inspection.
    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    /// Fail every artifact call.
    pub fn fail_artifacts(&self, down: bool) {
        self.artifacts_down.store(down, Ordering::SeqCst);
    }

    /// Fail every preference call.
    pub fn fail_preferences(&self, down: bool) {
        self.preferences_down.store(down, Ordering::SeqCst);
    }

    /// Fail `list_subscriptions` and `remove_recipient`.
    pub fn fail_subscriptions(&self, down: bool) {
        self.subscriptions_down.store(down, Ordering::SeqCst);
    }

    /// Fail marker reads and writes for one series URL.
    pub fn fail_markers_for(&self, series_url: impl Into<String>) {
        self.marker_failures.lock().insert(series_url.into());
    }

    fn down<T: Send + 'static>(what: &str) -> StoreFuture<'static, T> {
        let error = CoreError::Database(format!("{what} unavailable"));
        Box::pin(async move { Err(error) })
    }
}

impl ArtifactStore for FailingStore {
    fn get<'a>(&'a self, content_ref: &'a ContentRef) -> StoreFuture<'a, Option<ArtifactEntry>> {
        if self.artifacts_down.load(Ordering::SeqCst) {
            return Self::down("artifact store");
        }
        self.inner.get(content_ref)
    }

    fn upsert(&self, entry: ArtifactEntry) -> StoreFuture<'_, ArtifactEntry> {
        if self.artifacts_down.load(Ordering::SeqCst) {
            return Self::down("artifact store");
        }
        self.inner.upsert(entry)
    }

    fn remove<'a>(&'a self, content_ref: &'a ContentRef) -> StoreFuture<'a, bool> {
        if self.artifacts_down.load(Ordering::SeqCst) {
            return Self::down("artifact store");
        }
        self.inner.remove(content_ref)
    }
}

impl SubscriptionStore for FailingStore {
    fn list_subscriptions(&self) -> StoreFuture<'_, Vec<Subscription>> {
        if self.subscriptions_down.load(Ordering::SeqCst) {
            return Self::down("subscription store");
        }
        self.inner.list_subscriptions()
    }

    fn subscriptions_for(&self, recipient: RecipientId) -> StoreFuture<'_, Vec<Subscription>> {
        self.inner.subscriptions_for(recipient)
    }

    fn subscribe(&self, subscription: Subscription) -> StoreFuture<'_, bool> {
        self.inner.subscribe(subscription)
    }

    fn unsubscribe<'a>(
        &'a self,
        recipient: RecipientId,
        series_url: &'a str,
    ) -> StoreFuture<'a, bool> {
        self.inner.unsubscribe(recipient, series_url)
    }

    fn remove_recipient(&self, recipient: RecipientId) -> StoreFuture<'_, u64> {
        if self.subscriptions_down.load(Ordering::SeqCst) {
            return Self::down("subscription store");
        }
        self.inner.remove_recipient(recipient)
    }
}

impl DiscoveryStateStore for FailingStore {
    fn get_marker<'a>(&'a self, series_url: &'a str) -> StoreFuture<'a, Option<ContentRef>> {
        if self.marker_failures.lock().contains(series_url) {
            return Self::down("marker store");
        }
        self.inner.get_marker(series_url)
    }

    fn set_marker<'a>(&'a self, series_url: &'a str, marker: ContentRef) -> StoreFuture<'a, ()> {
        if self.marker_failures.lock().contains(series_url) {
            return Self::down("marker store");
        }
        self.inner.set_marker(series_url, marker)
    }
}

impl PreferenceStore for FailingStore {
    fn output_formats(&self, recipient: RecipientId) -> StoreFuture<'_, OutputFormats> {
        if self.preferences_down.load(Ordering::SeqCst) {
            return Self::down("preference store");
        }
        self.inner.output_formats(recipient)
    }

    fn set_output_formats(
        &self,
        recipient: RecipientId,
        formats: OutputFormats,
    ) -> StoreFuture<'_, ()> {
        if self.preferences_down.load(Ordering::SeqCst) {
            return Self::down("preference store");
        }
        self.inner.set_output_formats(recipient, formats)
    }
}
