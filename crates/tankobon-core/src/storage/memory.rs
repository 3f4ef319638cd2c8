//! In-process store used by tests and when no database is configured.
//!
//! State is lost on restart, which the scheduler tolerates: markers are
//! re-seeded and artifacts are produced again.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::{
    ArtifactStore, DiscoveryStateStore, PreferenceStore, StoreFuture, SubscriptionStore,
};
use crate::models::{ArtifactEntry, ContentRef, OutputFormats, RecipientId, SeriesRef, Subscription};

/// Thread-safe in-memory implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    artifacts: RwLock<HashMap<ContentRef, ArtifactEntry>>,
    // series url -> (series, subscribers)
    subscriptions: RwLock<BTreeMap<String, (SeriesRef, Vec<RecipientId>)>>,
    markers: RwLock<HashMap<String, ContentRef>>,
    formats: RwLock<HashMap<RecipientId, OutputFormats>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached artifact entries.
    pub fn artifact_count(&self) -> usize {
        self.artifacts.read().len()
    }
}

impl ArtifactStore for MemoryStore {
    fn get<'a>(&'a self, content_ref: &'a ContentRef) -> StoreFuture<'a, Option<ArtifactEntry>> {
        let entry = self.artifacts.read().get(content_ref).cloned();
        Box::pin(async move { Ok(entry) })
    }

    fn upsert(&self, entry: ArtifactEntry) -> StoreFuture<'_, ArtifactEntry> {
        let merged = {
            let mut artifacts = self.artifacts.write();
            let stored = artifacts
                .entry(entry.content_ref.clone())
                .or_insert_with(|| ArtifactEntry::new(entry.content_ref.clone()));
            stored.merge(entry);
            stored.clone()
        };
        Box::pin(async move { Ok(merged) })
    }

    fn remove<'a>(&'a self, content_ref: &'a ContentRef) -> StoreFuture<'a, bool> {
        let existed = self.artifacts.write().remove(content_ref).is_some();
        Box::pin(async move { Ok(existed) })
    }
}

impl SubscriptionStore for MemoryStore {
    fn list_subscriptions(&self) -> StoreFuture<'_, Vec<Subscription>> {
        let all = self
            .subscriptions
            .read()
            .values()
            .flat_map(|(series, recipients)| {
                recipients.iter().map(|recipient| Subscription::new(series.clone(), *recipient))
            })
            .collect();
        Box::pin(async move { Ok(all) })
    }

    fn subscriptions_for(&self, recipient: RecipientId) -> StoreFuture<'_, Vec<Subscription>> {
        let mut mine: Vec<Subscription> = self
            .subscriptions
            .read()
            .values()
            .filter(|(_, recipients)| recipients.contains(&recipient))
            .map(|(series, _)| Subscription::new(series.clone(), recipient))
            .collect();
        mine.sort_by(|a, b| a.series.name.cmp(&b.series.name));
        Box::pin(async move { Ok(mine) })
    }

    fn subscribe(&self, subscription: Subscription) -> StoreFuture<'_, bool> {
        let added = {
            let mut subscriptions = self.subscriptions.write();
            let (series, recipients) = subscriptions
                .entry(subscription.series.url.clone())
                .or_insert_with(|| (subscription.series.clone(), Vec::new()));
            series.name = subscription.series.name;
            if recipients.contains(&subscription.recipient) {
                false
            } else {
                recipients.push(subscription.recipient);
                true
            }
        };
        Box::pin(async move { Ok(added) })
    }

    fn unsubscribe<'a>(
        &'a self,
        recipient: RecipientId,
        series_url: &'a str,
    ) -> StoreFuture<'a, bool> {
        let removed = {
            let mut subscriptions = self.subscriptions.write();
            match subscriptions.get_mut(series_url) {
                Some((_, recipients)) => {
                    let before = recipients.len();
                    recipients.retain(|r| *r != recipient);
                    let removed = recipients.len() != before;
                    if recipients.is_empty() {
                        subscriptions.remove(series_url);
                    }
                    removed
                },
                None => false,
            }
        };
        Box::pin(async move { Ok(removed) })
    }

    fn remove_recipient(&self, recipient: RecipientId) -> StoreFuture<'_, u64> {
        let removed = {
            let mut subscriptions = self.subscriptions.write();
            let mut removed = 0;
            for (_, recipients) in subscriptions.values_mut() {
                let before = recipients.len();
                recipients.retain(|r| *r != recipient);
                removed += (before - recipients.len()) as u64;
            }
            subscriptions.retain(|_, (_, recipients)| !recipients.is_empty());
            removed
        };
        Box::pin(async move { Ok(removed) })
    }
}

impl DiscoveryStateStore for MemoryStore {
    fn get_marker<'a>(&'a self, series_url: &'a str) -> StoreFuture<'a, Option<ContentRef>> {
        let marker = self.markers.read().get(series_url).cloned();
        Box::pin(async move { Ok(marker) })
    }

    fn set_marker<'a>(&'a self, series_url: &'a str, marker: ContentRef) -> StoreFuture<'a, ()> {
        self.markers.write().insert(series_url.to_string(), marker);
        Box::pin(async move { Ok(()) })
    }
}

impl PreferenceStore for MemoryStore {
    fn output_formats(&self, recipient: RecipientId) -> StoreFuture<'_, OutputFormats> {
        let formats = self.formats.read().get(&recipient).copied().unwrap_or_default();
        Box::pin(async move { Ok(formats) })
    }

    fn set_output_formats(
        &self,
        recipient: RecipientId,
        formats: OutputFormats,
    ) -> StoreFuture<'_, ()> {
        self.formats.write().insert(recipient, formats);
        Box::pin(async move { Ok(()) })
    }
}
