//! Artifact cache keyed by content identity.
//!
//! A thin policy layer over the [`ArtifactStore`]: lookups never fail (a
//! store error counts as a miss and costs one extra conversion), and stores
//! always merge so concurrent producers of different formats for the same
//! item keep each other's handles.

use std::sync::Arc;

use tankobon_core::{storage::ArtifactStore, ArtifactEntry, ContentRef};
use tracing::{debug, warn};

use crate::error::Result;

/// Read-before-produce, write-after-produce cache of delivered artifacts.
#[derive(Clone)]
pub struct ArtifactCache {
    store: Arc<dyn ArtifactStore>,
}

impl ArtifactCache {
    /// Wraps a store.
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// Returns what is cached for `content_ref`; an empty entry on a miss.
    pub async fn lookup(&self, content_ref: &ContentRef) -> ArtifactEntry {
        match self.store.get(content_ref).await {
            Ok(Some(entry)) => {
                debug!(%content_ref, formats = entry.formats().bits(), "artifact cache hit");
                entry
            },
            Ok(None) => ArtifactEntry::new(content_ref.clone()),
            Err(error) => {
                warn!(%content_ref, error = %error, "artifact lookup failed, treating as miss");
                ArtifactEntry::new(content_ref.clone())
            },
        }
    }

    /// Merges newly produced handles into the cache and returns the stored
    /// entry. Empty entries are not written.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the upsert fails.
    pub async fn store(&self, entry: ArtifactEntry) -> Result<ArtifactEntry> {
        if entry.is_empty() {
            return Ok(entry);
        }
        let content_ref = entry.content_ref.clone();
        let merged = self.store.upsert(entry).await?;
        debug!(%content_ref, formats = merged.formats().bits(), "artifact cache updated");
        Ok(merged)
    }

    /// Forgets everything cached for `content_ref`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the delete fails.
    pub async fn invalidate(&self, content_ref: &ContentRef) -> Result<bool> {
        Ok(self.store.remove(content_ref).await?)
    }
}

#[cfg(test)]
mod tests {
    use tankobon_core::{storage::MemoryStore, ArtifactHandle, OutputFormats};

    use super::*;

    #[tokio::test]
    async fn miss_returns_empty_entry() {
        let cache = ArtifactCache::new(Arc::new(MemoryStore::new()));
        let entry = cache.lookup(&ContentRef::new("c/1")).await;
        assert!(entry.is_empty());
        assert_eq!(entry.content_ref, ContentRef::new("c/1"));
    }

    #[tokio::test]
    async fn empty_entries_are_not_written() {
        let store = Arc::new(MemoryStore::new());
        let cache = ArtifactCache::new(store.clone());

        cache.store(ArtifactEntry::new(ContentRef::new("c/1"))).await.unwrap();

        assert_eq!(store.artifact_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_formats_both_survive() {
        let cache = ArtifactCache::new(Arc::new(MemoryStore::new()));
        let content_ref = ContentRef::new("c/1");

        let mut document = ArtifactEntry::new(content_ref.clone());
        document.document = Some(ArtifactHandle::new("doc"));
        let mut archive = ArtifactEntry::new(content_ref.clone());
        archive.archive = Some(ArtifactHandle::new("zip"));

        let (a, b) = tokio::join!(cache.store(document.clone()), cache.store(archive));
        a.unwrap();
        b.unwrap();
        cache.store(document).await.unwrap();

        let entry = cache.lookup(&content_ref).await;
        assert_eq!(entry.formats(), OutputFormats::DOCUMENT | OutputFormats::ARCHIVE);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = ArtifactCache::new(Arc::new(MemoryStore::new()));
        let mut entry = ArtifactEntry::new(ContentRef::new("c/1"));
        entry.web_link = Some("https://telegra.ph/c1".into());
        cache.store(entry).await.unwrap();

        assert!(cache.invalidate(&ContentRef::new("c/1")).await.unwrap());
        assert!(cache.lookup(&ContentRef::new("c/1")).await.is_empty());
    }
}
