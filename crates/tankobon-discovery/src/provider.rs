//! Source provider interface and registry.
//!
//! A provider knows one site: it searches series, lists chapters page by
//! page, and answers whether a series moved past a stored marker. Providers
//! are registered under an identifier of the form `"[EN] Name"`, grouped by
//! language, and can be paused without being unregistered.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    future::Future,
    pin::Pin,
    sync::Arc,
};

use futures::{stream, stream::BoxStream, StreamExt};
use parking_lot::RwLock;
use tankobon_core::{ContentCard, ContentRef, ItemRef, SeriesRef};
use tracing::info;

use crate::error::Result;

/// Boxed future returned by provider calls.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Lazy newest-first stream of items.
pub type ItemStream<'a> = BoxStream<'a, Result<ItemRef>>;

/// Upper bound on pages walked by [`paged_items_since`].
pub const MAX_PAGES: u32 = 50;

/// One content source.
pub trait SourceProvider: Send + Sync + 'static {
    /// Display name, unique within a language.
    fn name(&self) -> &str;

    /// Language code, e.g. `"en"`.
    fn language(&self) -> &str;

    /// Registry identifier, `"[EN] Name"`.
    fn id(&self) -> String {
        provider_id(self.language(), self.name())
    }

    /// Searches series by title.
    fn search<'a>(&'a self, query: &'a str) -> SourceFuture<'a, Vec<ContentCard>>;

    /// One page of a series' items, newest first. Pages start at 1; an
    /// empty page means there are no more.
    fn list_items<'a>(&'a self, series: &'a SeriesRef, page: u32)
        -> SourceFuture<'a, Vec<ItemRef>>;

    /// Whether the series has an item newer than `marker`.
    ///
    /// The default compares the newest listed item with the marker;
    /// providers with a cheaper update feed should override it.
    fn has_changed<'a>(
        &'a self,
        series: &'a SeriesRef,
        marker: &'a ContentRef,
    ) -> SourceFuture<'a, bool> {
        Box::pin(async move {
            let first = self.list_items(series, 1).await?;
            Ok(first.first().is_some_and(|newest| newest.content_ref != *marker))
        })
    }

    /// Items newer than `marker`, newest first, stopping at the marker.
    /// With no marker every item is yielded.
    fn iterate_items_since<'a>(
        &'a self,
        series: &'a SeriesRef,
        marker: Option<&'a ContentRef>,
    ) -> ItemStream<'a>;

    /// Whether `url` belongs to this provider.
    fn contains(&self, url: &str) -> bool;
}

/// Formats a registry identifier.
pub fn provider_id(language: &str, name: &str) -> String {
    format!("[{}] {name}", language.to_uppercase())
}

struct Cursor {
    page: u32,
    buffer: VecDeque<ItemRef>,
    done: bool,
}

/// Walks [`SourceProvider::list_items`] pages until `marker`, an empty page,
/// an error (yielded once, then the stream ends) or [`MAX_PAGES`].
///
/// Providers without a dedicated feed implement
/// [`SourceProvider::iterate_items_since`] with this.
pub fn paged_items_since<'a, P>(
    provider: &'a P,
    series: &'a SeriesRef,
    marker: Option<&'a ContentRef>,
) -> ItemStream<'a>
where
    P: SourceProvider + ?Sized,
{
    let cursor = Cursor { page: 1, buffer: VecDeque::new(), done: false };

    stream::unfold(cursor, move |mut cursor| async move {
        loop {
            if let Some(item) = cursor.buffer.pop_front() {
                if marker.is_some_and(|marker| *marker == item.content_ref) {
                    return None;
                }
                return Some((Ok(item), cursor));
            }
            if cursor.done || cursor.page > MAX_PAGES {
                return None;
            }

            match provider.list_items(series, cursor.page).await {
                Ok(items) if items.is_empty() => return None,
                Ok(items) => {
                    cursor.page += 1;
                    cursor.buffer.extend(items);
                },
                Err(error) => {
                    cursor.done = true;
                    return Some((Err(error), cursor));
                },
            }
        }
    })
    .boxed()
}

/// Registered providers keyed by identifier.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn SourceProvider>>,
    paused: RwLock<HashSet<String>>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `provider`, replacing one with the same identifier.
    pub fn register(&mut self, provider: Arc<dyn SourceProvider>) {
        let id = provider.id();
        info!(provider = %id, "registered source provider");
        self.providers.insert(id, provider);
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn SourceProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Provider by identifier, paused or not.
    pub fn get(&self, id: &str) -> Option<Arc<dyn SourceProvider>> {
        self.providers.get(id).cloned()
    }

    /// The active provider that owns `url`.
    pub fn route(&self, url: &str) -> Option<Arc<dyn SourceProvider>> {
        let paused = self.paused.read();
        self.providers
            .iter()
            .filter(|(id, _)| !paused.contains(*id))
            .find(|(_, provider)| provider.contains(url))
            .map(|(_, provider)| provider.clone())
    }

    /// Active provider identifiers grouped by language code.
    pub fn by_language(&self) -> BTreeMap<String, Vec<String>> {
        let paused = self.paused.read();
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (id, provider) in &self.providers {
            if !paused.contains(id) {
                grouped.entry(provider.language().to_lowercase()).or_default().push(id.clone());
            }
        }
        grouped
    }

    /// Active providers for one language.
    pub fn for_language(&self, language: &str) -> Vec<Arc<dyn SourceProvider>> {
        let paused = self.paused.read();
        self.providers
            .iter()
            .filter(|(id, provider)| {
                !paused.contains(*id) && provider.language().eq_ignore_ascii_case(language)
            })
            .map(|(_, provider)| provider.clone())
            .collect()
    }

    /// Stops routing to a provider. Returns `false` for unknown identifiers.
    pub fn pause(&self, id: &str) -> bool {
        if !self.providers.contains_key(id) {
            return false;
        }
        self.paused.write().insert(id.to_string());
        info!(provider = %id, "paused source provider");
        true
    }

    /// Resumes a paused provider. Returns whether it was paused.
    pub fn resume(&self, id: &str) -> bool {
        self.paused.write().remove(id)
    }

    /// Whether `id` is paused.
    pub fn is_paused(&self, id: &str) -> bool {
        self.paused.read().contains(id)
    }

    /// Every registered identifier, paused ones included.
    pub fn ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
