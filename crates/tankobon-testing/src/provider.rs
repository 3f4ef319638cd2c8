//! In-memory source provider.

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use tankobon_core::{ContentCard, ContentRef, ItemRef, SeriesRef};
use tankobon_discovery::{
    paged_items_since, ItemStream, SourceError, SourceFuture, SourceProvider,
};

/// Items per page returned by [`StubProvider::list_items`].
pub const STUB_PAGE_SIZE: usize = 10;

/// Provider backed by a map of series URL to items (newest first).
pub struct StubProvider {
    name: String,
    language: String,
    domain: String,
    series: Mutex<HashMap<String, (SeriesRef, Vec<ItemRef>)>>,
    failing: Mutex<HashSet<String>>,
    list_calls: AtomicUsize,
}

impl StubProvider {
    /// English provider owning every URL that contains `domain`.
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language: "en".to_string(),
            domain: domain.into(),
            series: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Same provider under another language code.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Replaces the items of `series`; `items` are newest first.
    pub fn set_items(&self, series: &SeriesRef, items: Vec<ItemRef>) {
        self.series.lock().insert(series.url.clone(), (series.clone(), items));
    }

    /// Publishes a new newest item.
    pub fn publish(&self, item: ItemRef) {
        let mut series = self.series.lock();
        let entry = series
            .entry(item.series.url.clone())
            .or_insert_with(|| (item.series.clone(), Vec::new()));
        entry.1.insert(0, item);
    }

    /// Every call touching `series_url` fails.
    pub fn fail(&self, series_url: impl Into<String>) {
        self.failing.lock().insert(series_url.into());
    }

    /// Number of `list_items` calls.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn check_failing(&self, url: &str) -> Result<(), SourceError> {
        if self.failing.lock().contains(url) {
            return Err(SourceError::request(self.id(), format!("{url} is down")));
        }
        Ok(())
    }
}

impl SourceProvider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn language(&self) -> &str {
        &self.language
    }

    fn search<'a>(&'a self, query: &'a str) -> SourceFuture<'a, Vec<ContentCard>> {
        Box::pin(async move {
            let needle = query.to_lowercase();
            let mut cards: Vec<ContentCard> = self
                .series
                .lock()
                .values()
                .filter(|(series, _)| series.name.to_lowercase().contains(&needle))
                .map(|(series, _)| ContentCard {
                    series: series.clone(),
                    provider: self.id(),
                    cover_url: None,
                })
                .collect();
            cards.sort_by(|a, b| a.series.name.cmp(&b.series.name));
            Ok(cards)
        })
    }

    fn list_items<'a>(
        &'a self,
        series: &'a SeriesRef,
        page: u32,
    ) -> SourceFuture<'a, Vec<ItemRef>> {
        Box::pin(async move {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.check_failing(&series.url)?;

            let start = (page.max(1) as usize - 1) * STUB_PAGE_SIZE;
            let items = self
                .series
                .lock()
                .get(&series.url)
                .map(|(_, items)| items.iter().skip(start).take(STUB_PAGE_SIZE).cloned().collect())
                .unwrap_or_default();
            Ok(items)
        })
    }

    fn iterate_items_since<'a>(
        &'a self,
        series: &'a SeriesRef,
        marker: Option<&'a ContentRef>,
    ) -> ItemStream<'a> {
        paged_items_since(self, series, marker)
    }

    fn contains(&self, url: &str) -> bool {
        url.contains(&self.domain)
    }
}
