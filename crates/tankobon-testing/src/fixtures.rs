//! Small builders for series, items and jobs.

use tankobon_core::{ContentRef, ItemRef, Job, RecipientId, SeriesRef, Subscription};

/// Base URL used by every fixture.
pub const FIXTURE_HOST: &str = "https://manga.example";

/// Series number `n`.
pub fn series(n: u32) -> SeriesRef {
    SeriesRef::new(format!("{FIXTURE_HOST}/series/{n}"), format!("Series {n}"))
}

/// Content reference of chapter `chapter` of series `series_n`.
pub fn content_ref(series_n: u32, chapter: u32) -> ContentRef {
    ContentRef::new(format!("{FIXTURE_HOST}/series/{series_n}/chapter/{chapter}"))
}

/// Chapter `chapter` of series `series_n`.
pub fn item(series_n: u32, chapter: u32) -> ItemRef {
    ItemRef::new(content_ref(series_n, chapter), format!("Chapter {chapter}"), series(series_n))
}

/// Chapters `from..=to` of series `series_n`, newest first, the way
/// providers list them.
pub fn items_newest_first(series_n: u32, from: u32, to: u32) -> Vec<ItemRef> {
    (from..=to).rev().map(|chapter| item(series_n, chapter)).collect()
}

/// Job delivering chapter `chapter` of series 1 to `recipient`.
pub fn job(recipient: i64, chapter: u32) -> Job {
    Job::new(RecipientId(recipient), item(1, chapter))
}

/// `recipient` following series `series_n`.
pub fn subscription(series_n: u32, recipient: i64) -> Subscription {
    Subscription::new(series(series_n), RecipientId(recipient))
}
