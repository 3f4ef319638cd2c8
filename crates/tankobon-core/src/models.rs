//! Domain models and strongly-typed identifiers.
//!
//! Defines the delivery job, the content references it points at, the
//! artifact cache entry and the output format bitmask. Identifiers are
//! newtypes so a recipient id can never be passed where a job id is expected.

use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Opaque recipient identifier (one chat).
///
/// Jobs for the same recipient are serialized against each other; this id is
/// the serialization key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(pub i64);

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RecipientId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for RecipientId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RecipientId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for RecipientId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Unique id attached to every job for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of one content item, its canonical URL.
///
/// Used as the artifact cache key and as the discovery marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentRef(String);

impl ContentRef {
    /// Wraps a content URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    /// Returns the underlying URL.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentRef {
    fn from(url: &str) -> Self {
        Self(url.to_string())
    }
}

impl From<String> for ContentRef {
    fn from(url: String) -> Self {
        Self(url)
    }
}

/// A series (manga) as known to a source provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesRef {
    /// Canonical series URL, the subscription key.
    pub url: String,
    /// Human readable title.
    pub name: String,
}

impl SeriesRef {
    /// Creates a series reference.
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self { url: url.into(), name: name.into() }
    }
}

/// One discrete item (chapter) belonging to a series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    /// Item identity, also its source URL.
    pub content_ref: ContentRef,
    /// Chapter title as shown by the source.
    pub name: String,
    /// Series this item belongs to.
    pub series: SeriesRef,
}

impl ItemRef {
    /// Creates an item reference.
    pub fn new(content_ref: impl Into<ContentRef>, name: impl Into<String>, series: SeriesRef) -> Self {
        Self { content_ref: content_ref.into(), name: name.into(), series }
    }

    /// Short "series - chapter" title used in captions and failure notices.
    pub fn title(&self) -> String {
        format!("{} - {}", self.series.name, self.name)
    }
}

/// Search result returned by a source provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentCard {
    /// The series that matched.
    pub series: SeriesRef,
    /// Identifier of the provider that owns the series.
    pub provider: String,
    /// Cover image, when the source exposes one.
    pub cover_url: Option<String>,
}

/// One unit of "produce and deliver this item to this recipient" work.
///
/// Jobs are immutable once created. Ownership moves from the producer to the
/// queue and from the queue to exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Correlation id for logs.
    pub id: JobId,
    /// Destination and serialization key.
    pub recipient: RecipientId,
    /// The item to deliver.
    pub item: ItemRef,
    /// When the producer created the job.
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new job stamped with the current time.
    pub fn new(recipient: RecipientId, item: ItemRef) -> Self {
        Self { id: JobId::new(), recipient, item, enqueued_at: Utc::now() }
    }

    /// Cache key of the item this job delivers.
    pub fn content_ref(&self) -> &ContentRef {
        &self.item.content_ref
    }
}

/// A single output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Paged document (PDF-like).
    Document,
    /// Image archive (CBZ-like).
    Archive,
    /// Web-readable page link.
    WebLink,
}

impl OutputFormat {
    /// Every format, in delivery order.
    pub const ALL: [Self; 3] = [Self::Document, Self::Archive, Self::WebLink];

    /// The bitmask flag for this format.
    pub const fn flag(self) -> OutputFormats {
        match self {
            Self::Document => OutputFormats::DOCUMENT,
            Self::Archive => OutputFormats::ARCHIVE,
            Self::WebLink => OutputFormats::WEB_LINK,
        }
    }

    /// Whether the format is delivered as a file attachment.
    pub const fn is_file(self) -> bool {
        !matches!(self, Self::WebLink)
    }

    /// Lowercase name, as used in logs and the HTTP surface.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Archive => "archive",
            Self::WebLink => "web_link",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" | "pdf" => Ok(Self::Document),
            "archive" | "cbz" => Ok(Self::Archive),
            "web_link" | "telegraph" => Ok(Self::WebLink),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// Bitmask of independent output format flags.
///
/// Any subset is valid. An empty mask still acknowledges the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputFormats(u32);

impl OutputFormats {
    /// No formats.
    pub const NONE: Self = Self(0);
    /// Paged document.
    pub const DOCUMENT: Self = Self(1);
    /// Image archive.
    pub const ARCHIVE: Self = Self(2);
    /// Web-readable link.
    pub const WEB_LINK: Self = Self(4);
    /// Every format.
    pub const ALL: Self = Self(7);

    /// Builds a mask from raw bits, dropping unknown flags.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every flag of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Flags set in `self` but not in `other`.
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Flips the flags in `other`.
    pub const fn toggle(self, other: Self) -> Self {
        Self((self.0 ^ other.0) & Self::ALL.0)
    }

    /// Iterates the individual formats present in the mask.
    pub fn iter(self) -> impl Iterator<Item = OutputFormat> {
        OutputFormat::ALL.into_iter().filter(move |format| self.contains(format.flag()))
    }
}

impl Default for OutputFormats {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for OutputFormats {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OutputFormats {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<OutputFormat> for OutputFormats {
    fn from(format: OutputFormat) -> Self {
        format.flag()
    }
}

impl FromIterator<OutputFormat> for OutputFormats {
    fn from_iter<I: IntoIterator<Item = OutputFormat>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, |mask, format| mask | format.flag())
    }
}

/// Channel-side handle of an uploaded file, reusable for later sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactHandle(pub String);

impl ArtifactHandle {
    /// Wraps a channel file id.
    pub fn new(file_id: impl Into<String>) -> Self {
        Self(file_id.into())
    }
}

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Previously produced artifacts for one content item.
///
/// The presence bitmap is derived from which handles are set, so it can
/// never disagree with the handles themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Cache key.
    pub content_ref: ContentRef,
    /// Uploaded document handle.
    pub document: Option<ArtifactHandle>,
    /// Uploaded archive handle.
    pub archive: Option<ArtifactHandle>,
    /// Published web page.
    pub web_link: Option<String>,
}

impl ArtifactEntry {
    /// Creates an empty entry.
    pub fn new(content_ref: ContentRef) -> Self {
        Self { content_ref, document: None, archive: None, web_link: None }
    }

    /// Formats materialized in this entry.
    pub fn formats(&self) -> OutputFormats {
        let mut formats = OutputFormats::NONE;
        if self.document.is_some() {
            formats |= OutputFormats::DOCUMENT;
        }
        if self.archive.is_some() {
            formats |= OutputFormats::ARCHIVE;
        }
        if self.web_link.is_some() {
            formats |= OutputFormats::WEB_LINK;
        }
        formats
    }

    /// True when nothing has been produced yet.
    pub fn is_empty(&self) -> bool {
        self.formats().is_empty()
    }

    /// Cached file handle for a file format.
    pub fn handle(&self, format: OutputFormat) -> Option<&ArtifactHandle> {
        match format {
            OutputFormat::Document => self.document.as_ref(),
            OutputFormat::Archive => self.archive.as_ref(),
            OutputFormat::WebLink => None,
        }
    }

    /// Sets the handle for a file format. Ignored for `WebLink`.
    pub fn set_handle(&mut self, format: OutputFormat, handle: ArtifactHandle) {
        match format {
            OutputFormat::Document => self.document = Some(handle),
            OutputFormat::Archive => self.archive = Some(handle),
            OutputFormat::WebLink => {},
        }
    }

    /// Folds `other` into `self`. A present value is never replaced by `None`.
    pub fn merge(&mut self, other: Self) {
        if other.document.is_some() {
            self.document = other.document;
        }
        if other.archive.is_some() {
            self.archive = other.archive;
        }
        if other.web_link.is_some() {
            self.web_link = other.web_link;
        }
    }
}

/// A recipient's subscription to a series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    /// Followed series.
    pub series: SeriesRef,
    /// Subscriber.
    pub recipient: RecipientId,
}

impl Subscription {
    /// Creates a subscription.
    pub fn new(series: SeriesRef, recipient: RecipientId) -> Self {
        Self { series, recipient }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_formats_are_all() {
        assert_eq!(OutputFormats::default(), OutputFormats::ALL);
        assert_eq!(OutputFormats::ALL.iter().count(), 3);
    }

    #[test]
    fn toggle_flips_single_flag() {
        let formats = OutputFormats::ALL.toggle(OutputFormats::ARCHIVE);
        assert!(formats.contains(OutputFormats::DOCUMENT));
        assert!(!formats.contains(OutputFormats::ARCHIVE));
        assert_eq!(formats.toggle(OutputFormats::ARCHIVE), OutputFormats::ALL);
    }

    #[test]
    fn unknown_bits_are_dropped() {
        assert_eq!(OutputFormats::from_bits_truncate(0xff), OutputFormats::ALL);
        assert!(OutputFormats::from_bits_truncate(8).is_empty());
    }

    #[test]
    fn difference_lists_missing_formats() {
        let missing = OutputFormats::ALL.difference(OutputFormats::DOCUMENT);
        assert_eq!(missing.iter().collect::<Vec<_>>(), vec![
            OutputFormat::Archive,
            OutputFormat::WebLink
        ]);
    }

    #[test]
    fn merge_never_drops_present_handles() {
        let content_ref = ContentRef::new("https://example.org/c/1");
        let mut entry = ArtifactEntry::new(content_ref.clone());
        entry.document = Some(ArtifactHandle::new("doc-1"));

        let mut update = ArtifactEntry::new(content_ref);
        update.archive = Some(ArtifactHandle::new("zip-1"));
        entry.merge(update);

        assert_eq!(entry.formats(), OutputFormats::DOCUMENT | OutputFormats::ARCHIVE);
        assert_eq!(entry.document, Some(ArtifactHandle::new("doc-1")));
    }

    #[test]
    fn item_title_joins_series_and_chapter() {
        let item = ItemRef::new(
            "https://example.org/c/1",
            "Chapter 1",
            SeriesRef::new("https://example.org/s", "Series"),
        );
        assert_eq!(item.title(), "Series - Chapter 1");
    }

    #[test]
    fn output_format_parses_legacy_names() {
        assert_eq!("pdf".parse::<OutputFormat>(), Ok(OutputFormat::Document));
        assert_eq!("cbz".parse::<OutputFormat>(), Ok(OutputFormat::Archive));
        assert!("epub".parse::<OutputFormat>().is_err());
    }
}
