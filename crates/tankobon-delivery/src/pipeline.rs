//! Per-job delivery pipeline.
//!
//! For one job: look the item up in the artifact cache, work out which of
//! the recipient's formats are missing, fetch the source pages once if
//! anything must be produced, run one converter per missing format, send
//! cached and fresh artifacts through the retry policy, then merge the new
//! handles back into the cache.
//!
//! Fetched pages live in [`RawContent`], whose scratch directory is removed
//! when it is dropped, so every exit path cleans up.

use std::{collections::HashMap, fmt, future::Future, path::Path, pin::Pin, sync::Arc};

use bytes::Bytes;
use tankobon_core::{
    storage::PreferenceStore, ArtifactEntry, Clock, ItemRef, Job, OutputFormat, OutputFormats,
    RecipientId,
};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::{
    cache::ArtifactCache,
    channel::{DeliveryReceipt, OutboundChannel, OutgoingDocument},
    error::{DeliveryError, Result},
    retry::RetryPolicy,
};

/// Boxed future returned by producers and converters.
pub type PipelineFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Source pages of one item, plus an optional scratch directory that is
/// deleted on drop.
pub struct RawContent {
    /// Page images in reading order.
    pub pages: Vec<Bytes>,
    scratch: Option<TempDir>,
}

impl RawContent {
    /// Pages held in memory only.
    pub fn new(pages: Vec<Bytes>) -> Self {
        Self { pages, scratch: None }
    }

    /// Pages backed by a scratch directory owned by this value.
    pub fn with_scratch(pages: Vec<Bytes>, scratch: TempDir) -> Self {
        Self { pages, scratch: Some(scratch) }
    }

    /// Scratch directory, if any.
    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    /// True when the source yielded nothing usable.
    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(Bytes::is_empty)
    }
}

impl fmt::Debug for RawContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawContent")
            .field("pages", &self.pages.len())
            .field("scratch", &self.scratch_path())
            .finish()
    }
}

/// Output of one converter run.
#[derive(Clone, PartialEq, Eq)]
pub enum Produced {
    /// A file to upload.
    File(Bytes),
    /// A published link.
    Link(String),
}

impl fmt::Debug for Produced {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(bytes) => f.debug_tuple("File").field(&bytes.len()).finish(),
            Self::Link(url) => f.debug_tuple("Link").field(url).finish(),
        }
    }
}

/// Fetches the source pages of an item.
pub trait ContentProducer: Send + Sync + 'static {
    /// Downloads every page of `item`.
    ///
    /// # Errors
    ///
    /// Any error is reported to the recipient as unavailable content.
    fn fetch<'a>(&'a self, item: &'a ItemRef) -> PipelineFuture<'a, RawContent>;
}

/// Builds one output format from raw pages.
pub trait Converter: Send + Sync + 'static {
    /// Format this converter produces.
    fn format(&self) -> OutputFormat;

    /// Produces the artifact.
    ///
    /// # Errors
    ///
    /// Any error is reported as a conversion failure for this format only.
    fn convert<'a>(&'a self, item: &'a ItemRef, content: &'a RawContent)
        -> PipelineFuture<'a, Produced>;
}

/// Converters keyed by the format they produce.
#[derive(Clone, Default)]
pub struct ConverterSet {
    converters: HashMap<OutputFormat, Arc<dyn Converter>>,
}

impl ConverterSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `converter`, replacing any previous one for its format.
    pub fn with(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converters.insert(converter.format(), converter);
        self
    }

    /// Formats that have a converter.
    pub fn formats(&self) -> OutputFormats {
        self.converters.keys().copied().collect()
    }

    async fn convert(
        &self,
        format: OutputFormat,
        item: &ItemRef,
        content: &RawContent,
    ) -> Result<Produced> {
        let converter = self.converters.get(&format).ok_or_else(|| {
            DeliveryError::conversion(format, "no converter registered for format")
        })?;
        match converter.convert(item, content).await {
            Ok(Produced::File(bytes)) if format.is_file() && !bytes.is_empty() => {
                Ok(Produced::File(bytes))
            },
            Ok(Produced::Link(url)) if !format.is_file() && !url.is_empty() => {
                Ok(Produced::Link(url))
            },
            Ok(other) => {
                Err(DeliveryError::conversion(format, format!("unusable converter output {other:?}")))
            },
            Err(DeliveryError::ConversionFailed { message, .. }) => {
                Err(DeliveryError::conversion(format, message))
            },
            Err(error) => Err(DeliveryError::conversion(format, error.to_string())),
        }
    }
}

/// How a job ended, when it did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Artifacts (or the web link) reached the recipient.
    Delivered {
        /// Formats the recipient received.
        sent: OutputFormats,
        /// Formats produced by this job rather than taken from the cache.
        produced: OutputFormats,
        /// Formats whose conversion failed and were reported.
        failed: OutputFormats,
    },
    /// The recipient asked for no formats; a plain notice was sent.
    Acknowledged,
    /// Every requested format failed to convert; each failure was reported.
    NothingDelivered {
        /// Formats whose conversion failed.
        failed: OutputFormats,
    },
}

/// Text that introduces an item: title and source link.
pub fn source_caption(item: &ItemRef) -> String {
    format!("{}\n{}", item.title(), item.content_ref)
}

/// Caption attached to a successful delivery.
pub fn success_caption(item: &ItemRef, web_link: Option<&str>) -> String {
    let mut caption = format!("{}\n", item.title());
    if let Some(link) = web_link {
        caption.push_str(&format!("[Read on telegraph]({link})\n"));
    }
    caption.push_str(&format!("[Read on website]({})", item.content_ref));
    caption
}

/// Best-effort notice sent to the recipient for a terminal job failure.
///
/// Returns `None` for errors that must not produce a message (a blocked
/// recipient cannot be reached anyway).
pub fn failure_notice(item: &ItemRef, error: &DeliveryError) -> Option<String> {
    let footer = source_caption(item);
    let text = match error {
        DeliveryError::RecipientBlocked { .. } => return None,
        DeliveryError::ContentUnavailable { .. } => format!(
            "There was an error parsing this chapter or chapter is missing, please check the \
             chapter at the web\n\n{footer}"
        ),
        DeliveryError::ConversionFailed { format, .. } => format!(
            "There was an error making the {} for this chapter. Forward this message to the bot \
             group to report the error.\n\n{footer}",
            format_label(*format)
        ),
        _ => format!(
            "There was an error delivering this chapter, please read it at the web\n\n{footer}"
        ),
    };
    Some(text)
}

fn format_label(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Document => "pdf",
        OutputFormat::Archive => "cbz",
        OutputFormat::WebLink => "telegraph page",
    }
}

fn file_extension(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Document => "pdf",
        OutputFormat::Archive => "cbz",
        OutputFormat::WebLink => "html",
    }
}

fn clean(text: &str, max_chars: usize) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | '(' | ')'))
        .collect();
    cleaned.trim().chars().take(max_chars).collect::<String>().trim_end().to_string()
}

/// File name for a fresh upload: short series name, chapter, extension.
pub fn file_name(item: &ItemRef, format: OutputFormat) -> String {
    let stem = clean(&format!("{} - {}", clean(&item.series.name, 25), item.name), 45);
    format!("{stem}.{}", file_extension(format))
}

/// Everything a worker needs to deliver one job.
#[derive(Clone)]
pub struct DeliveryPipeline {
    cache: ArtifactCache,
    preferences: Arc<dyn PreferenceStore>,
    producer: Arc<dyn ContentProducer>,
    converters: ConverterSet,
    channel: Arc<dyn OutboundChannel>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl DeliveryPipeline {
    /// Assembles a pipeline from its collaborators.
    pub fn new(
        cache: ArtifactCache,
        preferences: Arc<dyn PreferenceStore>,
        producer: Arc<dyn ContentProducer>,
        converters: ConverterSet,
        channel: Arc<dyn OutboundChannel>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { cache, preferences, producer, converters, channel, retry, clock }
    }

    /// The artifact cache used by this pipeline.
    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Delivers one job.
    ///
    /// Conversion failures are reported to the recipient from here because
    /// the job carries on with its other formats.
    ///
    /// # Errors
    ///
    /// Returns `ContentUnavailable` when the source yields nothing,
    /// `RecipientBlocked` when the channel says so, and any non-retryable
    /// channel error. Rate limits are absorbed by the retry policy.
    pub async fn process(&self, job: &Job) -> Result<DeliveryOutcome> {
        let item = &job.item;
        let recipient = job.recipient;
        let content_ref = job.content_ref();

        let requested = match self.preferences.output_formats(recipient).await {
            Ok(formats) => formats,
            Err(error) => {
                warn!(%recipient, error = %error, "format lookup failed, sending every format");
                OutputFormats::ALL
            },
        };

        if requested.is_empty() {
            self.send_text(recipient, &source_caption(item)).await?;
            debug!(%recipient, %content_ref, "no formats requested, acknowledged");
            return Ok(DeliveryOutcome::Acknowledged);
        }

        let cached = self.cache.lookup(content_ref).await;
        let missing = requested.difference(cached.formats());
        let mut fresh = ArtifactEntry::new(content_ref.clone());
        let mut uploads: Vec<(OutputFormat, Bytes)> = Vec::new();
        let mut failed = OutputFormats::NONE;

        if !missing.is_empty() {
            let raw = self
                .producer
                .fetch(item)
                .await
                .map_err(|error| DeliveryError::content_unavailable(content_ref, error.to_string()))?;
            if raw.is_empty() {
                return Err(DeliveryError::content_unavailable(content_ref, "source yielded no pages"));
            }
            debug!(%content_ref, pages = raw.pages.len(), missing = missing.bits(), "producing artifacts");

            for format in missing.iter() {
                match self.converters.convert(format, item, &raw).await {
                    Ok(Produced::File(bytes)) => uploads.push((format, bytes)),
                    Ok(Produced::Link(url)) => fresh.web_link = Some(url),
                    Err(error) => {
                        warn!(%content_ref, %format, error = %error, "conversion failed");
                        failed |= format.flag();
                        self.report(job, &error).await?;
                    },
                }
            }
        }

        let web_link = if requested.contains(OutputFormats::WEB_LINK) {
            cached.web_link.as_deref().or(fresh.web_link.as_deref())
        } else {
            None
        };
        let caption = success_caption(item, web_link);

        let documents: Vec<OutgoingDocument> = requested
            .iter()
            .filter(|format| format.is_file())
            .filter_map(|format| match cached.handle(format) {
                Some(handle) => Some(OutgoingDocument::cached(format, handle.clone())),
                None => uploads.iter().find(|(f, _)| *f == format).map(|(_, bytes)| {
                    OutgoingDocument::upload(format, file_name(item, format), bytes.clone())
                }),
            })
            .collect();

        let mut sent: OutputFormats = documents.iter().map(|document| document.format).collect();
        if web_link.is_some() {
            sent |= OutputFormats::WEB_LINK;
        }

        if sent.is_empty() {
            info!(%recipient, %content_ref, failed = failed.bits(), "nothing left to deliver");
            return Ok(DeliveryOutcome::NothingDelivered { failed });
        }

        if documents.is_empty() {
            self.send_text(recipient, &caption).await?;
        } else {
            let receipt = self.send_documents(recipient, &documents, &caption).await?;
            record_handles(&mut fresh, &documents, &receipt);
        }

        let produced = fresh.formats();
        if let Err(error) = self.cache.store(fresh).await {
            warn!(%content_ref, error = %error, "failed to cache produced artifacts");
        }

        info!(
            %recipient,
            %content_ref,
            sent = sent.bits(),
            produced = produced.bits(),
            "chapter delivered"
        );
        Ok(DeliveryOutcome::Delivered { sent, produced, failed })
    }

    /// Sends the failure notice for `error`, if it warrants one.
    ///
    /// # Errors
    ///
    /// Only `RecipientBlocked` is returned; other send failures are logged.
    pub async fn report(&self, job: &Job, error: &DeliveryError) -> Result<()> {
        let Some(text) = failure_notice(&job.item, error) else {
            return Ok(());
        };
        match self.send_text(job.recipient, &text).await {
            Err(send_error) if send_error.is_blocked() => Err(send_error),
            Err(send_error) => {
                warn!(
                    recipient = %job.recipient,
                    error = %send_error,
                    "failed to send failure notice"
                );
                Ok(())
            },
            Ok(()) => Ok(()),
        }
    }

    async fn send_text(&self, recipient: RecipientId, text: &str) -> Result<()> {
        self.retry
            .execute(self.clock.as_ref(), |_| self.channel.send_text(recipient, text))
            .await
    }

    async fn send_documents(
        &self,
        recipient: RecipientId,
        documents: &[OutgoingDocument],
        caption: &str,
    ) -> Result<DeliveryReceipt> {
        if self.channel.supports_batch() || documents.len() == 1 {
            return self
                .retry
                .execute(self.clock.as_ref(), |_| self.channel.send(recipient, documents, caption))
                .await;
        }

        let mut receipt = DeliveryReceipt::default();
        let last = documents.len() - 1;
        for (index, document) in documents.iter().enumerate() {
            let caption = if index == last { caption } else { "" };
            let single = std::slice::from_ref(document);
            let part = self
                .retry
                .execute(self.clock.as_ref(), |_| self.channel.send(recipient, single, caption))
                .await?;
            receipt.handles.extend(part.handles);
        }
        Ok(receipt)
    }
}

fn record_handles(fresh: &mut ArtifactEntry, documents: &[OutgoingDocument], receipt: &DeliveryReceipt) {
    if receipt.handles.len() != documents.len() {
        warn!(
            expected = documents.len(),
            received = receipt.handles.len(),
            "channel returned unexpected number of handles, caching what matches"
        );
    }
    for (document, handle) in documents.iter().zip(&receipt.handles) {
        if document.attachment.is_upload() {
            fresh.set_handle(document.format, handle.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use tankobon_core::SeriesRef;

    use super::*;

    fn item() -> ItemRef {
        ItemRef::new(
            "https://example.org/c/12",
            "Chapter 12: The Return?",
            SeriesRef::new("https://example.org/s", "A Very Long Series Name That Keeps Going"),
        )
    }

    #[test]
    fn success_caption_lists_links() {
        let caption = success_caption(&item(), Some("https://telegra.ph/x"));
        assert!(caption.starts_with("A Very Long Series Name That Keeps Going - Chapter 12"));
        assert!(caption.contains("[Read on telegraph](https://telegra.ph/x)"));
        assert!(caption.ends_with("[Read on website](https://example.org/c/12)"));
    }

    #[test]
    fn caption_without_web_link_has_only_source() {
        let caption = success_caption(&item(), None);
        assert!(!caption.contains("telegraph"));
    }

    #[test]
    fn blocked_recipient_gets_no_notice() {
        assert!(failure_notice(&item(), &DeliveryError::blocked(RecipientId(1))).is_none());
    }

    #[test]
    fn conversion_notice_names_format() {
        let notice = failure_notice(
            &item(),
            &DeliveryError::conversion(OutputFormat::Archive, "zip failed"),
        )
        .unwrap();
        assert!(notice.starts_with("There was an error making the cbz"));
        assert!(notice.ends_with("https://example.org/c/12"));
    }

    #[test]
    fn file_names_are_short_and_clean() {
        let name = file_name(&item(), OutputFormat::Document);
        assert!(name.ends_with(".pdf"));
        assert!(!name.contains('?') && !name.contains(':'));
        assert!(name.trim_end_matches(".pdf").chars().count() <= 45);
        assert!(name.starts_with("A Very Long Series Name T - Chapter 12"));
    }

    #[test]
    fn raw_content_scratch_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        std::fs::write(path.join("001.jpg"), b"jpeg").unwrap();

        let raw = RawContent::with_scratch(vec![Bytes::from_static(b"jpeg")], dir);
        assert_eq!(raw.scratch_path(), Some(path.as_path()));
        drop(raw);

        assert!(!path.exists());
    }

    #[test]
    fn raw_content_with_blank_pages_is_empty() {
        assert!(RawContent::new(vec![]).is_empty());
        assert!(RawContent::new(vec![Bytes::new()]).is_empty());
        assert!(!RawContent::new(vec![Bytes::from_static(b"x")]).is_empty());
    }
}
