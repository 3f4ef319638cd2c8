//! Stub content producer and converters.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tankobon_core::{ContentRef, ItemRef, OutputFormat};
use tankobon_delivery::{
    pipeline::PipelineFuture, ContentProducer, Converter, DeliveryError, Produced, RawContent,
};

/// Producer returning two fake pages per item, backed by a real scratch
/// directory so cleanup can be observed.
#[derive(Default)]
pub struct StubProducer {
    missing: Mutex<HashSet<ContentRef>>,
    failing: Mutex<HashSet<ContentRef>>,
    panicking: Mutex<HashSet<ContentRef>>,
    scratch_dirs: Mutex<Vec<PathBuf>>,
    fetches: AtomicUsize,
}

impl StubProducer {
    /// Producer that succeeds for every item.
    pub fn new() -> Self {
        Self::default()
    }

    /// `content_ref` yields no pages.
    pub fn set_missing(&self, content_ref: ContentRef) {
        self.missing.lock().insert(content_ref);
    }

    /// `content_ref` fails to fetch.
    pub fn set_failing(&self, content_ref: ContentRef) {
        self.failing.lock().insert(content_ref);
    }

    /// Fetching `content_ref` panics.
    pub fn set_panicking(&self, content_ref: ContentRef) {
        self.panicking.lock().insert(content_ref);
    }

    /// Fetches performed.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Scratch directories handed out so far.
    pub fn scratch_dirs(&self) -> Vec<PathBuf> {
        self.scratch_dirs.lock().clone()
    }
}

impl ContentProducer for StubProducer {
    fn fetch<'a>(&'a self, item: &'a ItemRef) -> PipelineFuture<'a, RawContent> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let content_ref = &item.content_ref;

            if self.panicking.lock().contains(content_ref) {
                panic!("producer exploded on {content_ref}");
            }
            if self.failing.lock().contains(content_ref) {
                return Err(DeliveryError::network("source unreachable"));
            }
            if self.missing.lock().contains(content_ref) {
                return Ok(RawContent::new(Vec::new()));
            }

            let scratch = tempfile::tempdir()
                .map_err(|e| DeliveryError::content_unavailable(content_ref, e.to_string()))?;
            self.scratch_dirs.lock().push(scratch.path().to_path_buf());
            let pages = vec![
                Bytes::from(format!("{content_ref}#1")),
                Bytes::from(format!("{content_ref}#2")),
            ];
            Ok(RawContent::with_scratch(pages, scratch))
        })
    }
}

/// Converter for one format that can be switched into failure.
pub struct StubConverter {
    format: OutputFormat,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl StubConverter {
    /// Converter producing `format`.
    pub fn new(format: OutputFormat) -> Self {
        Self { format, failing: AtomicBool::new(false), calls: AtomicUsize::new(0) }
    }

    /// Makes subsequent conversions fail or succeed.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Conversions attempted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Converter for StubConverter {
    fn format(&self) -> OutputFormat {
        self.format
    }

    fn convert<'a>(
        &'a self,
        item: &'a ItemRef,
        content: &'a RawContent,
    ) -> PipelineFuture<'a, Produced> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(DeliveryError::conversion(self.format, "stub converter failure"));
            }
            let produced = if self.format.is_file() {
                Produced::File(Bytes::from(format!(
                    "{}:{}:{} pages",
                    self.format,
                    item.content_ref,
                    content.pages.len()
                )))
            } else {
                Produced::Link(format!("https://read.example/page?src={}", item.content_ref))
            };
            Ok(produced)
        })
    }
}
