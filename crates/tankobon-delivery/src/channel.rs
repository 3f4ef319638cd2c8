//! Outbound channel interface.
//!
//! The channel delivers files and text to a recipient. It distinguishes
//! backpressure (`RateLimited`) and a severed recipient (`RecipientBlocked`)
//! from every other failure, which is all the scheduler needs to know.

use std::{fmt, future::Future, pin::Pin};

use bytes::Bytes;
use tankobon_core::{ArtifactHandle, OutputFormat, RecipientId};

use crate::error::Result;

/// Boxed future returned by channel methods.
pub type ChannelFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// File content for one outgoing document.
#[derive(Clone, PartialEq, Eq)]
pub enum Attachment {
    /// Previously uploaded file, re-sent by handle.
    Cached(ArtifactHandle),
    /// Freshly produced file.
    Upload {
        /// File name shown to the recipient
        filename: String,
        /// File bytes
        bytes: Bytes,
    },
}

impl Attachment {
    /// True for fresh uploads, whose handle should be cached after sending.
    pub fn is_upload(&self) -> bool {
        matches!(self, Self::Upload { .. })
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cached(handle) => f.debug_tuple("Cached").field(handle).finish(),
            Self::Upload { filename, bytes } => f
                .debug_struct("Upload")
                .field("filename", filename)
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

/// One document in an outgoing batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingDocument {
    /// Format the document represents.
    pub format: OutputFormat,
    /// Content to send.
    pub attachment: Attachment,
}

impl OutgoingDocument {
    /// Re-send of a cached handle.
    pub fn cached(format: OutputFormat, handle: ArtifactHandle) -> Self {
        Self { format, attachment: Attachment::Cached(handle) }
    }

    /// Upload of fresh bytes.
    pub fn upload(format: OutputFormat, filename: impl Into<String>, bytes: Bytes) -> Self {
        Self { format, attachment: Attachment::Upload { filename: filename.into(), bytes } }
    }
}

/// Result of a successful send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Handle the channel holds for each sent document, in request order.
    pub handles: Vec<ArtifactHandle>,
}

/// Rate-limited transport to recipients.
pub trait OutboundChannel: Send + Sync + 'static {
    /// Sends documents with `caption` attached to the last one.
    ///
    /// Callers only pass more than one document when
    /// [`supports_batch`](Self::supports_batch) is true.
    ///
    /// # Errors
    ///
    /// `RateLimited` for backpressure, `RecipientBlocked` when the recipient
    /// severed the channel, anything else for other failures.
    fn send<'a>(
        &'a self,
        recipient: RecipientId,
        documents: &'a [OutgoingDocument],
        caption: &'a str,
    ) -> ChannelFuture<'a, DeliveryReceipt>;

    /// Sends a plain text message.
    ///
    /// # Errors
    ///
    /// Same classification as [`send`](Self::send).
    fn send_text<'a>(&'a self, recipient: RecipientId, text: &'a str) -> ChannelFuture<'a, ()>;

    /// Whether several documents can be delivered in one call.
    fn supports_batch(&self) -> bool;
}
