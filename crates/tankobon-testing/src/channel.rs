//! Scriptable outbound channel.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tankobon_core::{ArtifactHandle, RecipientId};
use tankobon_delivery::{
    channel::ChannelFuture, Attachment, DeliveryError, DeliveryReceipt, OutboundChannel,
    OutgoingDocument,
};
use tokio::sync::watch;

/// Scripted answer for the next call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Accept the call.
    Ok,
    /// Answer `RateLimited` with this wait.
    RateLimited(Duration),
    /// Answer `RecipientBlocked`.
    Blocked,
    /// Answer a non-retryable channel error.
    Fail(String),
}

/// A successful call, as the channel saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    /// Documents with a caption.
    Documents {
        /// Recipient
        recipient: RecipientId,
        /// Documents in request order
        documents: Vec<OutgoingDocument>,
        /// Caption on the last document
        caption: String,
    },
    /// Plain text.
    Text {
        /// Recipient
        recipient: RecipientId,
        /// Message text
        text: String,
    },
}

impl Sent {
    /// Recipient of the call.
    pub fn recipient(&self) -> RecipientId {
        match self {
            Self::Documents { recipient, .. } | Self::Text { recipient, .. } => *recipient,
        }
    }

    /// Caption or text.
    pub fn text(&self) -> &str {
        match self {
            Self::Documents { caption, .. } => caption,
            Self::Text { text, .. } => text,
        }
    }
}

/// In-memory [`OutboundChannel`] that replays a script and records sends.
///
/// With an empty script every call succeeds. Uploads receive handles
/// `upload-1`, `upload-2`, ...; cached handles are echoed back. The channel
/// also tracks overlapping calls for the same recipient.
pub struct StubChannel {
    script: Mutex<VecDeque<Reply>>,
    blocked: Mutex<HashSet<RecipientId>>,
    held: Mutex<HashMap<RecipientId, watch::Sender<bool>>>,
    sent: Mutex<Vec<Sent>>,
    in_progress: Mutex<HashSet<RecipientId>>,
    attempts: AtomicU32,
    overlaps: AtomicUsize,
    next_handle: AtomicU64,
    batch: bool,
    latency: Option<Duration>,
}

impl Default for StubChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl StubChannel {
    /// Channel that supports batches and always succeeds.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            blocked: Mutex::new(HashSet::new()),
            held: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            in_progress: Mutex::new(HashSet::new()),
            attempts: AtomicU32::new(0),
            overlaps: AtomicUsize::new(0),
            next_handle: AtomicU64::new(1),
            batch: true,
            latency: None,
        }
    }

    /// Channel that only accepts one document per call.
    #[must_use]
    pub fn without_batch(mut self) -> Self {
        self.batch = false;
        self
    }

    /// Makes every call take `latency` of real time.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Appends replies consumed one per call.
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.script.lock().extend(replies);
    }

    /// Every future call for `recipient` answers `RecipientBlocked`.
    pub fn block(&self, recipient: RecipientId) {
        self.blocked.lock().insert(recipient);
    }

    /// Calls for `recipient` stall until [`StubChannel::resume`].
    pub fn hold(&self, recipient: RecipientId) {
        self.held.lock().entry(recipient).or_insert_with(|| watch::channel(false).0);
    }

    /// Lets stalled and future calls for `recipient` through.
    pub fn resume(&self, recipient: RecipientId) {
        if let Some(gate) = self.held.lock().remove(&recipient) {
            gate.send_replace(true);
        }
    }

    /// Successful calls so far.
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    /// Successful calls for one recipient.
    pub fn sent_to(&self, recipient: RecipientId) -> Vec<Sent> {
        self.sent.lock().iter().filter(|sent| sent.recipient() == recipient).cloned().collect()
    }

    /// Calls made, including failed ones.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Times a call started while another call for the same recipient was
    /// still running.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    fn next_reply(&self, recipient: RecipientId) -> Reply {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.blocked.lock().contains(&recipient) {
            return Reply::Blocked;
        }
        self.script.lock().pop_front().unwrap_or(Reply::Ok)
    }

    async fn call(&self, recipient: RecipientId, sent: Sent) -> Result<(), DeliveryError> {
        if !self.in_progress.lock().insert(recipient) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let gate = self.held.lock().get(&recipient).map(watch::Sender::subscribe);
        if let Some(mut gate) = gate {
            // A dropped sender also opens the gate.
            let _ = gate.wait_for(|open| *open).await;
        }
        self.in_progress.lock().remove(&recipient);

        match self.next_reply(recipient) {
            Reply::Ok => {
                self.sent.lock().push(sent);
                Ok(())
            },
            Reply::RateLimited(wait) => Err(DeliveryError::rate_limited(wait)),
            Reply::Blocked => Err(DeliveryError::blocked(recipient)),
            Reply::Fail(message) => Err(DeliveryError::channel(Some(500), message)),
        }
    }
}

impl OutboundChannel for StubChannel {
    fn send<'a>(
        &'a self,
        recipient: RecipientId,
        documents: &'a [OutgoingDocument],
        caption: &'a str,
    ) -> ChannelFuture<'a, DeliveryReceipt> {
        Box::pin(async move {
            assert!(
                self.batch || documents.len() == 1,
                "batch of {} sent to a channel without batch support",
                documents.len()
            );
            let sent =
                Sent::Documents { recipient, documents: documents.to_vec(), caption: caption.into() };
            self.call(recipient, sent).await?;

            let handles = documents
                .iter()
                .map(|document| match &document.attachment {
                    Attachment::Cached(handle) => handle.clone(),
                    Attachment::Upload { .. } => ArtifactHandle::new(format!(
                        "upload-{}",
                        self.next_handle.fetch_add(1, Ordering::SeqCst)
                    )),
                })
                .collect();
            Ok(DeliveryReceipt { handles })
        })
    }

    fn send_text<'a>(&'a self, recipient: RecipientId, text: &'a str) -> ChannelFuture<'a, ()> {
        Box::pin(self.call(recipient, Sent::Text { recipient, text: text.into() }))
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }
}
