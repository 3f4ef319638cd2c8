//! HTTP implementation of the outbound channel.
//!
//! Talks to a bot gateway that owns the chat credentials. Documents go out
//! as one multipart request carrying a JSON manifest plus a file part per
//! fresh upload. Responses are classified for the retry policy: 429 becomes
//! `RateLimited` (from `Retry-After` or the body's `retry_after`), 403
//! becomes `RecipientBlocked`.

use std::time::{Duration, Instant};

use reqwest::{
    header::RETRY_AFTER,
    multipart::{Form, Part},
    Response,
};
use serde::{Deserialize, Serialize};
use tankobon_core::{ArtifactHandle, RecipientId};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    channel::{Attachment, ChannelFuture, DeliveryReceipt, OutboundChannel, OutgoingDocument},
    error::{DeliveryError, Result},
};

/// Configuration for the gateway client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Gateway base URL, without trailing slash.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Whether the gateway accepts several documents per send.
    pub supports_batch: bool,
    /// Wait assumed when a 429 carries no hint.
    pub default_retry_after: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("tankobon/", env!("CARGO_PKG_VERSION")).to_string(),
            supports_batch: true,
            default_retry_after: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ManifestEntry<'a> {
    Cached { format: &'a str, file_id: &'a str },
    Upload { format: &'a str, part: String, filename: &'a str },
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    recipient: RecipientId,
    caption: &'a str,
    documents: Vec<ManifestEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    recipient: RecipientId,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    file_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    description: Option<String>,
}

/// Outbound channel backed by the HTTP gateway.
#[derive(Debug, Clone)]
pub struct HttpChannel {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpChannel {
    /// Creates a channel with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn classify_send_error(&self, error: &reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            DeliveryError::timeout(self.config.timeout)
        } else {
            DeliveryError::network(error.to_string())
        }
    }

    async fn check_status(&self, recipient: RecipientId, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let header_hint = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<f64>().ok());
        let text = response.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();

        match status.as_u16() {
            429 => {
                let retry_after = header_hint
                    .or(body.retry_after)
                    .filter(|secs| secs.is_finite() && *secs >= 0.0)
                    .map_or(self.config.default_retry_after, |secs| {
                        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
                    });
                Err(DeliveryError::rate_limited(retry_after))
            },
            403 => Err(DeliveryError::blocked(recipient)),
            _ => Err(DeliveryError::channel(
                Some(status.as_u16()),
                body.description.unwrap_or(text),
            )),
        }
    }

    async fn send_documents(
        &self,
        recipient: RecipientId,
        documents: &[OutgoingDocument],
        caption: &str,
    ) -> Result<DeliveryReceipt> {
        let mut form = Form::new();
        let mut entries = Vec::with_capacity(documents.len());

        for (index, document) in documents.iter().enumerate() {
            let format = document.format.as_str();
            match &document.attachment {
                Attachment::Cached(handle) => {
                    entries.push(ManifestEntry::Cached { format, file_id: &handle.0 });
                },
                Attachment::Upload { filename, bytes } => {
                    let part = format!("file{index}");
                    form = form.part(
                        part.clone(),
                        Part::bytes(bytes.to_vec()).file_name(filename.clone()),
                    );
                    entries.push(ManifestEntry::Upload { format, part, filename });
                },
            }
        }

        let manifest = serde_json::to_string(&Manifest { recipient, caption, documents: entries })
            .map_err(|e| DeliveryError::channel(None, format!("manifest encoding failed: {e}")))?;
        form = form.text("manifest", manifest);

        let start = Instant::now();
        let response = self
            .client
            .post(self.url("send_documents"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.classify_send_error(&e))?;

        let response = self.check_status(recipient, response).await?;
        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::channel(None, format!("invalid gateway response: {e}")))?;

        debug!(
            documents = documents.len(),
            duration_ms = start.elapsed().as_millis(),
            "documents delivered"
        );

        Ok(DeliveryReceipt { handles: parsed.file_ids.into_iter().map(ArtifactHandle).collect() })
    }
}

impl OutboundChannel for HttpChannel {
    fn send<'a>(
        &'a self,
        recipient: RecipientId,
        documents: &'a [OutgoingDocument],
        caption: &'a str,
    ) -> ChannelFuture<'a, DeliveryReceipt> {
        let span = info_span!("channel_send", %recipient, documents = documents.len());
        Box::pin(
            async move {
                let result = self.send_documents(recipient, documents, caption).await;
                if let Err(ref error) = result {
                    warn!(error = %error, "document send failed");
                }
                result
            }
            .instrument(span),
        )
    }

    fn send_text<'a>(&'a self, recipient: RecipientId, text: &'a str) -> ChannelFuture<'a, ()> {
        let span = info_span!("channel_send_text", %recipient);
        Box::pin(
            async move {
                let response = self
                    .client
                    .post(self.url("send_message"))
                    .json(&TextMessage { recipient, text })
                    .send()
                    .await
                    .map_err(|e| self.classify_send_error(&e))?;
                self.check_status(recipient, response).await?;
                Ok(())
            }
            .instrument(span),
        )
    }

    fn supports_batch(&self) -> bool {
        self.config.supports_batch
    }
}
