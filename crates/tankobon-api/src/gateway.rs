//! HTTP sidecar adapters.
//!
//! Scraping and rendering live in sidecar services. A provider sidecar
//! answers `GET /search?q=` and `GET /items?url=&page=` with JSON. The
//! render sidecar answers `GET /render/pages?url=` with the page image URLs
//! of a chapter, and `POST /render/{format}` (multipart, one `page` part per
//! image plus a `meta` JSON part) with the finished file, or `{"url": ..}`
//! for web links.

use std::{path::Path, time::Duration};

use bytes::Bytes;
use reqwest::{
    multipart::{Form, Part},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use tankobon_core::{ContentCard, ContentRef, ItemRef, OutputFormat, SeriesRef};
use tankobon_delivery::{
    pipeline::PipelineFuture, ContentProducer, Converter, DeliveryError, Produced, RawContent,
};
use tankobon_discovery::{
    paged_items_since, ItemStream, SourceError, SourceFuture, SourceProvider,
};
use tracing::{debug, info_span, Instrument};

use crate::config::ProviderConfig;

/// Builds the shared HTTP client for sidecar calls.
///
/// # Errors
///
/// Fails when the TLS backend cannot be initialised.
pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("tankobon/", env!("CARGO_PKG_VERSION")))
        .build()
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{path}", base_url.trim_end_matches('/'))
}

/// Hostname of `url`, without port or `www.` prefix.
fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?.split(':').next()?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    (!host.is_empty()).then_some(host)
}

#[derive(Debug, Deserialize)]
struct CardDto {
    url: String,
    name: String,
    #[serde(default)]
    cover_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemDto {
    url: String,
    name: String,
}

/// A [`SourceProvider`] backed by a provider sidecar.
#[derive(Debug, Clone)]
pub struct GatewayProvider {
    name: String,
    language: String,
    base_url: String,
    domains: Vec<String>,
    client: reqwest::Client,
}

impl GatewayProvider {
    /// Creates a provider from its configuration entry.
    pub fn new(config: &ProviderConfig, client: reqwest::Client) -> Self {
        Self {
            name: config.name.clone(),
            language: config.language.to_lowercase(),
            base_url: config.base_url.clone(),
            domains: config.domains.iter().map(|domain| domain.to_lowercase()).collect(),
            client,
        }
    }

    async fn get_json<T>(&self, path: &str, query: &[(&str, &str)], url: &str) -> Result<T, SourceError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self
            .client
            .get(endpoint(&self.base_url, path))
            .query(query)
            .send()
            .await
            .map_err(|e| SourceError::request(self.id(), e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(SourceError::not_found(url)),
            status if !status.is_success() => {
                return Err(SourceError::request(self.id(), format!("sidecar returned {status}")));
            },
            _ => {},
        }

        response.json().await.map_err(|e| SourceError::parse(self.id(), e.to_string()))
    }
}

impl SourceProvider for GatewayProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn language(&self) -> &str {
        &self.language
    }

    fn search<'a>(&'a self, query: &'a str) -> SourceFuture<'a, Vec<ContentCard>> {
        let span = info_span!("provider_search", provider = %self.id());
        Box::pin(
            async move {
                let cards: Vec<CardDto> = self.get_json("search", &[("q", query)], query).await?;
                debug!(results = cards.len(), "search answered");
                Ok(cards
                    .into_iter()
                    .map(|card| ContentCard {
                        series: SeriesRef::new(card.url, card.name),
                        provider: self.id(),
                        cover_url: card.cover_url,
                    })
                    .collect())
            }
            .instrument(span),
        )
    }

    fn list_items<'a>(
        &'a self,
        series: &'a SeriesRef,
        page: u32,
    ) -> SourceFuture<'a, Vec<ItemRef>> {
        let span = info_span!("provider_list_items", provider = %self.id(), url = %series.url, page);
        Box::pin(
            async move {
                let page = page.to_string();
                let items: Vec<ItemDto> = self
                    .get_json("items", &[("url", series.url.as_str()), ("page", &page)], &series.url)
                    .await?;
                Ok(items
                    .into_iter()
                    .map(|item| ItemRef::new(item.url, item.name, series.clone()))
                    .collect())
            }
            .instrument(span),
        )
    }

    fn iterate_items_since<'a>(
        &'a self,
        series: &'a SeriesRef,
        marker: Option<&'a ContentRef>,
    ) -> ItemStream<'a> {
        paged_items_since(self, series, marker)
    }

    fn contains(&self, url: &str) -> bool {
        let Some(host) = host_of(url) else {
            return false;
        };
        let host = host.to_lowercase();
        self.domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
    }
}

#[derive(Debug, Deserialize)]
struct PagesDto {
    pages: Vec<String>,
}

/// A [`ContentProducer`] that asks the render sidecar for page URLs and
/// downloads them into a scratch directory.
#[derive(Debug, Clone)]
pub struct GatewayProducer {
    base_url: String,
    client: reqwest::Client,
}

impl GatewayProducer {
    /// Creates a producer talking to the render sidecar at `base_url`.
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self { base_url: base_url.into(), client }
    }

    async fn download(&self, item: &ItemRef) -> tankobon_delivery::Result<RawContent> {
        let unavailable = |reason: String| DeliveryError::content_unavailable(&item.content_ref, reason);

        let response = self
            .client
            .get(endpoint(&self.base_url, "render/pages"))
            .query(&[("url", item.content_ref.as_str())])
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(unavailable(format!("page listing returned {}", response.status())));
        }
        let listing: PagesDto = response.json().await.map_err(|e| unavailable(e.to_string()))?;

        let scratch = tempfile::tempdir()
            .map_err(|e| unavailable(format!("scratch directory unavailable: {e}")))?;
        let mut pages = Vec::with_capacity(listing.pages.len());
        for (index, page_url) in listing.pages.iter().enumerate() {
            let bytes = self
                .client
                .get(page_url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| unavailable(e.to_string()))?
                .bytes()
                .await
                .map_err(|e| unavailable(e.to_string()))?;
            write_page(scratch.path(), index, &bytes).await.map_err(unavailable)?;
            pages.push(bytes);
        }

        debug!(pages = pages.len(), "chapter pages downloaded");
        Ok(RawContent::with_scratch(pages, scratch))
    }
}

async fn write_page(dir: &Path, index: usize, bytes: &Bytes) -> Result<(), String> {
    tokio::fs::write(dir.join(format!("{index:04}.img")), bytes)
        .await
        .map_err(|e| format!("failed to write page {index}: {e}"))
}

impl ContentProducer for GatewayProducer {
    fn fetch<'a>(&'a self, item: &'a ItemRef) -> PipelineFuture<'a, RawContent> {
        let span = info_span!("render_fetch", content_ref = %item.content_ref);
        Box::pin(self.download(item).instrument(span))
    }
}

#[derive(Debug, Serialize)]
struct RenderMeta<'a> {
    url: &'a str,
    series: &'a str,
    chapter: &'a str,
}

#[derive(Debug, Deserialize)]
struct LinkDto {
    url: String,
}

/// A [`Converter`] delegating one output format to the render sidecar.
#[derive(Debug, Clone)]
pub struct GatewayConverter {
    format: OutputFormat,
    base_url: String,
    client: reqwest::Client,
}

impl GatewayConverter {
    /// Creates a converter for `format`.
    pub fn new(format: OutputFormat, base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self { format, base_url: base_url.into(), client }
    }

    async fn render(&self, item: &ItemRef, content: &RawContent) -> tankobon_delivery::Result<Produced> {
        let failed = |message: String| DeliveryError::conversion(self.format, message);

        let meta = serde_json::to_string(&RenderMeta {
            url: item.content_ref.as_str(),
            series: &item.series.name,
            chapter: &item.name,
        })
        .map_err(|e| failed(e.to_string()))?;

        let mut form = Form::new().text("meta", meta);
        for (index, page) in content.pages.iter().enumerate() {
            form = form.part("page", Part::bytes(page.to_vec()).file_name(format!("{index:04}.img")));
        }

        let response = self
            .client
            .post(endpoint(&self.base_url, &format!("render/{}", self.format.as_str())))
            .multipart(form)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("render sidecar returned {}", response.status())));
        }

        if self.format.is_file() {
            let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
            Ok(Produced::File(bytes))
        } else {
            let link: LinkDto = response.json().await.map_err(|e| failed(e.to_string()))?;
            Ok(Produced::Link(link.url))
        }
    }
}

impl Converter for GatewayConverter {
    fn format(&self) -> OutputFormat {
        self.format
    }

    fn convert<'a>(&'a self, item: &'a ItemRef, content: &'a RawContent)
        -> PipelineFuture<'a, Produced> {
        let span = info_span!("render_convert", format = %self.format, content_ref = %item.content_ref);
        Box::pin(self.render(item, content).instrument(span))
    }
}
