//! Typed recipient commands.
//!
//! Search results and chapter listings are registered in a
//! [`TokenRegistry`] and referenced by token in follow-up commands, so a
//! client never has to echo series or chapter data back. Only
//! [`Command::Deliver`] reaches the delivery engine.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tankobon_core::{
    storage::{PreferenceStore, SubscriptionStore},
    Clock, ContentRef, CoreError, EnqueueError, ItemRef, Job, JobSink, OutputFormat,
    OutputFormats, RecipientId, SeriesRef, Subscription, Token, TokenRegistry,
};
use tankobon_delivery::{ArtifactCache, DeliveryError, EngineHandle, EngineStats};
use tankobon_discovery::{ProviderRegistry, SourceError, SourceProvider};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Subscriptions shown per listing.
pub const SUBSCRIPTION_PAGE: usize = 10;

/// Result type alias for command handling.
pub type Result<T> = std::result::Result<T, CommandError>;

/// Reasons a command could not be carried out.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The token expired or was never issued.
    #[error("unknown or expired token {token}")]
    UnknownToken {
        /// Token as received
        token: Token,
    },

    /// The token points at something else than the command needs.
    #[error("token {token} does not refer to a {expected}")]
    WrongToken {
        /// Token as received
        token: Token,
        /// What the command expected
        expected: &'static str,
    },

    /// No active provider has this identifier.
    #[error("unknown provider {id}")]
    UnknownProvider {
        /// Requested identifier
        id: String,
    },

    /// No active provider owns this URL.
    #[error("no provider handles {url}")]
    Unrouted {
        /// Series URL without an owner
        url: String,
    },

    /// Malformed request.
    #[error("invalid request: {0}")]
    InvalidInput(String),

    /// The provider failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// A store failed.
    #[error(transparent)]
    Store(#[from] CoreError),

    /// The engine refused the job.
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    /// The artifact cache failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// What a token stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registered {
    /// A search result.
    Series(SeriesRef),
    /// One listed chapter.
    Item(ItemRef),
    /// A whole listing page, oldest chapter first.
    Batch(Vec<ItemRef>),
}

/// A recipient request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Search one provider, every provider of a language, or all of them.
    Search {
        /// Title fragment
        query: String,
        /// Restrict to one provider identifier
        provider: Option<String>,
        /// Restrict to one language code
        language: Option<String>,
    },
    /// One page of a series' chapters, newest first.
    ListItems {
        /// Series token from a search
        series: Token,
        /// Page number, starting at 1
        page: u32,
    },
    /// Deliver chapters in the order given.
    Deliver {
        /// Destination
        recipient: RecipientId,
        /// Item or batch tokens
        items: Vec<Token>,
    },
    /// Follow a series.
    Subscribe {
        /// Subscriber
        recipient: RecipientId,
        /// Series token from a search
        series: Token,
    },
    /// Stop following a series.
    Unsubscribe {
        /// Subscriber
        recipient: RecipientId,
        /// Series URL as listed
        series_url: String,
    },
    /// A recipient's subscriptions, optionally filtered.
    ListSubscriptions {
        /// Subscriber
        recipient: RecipientId,
        /// Space separated fragments; any match keeps a subscription
        filter: Option<String>,
    },
    /// Current output formats.
    OutputFormats {
        /// Recipient
        recipient: RecipientId,
    },
    /// Flip one output format.
    ToggleFormat {
        /// Recipient
        recipient: RecipientId,
        /// Format to flip
        format: OutputFormat,
    },
    /// Drop cached artifacts so the next delivery rebuilds them.
    Refresh {
        /// Item whose artifacts are dropped
        content_ref: ContentRef,
    },
    /// Queue depth and engine counters.
    QueueStatus,
}

/// A search result with its token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesHit {
    /// Series token for listing and subscribing
    pub token: Token,
    /// Series title
    pub name: String,
    /// Series URL
    pub url: String,
    /// Provider identifier
    pub provider: String,
    /// Cover image
    pub cover_url: Option<String>,
}

/// A listed chapter with its token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemHit {
    /// Item token for delivery
    pub token: Token,
    /// Chapter title
    pub name: String,
    /// Chapter URL
    pub url: String,
}

/// A listed subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionView {
    /// Series title
    pub name: String,
    /// Series URL, the unsubscribe key
    pub url: String,
}

/// Result of a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    /// Search hits in provider order.
    SearchResults {
        /// Hits
        results: Vec<SeriesHit>,
    },
    /// One listing page.
    Items {
        /// Series title
        series: String,
        /// Page number
        page: u32,
        /// Chapters, newest first
        items: Vec<ItemHit>,
        /// Token delivering the whole page oldest first
        all: Option<Token>,
    },
    /// Jobs handed to the engine.
    Enqueued {
        /// Number of jobs
        jobs: usize,
    },
    /// Subscribe outcome.
    Subscribed {
        /// False when already subscribed
        created: bool,
    },
    /// Unsubscribe outcome.
    Unsubscribed {
        /// False when there was nothing to remove
        removed: bool,
    },
    /// Subscription listing.
    Subscriptions {
        /// Matches before truncation
        total: usize,
        /// First matches
        subscriptions: Vec<SubscriptionView>,
    },
    /// Enabled output formats.
    Formats {
        /// Enabled formats in canonical order
        formats: Vec<OutputFormat>,
    },
    /// Refresh outcome.
    Refreshed {
        /// False when nothing was cached
        removed: bool,
    },
    /// Scheduler status.
    Queue {
        /// Jobs waiting
        depth: usize,
        /// Engine counters
        stats: EngineStats,
    },
}

/// Executes [`Command`]s against the providers, stores and engine.
pub struct CommandDispatcher {
    providers: Arc<ProviderRegistry>,
    tokens: TokenRegistry<Registered>,
    subscriptions: Arc<dyn SubscriptionStore>,
    preferences: Arc<dyn PreferenceStore>,
    cache: ArtifactCache,
    engine: EngineHandle,
}

impl CommandDispatcher {
    /// Creates a dispatcher holding at most `token_capacity` tokens for
    /// `token_ttl`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        providers: Arc<ProviderRegistry>,
        subscriptions: Arc<dyn SubscriptionStore>,
        preferences: Arc<dyn PreferenceStore>,
        cache: ArtifactCache,
        engine: EngineHandle,
        token_capacity: usize,
        token_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            providers,
            tokens: TokenRegistry::new(token_capacity, token_ttl, clock),
            subscriptions,
            preferences,
            cache,
            engine,
        }
    }

    /// Live tokens.
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Drops expired tokens. Returns how many were removed.
    pub fn purge_tokens(&self) -> usize {
        self.tokens.purge_expired()
    }

    /// Runs one command.
    ///
    /// # Errors
    ///
    /// See [`CommandError`]; nothing is enqueued when a command fails before
    /// reaching the engine.
    pub async fn dispatch(&self, command: Command) -> Result<Reply> {
        debug!(?command, "dispatching command");
        match command {
            Command::Search { query, provider, language } => {
                self.search(&query, provider.as_deref(), language.as_deref()).await
            },
            Command::ListItems { series, page } => self.list_items(series, page).await,
            Command::Deliver { recipient, items } => self.deliver(recipient, &items),
            Command::Subscribe { recipient, series } => {
                let series = self.series(series)?;
                let created =
                    self.subscriptions.subscribe(Subscription::new(series, recipient)).await?;
                Ok(Reply::Subscribed { created })
            },
            Command::Unsubscribe { recipient, series_url } => {
                let removed = self.subscriptions.unsubscribe(recipient, &series_url).await?;
                Ok(Reply::Unsubscribed { removed })
            },
            Command::ListSubscriptions { recipient, filter } => {
                self.list_subscriptions(recipient, filter.as_deref()).await
            },
            Command::OutputFormats { recipient } => {
                let formats = self.preferences.output_formats(recipient).await?;
                Ok(formats_reply(formats))
            },
            Command::ToggleFormat { recipient, format } => {
                let current = self.preferences.output_formats(recipient).await?;
                let updated = current.toggle(format.flag());
                self.preferences.set_output_formats(recipient, updated).await?;
                Ok(formats_reply(updated))
            },
            Command::Refresh { content_ref } => {
                let removed = self.cache.invalidate(&content_ref).await?;
                info!(%content_ref, removed, "artifact cache refreshed");
                Ok(Reply::Refreshed { removed })
            },
            Command::QueueStatus => Ok(Reply::Queue {
                depth: self.engine.queue_depth(),
                stats: self.engine.stats().await,
            }),
        }
    }

    async fn search(
        &self,
        query: &str,
        provider: Option<&str>,
        language: Option<&str>,
    ) -> Result<Reply> {
        let query = query.trim();
        if query.is_empty() {
            return Err(CommandError::InvalidInput("search query is empty".to_string()));
        }

        let targets: Vec<Arc<dyn SourceProvider>> = match (provider, language) {
            (Some(id), _) => {
                let provider = self
                    .providers
                    .get(id)
                    .filter(|_| !self.providers.is_paused(id))
                    .ok_or_else(|| CommandError::UnknownProvider { id: id.to_string() })?;
                vec![provider]
            },
            (None, Some(language)) => self.providers.for_language(language),
            (None, None) => self
                .providers
                .by_language()
                .keys()
                .flat_map(|language| self.providers.for_language(language))
                .collect(),
        };

        let single = targets.len() == 1;
        let answers = join_all(targets.iter().map(|provider| provider.search(query))).await;

        let mut results = Vec::new();
        for (provider, answer) in targets.iter().zip(answers) {
            match answer {
                Ok(cards) => results.extend(cards.into_iter().map(|card| SeriesHit {
                    token: self.tokens.insert(Registered::Series(card.series.clone())),
                    name: card.series.name,
                    url: card.series.url,
                    provider: card.provider,
                    cover_url: card.cover_url,
                })),
                Err(error) if single => return Err(error.into()),
                Err(error) => warn!(provider = %provider.id(), error = %error, "search failed"),
            }
        }

        Ok(Reply::SearchResults { results })
    }

    async fn list_items(&self, token: Token, page: u32) -> Result<Reply> {
        let series = self.series(token)?;
        let provider = self
            .providers
            .route(&series.url)
            .ok_or_else(|| CommandError::Unrouted { url: series.url.clone() })?;

        let listed = provider.list_items(&series, page.max(1)).await?;
        let items = listed
            .iter()
            .map(|item| ItemHit {
                token: self.tokens.insert(Registered::Item(item.clone())),
                name: item.name.clone(),
                url: item.content_ref.to_string(),
            })
            .collect();
        let all = (!listed.is_empty()).then(|| {
            let oldest_first = listed.into_iter().rev().collect();
            self.tokens.insert(Registered::Batch(oldest_first))
        });

        Ok(Reply::Items { series: series.name, page: page.max(1), items, all })
    }

    fn deliver(&self, recipient: RecipientId, tokens: &[Token]) -> Result<Reply> {
        if tokens.is_empty() {
            return Err(CommandError::InvalidInput("no items to deliver".to_string()));
        }

        let mut items = Vec::new();
        for token in tokens {
            match self.resolve(*token)? {
                Registered::Item(item) => items.push(item),
                Registered::Batch(batch) => items.extend(batch),
                Registered::Series(_) => {
                    return Err(CommandError::WrongToken { token: *token, expected: "chapter" });
                },
            }
        }

        for item in &items {
            self.engine.enqueue_direct(Job::new(recipient, item.clone()))?;
        }
        info!(%recipient, jobs = items.len(), "direct delivery requested");
        Ok(Reply::Enqueued { jobs: items.len() })
    }

    async fn list_subscriptions(
        &self,
        recipient: RecipientId,
        filter: Option<&str>,
    ) -> Result<Reply> {
        let fragments: Vec<String> =
            filter.unwrap_or_default().split_whitespace().map(str::to_lowercase).collect();

        let matching: Vec<SubscriptionView> = self
            .subscriptions
            .subscriptions_for(recipient)
            .await?
            .into_iter()
            .filter(|subscription| {
                fragments.is_empty()
                    || fragments.iter().any(|fragment| {
                        subscription.series.url.to_lowercase().contains(fragment)
                            || subscription.series.name.to_lowercase().contains(fragment)
                    })
            })
            .map(|subscription| SubscriptionView {
                name: subscription.series.name,
                url: subscription.series.url,
            })
            .collect();

        let total = matching.len();
        let subscriptions = matching.into_iter().take(SUBSCRIPTION_PAGE).collect();
        Ok(Reply::Subscriptions { total, subscriptions })
    }

    fn resolve(&self, token: Token) -> Result<Registered> {
        self.tokens.get(token).ok_or(CommandError::UnknownToken { token })
    }

    fn series(&self, token: Token) -> Result<SeriesRef> {
        match self.resolve(token)? {
            Registered::Series(series) => Ok(series),
            _ => Err(CommandError::WrongToken { token, expected: "series" }),
        }
    }
}

fn formats_reply(formats: OutputFormats) -> Reply {
    Reply::Formats { formats: formats.iter().collect() }
}
