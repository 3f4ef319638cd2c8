//! PostgreSQL implementation of the store traits.
//!
//! All SQL for the service lives here. Artifact upserts merge with
//! `COALESCE` inside a single statement, so two workers producing different
//! formats of the same item concurrently can never erase each other's
//! handles.

use std::sync::Arc;

use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::debug;

use super::{
    ArtifactStore, DiscoveryStateStore, PreferenceStore, StoreFuture, SubscriptionStore,
};
use crate::{
    error::Result,
    models::{
        ArtifactEntry, ArtifactHandle, ContentRef, OutputFormats, RecipientId, SeriesRef,
        Subscription,
    },
};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS series (
        url TEXT PRIMARY KEY,
        name TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS subscriptions (
        series_url TEXT NOT NULL REFERENCES series(url) ON DELETE CASCADE,
        recipient BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (series_url, recipient)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_subscriptions_recipient ON subscriptions(recipient)",
    r"
    CREATE TABLE IF NOT EXISTS discovery_markers (
        series_url TEXT PRIMARY KEY,
        last_item TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS artifacts (
        content_ref TEXT PRIMARY KEY,
        document_id TEXT,
        archive_id TEXT,
        web_link TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS recipient_formats (
        recipient BIGINT PRIMARY KEY,
        formats INTEGER NOT NULL CHECK (formats >= 0 AND formats < 8)
    )
    ",
];

/// Store backed by a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    /// Wraps an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates tables and indexes that do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns error if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&*self.pool).await?;
        }
        debug!(statements = SCHEMA.len(), "store schema ensured");
        Ok(())
    }

    /// Verifies the database answers queries.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}

fn artifact_from_row(row: &PgRow) -> std::result::Result<ArtifactEntry, sqlx::Error> {
    Ok(ArtifactEntry {
        content_ref: ContentRef::new(row.try_get::<String, _>("content_ref")?),
        document: row.try_get::<Option<String>, _>("document_id")?.map(ArtifactHandle),
        archive: row.try_get::<Option<String>, _>("archive_id")?.map(ArtifactHandle),
        web_link: row.try_get("web_link")?,
    })
}

fn subscription_from_row(row: &PgRow) -> std::result::Result<Subscription, sqlx::Error> {
    Ok(Subscription {
        series: SeriesRef { url: row.try_get("url")?, name: row.try_get("name")? },
        recipient: row.try_get("recipient")?,
    })
}

impl ArtifactStore for PgStore {
    fn get<'a>(&'a self, content_ref: &'a ContentRef) -> StoreFuture<'a, Option<ArtifactEntry>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT content_ref, document_id, archive_id, web_link
                FROM artifacts
                WHERE content_ref = $1
                ",
            )
            .bind(content_ref.as_str())
            .fetch_optional(&*self.pool)
            .await?;

            Ok(row.as_ref().map(artifact_from_row).transpose()?)
        })
    }

    fn upsert(&self, entry: ArtifactEntry) -> StoreFuture<'_, ArtifactEntry> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                INSERT INTO artifacts (content_ref, document_id, archive_id, web_link)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (content_ref) DO UPDATE SET
                    document_id = COALESCE(EXCLUDED.document_id, artifacts.document_id),
                    archive_id = COALESCE(EXCLUDED.archive_id, artifacts.archive_id),
                    web_link = COALESCE(EXCLUDED.web_link, artifacts.web_link),
                    updated_at = NOW()
                RETURNING content_ref, document_id, archive_id, web_link
                ",
            )
            .bind(entry.content_ref.as_str())
            .bind(entry.document.as_ref().map(|h| h.0.as_str()))
            .bind(entry.archive.as_ref().map(|h| h.0.as_str()))
            .bind(entry.web_link.as_deref())
            .fetch_one(&*self.pool)
            .await?;

            Ok(artifact_from_row(&row)?)
        })
    }

    fn remove<'a>(&'a self, content_ref: &'a ContentRef) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM artifacts WHERE content_ref = $1")
                .bind(content_ref.as_str())
                .execute(&*self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }
}

impl SubscriptionStore for PgStore {
    fn list_subscriptions(&self) -> StoreFuture<'_, Vec<Subscription>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT s.url, s.name, sub.recipient
                FROM subscriptions sub
                JOIN series s ON s.url = sub.series_url
                ORDER BY sub.series_url, sub.created_at
                ",
            )
            .fetch_all(&*self.pool)
            .await?;

            Ok(rows.iter().map(subscription_from_row).collect::<std::result::Result<_, _>>()?)
        })
    }

    fn subscriptions_for(&self, recipient: RecipientId) -> StoreFuture<'_, Vec<Subscription>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT s.url, s.name, sub.recipient
                FROM subscriptions sub
                JOIN series s ON s.url = sub.series_url
                WHERE sub.recipient = $1
                ORDER BY s.name
                ",
            )
            .bind(recipient)
            .fetch_all(&*self.pool)
            .await?;

            Ok(rows.iter().map(subscription_from_row).collect::<std::result::Result<_, _>>()?)
        })
    }

    fn subscribe(&self, subscription: Subscription) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r"
                INSERT INTO series (url, name) VALUES ($1, $2)
                ON CONFLICT (url) DO UPDATE SET name = EXCLUDED.name
                ",
            )
            .bind(&subscription.series.url)
            .bind(&subscription.series.name)
            .execute(&mut *tx)
            .await?;

            let result = sqlx::query(
                r"
                INSERT INTO subscriptions (series_url, recipient) VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(&subscription.series.url)
            .bind(subscription.recipient)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn unsubscribe<'a>(
        &'a self,
        recipient: RecipientId,
        series_url: &'a str,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result =
                sqlx::query("DELETE FROM subscriptions WHERE series_url = $1 AND recipient = $2")
                    .bind(series_url)
                    .bind(recipient)
                    .execute(&*self.pool)
                    .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn remove_recipient(&self, recipient: RecipientId) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM subscriptions WHERE recipient = $1")
                .bind(recipient)
                .execute(&*self.pool)
                .await?;
            Ok(result.rows_affected())
        })
    }
}

impl DiscoveryStateStore for PgStore {
    fn get_marker<'a>(&'a self, series_url: &'a str) -> StoreFuture<'a, Option<ContentRef>> {
        Box::pin(async move {
            let marker: Option<String> =
                sqlx::query_scalar("SELECT last_item FROM discovery_markers WHERE series_url = $1")
                    .bind(series_url)
                    .fetch_optional(&*self.pool)
                    .await?;
            Ok(marker.map(ContentRef::new))
        })
    }

    fn set_marker<'a>(&'a self, series_url: &'a str, marker: ContentRef) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO discovery_markers (series_url, last_item) VALUES ($1, $2)
                ON CONFLICT (series_url) DO UPDATE SET
                    last_item = EXCLUDED.last_item,
                    updated_at = NOW()
                ",
            )
            .bind(series_url)
            .bind(marker.as_str())
            .execute(&*self.pool)
            .await?;
            Ok(())
        })
    }
}

impl PreferenceStore for PgStore {
    fn output_formats(&self, recipient: RecipientId) -> StoreFuture<'_, OutputFormats> {
        Box::pin(async move {
            let bits: Option<i32> =
                sqlx::query_scalar("SELECT formats FROM recipient_formats WHERE recipient = $1")
                    .bind(recipient)
                    .fetch_optional(&*self.pool)
                    .await?;

            Ok(bits
                .and_then(|bits| u32::try_from(bits).ok())
                .map(OutputFormats::from_bits_truncate)
                .unwrap_or_default())
        })
    }

    fn set_output_formats(
        &self,
        recipient: RecipientId,
        formats: OutputFormats,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO recipient_formats (recipient, formats) VALUES ($1, $2)
                ON CONFLICT (recipient) DO UPDATE SET formats = EXCLUDED.formats
                ",
            )
            .bind(recipient)
            .bind(i32::try_from(formats.bits()).unwrap_or(0))
            .execute(&*self.pool)
            .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_can_be_created_lazily() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let store = PgStore::new(pool);
        assert_eq!(Arc::strong_count(&store.pool()), 2);
    }

    #[test]
    fn schema_creates_every_table() {
        let ddl = SCHEMA.join("\n");
        for table in ["series", "subscriptions", "discovery_markers", "artifacts", "recipient_formats"]
        {
            assert!(ddl.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")), "{table}");
        }
    }
}
