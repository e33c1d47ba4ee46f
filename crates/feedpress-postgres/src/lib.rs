//! PostgreSQL implementation of the feedpress storage traits.
//!
//! [`PgStore`] implements every store the core needs on one connection pool.
//! The invariants the traits name are enforced by the schema, not by reads
//! before writes:
//!
//! - Feed item deduplication uses partial unique indexes on
//!   `(source_id, guid)` and `(source_id, url)` with `ON CONFLICT DO NOTHING`
//! - Article transitions are a single `UPDATE ... WHERE status AND version`
//! - Idempotency keys are a `UNIQUE` column on `publications`
//! - The one-active-publication-per-target guard is the partial unique index
//!   `uq_publications_active`
//!
//! # Database Schema
//!
//! See `migrations/0001_init.sql`. [`PgStore::apply_schema`] runs it; every
//! statement is `IF NOT EXISTS`, so it is safe on every start.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use feedpress_postgres::PgStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/feedpress").await?;
//! let store = PgStore::new(pool);
//! store.apply_schema().await?;
//!
//! let services = Services::new(Arc::new(store), publishers, generator, images, config);
//! ```

mod decode;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use feedpress::automation::AutomationRule;
use feedpress::lifecycle::ArticleTransition;
use feedpress::model::IdentityKey;
use feedpress::store::{
    ArticleStore, CreateOutcome, FeedItemStore, PublicationStore, RuleStore, SourceStore,
    StoreError, StoreResult,
};
use feedpress::{
    Article, ArticleId, ArticleStatus, FeedItem, FeedItemId, Publication, PublicationId, RuleId,
    Source, SourceId,
};

use decode::{backend, limit, to_i32, to_i64};

const SCHEMA: &str = include_str!("../migrations/0001_init.sql");

const ARTICLE_COLUMNS: &str = "id, source_id, feed_item_id, title, content, excerpt, slug, seo, \
    status, version, flags, generation, featured_media, publish_target, last_error, \
    created_at, updated_at";

const PUBLICATION_COLUMNS: &str = "id, article_id, target, status, retry_count, max_retries, \
    external_id, external_url, scheduled_at, published_at, content, metadata, last_error, \
    idempotency_key, allow_duplicate, created_at, updated_at";

/// PostgreSQL store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes that do not exist yet.
    pub async fn apply_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn exists(&self, table: &'static str, id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query(&format!("SELECT 1 AS found FROM {table} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.is_some())
    }

    /// The non-failed, guarded publication holding (article, target).
    async fn find_claiming(
        &self,
        article_id: ArticleId,
        target_key: &str,
    ) -> StoreResult<Option<Publication>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {PUBLICATION_COLUMNS} FROM publications
            WHERE article_id = $1 AND target_key = $2
              AND status <> 'failed' AND NOT allow_duplicate
            "#
        ))
        .bind(article_id.into_uuid())
        .bind(target_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(decode::publication).transpose()
    }
}

// =============================================================================
// Sources and rules
// =============================================================================

#[async_trait]
impl SourceStore for PgStore {
    async fn upsert_source(&self, source: Source) -> StoreResult<Source> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, name, kind, status, configuration, automation, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                kind = EXCLUDED.kind,
                status = EXCLUDED.status,
                configuration = EXCLUDED.configuration,
                automation = EXCLUDED.automation
            "#,
        )
        .bind(source.id.into_uuid())
        .bind(&source.name)
        .bind(&source.kind)
        .bind(source.status.as_str())
        .bind(&source.configuration)
        .bind(Json(&source.automation))
        .bind(source.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(source)
    }

    async fn find_source(&self, id: SourceId) -> StoreResult<Option<Source>> {
        let row = sqlx::query(
            "SELECT id, name, kind, status, configuration, automation, created_at \
             FROM sources WHERE id = $1",
        )
        .bind(id.into_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(decode::source).transpose()
    }

    async fn list_sources(&self) -> StoreResult<Vec<Source>> {
        let rows = sqlx::query(
            "SELECT id, name, kind, status, configuration, automation, created_at \
             FROM sources ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(decode::source).collect()
    }
}

#[async_trait]
impl RuleStore for PgStore {
    async fn insert_rule(&self, rule: AutomationRule) -> StoreResult<AutomationRule> {
        sqlx::query(
            r#"
            INSERT INTO automation_rules (
                id, source_id, name, enabled, trigger, conditions, actions,
                execution_count, last_executed_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(rule.id().into_uuid())
        .bind(rule.source_id().into_uuid())
        .bind(rule.name())
        .bind(rule.is_enabled())
        .bind(Json(rule.trigger()))
        .bind(Json(rule.conditions()))
        .bind(Json(rule.actions()))
        .bind(to_i64(rule.execution_count()))
        .bind(rule.last_executed_at())
        .bind(rule.created_at())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rule)
    }

    async fn find_rule(&self, id: RuleId) -> StoreResult<Option<AutomationRule>> {
        let row = sqlx::query("SELECT * FROM automation_rules WHERE id = $1")
            .bind(id.into_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.as_ref().map(decode::rule).transpose()
    }

    async fn rules_for_source(&self, source_id: SourceId) -> StoreResult<Vec<AutomationRule>> {
        let rows = sqlx::query(
            "SELECT * FROM automation_rules WHERE source_id = $1 ORDER BY created_at, id",
        )
        .bind(source_id.into_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(decode::rule).collect()
    }

    async fn save_rule(&self, rule: &AutomationRule) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE automation_rules
            SET name = $2,
                enabled = $3,
                trigger = $4,
                conditions = $5,
                actions = $6,
                execution_count = $7,
                last_executed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(rule.id().into_uuid())
        .bind(rule.name())
        .bind(rule.is_enabled())
        .bind(Json(rule.trigger()))
        .bind(Json(rule.conditions()))
        .bind(Json(rule.actions()))
        .bind(to_i64(rule.execution_count()))
        .bind(rule.last_executed_at())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("rule", rule.id()));
        }
        Ok(())
    }
}

// =============================================================================
// Feed items
// =============================================================================

#[async_trait]
impl FeedItemStore for PgStore {
    async fn insert_if_absent(&self, item: FeedItem) -> StoreResult<Option<FeedItem>> {
        // No conflict target: either partial unique index rejects the row.
        let inserted = sqlx::query(
            r#"
            INSERT INTO feed_items (
                id, source_id, guid, url, title, content, published_at,
                fetched_at, status, article_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(item.id.into_uuid())
        .bind(item.source_id.into_uuid())
        .bind(&item.guid)
        .bind(&item.url)
        .bind(&item.title)
        .bind(&item.content)
        .bind(item.published_at)
        .bind(item.fetched_at)
        .bind(item.status.as_str())
        .bind(item.article_id.map(ArticleId::into_uuid))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        if inserted.is_none() {
            debug!(source_id = %item.source_id, guid = ?item.guid, url = ?item.url, "feed item already present");
            return Ok(None);
        }
        Ok(Some(item))
    }

    async fn find_feed_item(&self, id: FeedItemId) -> StoreResult<Option<FeedItem>> {
        let row = sqlx::query("SELECT * FROM feed_items WHERE id = $1")
            .bind(id.into_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.as_ref().map(decode::feed_item).transpose()
    }

    async fn find_by_identity(
        &self,
        source_id: SourceId,
        key: IdentityKey<'_>,
    ) -> StoreResult<Option<FeedItem>> {
        let (sql, value) = match key {
            IdentityKey::Guid(guid) => (
                "SELECT * FROM feed_items WHERE source_id = $1 AND guid = $2",
                guid,
            ),
            IdentityKey::Url(url) => (
                "SELECT * FROM feed_items WHERE source_id = $1 AND url = $2",
                url,
            ),
        };

        let row = sqlx::query(sql)
            .bind(source_id.into_uuid())
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.as_ref().map(decode::feed_item).transpose()
    }

    async fn pending_feed_items(
        &self,
        source_id: SourceId,
        max: usize,
    ) -> StoreResult<Vec<FeedItem>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM feed_items
            WHERE source_id = $1 AND status = 'pending'
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(source_id.into_uuid())
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(decode::feed_item).collect()
    }

    async fn claim_feed_item(&self, id: FeedItemId) -> StoreResult<bool> {
        let claimed = sqlx::query(
            "UPDATE feed_items SET status = 'processing' WHERE id = $1 AND status = 'pending'",
        )
        .bind(id.into_uuid())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if claimed.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.exists("feed_items", id.into_uuid()).await? {
            return Err(StoreError::not_found("feed item", id));
        }
        Ok(false)
    }

    async fn complete_feed_item(&self, id: FeedItemId, article_id: ArticleId) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE feed_items SET status = 'processed', article_id = $2 WHERE id = $1",
        )
        .bind(id.into_uuid())
        .bind(article_id.into_uuid())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("feed item", id));
        }
        Ok(())
    }

    async fn release_feed_item(&self, id: FeedItemId) -> StoreResult<()> {
        let released = sqlx::query(
            "UPDATE feed_items SET status = 'pending' WHERE id = $1 AND status = 'processing'",
        )
        .bind(id.into_uuid())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if released.rows_affected() == 0 && !self.exists("feed_items", id.into_uuid()).await? {
            return Err(StoreError::not_found("feed item", id));
        }
        Ok(())
    }
}

// =============================================================================
// Articles
// =============================================================================

#[async_trait]
impl ArticleStore for PgStore {
    async fn insert_article(&self, article: Article) -> StoreResult<Article> {
        sqlx::query(&format!(
            "INSERT INTO articles ({ARTICLE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(article.id.into_uuid())
        .bind(article.source_id.into_uuid())
        .bind(article.feed_item_id.map(FeedItemId::into_uuid))
        .bind(&article.title)
        .bind(&article.content)
        .bind(&article.excerpt)
        .bind(&article.slug)
        .bind(Json(&article.seo))
        .bind(article.status.as_str())
        .bind(article.version)
        .bind(Json(&article.flags))
        .bind(Json(&article.generation))
        .bind(article.featured_media.as_ref().map(Json))
        .bind(article.publish_target.as_ref().map(Json))
        .bind(&article.last_error)
        .bind(article.created_at)
        .bind(article.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(article)
    }

    async fn find_article(&self, id: ArticleId) -> StoreResult<Option<Article>> {
        let row = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = $1"
        ))
        .bind(id.into_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(decode::article).transpose()
    }

    async fn articles_in_status(
        &self,
        status: ArticleStatus,
        max: usize,
    ) -> StoreResult<Vec<Article>> {
        let rows = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE status = $1 ORDER BY id LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(decode::article).collect()
    }

    async fn transition(&self, transition: &ArticleTransition) -> StoreResult<Article> {
        let updated = sqlx::query(&format!(
            r#"
            UPDATE articles
            SET status = $4,
                version = version + 1,
                featured_media = COALESCE($5, featured_media),
                last_error = COALESCE($6, last_error),
                updated_at = $7
            WHERE id = $1 AND status = $2 AND version = $3
            RETURNING {ARTICLE_COLUMNS}
            "#
        ))
        .bind(transition.article_id.into_uuid())
        .bind(transition.expected_status.as_str())
        .bind(transition.expected_version)
        .bind(transition.next_status.as_str())
        .bind(transition.featured_media.as_ref().map(Json))
        .bind(&transition.error)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        if let Some(row) = updated {
            return decode::article(&row);
        }

        let current = sqlx::query("SELECT status, version FROM articles WHERE id = $1")
            .bind(transition.article_id.into_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::not_found("article", transition.article_id))?;

        let actual_status: String = current.try_get("status").map_err(backend)?;
        Err(StoreError::VersionConflict {
            article_id: transition.article_id,
            expected_status: transition.expected_status,
            expected_version: transition.expected_version,
            actual_status: decode::parse_status(&actual_status)?,
            actual_version: current.try_get("version").map_err(backend)?,
        })
    }
}

// =============================================================================
// Publications
// =============================================================================

#[async_trait]
impl PublicationStore for PgStore {
    async fn create(&self, publication: Publication) -> StoreResult<CreateOutcome> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO publications ({PUBLICATION_COLUMNS}, target_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#
        ))
        .bind(publication.id.into_uuid())
        .bind(publication.article_id.into_uuid())
        .bind(Json(&publication.target))
        .bind(publication.status.as_str())
        .bind(to_i32(publication.retry_count))
        .bind(to_i32(publication.max_retries))
        .bind(&publication.external_id)
        .bind(&publication.external_url)
        .bind(publication.scheduled_at)
        .bind(publication.published_at)
        .bind(Json(&publication.content))
        .bind(Json(&publication.metadata))
        .bind(&publication.last_error)
        .bind(&publication.idempotency_key)
        .bind(publication.allow_duplicate)
        .bind(publication.created_at)
        .bind(publication.updated_at)
        .bind(publication.target.key())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        if inserted.is_some() {
            return Ok(CreateOutcome::Created(publication));
        }

        // Either the idempotency key or the active-target index conflicted.
        if let Some(key) = publication.idempotency_key.as_deref() {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
                return Ok(CreateOutcome::KeyTaken(existing));
            }
        }
        match self
            .find_claiming(publication.article_id, &publication.target.key())
            .await?
        {
            Some(existing) => Ok(CreateOutcome::ActiveExists(existing)),
            None => Err(StoreError::Backend(anyhow::anyhow!(
                "publication {} conflicted but no holder was found",
                publication.id
            ))),
        }
    }

    async fn find_publication(&self, id: PublicationId) -> StoreResult<Option<Publication>> {
        let row = sqlx::query(&format!(
            "SELECT {PUBLICATION_COLUMNS} FROM publications WHERE id = $1"
        ))
        .bind(id.into_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(decode::publication).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Publication>> {
        let row = sqlx::query(&format!(
            "SELECT {PUBLICATION_COLUMNS} FROM publications WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(decode::publication).transpose()
    }

    async fn find_active(
        &self,
        article_id: ArticleId,
        target_key: &str,
    ) -> StoreResult<Option<Publication>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {PUBLICATION_COLUMNS} FROM publications
            WHERE article_id = $1 AND target_key = $2 AND status <> 'failed'
            ORDER BY id
            LIMIT 1
            "#
        ))
        .bind(article_id.into_uuid())
        .bind(target_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(decode::publication).transpose()
    }

    async fn save_publication(&self, publication: &Publication) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE publications
            SET status = $2,
                retry_count = $3,
                max_retries = $4,
                external_id = $5,
                external_url = $6,
                scheduled_at = $7,
                published_at = $8,
                content = $9,
                metadata = $10,
                last_error = $11,
                updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(publication.id.into_uuid())
        .bind(publication.status.as_str())
        .bind(to_i32(publication.retry_count))
        .bind(to_i32(publication.max_retries))
        .bind(&publication.external_id)
        .bind(&publication.external_url)
        .bind(publication.scheduled_at)
        .bind(publication.published_at)
        .bind(Json(&publication.content))
        .bind(Json(&publication.metadata))
        .bind(&publication.last_error)
        .bind(publication.updated_at)
        .execute(&self.pool)
        .await;

        let result = match updated {
            Ok(result) => result,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let target_key = publication.target.key();
                let active_id = self
                    .find_claiming(publication.article_id, &target_key)
                    .await?
                    .map(|holder| holder.id)
                    .ok_or_else(|| {
                        StoreError::Backend(anyhow::anyhow!(
                            "publication {} conflicted but no holder was found",
                            publication.id
                        ))
                    })?;
                return Err(StoreError::DuplicatePublication {
                    publication_id: publication.id,
                    active_id,
                });
            }
            Err(e) => return Err(backend(e)),
        };

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("publication", publication.id));
        }
        Ok(())
    }

    async fn ready_to_execute(
        &self,
        now: DateTime<Utc>,
        max: usize,
    ) -> StoreResult<Vec<Publication>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PUBLICATION_COLUMNS} FROM publications
            WHERE status = 'pending'
               OR (status = 'scheduled' AND scheduled_at <= $1)
            ORDER BY id
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(decode::publication).collect()
    }

    async fn retry_eligible(&self, max: usize) -> StoreResult<Vec<Publication>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PUBLICATION_COLUMNS} FROM publications
            WHERE status = 'failed' AND retry_count < max_retries
            ORDER BY id
            LIMIT $1
            "#
        ))
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(decode::publication).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_declares_dedup_indexes() {
        assert!(SCHEMA.contains("uq_feed_items_source_guid"));
        assert!(SCHEMA.contains("uq_feed_items_source_url"));
        assert!(SCHEMA.contains("idempotency_key TEXT UNIQUE"));
        assert!(SCHEMA.contains("CREATE UNIQUE INDEX IF NOT EXISTS uq_publications_active"));
        assert!(SCHEMA.contains("WHERE status <> 'failed' AND NOT allow_duplicate"));
    }

    #[test]
    fn test_column_lists_match_decoders() {
        for column in ["status", "version", "flags", "publish_target"] {
            assert!(ARTICLE_COLUMNS.contains(column), "{column}");
        }
        for column in ["retry_count", "max_retries", "idempotency_key", "allow_duplicate"] {
            assert!(PUBLICATION_COLUMNS.contains(column), "{column}");
        }
    }
}
