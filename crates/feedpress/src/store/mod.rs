//! Storage interfaces.
//!
//! The core owns interfaces only. Each trait states the invariant its
//! implementation must enforce at the storage boundary, not in callers:
//!
//! - [`FeedItemStore::insert_if_absent`] enforces (source, guid) and (source, url)
//!   uniqueness atomically per item
//! - [`ArticleStore::transition`] is a compare-and-set on (status, version)
//! - [`PublicationStore::create`] enforces idempotency-key uniqueness and at
//!   most one claiming publication per (article, target)
//!
//! Implementations: [`MemoryStore`] (in-process), [`OverlayStore`] (dry-run
//! scratch layer) and `feedpress-postgres`.

mod memory;
mod overlay;

pub use memory::MemoryStore;
pub use overlay::OverlayStore;

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::automation::AutomationRule;
use crate::error::{Categorizable, ErrorCategory};
use crate::id::{ArticleId, FeedItemId, PublicationId, RuleId, SourceId};
use crate::lifecycle::{ArticleStatus, ArticleTransition};
use crate::model::{Article, FeedItem, IdentityKey, Publication, Source};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("article {article_id} changed concurrently: expected {expected_status} v{expected_version}, found {actual_status} v{actual_version}")]
    VersionConflict {
        article_id: ArticleId,
        expected_status: ArticleStatus,
        expected_version: i64,
        actual_status: ArticleStatus,
        actual_version: i64,
    },

    #[error("publication {publication_id} cannot become active: publication {active_id} holds its target")]
    DuplicatePublication {
        publication_id: PublicationId,
        active_id: PublicationId,
    },

    #[error("storage backend failed: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl Categorizable for StoreError {
    fn category(&self) -> ErrorCategory {
        match self {
            StoreError::NotFound { .. } => ErrorCategory::NotFound,
            StoreError::VersionConflict { .. } | StoreError::DuplicatePublication { .. } => {
                ErrorCategory::Conflict
            }
            StoreError::Backend(_) => ErrorCategory::Internal,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::VersionConflict { .. } => "version_conflict",
            StoreError::DuplicatePublication { .. } => "duplicate_publication",
            StoreError::Backend(_) => "storage_error",
        }
    }

    fn safe_message(&self) -> Cow<'static, str> {
        match self {
            StoreError::Backend(_) => "An internal error occurred".into(),
            other => other.to_string().into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn upsert_source(&self, source: Source) -> StoreResult<Source>;
    async fn find_source(&self, id: SourceId) -> StoreResult<Option<Source>>;
    /// Every source, oldest first.
    async fn list_sources(&self) -> StoreResult<Vec<Source>>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn insert_rule(&self, rule: AutomationRule) -> StoreResult<AutomationRule>;
    async fn find_rule(&self, id: RuleId) -> StoreResult<Option<AutomationRule>>;
    /// Rules of one source in creation order.
    async fn rules_for_source(&self, source_id: SourceId) -> StoreResult<Vec<AutomationRule>>;
    /// Replace the stored snapshot (enable/disable, recorded execution).
    async fn save_rule(&self, rule: &AutomationRule) -> StoreResult<()>;
}

#[async_trait]
pub trait FeedItemStore: Send + Sync {
    /// Insert unless an item of the same source already holds its guid or url.
    ///
    /// Returns `None` on conflict. Must be atomic per item: two overlapping
    /// calls for the same key insert at most one row.
    async fn insert_if_absent(&self, item: FeedItem) -> StoreResult<Option<FeedItem>>;
    async fn find_feed_item(&self, id: FeedItemId) -> StoreResult<Option<FeedItem>>;
    /// The item of `source_id` currently holding `key`.
    async fn find_by_identity(
        &self,
        source_id: SourceId,
        key: IdentityKey<'_>,
    ) -> StoreResult<Option<FeedItem>>;
    /// Oldest pending items of a source.
    async fn pending_feed_items(
        &self,
        source_id: SourceId,
        limit: usize,
    ) -> StoreResult<Vec<FeedItem>>;
    /// `pending → processing`. Returns false if the item was not pending.
    async fn claim_feed_item(&self, id: FeedItemId) -> StoreResult<bool>;
    /// `processing → processed`, recording the generated article.
    async fn complete_feed_item(&self, id: FeedItemId, article_id: ArticleId) -> StoreResult<()>;
    /// `processing → pending` after a failed generation.
    async fn release_feed_item(&self, id: FeedItemId) -> StoreResult<()>;
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn insert_article(&self, article: Article) -> StoreResult<Article>;
    async fn find_article(&self, id: ArticleId) -> StoreResult<Option<Article>>;
    /// Oldest articles in `status`.
    async fn articles_in_status(
        &self,
        status: ArticleStatus,
        limit: usize,
    ) -> StoreResult<Vec<Article>>;
    /// Apply a planned transition if the article still matches its expectations.
    ///
    /// Fails with [`StoreError::VersionConflict`] otherwise.
    async fn transition(&self, transition: &ArticleTransition) -> StoreResult<Article>;
}

/// Outcome of [`PublicationStore::create`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Publication),
    /// Another record already holds the idempotency key.
    KeyTaken(Publication),
    /// Another claiming record already holds the (article, target) slot.
    ActiveExists(Publication),
}

#[async_trait]
pub trait PublicationStore: Send + Sync {
    /// Insert unless the idempotency key is taken or, for a record that
    /// [claims its target](Publication::claims_target), another claiming record
    /// of the same article and target exists. Atomic per key and per slot.
    async fn create(&self, publication: Publication) -> StoreResult<CreateOutcome>;
    async fn find_publication(&self, id: PublicationId) -> StoreResult<Option<Publication>>;
    async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Publication>>;
    /// A non-failed publication of `article_id` to the target with `target_key`.
    async fn find_active(
        &self,
        article_id: ArticleId,
        target_key: &str,
    ) -> StoreResult<Option<Publication>>;
    /// Replace the stored record.
    ///
    /// Fails with [`StoreError::DuplicatePublication`] when the record starts
    /// claiming a target slot another record holds.
    async fn save_publication(&self, publication: &Publication) -> StoreResult<()>;
    /// Pending, or scheduled with `scheduled_at <= now`; oldest first.
    async fn ready_to_execute(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Publication>>;
    /// Failed with `retry_count < max_retries`; oldest first.
    async fn retry_eligible(&self, limit: usize) -> StoreResult<Vec<Publication>>;
}

/// Every store the core needs, behind one handle.
pub trait Stores:
    SourceStore + RuleStore + FeedItemStore + ArticleStore + PublicationStore
{
}

impl<T> Stores for T where
    T: SourceStore + RuleStore + FeedItemStore + ArticleStore + PublicationStore
{
}

pub type SharedStores = Arc<dyn Stores>;
