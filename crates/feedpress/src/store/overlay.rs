//! Dry-run scratch layer.
//!
//! Reads see the scratch layer first, then the base store. Writes only ever
//! touch the scratch layer; a base record is copied into scratch before it is
//! mutated. Uniqueness checks consult both layers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ArticleStore, CreateOutcome, FeedItemStore, MemoryStore, PublicationStore, RuleStore,
    SharedStores, SourceStore, StoreError, StoreResult,
};
use crate::automation::AutomationRule;
use crate::id::{ArticleId, FeedItemId, PublicationId, RuleId, SourceId};
use crate::lifecycle::{ArticleStatus, ArticleTransition};
use crate::model::{Article, FeedItem, FeedItemStatus, IdentityKey, Publication, Source};

pub struct OverlayStore {
    base: SharedStores,
    scratch: MemoryStore,
}

impl OverlayStore {
    pub fn new(base: SharedStores) -> Self {
        Self {
            base,
            scratch: MemoryStore::new(),
        }
    }

    /// The records written during this overlay's lifetime.
    pub fn scratch(&self) -> &MemoryStore {
        &self.scratch
    }

    async fn base_conflict(&self, item: &FeedItem) -> StoreResult<bool> {
        if let Some(guid) = item.guid.as_deref() {
            if self
                .base
                .find_by_identity(item.source_id, IdentityKey::Guid(guid))
                .await?
                .is_some()
            {
                return Ok(true);
            }
        }
        if let Some(url) = item.url.as_deref() {
            if self
                .base
                .find_by_identity(item.source_id, IdentityKey::Url(url))
                .await?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Make sure the feed item lives in scratch before it is mutated.
    async fn lift_feed_item(&self, id: FeedItemId) -> StoreResult<()> {
        if self.scratch.find_feed_item(id).await?.is_none() {
            let item = self
                .base
                .find_feed_item(id)
                .await?
                .ok_or_else(|| StoreError::not_found("feed item", id))?;
            self.scratch.shadow_feed_item(item);
        }
        Ok(())
    }
}

/// Merge two id-keyed lists, letting `top` win, then re-filter and cap.
fn merge<K, T>(
    bottom: Vec<T>,
    top: Vec<T>,
    key: impl Fn(&T) -> K,
    keep: impl Fn(&T) -> bool,
    limit: usize,
) -> Vec<T>
where
    K: Ord,
{
    let mut merged: BTreeMap<K, T> = BTreeMap::new();
    for record in bottom.into_iter().chain(top) {
        merged.insert(key(&record), record);
    }
    merged.into_values().filter(|r| keep(r)).take(limit).collect()
}

#[async_trait]
impl SourceStore for OverlayStore {
    async fn upsert_source(&self, source: Source) -> StoreResult<Source> {
        self.scratch.upsert_source(source).await
    }

    async fn find_source(&self, id: SourceId) -> StoreResult<Option<Source>> {
        match self.scratch.find_source(id).await? {
            Some(source) => Ok(Some(source)),
            None => self.base.find_source(id).await,
        }
    }

    async fn list_sources(&self) -> StoreResult<Vec<Source>> {
        let base = self.base.list_sources().await?;
        let scratch = self.scratch.list_sources().await?;
        Ok(merge(base, scratch, |s| s.id, |_| true, usize::MAX))
    }
}

#[async_trait]
impl RuleStore for OverlayStore {
    async fn insert_rule(&self, rule: AutomationRule) -> StoreResult<AutomationRule> {
        self.scratch.insert_rule(rule).await
    }

    async fn find_rule(&self, id: RuleId) -> StoreResult<Option<AutomationRule>> {
        match self.scratch.find_rule(id).await? {
            Some(rule) => Ok(Some(rule)),
            None => self.base.find_rule(id).await,
        }
    }

    async fn rules_for_source(&self, source_id: SourceId) -> StoreResult<Vec<AutomationRule>> {
        let base = self.base.rules_for_source(source_id).await?;
        let scratch = self.scratch.rules_for_source(source_id).await?;
        Ok(merge(base, scratch, AutomationRule::id, |_| true, usize::MAX))
    }

    async fn save_rule(&self, rule: &AutomationRule) -> StoreResult<()> {
        if self.find_rule(rule.id()).await?.is_none() {
            return Err(StoreError::not_found("rule", rule.id()));
        }
        self.scratch.shadow_rule(rule.clone());
        Ok(())
    }
}

#[async_trait]
impl FeedItemStore for OverlayStore {
    async fn insert_if_absent(&self, item: FeedItem) -> StoreResult<Option<FeedItem>> {
        if self.base_conflict(&item).await? {
            return Ok(None);
        }
        self.scratch.insert_if_absent(item).await
    }

    async fn find_feed_item(&self, id: FeedItemId) -> StoreResult<Option<FeedItem>> {
        match self.scratch.find_feed_item(id).await? {
            Some(item) => Ok(Some(item)),
            None => self.base.find_feed_item(id).await,
        }
    }

    async fn find_by_identity(
        &self,
        source_id: SourceId,
        key: IdentityKey<'_>,
    ) -> StoreResult<Option<FeedItem>> {
        match self.scratch.find_by_identity(source_id, key).await? {
            Some(item) => Ok(Some(item)),
            None => self.base.find_by_identity(source_id, key).await,
        }
    }

    async fn pending_feed_items(
        &self,
        source_id: SourceId,
        limit: usize,
    ) -> StoreResult<Vec<FeedItem>> {
        let base = self.base.pending_feed_items(source_id, limit).await?;
        let mut scratch = Vec::new();
        for item in &base {
            if let Some(shadow) = self.scratch.find_feed_item(item.id).await? {
                scratch.push(shadow);
            }
        }
        scratch.extend(self.scratch.pending_feed_items(source_id, limit).await?);
        Ok(merge(
            base,
            scratch,
            |item| item.id,
            |item| item.status == FeedItemStatus::Pending,
            limit,
        ))
    }

    async fn claim_feed_item(&self, id: FeedItemId) -> StoreResult<bool> {
        self.lift_feed_item(id).await?;
        self.scratch.claim_feed_item(id).await
    }

    async fn complete_feed_item(&self, id: FeedItemId, article_id: ArticleId) -> StoreResult<()> {
        self.lift_feed_item(id).await?;
        self.scratch.complete_feed_item(id, article_id).await
    }

    async fn release_feed_item(&self, id: FeedItemId) -> StoreResult<()> {
        self.lift_feed_item(id).await?;
        self.scratch.release_feed_item(id).await
    }
}

#[async_trait]
impl ArticleStore for OverlayStore {
    async fn insert_article(&self, article: Article) -> StoreResult<Article> {
        self.scratch.insert_article(article).await
    }

    async fn find_article(&self, id: ArticleId) -> StoreResult<Option<Article>> {
        match self.scratch.find_article(id).await? {
            Some(article) => Ok(Some(article)),
            None => self.base.find_article(id).await,
        }
    }

    async fn articles_in_status(
        &self,
        status: ArticleStatus,
        limit: usize,
    ) -> StoreResult<Vec<Article>> {
        let base = self.base.articles_in_status(status, limit).await?;
        // Scratch copies may have left `status`; fetch them regardless so they mask the base row.
        let mut scratch = Vec::new();
        for article in &base {
            if let Some(shadow) = self.scratch.find_article(article.id).await? {
                scratch.push(shadow);
            }
        }
        scratch.extend(self.scratch.articles_in_status(status, limit).await?);
        Ok(merge(base, scratch, |a| a.id, |a| a.status == status, limit))
    }

    async fn transition(&self, transition: &ArticleTransition) -> StoreResult<Article> {
        if self.scratch.find_article(transition.article_id).await?.is_none() {
            let article = self
                .base
                .find_article(transition.article_id)
                .await?
                .ok_or_else(|| StoreError::not_found("article", transition.article_id))?;
            self.scratch.shadow_article(article);
        }
        self.scratch.transition(transition).await
    }
}

#[async_trait]
impl PublicationStore for OverlayStore {
    async fn create(&self, publication: Publication) -> StoreResult<CreateOutcome> {
        if let Some(key) = publication.idempotency_key.as_deref() {
            if let Some(existing) = self.base.find_by_idempotency_key(key).await? {
                let current = self.find_publication(existing.id).await?.unwrap_or(existing);
                return Ok(CreateOutcome::KeyTaken(current));
            }
        }
        if publication.claims_target() {
            let target_key = publication.target.key();
            if let Some(active) = self.find_active(publication.article_id, &target_key).await? {
                if active.claims_target() {
                    return Ok(CreateOutcome::ActiveExists(active));
                }
            }
        }
        self.scratch.create(publication).await
    }

    async fn find_publication(&self, id: PublicationId) -> StoreResult<Option<Publication>> {
        match self.scratch.find_publication(id).await? {
            Some(publication) => Ok(Some(publication)),
            None => self.base.find_publication(id).await,
        }
    }

    async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Publication>> {
        if let Some(found) = self.scratch.find_by_idempotency_key(key).await? {
            return Ok(Some(found));
        }
        match self.base.find_by_idempotency_key(key).await? {
            Some(existing) => self.find_publication(existing.id).await,
            None => Ok(None),
        }
    }

    async fn find_active(
        &self,
        article_id: ArticleId,
        target_key: &str,
    ) -> StoreResult<Option<Publication>> {
        if let Some(found) = self.scratch.find_active(article_id, target_key).await? {
            return Ok(Some(found));
        }
        let Some(base) = self.base.find_active(article_id, target_key).await? else {
            return Ok(None);
        };
        match self.scratch.find_publication(base.id).await? {
            Some(shadow) if shadow.is_active() => Ok(Some(shadow)),
            Some(_) => Ok(None),
            None => Ok(Some(base)),
        }
    }

    async fn save_publication(&self, publication: &Publication) -> StoreResult<()> {
        if self.find_publication(publication.id).await?.is_none() {
            return Err(StoreError::not_found("publication", publication.id));
        }
        self.scratch.shadow_publication(publication.clone());
        Ok(())
    }

    async fn ready_to_execute(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Publication>> {
        let base = self.base.ready_to_execute(now, limit).await?;
        let mut scratch = Vec::new();
        for publication in &base {
            if let Some(shadow) = self.scratch.find_publication(publication.id).await? {
                scratch.push(shadow);
            }
        }
        scratch.extend(self.scratch.ready_to_execute(now, limit).await?);
        Ok(merge(
            base,
            scratch,
            |p| p.id,
            |p| p.is_ready_to_execute(now),
            limit,
        ))
    }

    async fn retry_eligible(&self, limit: usize) -> StoreResult<Vec<Publication>> {
        let base = self.base.retry_eligible(limit).await?;
        let mut scratch = Vec::new();
        for publication in &base {
            if let Some(shadow) = self.scratch.find_publication(publication.id).await? {
                scratch.push(shadow);
            }
        }
        scratch.extend(self.scratch.retry_eligible(limit).await?);
        Ok(merge(base, scratch, |p| p.id, Publication::is_retry_eligible, limit))
    }
}
