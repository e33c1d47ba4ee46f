//! In-process store backed by `DashMap`.
//!
//! Feed-item uniqueness is enforced by reserving each (source, guid) and
//! (source, url) key through the map's entry API, which locks the key's shard
//! for the check-and-insert. A partial reservation is rolled back before the
//! conflict is reported.
//!
//! Publications follow the same pattern. `create` takes the idempotency key
//! entry, then the (article, target) entry, and inserts the record while both
//! are held, so a rejected record is never visible. Entries are always taken
//! in that order: idempotency keys, active targets, publications.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{
    ArticleStore, CreateOutcome, FeedItemStore, PublicationStore, RuleStore, SourceStore,
    StoreError, StoreResult,
};
use crate::automation::AutomationRule;
use crate::id::{ArticleId, FeedItemId, PublicationId, RuleId, SourceId};
use crate::lifecycle::{ArticleStatus, ArticleTransition};
use crate::model::{Article, FeedItem, FeedItemStatus, IdentityKey, Publication, Source};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FeedKey {
    Guid(SourceId, String),
    Url(SourceId, String),
}

impl FeedKey {
    fn for_item(item: &FeedItem) -> Vec<FeedKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(guid) = &item.guid {
            keys.push(FeedKey::Guid(item.source_id, guid.clone()));
        }
        if let Some(url) = &item.url {
            keys.push(FeedKey::Url(item.source_id, url.clone()));
        }
        keys
    }
}

#[derive(Default)]
pub struct MemoryStore {
    sources: DashMap<SourceId, Source>,
    rules: DashMap<RuleId, AutomationRule>,
    feed_items: DashMap<FeedItemId, FeedItem>,
    feed_keys: DashMap<FeedKey, FeedItemId>,
    articles: DashMap<ArticleId, Article>,
    publications: DashMap<PublicationId, Publication>,
    idempotency_keys: DashMap<String, PublicationId>,
    active_targets: DashMap<(ArticleId, String), PublicationId>,
}

fn target_slot(publication: &Publication) -> (ArticleId, String) {
    (publication.article_id, publication.target.key())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All feed items of a source, oldest first.
    pub fn feed_items_for_source(&self, source_id: SourceId) -> Vec<FeedItem> {
        let mut items: Vec<FeedItem> = self
            .feed_items
            .iter()
            .filter(|entry| entry.source_id == source_id)
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by_key(|item| item.id);
        items
    }

    /// All publications of an article, oldest first.
    pub fn publications_for_article(&self, article_id: ArticleId) -> Vec<Publication> {
        let mut publications: Vec<Publication> = self
            .publications
            .iter()
            .filter(|entry| entry.article_id == article_id)
            .map(|entry| entry.value().clone())
            .collect();
        publications.sort_by_key(|p| p.id);
        publications
    }

    /// All articles of a source, oldest first.
    pub fn articles_for_source(&self, source_id: SourceId) -> Vec<Article> {
        let mut articles: Vec<Article> = self
            .articles
            .iter()
            .filter(|entry| entry.source_id == source_id)
            .map(|entry| entry.value().clone())
            .collect();
        articles.sort_by_key(|a| a.id);
        articles
    }

    /// Store copies of records read from another store, bypassing key checks.
    ///
    /// Used by [`OverlayStore`](super::OverlayStore) before it mutates a base record.
    pub(crate) fn shadow_feed_item(&self, item: FeedItem) {
        self.feed_items.entry(item.id).or_insert(item);
    }

    pub(crate) fn shadow_article(&self, article: Article) {
        self.articles.entry(article.id).or_insert(article);
    }

    pub(crate) fn shadow_rule(&self, rule: AutomationRule) {
        self.rules.insert(rule.id(), rule);
    }

    pub(crate) fn shadow_publication(&self, publication: Publication) {
        self.publications.insert(publication.id, publication);
    }

    fn publication_holding(&self, id: PublicationId) -> StoreResult<Publication> {
        self.publications
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or_else(|| StoreError::not_found("publication", id))
    }

    /// Insert `publication`, taking its target slot if it claims one.
    ///
    /// Returns the holder when the slot is taken. Nothing is written then.
    fn insert_claiming(&self, publication: &Publication) -> Option<PublicationId> {
        if !publication.claims_target() {
            self.publications.insert(publication.id, publication.clone());
            return None;
        }
        match self.active_targets.entry(target_slot(publication)) {
            Entry::Occupied(holder) if *holder.get() != publication.id => Some(*holder.get()),
            Entry::Occupied(_) => {
                self.publications.insert(publication.id, publication.clone());
                None
            }
            Entry::Vacant(slot) => {
                self.publications.insert(publication.id, publication.clone());
                slot.insert(publication.id);
                None
            }
        }
    }

    /// Reserve every key of `item`. Returns false, with nothing reserved, on conflict.
    fn reserve_keys(&self, item: &FeedItem) -> bool {
        let mut reserved: Vec<FeedKey> = Vec::new();

        for key in FeedKey::for_item(item) {
            // The entry guard must be released before any rollback touches the map.
            let taken = match self.feed_keys.entry(key.clone()) {
                Entry::Occupied(_) => true,
                Entry::Vacant(slot) => {
                    slot.insert(item.id);
                    false
                }
            };

            if taken {
                for key in reserved {
                    self.feed_keys.remove_if(&key, |_, owner| *owner == item.id);
                }
                return false;
            }
            reserved.push(key);
        }

        true
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn upsert_source(&self, source: Source) -> StoreResult<Source> {
        self.sources.insert(source.id, source.clone());
        Ok(source)
    }

    async fn find_source(&self, id: SourceId) -> StoreResult<Option<Source>> {
        Ok(self.sources.get(&id).map(|s| s.value().clone()))
    }

    async fn list_sources(&self) -> StoreResult<Vec<Source>> {
        let mut sources: Vec<Source> = self.sources.iter().map(|e| e.value().clone()).collect();
        sources.sort_by_key(|s| s.id);
        Ok(sources)
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn insert_rule(&self, rule: AutomationRule) -> StoreResult<AutomationRule> {
        self.rules.insert(rule.id(), rule.clone());
        Ok(rule)
    }

    async fn find_rule(&self, id: RuleId) -> StoreResult<Option<AutomationRule>> {
        Ok(self.rules.get(&id).map(|r| r.value().clone()))
    }

    async fn rules_for_source(&self, source_id: SourceId) -> StoreResult<Vec<AutomationRule>> {
        let mut rules: Vec<AutomationRule> = self
            .rules
            .iter()
            .filter(|entry| entry.source_id() == source_id)
            .map(|entry| entry.value().clone())
            .collect();
        rules.sort_by_key(|rule| rule.id());
        Ok(rules)
    }

    async fn save_rule(&self, rule: &AutomationRule) -> StoreResult<()> {
        match self.rules.get_mut(&rule.id()) {
            Some(mut stored) => {
                *stored = rule.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("rule", rule.id())),
        }
    }
}

#[async_trait]
impl FeedItemStore for MemoryStore {
    async fn insert_if_absent(&self, item: FeedItem) -> StoreResult<Option<FeedItem>> {
        if !self.reserve_keys(&item) {
            return Ok(None);
        }
        self.feed_items.insert(item.id, item.clone());
        Ok(Some(item))
    }

    async fn find_feed_item(&self, id: FeedItemId) -> StoreResult<Option<FeedItem>> {
        Ok(self.feed_items.get(&id).map(|i| i.value().clone()))
    }

    async fn find_by_identity(
        &self,
        source_id: SourceId,
        key: IdentityKey<'_>,
    ) -> StoreResult<Option<FeedItem>> {
        let key = match key {
            IdentityKey::Guid(guid) => FeedKey::Guid(source_id, guid.to_string()),
            IdentityKey::Url(url) => FeedKey::Url(source_id, url.to_string()),
        };
        let Some(id) = self.feed_keys.get(&key).map(|id| *id) else {
            return Ok(None);
        };
        self.find_feed_item(id).await
    }

    async fn pending_feed_items(
        &self,
        source_id: SourceId,
        limit: usize,
    ) -> StoreResult<Vec<FeedItem>> {
        let mut items: Vec<FeedItem> = self
            .feed_items
            .iter()
            .filter(|e| e.source_id == source_id && e.status == FeedItemStatus::Pending)
            .map(|e| e.value().clone())
            .collect();
        items.sort_by_key(|item| item.id);
        items.truncate(limit);
        Ok(items)
    }

    async fn claim_feed_item(&self, id: FeedItemId) -> StoreResult<bool> {
        let mut item = self
            .feed_items
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("feed item", id))?;
        if item.status != FeedItemStatus::Pending {
            return Ok(false);
        }
        item.status = FeedItemStatus::Processing;
        Ok(true)
    }

    async fn complete_feed_item(&self, id: FeedItemId, article_id: ArticleId) -> StoreResult<()> {
        let mut item = self
            .feed_items
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("feed item", id))?;
        item.status = FeedItemStatus::Processed;
        item.article_id = Some(article_id);
        Ok(())
    }

    async fn release_feed_item(&self, id: FeedItemId) -> StoreResult<()> {
        let mut item = self
            .feed_items
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("feed item", id))?;
        if item.status == FeedItemStatus::Processing {
            item.status = FeedItemStatus::Pending;
        }
        Ok(())
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn insert_article(&self, article: Article) -> StoreResult<Article> {
        self.articles.insert(article.id, article.clone());
        Ok(article)
    }

    async fn find_article(&self, id: ArticleId) -> StoreResult<Option<Article>> {
        Ok(self.articles.get(&id).map(|a| a.value().clone()))
    }

    async fn articles_in_status(
        &self,
        status: ArticleStatus,
        limit: usize,
    ) -> StoreResult<Vec<Article>> {
        let mut articles: Vec<Article> = self
            .articles
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.value().clone())
            .collect();
        articles.sort_by_key(|a| a.id);
        articles.truncate(limit);
        Ok(articles)
    }

    async fn transition(&self, transition: &ArticleTransition) -> StoreResult<Article> {
        let mut article = self
            .articles
            .get_mut(&transition.article_id)
            .ok_or_else(|| StoreError::not_found("article", transition.article_id))?;

        if !transition.matches(&article) {
            return Err(StoreError::VersionConflict {
                article_id: transition.article_id,
                expected_status: transition.expected_status,
                expected_version: transition.expected_version,
                actual_status: article.status,
                actual_version: article.version,
            });
        }

        transition.apply_to(&mut article);
        Ok(article.clone())
    }
}

#[async_trait]
impl PublicationStore for MemoryStore {
    async fn create(&self, publication: Publication) -> StoreResult<CreateOutcome> {
        let key_slot = match publication.idempotency_key.clone() {
            None => None,
            Some(key) => match self.idempotency_keys.entry(key) {
                Entry::Occupied(existing) => {
                    let holder = *existing.get();
                    drop(existing);
                    return Ok(CreateOutcome::KeyTaken(self.publication_holding(holder)?));
                }
                Entry::Vacant(slot) => Some(slot),
            },
        };

        if let Some(holder) = self.insert_claiming(&publication) {
            drop(key_slot);
            return Ok(CreateOutcome::ActiveExists(self.publication_holding(holder)?));
        }
        if let Some(slot) = key_slot {
            slot.insert(publication.id);
        }
        Ok(CreateOutcome::Created(publication))
    }

    async fn find_publication(&self, id: PublicationId) -> StoreResult<Option<Publication>> {
        Ok(self.publications.get(&id).map(|p| p.value().clone()))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Publication>> {
        let Some(id) = self.idempotency_keys.get(key).map(|id| *id) else {
            return Ok(None);
        };
        self.find_publication(id).await
    }

    async fn find_active(
        &self,
        article_id: ArticleId,
        target_key: &str,
    ) -> StoreResult<Option<Publication>> {
        Ok(self
            .publications_for_article(article_id)
            .into_iter()
            .find(|p| p.is_active() && p.target.key() == target_key))
    }

    async fn save_publication(&self, publication: &Publication) -> StoreResult<()> {
        let previous = self.publication_holding(publication.id)?;

        if let Some(active_id) = self.insert_claiming(publication) {
            return Err(StoreError::DuplicatePublication {
                publication_id: publication.id,
                active_id,
            });
        }
        if previous.claims_target() && !publication.claims_target() {
            self.active_targets
                .remove_if(&target_slot(&previous), |_, holder| *holder == publication.id);
        }
        Ok(())
    }

    async fn ready_to_execute(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Publication>> {
        let mut ready: Vec<Publication> = self
            .publications
            .iter()
            .filter(|e| e.is_ready_to_execute(now))
            .map(|e| e.value().clone())
            .collect();
        ready.sort_by_key(|p| p.id);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn retry_eligible(&self, limit: usize) -> StoreResult<Vec<Publication>> {
        let mut eligible: Vec<Publication> = self
            .publications
            .iter()
            .filter(|e| e.is_retry_eligible())
            .map(|e| e.value().clone())
            .collect();
        eligible.sort_by_key(|p| p.id);
        eligible.truncate(limit);
        Ok(eligible)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::lifecycle::{AutomationFlags, StageResult};
    use crate::model::{PublicationStatus, PublishContent, PublishMetadata, PublishTarget, RawFeedItem};

    fn item(source_id: SourceId, guid: Option<&str>, url: Option<&str>) -> FeedItem {
        FeedItem::from_raw(
            source_id,
            RawFeedItem {
                guid: guid.map(String::from),
                url: url.map(String::from),
                title: "t".into(),
                ..RawFeedItem::default()
            },
            Utc::now(),
        )
    }

    fn publication(article_id: ArticleId, key: Option<&str>) -> Publication {
        let now = Utc::now();
        Publication {
            id: PublicationId::new(),
            article_id,
            target: PublishTarget::new("wordpress", "site-1"),
            status: PublicationStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            external_id: None,
            external_url: None,
            scheduled_at: None,
            published_at: None,
            content: PublishContent::default(),
            metadata: PublishMetadata::default(),
            last_error: None,
            idempotency_key: key.map(String::from),
            allow_duplicate: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_guid_conflict_is_skipped() {
        let store = MemoryStore::new();
        let source = SourceId::new();

        assert!(store
            .insert_if_absent(item(source, Some("a"), None))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .insert_if_absent(item(source, Some("a"), Some("https://x")))
            .await
            .unwrap()
            .is_none());
        // The url of the rejected item was rolled back.
        assert!(store
            .insert_if_absent(item(source, None, Some("https://x")))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_keys_are_scoped_per_source() {
        let store = MemoryStore::new();
        let first = store
            .insert_if_absent(item(SourceId::new(), Some("a"), None))
            .await
            .unwrap();
        let second = store
            .insert_if_absent(item(SourceId::new(), Some("a"), None))
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn test_unkeyed_items_always_insert() {
        let store = MemoryStore::new();
        let source = SourceId::new();
        for _ in 0..3 {
            assert!(store
                .insert_if_absent(item(source, None, None))
                .await
                .unwrap()
                .is_some());
        }
        assert_eq!(store.feed_items_for_source(source).len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_of_same_key() {
        let store = Arc::new(MemoryStore::new());
        let source = SourceId::new();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert_if_absent(item(source, Some("same"), Some("https://same")))
                        .await
                        .unwrap()
                        .is_some()
                })
            })
            .collect();

        let mut inserted = 0;
        for task in tasks {
            if task.await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.feed_items_for_source(source).len(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_set() {
        let store = MemoryStore::new();
        let stored = store
            .insert_if_absent(item(SourceId::new(), Some("a"), None))
            .await
            .unwrap()
            .unwrap();

        assert!(store.claim_feed_item(stored.id).await.unwrap());
        assert!(!store.claim_feed_item(stored.id).await.unwrap());

        store.release_feed_item(stored.id).await.unwrap();
        assert!(store.claim_feed_item(stored.id).await.unwrap());

        let article_id = ArticleId::new();
        store.complete_feed_item(stored.id, article_id).await.unwrap();
        let done = store.find_feed_item(stored.id).await.unwrap().unwrap();
        assert_eq!(done.status, FeedItemStatus::Processed);
        assert_eq!(done.article_id, Some(article_id));
    }

    #[tokio::test]
    async fn test_stale_transition_is_a_conflict() {
        let store = MemoryStore::new();
        let flags = AutomationFlags {
            auto_generate_image: false,
            auto_publish: false,
        };
        let article = store
            .insert_article(Article::new(
                SourceId::new(),
                "t",
                "c",
                ArticleStatus::Generated,
                flags,
            ))
            .await
            .unwrap();

        let approve = ArticleTransition::plan(&article, StageResult::ApprovedForPublish).unwrap();
        let abandon = ArticleTransition::plan(
            &article,
            StageResult::Abandoned {
                reason: "dup".into(),
            },
        )
        .unwrap();

        let updated = store.transition(&approve).await.unwrap();
        assert_eq!(updated.status, ArticleStatus::ReadyToPublish);
        assert_eq!(updated.version, 1);

        let err = store.transition(&abandon).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                actual_status: ArticleStatus::ReadyToPublish,
                actual_version: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_idempotency_key_is_unique() {
        let store = MemoryStore::new();
        let article_id = ArticleId::new();

        let first = store
            .create(publication(article_id, Some("key-1")))
            .await
            .unwrap();
        let CreateOutcome::Created(first) = first else {
            panic!("first create must succeed");
        };

        let second = store
            .create(publication(article_id, Some("key-1")))
            .await
            .unwrap();
        assert_eq!(second, CreateOutcome::KeyTaken(first.clone()));
        assert_eq!(store.publications_for_article(article_id).len(), 1);
        assert_eq!(
            store.find_by_idempotency_key("key-1").await.unwrap(),
            Some(first)
        );
    }

    #[tokio::test]
    async fn test_find_active_ignores_failed() {
        let store = MemoryStore::new();
        let article_id = ArticleId::new();
        let mut failed = publication(article_id, None);
        failed.status = PublicationStatus::Failed;
        store.create(failed).await.unwrap();

        let key = PublishTarget::new("wordpress", "site-1").key();
        assert_eq!(store.find_active(article_id, &key).await.unwrap(), None);

        let CreateOutcome::Created(active) =
            store.create(publication(article_id, None)).await.unwrap()
        else {
            panic!("create must succeed");
        };
        assert_eq!(
            store.find_active(article_id, &key).await.unwrap(),
            Some(active)
        );
    }

    #[tokio::test]
    async fn test_second_active_publication_is_refused() {
        let store = MemoryStore::new();
        let article_id = ArticleId::new();

        let CreateOutcome::Created(first) =
            store.create(publication(article_id, None)).await.unwrap()
        else {
            panic!("first create must succeed");
        };
        let second = store
            .create(publication(article_id, Some("key-2")))
            .await
            .unwrap();

        assert_eq!(second, CreateOutcome::ActiveExists(first.clone()));
        assert_eq!(store.publications_for_article(article_id), [first]);
        // The refused record did not keep its idempotency key either.
        assert_eq!(store.find_by_idempotency_key("key-2").await.unwrap(), None);

        let mut duplicate = publication(article_id, None);
        duplicate.allow_duplicate = true;
        assert!(matches!(
            store.create(duplicate).await.unwrap(),
            CreateOutcome::Created(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_record_releases_target() {
        let store = MemoryStore::new();
        let article_id = ArticleId::new();
        let CreateOutcome::Created(mut first) =
            store.create(publication(article_id, None)).await.unwrap()
        else {
            panic!("create must succeed");
        };

        first.status = PublicationStatus::Failed;
        store.save_publication(&first).await.unwrap();

        let CreateOutcome::Created(second) =
            store.create(publication(article_id, None)).await.unwrap()
        else {
            panic!("a failed record must not block the target");
        };

        // Reactivating the failed record now collides with the new holder.
        first.status = PublicationStatus::Pending;
        let err = store.save_publication(&first).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::DuplicatePublication { publication_id, active_id }
                if publication_id == first.id && active_id == second.id
        ));
        let stored = store.find_publication(first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PublicationStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_for_same_target() {
        let store = Arc::new(MemoryStore::new());
        let article_id = ArticleId::new();

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create(publication(article_id, None)).await.unwrap() })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            match task.await.unwrap() {
                CreateOutcome::Created(_) => created += 1,
                CreateOutcome::ActiveExists(_) => {}
                CreateOutcome::KeyTaken(_) => panic!("no key was given"),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.publications_for_article(article_id).len(), 1);
    }

    #[tokio::test]
    async fn test_find_by_identity() {
        let store = MemoryStore::new();
        let source = SourceId::new();
        let stored = store
            .insert_if_absent(item(source, Some("a"), Some("https://x")))
            .await
            .unwrap()
            .unwrap();

        let by_url = store
            .find_by_identity(source, IdentityKey::Url("https://x"))
            .await
            .unwrap();
        assert_eq!(by_url.map(|i| i.id), Some(stored.id));
        assert!(store
            .find_by_identity(SourceId::new(), IdentityKey::Guid("a"))
            .await
            .unwrap()
            .is_none());
    }
}
