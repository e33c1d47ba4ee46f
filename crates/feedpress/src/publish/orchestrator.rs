use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{
    Disposition, PlatformRequest, PublishError, PublishReceipt, PublishRequest, PublisherRegistry,
};
use crate::bus::EventBus;
use crate::config::FeedpressConfig;
use crate::events::{PublicationCompleted, PublicationFailed};
use crate::id::{ArticleId, PublicationId};
use crate::lifecycle::StageResult;
use crate::model::{Publication, PublicationStatus};
use crate::stages::{advance_article, AdvanceError};
use crate::store::{CreateOutcome, SharedStores, StoreError};

/// Creates, executes and retries publications.
#[derive(Clone)]
pub struct PublicationOrchestrator {
    stores: SharedStores,
    publishers: PublisherRegistry,
    bus: EventBus,
    config: FeedpressConfig,
}

impl PublicationOrchestrator {
    pub fn new(
        stores: SharedStores,
        publishers: PublisherRegistry,
        bus: EventBus,
        config: FeedpressConfig,
    ) -> Self {
        Self {
            stores,
            publishers,
            bus,
            config,
        }
    }

    pub fn publishers(&self) -> &PublisherRegistry {
        &self.publishers
    }

    /// Publish an article snapshot to `request.target`.
    ///
    /// A scheduled request only records the publication; the dispatch sweep
    /// executes it once due.
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, PublishError> {
        let errors = request.validate();
        if !errors.is_empty() {
            return Err(PublishError::Invalid(errors));
        }
        if !self.publishers.supports(&request.target.platform) {
            return Err(PublishError::UnsupportedPlatform {
                platform: request.target.platform.clone(),
            });
        }

        if let Some(key) = request.options.idempotency_key.as_deref() {
            if let Some(existing) = self.stores.find_by_idempotency_key(key).await? {
                return replay(existing, &request, key);
            }
        }

        let article = self
            .stores
            .find_article(request.article_id)
            .await?
            .ok_or(PublishError::ArticleNotFound(request.article_id))?;

        if !request.options.allow_duplicate {
            let target_key = request.target.key();
            if let Some(existing) = self.stores.find_active(article.id, &target_key).await? {
                info!(
                    article_id = %article.id,
                    publication_id = %existing.id,
                    target = %target_key,
                    "article already has an active publication for target"
                );
                return Ok(PublishReceipt::new(&existing, Disposition::Existing));
            }
        }

        let now = Utc::now();
        let status = match request.options.scheduled_at {
            Some(at) if at > now => PublicationStatus::Scheduled,
            _ => PublicationStatus::Pending,
        };
        let publication = Publication {
            id: PublicationId::new(),
            article_id: article.id,
            target: request.target.clone(),
            status,
            retry_count: 0,
            max_retries: self.config.publish_max_retries,
            external_id: None,
            external_url: None,
            scheduled_at: request.options.scheduled_at,
            published_at: None,
            content: request.content.clone(),
            metadata: request.metadata.clone(),
            last_error: None,
            idempotency_key: request.options.idempotency_key.clone(),
            allow_duplicate: request.options.allow_duplicate,
            created_at: now,
            updated_at: now,
        };

        let publication = match self.stores.create(publication).await? {
            CreateOutcome::Created(publication) => publication,
            CreateOutcome::KeyTaken(existing) => {
                let key = request.options.idempotency_key.as_deref().unwrap_or_default();
                return replay(existing, &request, key);
            }
            CreateOutcome::ActiveExists(existing) => {
                info!(
                    article_id = %existing.article_id,
                    publication_id = %existing.id,
                    target = %existing.target.key(),
                    "concurrent publish lost the target to another publication"
                );
                return Ok(PublishReceipt::new(&existing, Disposition::Existing));
            }
        };

        if publication.status == PublicationStatus::Scheduled {
            info!(
                publication_id = %publication.id,
                article_id = %publication.article_id,
                scheduled_at = ?publication.scheduled_at,
                "publication scheduled"
            );
            return Ok(PublishReceipt::new(&publication, Disposition::Created));
        }

        let publication = self.execute(publication).await?;
        Ok(PublishReceipt::new(&publication, Disposition::Created))
    }

    /// Execute a failed publication again.
    ///
    /// Fails with [`PublishError::Superseded`] when another publication took
    /// over the article's target since the failure.
    pub async fn retry(&self, publication_id: PublicationId) -> Result<PublishReceipt, PublishError> {
        let publication = self
            .stores
            .find_publication(publication_id)
            .await?
            .ok_or(PublishError::PublicationNotFound(publication_id))?;

        if !publication.is_retry_eligible() {
            return Err(PublishError::NotRetryable {
                publication_id,
                status: publication.status,
                retry_count: publication.retry_count,
                max_retries: publication.max_retries,
            });
        }

        let publication = self.reactivate(publication).await?;
        Ok(PublishReceipt::new(&publication, Disposition::Retried))
    }

    /// Execute every pending or due scheduled publication, one at a time.
    pub async fn execute_due(&self, now: DateTime<Utc>) -> Result<Vec<PublishReceipt>, PublishError> {
        let due = self
            .stores
            .ready_to_execute(now, self.config.stage_batch_size)
            .await?;
        self.execute_batch(due, Disposition::Dispatched).await
    }

    /// Retry every retry-eligible publication, one at a time.
    pub async fn retry_failed(&self) -> Result<Vec<PublishReceipt>, PublishError> {
        let eligible = self
            .stores
            .retry_eligible(self.config.stage_batch_size)
            .await?;
        self.execute_batch(eligible, Disposition::Retried).await
    }

    async fn execute_batch(
        &self,
        publications: Vec<Publication>,
        disposition: Disposition,
    ) -> Result<Vec<PublishReceipt>, PublishError> {
        let delay = self.config.inter_item_delay();
        let mut receipts = Vec::with_capacity(publications.len());

        for (index, publication) in publications.into_iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let id = publication.id;
            let executed = match disposition {
                Disposition::Retried => self.reactivate(publication).await,
                _ => self.execute(publication).await,
            };
            match executed {
                Ok(executed) => receipts.push(PublishReceipt::new(&executed, disposition)),
                Err(PublishError::Store(e)) => return Err(e.into()),
                Err(e) => warn!(publication_id = %id, error = %e, "publication skipped"),
            }
        }

        Ok(receipts)
    }

    /// Take the target slot back for a failed record, then execute it.
    ///
    /// The record is superseded instead when another publication holds the slot.
    async fn reactivate(&self, failed: Publication) -> Result<Publication, PublishError> {
        if !failed.allow_duplicate {
            let target_key = failed.target.key();
            if let Some(active) = self.stores.find_active(failed.article_id, &target_key).await? {
                if active.id != failed.id {
                    return Err(self.supersede(failed, active.id).await);
                }
            }
        }

        let mut pending = failed.clone();
        pending.status = PublicationStatus::Pending;
        pending.updated_at = Utc::now();
        match self.stores.save_publication(&pending).await {
            Ok(()) => self.execute(pending).await,
            Err(StoreError::DuplicatePublication { active_id, .. }) => {
                Err(self.supersede(failed, active_id).await)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn supersede(&self, mut failed: Publication, active_id: PublicationId) -> PublishError {
        failed.supersede(active_id, Utc::now());
        if let Err(e) = self.stores.save_publication(&failed).await {
            return e.into();
        }
        info!(
            publication_id = %failed.id,
            article_id = %failed.article_id,
            active_id = %active_id,
            "failed publication superseded"
        );
        PublishError::Superseded {
            publication_id: failed.id,
            active_id,
        }
    }

    /// Call the platform and record the outcome on the publication.
    async fn execute(&self, mut publication: Publication) -> Result<Publication, PublishError> {
        let publisher = self.publishers.get(&publication.target.platform).ok_or_else(|| {
            PublishError::UnsupportedPlatform {
                platform: publication.target.platform.clone(),
            }
        })?;

        let request = PlatformRequest {
            publication_id: publication.id,
            article_id: publication.article_id,
            target: publication.target.clone(),
            content: publication.content.clone(),
            metadata: publication.metadata.clone(),
        };
        let limit = self.config.external_call_timeout();
        let outcome = tokio::time::timeout(limit, publisher.publish(&request))
            .await
            .unwrap_or_else(|_| Err(anyhow!("publish timed out after {limit:?}")));

        let now = Utc::now();
        publication.updated_at = now;

        match outcome {
            Ok(post) => {
                publication.status = PublicationStatus::Completed;
                publication.external_id = Some(post.external_id);
                publication.external_url = post.external_url;
                publication.published_at = Some(now);
                publication.last_error = None;
                self.stores.save_publication(&publication).await?;

                info!(
                    publication_id = %publication.id,
                    article_id = %publication.article_id,
                    external_id = publication.external_id.as_deref(),
                    "publication completed"
                );
                self.bus
                    .publish(PublicationCompleted {
                        publication_id: publication.id,
                        article_id: publication.article_id,
                        external_id: publication.external_id.clone(),
                        external_url: publication.external_url.clone(),
                    })
                    .await;
                self.sync_article(publication.article_id, StageResult::Published)
                    .await?;
            }
            Err(e) => {
                let error = format!("{e:#}");
                publication.status = PublicationStatus::Failed;
                publication.retry_count = publication.retry_count.saturating_add(1);
                publication.last_error = Some(error.clone());
                self.stores.save_publication(&publication).await?;

                let retry_eligible = publication.is_retry_eligible();
                warn!(
                    publication_id = %publication.id,
                    article_id = %publication.article_id,
                    retry_count = publication.retry_count,
                    max_retries = publication.max_retries,
                    retry_eligible,
                    error = %error,
                    "publication failed"
                );
                self.bus
                    .publish(PublicationFailed {
                        publication_id: publication.id,
                        article_id: publication.article_id,
                        error: error.clone(),
                        retry_count: publication.retry_count,
                        retry_eligible,
                    })
                    .await;
                if !retry_eligible {
                    self.sync_article(
                        publication.article_id,
                        StageResult::PublishFailed {
                            error,
                            retries_exhausted: true,
                        },
                    )
                    .await?;
                }
            }
        }

        Ok(publication)
    }

    /// Mirror a publication outcome onto the article.
    ///
    /// The publication is the record of truth; an article that cannot take the
    /// transition is logged and left as is.
    async fn sync_article(&self, article_id: ArticleId, result: StageResult) -> Result<(), StoreError> {
        match advance_article(&self.stores, &self.bus, article_id, result).await {
            Ok(_) => Ok(()),
            Err(AdvanceError::Store(StoreError::Backend(e))) => Err(StoreError::Backend(e)),
            Err(e) => {
                warn!(article_id = %article_id, error = %e, "article status not updated after publication");
                Ok(())
            }
        }
    }
}

fn replay(
    existing: Publication,
    request: &PublishRequest,
    key: &str,
) -> Result<PublishReceipt, PublishError> {
    if existing.article_id != request.article_id || existing.target.key() != request.target.key() {
        return Err(PublishError::IdempotencyKeyReuse {
            key: key.to_string(),
        });
    }
    info!(
        publication_id = %existing.id,
        idempotency_key = key,
        "idempotent publish replayed"
    );
    Ok(PublishReceipt::new(&existing, Disposition::Replayed))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::lifecycle::{ArticleStatus, AutomationFlags};
    use crate::model::{Article, PublishContent, PublishMetadata, PublishTarget};
    use crate::publish::{ExternalPost, PublishOptions, Publisher};
    use crate::store::{ArticleStore, MemoryStore, PublicationStore};

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
        hang: bool,
        seen: Mutex<Vec<PublicationId>>,
    }

    impl Flaky {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
                hang: false,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Publisher for Flaky {
        fn platform(&self) -> &str {
            "wordpress"
        }

        async fn publish(&self, request: &PlatformRequest) -> anyhow::Result<ExternalPost> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.publication_id);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if call < self.failures {
                return Err(anyhow!("HTTP 502 from wordpress"));
            }
            Ok(ExternalPost {
                external_id: format!("wp-{call}"),
                external_url: Some(format!("https://blog.test/?p={call}")),
            })
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        publisher: Arc<Flaky>,
        orchestrator: PublicationOrchestrator,
        article: Article,
    }

    async fn fixture_with(publisher: Arc<Flaky>, config: FeedpressConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let article = store
            .insert_article(Article::new(
                crate::id::SourceId::new(),
                "Title",
                "Body",
                ArticleStatus::ReadyToPublish,
                AutomationFlags::default(),
            ))
            .await
            .unwrap();
        let orchestrator = PublicationOrchestrator::new(
            store.clone(),
            PublisherRegistry::new().with(publisher.clone()),
            EventBus::new(),
            config,
        );
        Fixture {
            store,
            publisher,
            orchestrator,
            article,
        }
    }

    async fn fixture(failures: usize) -> Fixture {
        let config = FeedpressConfig {
            inter_item_delay_ms: 0,
            ..FeedpressConfig::default()
        };
        fixture_with(Flaky::new(failures), config).await
    }

    fn request(article_id: ArticleId) -> PublishRequest {
        PublishRequest {
            article_id,
            target: PublishTarget::new("wordpress", "site-1"),
            content: PublishContent {
                title: "Title".into(),
                content: "Body".into(),
                ..PublishContent::default()
            },
            metadata: PublishMetadata::default(),
            options: PublishOptions::default(),
        }
    }

    fn keyed(article_id: ArticleId, key: &str) -> PublishRequest {
        let mut request = request(article_id);
        request.options.idempotency_key = Some(key.into());
        request
    }

    #[tokio::test]
    async fn test_publish_completes_and_advances_article() {
        let fx = fixture(0).await;

        let receipt = fx.orchestrator.publish(request(fx.article.id)).await.unwrap();

        assert_eq!(receipt.status, PublicationStatus::Completed);
        assert_eq!(receipt.external_id.as_deref(), Some("wp-0"));
        assert_eq!(receipt.disposition, Disposition::Created);
        assert!(receipt.published_at.is_some());

        let article = fx.store.find_article(fx.article.id).await.unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Published);
    }

    #[tokio::test]
    async fn test_same_idempotency_key_replays_without_second_call() {
        let fx = fixture(0).await;

        let first = fx
            .orchestrator
            .publish(keyed(fx.article.id, "req-1"))
            .await
            .unwrap();
        let second = fx
            .orchestrator
            .publish(keyed(fx.article.id, "req-1"))
            .await
            .unwrap();

        assert_eq!(first.publication_id, second.publication_id);
        assert_eq!(second.disposition, Disposition::Replayed);
        assert_eq!(fx.publisher.calls(), 1);
    }

    #[tokio::test]
    async fn test_idempotency_key_reuse_for_other_article_is_rejected() {
        let fx = fixture(0).await;
        fx.orchestrator
            .publish(keyed(fx.article.id, "req-1"))
            .await
            .unwrap();

        let err = fx
            .orchestrator
            .publish(keyed(ArticleId::new(), "req-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::IdempotencyKeyReuse { .. }));
        assert_eq!(fx.publisher.calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_guard_returns_existing() {
        let fx = fixture(0).await;

        let first = fx.orchestrator.publish(request(fx.article.id)).await.unwrap();
        let second = fx.orchestrator.publish(request(fx.article.id)).await.unwrap();

        assert_eq!(second.publication_id, first.publication_id);
        assert_eq!(second.disposition, Disposition::Existing);
        assert_eq!(fx.publisher.calls(), 1);

        let mut again = request(fx.article.id);
        again.options.allow_duplicate = true;
        let third = fx.orchestrator.publish(again).await.unwrap();
        assert_ne!(third.publication_id, first.publication_id);
        assert_eq!(fx.publisher.calls(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_platform_creates_nothing() {
        let fx = fixture(0).await;
        let mut req = request(fx.article.id);
        req.target = PublishTarget::new("myspace", "page");

        let err = fx.orchestrator.publish(req).await.unwrap_err();

        assert!(matches!(err, PublishError::UnsupportedPlatform { .. }));
        assert!(fx.store.publications_for_article(fx.article.id).is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_retry_succeeds() {
        let fx = fixture(1).await;

        let failed = fx.orchestrator.publish(request(fx.article.id)).await.unwrap();
        assert_eq!(failed.status, PublicationStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error.as_deref(), Some("HTTP 502 from wordpress"));

        let article = fx.store.find_article(fx.article.id).await.unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::ReadyToPublish);

        // A failed record does not block a new publication attempt either.
        assert!(fx
            .store
            .find_active(fx.article.id, &PublishTarget::new("wordpress", "site-1").key())
            .await
            .unwrap()
            .is_none());

        let retried = fx.orchestrator.retry(failed.publication_id).await.unwrap();
        assert_eq!(retried.status, PublicationStatus::Completed);
        assert_eq!(retried.disposition, Disposition::Retried);
        assert_eq!(retried.retry_count, 1);

        let err = fx.orchestrator.retry(failed.publication_id).await.unwrap_err();
        assert!(matches!(err, PublishError::NotRetryable { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_article() {
        let config = FeedpressConfig {
            inter_item_delay_ms: 0,
            publish_max_retries: 2,
            ..FeedpressConfig::default()
        };
        let fx = fixture_with(Flaky::new(usize::MAX), config).await;

        let receipt = fx.orchestrator.publish(request(fx.article.id)).await.unwrap();
        let swept = fx.orchestrator.retry_failed().await.unwrap();

        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].publication_id, receipt.publication_id);
        assert_eq!(swept[0].retry_count, 2);
        assert!(fx.orchestrator.retry_failed().await.unwrap().is_empty());

        let article = fx.store.find_article(fx.article.id).await.unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Failed);
        assert_eq!(article.last_error.as_deref(), Some("HTTP 502 from wordpress"));
    }

    #[tokio::test]
    async fn test_scheduled_publication_waits_for_dispatch() {
        let fx = fixture(0).await;
        let at = Utc::now() + ChronoDuration::hours(1);
        let mut req = request(fx.article.id);
        req.options.scheduled_at = Some(at);

        let receipt = fx.orchestrator.publish(req).await.unwrap();
        assert_eq!(receipt.status, PublicationStatus::Scheduled);
        assert_eq!(fx.publisher.calls(), 0);

        assert!(fx.orchestrator.execute_due(Utc::now()).await.unwrap().is_empty());

        let dispatched = fx
            .orchestrator
            .execute_due(at + ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].status, PublicationStatus::Completed);
        assert_eq!(dispatched[0].disposition, Disposition::Dispatched);
        assert_eq!(fx.publisher.calls(), 1);
    }

    #[tokio::test]
    async fn test_retry_after_newer_success_is_superseded() {
        let fx = fixture(1).await;

        let failed = fx.orchestrator.publish(request(fx.article.id)).await.unwrap();
        assert_eq!(failed.status, PublicationStatus::Failed);
        let newer = fx.orchestrator.publish(request(fx.article.id)).await.unwrap();
        assert_eq!(newer.status, PublicationStatus::Completed);
        assert_eq!(newer.disposition, Disposition::Created);

        let err = fx.orchestrator.retry(failed.publication_id).await.unwrap_err();
        assert!(matches!(
            err,
            PublishError::Superseded { publication_id, active_id }
                if publication_id == failed.publication_id && active_id == newer.publication_id
        ));
        assert!(fx.orchestrator.retry_failed().await.unwrap().is_empty());
        assert_eq!(fx.publisher.calls(), 2);

        let publications = fx.store.publications_for_article(fx.article.id);
        let completed = publications
            .iter()
            .filter(|p| p.status == PublicationStatus::Completed)
            .count();
        assert_eq!(completed, 1);
        let old = fx
            .store
            .find_publication(failed.publication_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.status, PublicationStatus::Failed);
        assert!(!old.is_retry_eligible());
        assert!(old.last_error.unwrap().contains("superseded"));
    }

    #[tokio::test]
    async fn test_retry_sweep_skips_superseded_records() {
        let fx = fixture(1).await;

        fx.orchestrator.publish(request(fx.article.id)).await.unwrap();
        fx.orchestrator.publish(request(fx.article.id)).await.unwrap();

        assert!(fx.orchestrator.retry_failed().await.unwrap().is_empty());
        assert_eq!(fx.publisher.calls(), 2);
        assert!(fx
            .store
            .retry_eligible(10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishes_create_one_publication() {
        let fx = fixture(0).await;

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let orchestrator = fx.orchestrator.clone();
                let request = request(fx.article.id);
                tokio::spawn(async move { orchestrator.publish(request).await.unwrap() })
            })
            .collect();

        let mut receipts = Vec::new();
        for task in tasks {
            receipts.push(task.await.unwrap());
        }
        assert_eq!(receipts[0].publication_id, receipts[1].publication_id);
        let created = receipts
            .iter()
            .filter(|r| r.disposition == Disposition::Created)
            .count();
        assert_eq!(created, 1);
        assert_eq!(fx.publisher.calls(), 1);
        assert_eq!(fx.store.publications_for_article(fx.article.id).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_platform_times_out() {
        let publisher = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: 0,
            hang: true,
            seen: Mutex::new(Vec::new()),
        });
        let config = FeedpressConfig {
            external_call_timeout_secs: 5,
            ..FeedpressConfig::default()
        };
        let fx = fixture_with(publisher, config).await;

        let receipt = fx.orchestrator.publish(request(fx.article.id)).await.unwrap();

        assert_eq!(receipt.status, PublicationStatus::Failed);
        assert!(receipt.error.unwrap().contains("timed out"));
        assert_eq!(*fx.publisher.seen.lock().unwrap(), [receipt.publication_id]);
    }
}
