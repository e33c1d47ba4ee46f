//! Wiring of stores, bus and collaborators into the runnable components.

use std::sync::Arc;

use crate::bus::{EventBus, SubscriptionId};
use crate::config::FeedpressConfig;
use crate::events::NewFeedItems;
use crate::ingest::IngestionGate;
use crate::pipeline::{ArticleGenerator, AutomationHandler, GenerationPipeline};
use crate::publish::{PublicationOrchestrator, PublisherRegistry};
use crate::stages::{ImageGenerator, ImageStage, PublicationSweeper, PublishStage};
use crate::store::{OverlayStore, SharedStores};
use crate::stub::{StubArticleGenerator, StubImageGenerator};

/// Everything a component needs, cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub stores: SharedStores,
    pub bus: EventBus,
    pub publishers: PublisherRegistry,
    pub generator: Arc<dyn ArticleGenerator>,
    pub images: Arc<dyn ImageGenerator>,
    pub config: FeedpressConfig,
}

impl Services {
    /// Wire a fresh bus using the configured handler timeout.
    pub fn new(
        stores: SharedStores,
        publishers: PublisherRegistry,
        generator: Arc<dyn ArticleGenerator>,
        images: Arc<dyn ImageGenerator>,
        config: FeedpressConfig,
    ) -> Self {
        Self {
            bus: EventBus::with_handler_timeout(config.handler_timeout()),
            stores,
            publishers,
            generator,
            images,
            config,
        }
    }

    pub fn ingestion(&self) -> IngestionGate {
        IngestionGate::new(self.stores.clone(), self.bus.clone())
    }

    pub fn pipeline(&self) -> GenerationPipeline {
        GenerationPipeline::new(
            self.stores.clone(),
            self.generator.clone(),
            self.bus.clone(),
            self.config.clone(),
        )
    }

    pub fn orchestrator(&self) -> PublicationOrchestrator {
        PublicationOrchestrator::new(
            self.stores.clone(),
            self.publishers.clone(),
            self.bus.clone(),
            self.config.clone(),
        )
    }

    pub fn image_stage(&self) -> ImageStage {
        ImageStage::new(
            self.stores.clone(),
            self.images.clone(),
            self.bus.clone(),
            self.config.clone(),
        )
    }

    pub fn publish_stage(&self) -> PublishStage {
        PublishStage::new(self.stores.clone(), self.orchestrator(), self.config.clone())
    }

    pub fn sweeper(&self) -> PublicationSweeper {
        PublicationSweeper::new(self.orchestrator())
    }

    /// Subscribe the automation handler to [`NewFeedItems`].
    pub fn install_automation(&self) -> SubscriptionId {
        self.bus
            .subscribe::<NewFeedItems, _>(AutomationHandler::new(self.stores.clone(), self.pipeline()))
    }

    /// A dry-run twin of these services.
    ///
    /// Writes land in a scratch overlay over the current stores; generators
    /// and publishers are replaced by local stubs; the bus is fresh with only
    /// the automation handler installed. Nothing reaches the base store or an
    /// external service.
    pub fn simulated(&self) -> Self {
        let config = FeedpressConfig {
            inter_item_delay_ms: 0,
            ..self.config.clone()
        };
        let simulated = Self::new(
            Arc::new(OverlayStore::new(self.stores.clone())),
            self.publishers.simulated(),
            Arc::new(StubArticleGenerator),
            Arc::new(StubImageGenerator),
            config,
        );
        simulated.install_automation();
        simulated
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::automation::{AutomationRule, ComponentSpec, NewAutomationRule};
    use crate::lifecycle::ArticleStatus;
    use crate::model::{AutomationSettings, PublishTarget, RawFeedItem, Source};
    use crate::publish::NoopPublisher;
    use crate::store::{MemoryStore, RuleStore, SourceStore};

    fn live(store: Arc<MemoryStore>) -> Services {
        Services::new(
            store,
            PublisherRegistry::new().with(Arc::new(NoopPublisher::new("wordpress"))),
            Arc::new(StubArticleGenerator),
            Arc::new(StubImageGenerator),
            FeedpressConfig {
                inter_item_delay_ms: 0,
                ..FeedpressConfig::default()
            },
        )
    }

    fn item(guid: &str) -> RawFeedItem {
        RawFeedItem {
            title: "Hello".into(),
            content: "World".into(),
            ..RawFeedItem::with_guid(guid)
        }
    }

    async fn seed_source(store: &MemoryStore) -> Source {
        let source = store
            .upsert_source(Source::new("Tech", "rss").with_automation(AutomationSettings {
                auto_generate_image: true,
                auto_publish: true,
                default_target: Some(PublishTarget::new("wordpress", "site-1")),
            }))
            .await
            .unwrap();
        let rule = AutomationRule::create(&NewAutomationRule {
            source_id: Some(source.id),
            name: "everything".into(),
            trigger: Some(ComponentSpec::new("NEW_FEED_ITEMS", json!(null))),
            actions: vec![ComponentSpec::new("GENERATE_ARTICLE", json!({}))],
            ..NewAutomationRule::default()
        })
        .unwrap();
        store.insert_rule(rule).await.unwrap();
        source
    }

    #[tokio::test]
    async fn test_installed_automation_generates_on_ingest() {
        let store = Arc::new(MemoryStore::new());
        let source = seed_source(&store).await;
        let services = live(store.clone());
        services.install_automation();

        services
            .ingestion()
            .ingest(source.id, vec![item("a")])
            .await
            .unwrap();

        let articles = store.articles_for_source(source.id);
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].status, ArticleStatus::GeneratedImageDraft);

        let report = services.image_stage().run_batch().await.unwrap();
        assert_eq!(report.advanced, [articles[0].id]);
        let report = services.publish_stage().run_batch().await.unwrap();
        assert_eq!(report.advanced, [articles[0].id]);
    }

    #[tokio::test]
    async fn test_simulated_services_leave_base_untouched() {
        let store = Arc::new(MemoryStore::new());
        let source = seed_source(&store).await;
        let dry = live(store.clone()).simulated();

        let report = dry
            .ingestion()
            .ingest(source.id, vec![item("a")])
            .await
            .unwrap();

        assert_eq!(report.inserted_count(), 1);
        assert!(store.feed_items_for_source(source.id).is_empty());
        assert!(store.articles_for_source(source.id).is_empty());
        assert!(dry.publishers.supports("wordpress"));
    }
}
