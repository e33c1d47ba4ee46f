//! Testing utilities for feedpress.
//!
//! Scripted collaborators record every call and answer from a queue, so a
//! test can say "the first publish fails, the second succeeds" and then
//! assert on exactly what reached the platform.
//!
//! # Quick Start
//!
//! ```ignore
//! use feedpress_testing::{Harness, raw_item, rule_on_new_items};
//!
//! let h = Harness::new();
//! let source = h.source_with_flags(true, true).await;
//! h.add_rule(rule_on_new_items(source.id, &["GENERATE_ARTICLE"])).await;
//!
//! h.publisher.fail_next(1);
//! h.services.ingestion().ingest(source.id, vec![raw_item("a", "Hello")]).await?;
//!
//! h.generator.assert_call_count(1);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;

use feedpress::automation::{AutomationRule, ComponentSpec, NewAutomationRule};
use feedpress::bus::{Event, EventEnvelope, EventHandler};
use feedpress::model::{AutomationSettings, FeaturedMedia, PublishTarget, RawFeedItem, Source};
use feedpress::pipeline::{ArticleGenerator, GeneratedText, GenerationRequest};
use feedpress::publish::{ExternalPost, PlatformRequest, Publisher, PublisherRegistry};
use feedpress::stages::{ImageGenerator, ImageRequest};
use feedpress::store::{MemoryStore, RuleStore, SourceStore};
use feedpress::{FeedpressConfig, Services};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Scripted article generator
// =============================================================================

/// Text generator answering from a script.
///
/// Without a scripted answer it echoes the feed item's title and content.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<GeneratedText, String>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful answer.
    pub fn push_text(&self, text: GeneratedText) {
        lock(&self.script).push_back(Ok(text));
    }

    /// Queue a failure with `error`.
    pub fn push_failure(&self, error: impl Into<String>) {
        lock(&self.script).push_back(Err(error.into()));
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Assert the generator was called exactly `expected` times.
    pub fn assert_call_count(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(
            actual, expected,
            "expected {expected} generation call(s), got {actual}"
        );
    }
}

#[async_trait]
impl ArticleGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText> {
        lock(&self.requests).push(request.clone());
        match lock(&self.script).pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(error)) => Err(anyhow!(error)),
            None => Ok(GeneratedText {
                title: format!("Article: {}", request.item.title),
                content: request.item.content.clone(),
                ..GeneratedText::default()
            }),
        }
    }
}

// =============================================================================
// Scripted image generator
// =============================================================================

/// Image generator failing the next `n` calls on request.
#[derive(Debug, Default)]
pub struct ScriptedImageGenerator {
    failures: AtomicUsize,
    requests: Mutex<Vec<ImageRequest>>,
}

impl ScriptedImageGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ImageRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl ImageGenerator for ScriptedImageGenerator {
    async fn generate_image(&self, request: &ImageRequest) -> Result<FeaturedMedia> {
        lock(&self.requests).push(request.clone());
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("image provider unavailable"));
        }
        Ok(FeaturedMedia {
            media_ref: format!("img-{}", request.article_id),
            url: Some(format!("https://cdn.test/{}.png", request.article_id)),
            alt_text: Some(request.title.clone()),
        })
    }
}

// =============================================================================
// Recording publisher
// =============================================================================

/// Platform publisher that records every request.
#[derive(Debug)]
pub struct RecordingPublisher {
    platform: String,
    failures: AtomicUsize,
    requests: Mutex<Vec<PlatformRequest>>,
}

impl RecordingPublisher {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            failures: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `n` calls with a platform error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<PlatformRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Assert the platform was called exactly `expected` times.
    pub fn assert_call_count(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(
            actual, expected,
            "expected {expected} platform call(s) to {}, got {actual}",
            self.platform
        );
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn publish(&self, request: &PlatformRequest) -> Result<ExternalPost> {
        let call = {
            let mut requests = lock(&self.requests);
            requests.push(request.clone());
            requests.len()
        };
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("{} returned HTTP 503", self.platform));
        }
        Ok(ExternalPost {
            external_id: format!("{}-{call}", self.platform),
            external_url: Some(format!("https://{}.test/posts/{call}", request.target.site_id)),
        })
    }
}

// =============================================================================
// Event recorder
// =============================================================================

/// Bus subscriber keeping a copy of every event it receives.
#[derive(Debug)]
pub struct EventRecorder<E> {
    events: Arc<Mutex<Vec<E>>>,
}

impl<E> Clone for EventRecorder<E> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
        }
    }
}

impl<E> Default for EventRecorder<E> {
    fn default() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone> EventRecorder<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<E> {
        lock(&self.events).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }
}

#[async_trait]
impl<E: Event + Clone> EventHandler<E> for EventRecorder<E> {
    fn name(&self) -> &'static str {
        "event-recorder"
    }

    async fn handle(&self, event: &E, _envelope: &EventEnvelope) -> Result<()> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// Config with no inter-item delay.
pub fn test_config() -> FeedpressConfig {
    FeedpressConfig {
        inter_item_delay_ms: 0,
        ..FeedpressConfig::default()
    }
}

/// A keyed feed item with a title and a short body.
pub fn raw_item(guid: &str, title: &str) -> RawFeedItem {
    RawFeedItem {
        title: title.to_string(),
        content: format!("{title} body text"),
        ..RawFeedItem::with_guid(guid)
    }
}

/// A new-items rule for `source_id` running `actions` (type names only).
pub fn rule_on_new_items(source_id: feedpress::SourceId, actions: &[&str]) -> NewAutomationRule {
    NewAutomationRule {
        source_id: Some(source_id),
        name: format!("on new items: {}", actions.join(", ")),
        trigger: Some(ComponentSpec::new("NEW_FEED_ITEMS", json!(null))),
        actions: actions
            .iter()
            .map(|kind| ComponentSpec::new(*kind, json!(null)))
            .collect(),
        ..NewAutomationRule::default()
    }
}

/// In-memory store, scripted collaborators and wired services.
///
/// Automation is installed on the bus; the publisher answers for `"wordpress"`.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub generator: Arc<ScriptedGenerator>,
    pub images: Arc<ScriptedImageGenerator>,
    pub publisher: Arc<RecordingPublisher>,
    pub services: Services,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: FeedpressConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let generator = Arc::new(ScriptedGenerator::new());
        let images = Arc::new(ScriptedImageGenerator::new());
        let publisher = Arc::new(RecordingPublisher::new("wordpress"));

        let services = Services::new(
            store.clone(),
            PublisherRegistry::new().with(publisher.clone()),
            generator.clone(),
            images.clone(),
            config,
        );
        services.install_automation();

        Self {
            store,
            generator,
            images,
            publisher,
            services,
        }
    }

    /// Store an active source with the given automation flags and a WordPress default target.
    pub async fn source_with_flags(&self, auto_generate_image: bool, auto_publish: bool) -> Source {
        let source = Source::new("Test feed", "rss").with_automation(AutomationSettings {
            auto_generate_image,
            auto_publish,
            default_target: Some(PublishTarget::new("wordpress", "site-1")),
        });
        self.store
            .upsert_source(source)
            .await
            .expect("store source")
    }

    pub async fn add_rule(&self, input: NewAutomationRule) -> AutomationRule {
        let rule = AutomationRule::create(&input).expect("valid rule");
        self.store.insert_rule(rule).await.expect("store rule")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
