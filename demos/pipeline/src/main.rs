//! # Pipeline Demo
//!
//! Runs one feed batch end to end on the in-memory store: ingest, automation,
//! generation, a scheduled tick, image stage, publish stage and the
//! publication sweep, then a dry-run through the admin facade.
//!
//! Generation calls a messages-style LLM API when `FEEDPRESS_LLM_API_KEY` is
//! set and falls back to the stub generator otherwise. Publishing only logs.
//!
//! ```text
//! FEEDPRESS_LLM_API_KEY=...       enable the HTTP generator
//! FEEDPRESS_LLM_URL=...           messages endpoint
//! FEEDPRESS_LLM_MODEL=...         model name sent with each request
//! FEEDPRESS_LOG_JSON=1            JSON log lines
//! RUST_LOG=feedpress=debug        log filter (default: info)
//! ```

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use feedpress::model::{AutomationSettings, GenerationMetadata, PublishTarget};
use feedpress::publish::{ExternalPost, PlatformRequest};
use feedpress::store::{RuleStore, SourceStore};
use feedpress::{
    AdminFacade, ArticleGenerator, AutomationRule, ComponentSpec, ExecuteOptions,
    FeedpressConfig, GeneratedText, GenerationRequest, MemoryStore, NewAutomationRule, Publisher,
    PublisherRegistry, RawFeedItem, Services, Source, StubArticleGenerator, StubImageGenerator,
};

const DEFAULT_LLM_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_PROMPT: &str = "Rewrite this feed item as a short news article. \
    Put the headline on the first line and the body after it.";

// ============================================================================
// HTTP article generator
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

struct HttpArticleGenerator {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl HttpArticleGenerator {
    fn from_env() -> Option<Self> {
        let api_key = env::var("FEEDPRESS_LLM_API_KEY").ok()?;
        Some(Self {
            client: reqwest::Client::new(),
            url: env::var("FEEDPRESS_LLM_URL").unwrap_or_else(|_| DEFAULT_LLM_URL.to_string()),
            api_key,
            model: env::var("FEEDPRESS_LLM_MODEL")
                .unwrap_or_else(|_| "claude-3-5-sonnet-20241022".to_string()),
        })
    }

    async fn call(&self, request: &MessagesRequest) -> Result<MessagesResponse> {
        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await?;
            bail!("generation API error {}: {}", status, body);
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl ArticleGenerator for HttpArticleGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText> {
        let started = Instant::now();
        let prompt = request
            .prompt_template
            .clone()
            .unwrap_or_else(|| DEFAULT_PROMPT.to_string());
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());

        let response = self
            .call(&MessagesRequest {
                model: model.clone(),
                max_tokens: 1024,
                messages: vec![Message {
                    role: "user".to_string(),
                    content: format!(
                        "{prompt}\n\n{}\n\n{}",
                        request.item.title, request.item.content
                    ),
                }],
            })
            .await?;

        let text = response
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n");
        let (title, content) = split_headline(&text);
        if title.is_empty() {
            bail!("generation API returned no text");
        }

        Ok(GeneratedText {
            title,
            content,
            metadata: GenerationMetadata {
                prompt,
                model,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                ..GenerationMetadata::default()
            },
            ..GeneratedText::default()
        })
    }
}

/// First non-empty line (minus markdown heading marks) and the rest.
fn split_headline(text: &str) -> (String, String) {
    let text = text.trim();
    let (first, rest) = text.split_once('\n').unwrap_or((text, ""));
    (
        first.trim_start_matches('#').trim().to_string(),
        rest.trim().to_string(),
    )
}

// ============================================================================
// Logging publisher
// ============================================================================

#[derive(Default)]
struct LoggingPublisher {
    posts: AtomicUsize,
}

#[async_trait]
impl Publisher for LoggingPublisher {
    fn platform(&self) -> &str {
        "wordpress"
    }

    async fn publish(&self, request: &PlatformRequest) -> Result<ExternalPost> {
        let n = self.posts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            publication_id = %request.publication_id,
            site_id = %request.target.site_id,
            title = %request.content.title,
            "would publish post"
        );
        Ok(ExternalPost {
            external_id: format!("demo-{n}"),
            external_url: Some(format!("https://{}/?p={n}", request.target.site_id)),
        })
    }
}

// ============================================================================
// Main
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env::var("FEEDPRESS_LOG_JSON").is_ok_and(|v| v == "1") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn feed_batch() -> Vec<RawFeedItem> {
    let item = |guid: &str, title: &str, content: &str| RawFeedItem {
        title: title.to_string(),
        content: content.to_string(),
        published_at: Some(Utc::now()),
        ..RawFeedItem::with_guid(guid)
    };
    vec![
        item(
            "rel-1.4",
            "Version 1.4 released",
            "The release adds streaming exports and drops support for the legacy API.",
        ),
        item(
            "meetup-oct",
            "October meetup announced",
            "The community meetup moves to the new venue downtown.",
        ),
        // Same guid as the first item: deduplicated at the store.
        item("rel-1.4", "Version 1.4 released", "Repeated by the feed."),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = FeedpressConfig::from_env()?;
    let generator: Arc<dyn ArticleGenerator> = match HttpArticleGenerator::from_env() {
        Some(http) => {
            info!(url = %http.url, model = %http.model, "using HTTP article generator");
            Arc::new(http)
        }
        None => {
            info!("FEEDPRESS_LLM_API_KEY not set, using stub article generator");
            Arc::new(StubArticleGenerator)
        }
    };

    let store = Arc::new(MemoryStore::new());
    let services = Services::new(
        store.clone(),
        PublisherRegistry::new().with(Arc::new(LoggingPublisher::default())),
        generator,
        Arc::new(StubImageGenerator),
        config,
    );
    services.install_automation();

    let source = store
        .upsert_source(
            Source::new("Project blog", "rss").with_automation(AutomationSettings {
                auto_generate_image: true,
                auto_publish: true,
                default_target: Some(PublishTarget::new("wordpress", "blog.example.com")),
            }),
        )
        .await?;
    let rule = AutomationRule::create(&NewAutomationRule {
        source_id: Some(source.id),
        name: "Generate on new items".to_string(),
        trigger: Some(ComponentSpec::new("NEW_FEED_ITEMS", json!(null))),
        actions: vec![ComponentSpec::new("GENERATE_ARTICLE", json!({ "maxItems": 5 }))],
        ..NewAutomationRule::default()
    })?;
    store.insert_rule(rule).await?;
    let backlog = AutomationRule::create(&NewAutomationRule {
        source_id: Some(source.id),
        name: "Hourly backlog".to_string(),
        trigger: Some(ComponentSpec::new("SCHEDULED", json!({ "intervalMinutes": 60 }))),
        actions: vec![ComponentSpec::new("GENERATE_ARTICLE", json!(null))],
        ..NewAutomationRule::default()
    })?;
    store.insert_rule(backlog).await?;

    let report = services.ingestion().ingest(source.id, feed_batch()).await?;
    info!(
        inserted = report.inserted_count(),
        duplicates = report.duplicates,
        "ingested feed batch"
    );

    // Items the event-driven rule left pending are picked up by the tick.
    for tick in services.pipeline().run_scheduled(Utc::now()).await? {
        info!(
            source_id = %tick.source_id,
            fired = tick.rules_fired.len(),
            generated = tick.generated.len(),
            "scheduled tick done"
        );
    }

    let images = services.image_stage().run_batch().await?;
    info!(advanced = images.advanced.len(), failed = images.failed.len(), "image stage done");

    let published = services.publish_stage().run_batch().await?;
    info!(
        advanced = published.advanced.len(),
        failed = published.failed.len(),
        "publish stage done"
    );

    let sweep = services.sweeper().sweep(Utc::now()).await?;
    info!(
        dispatched = sweep.dispatched.len(),
        retried = sweep.retried.len(),
        "publication sweep done"
    );

    // Dry run: validated and executed against a scratch layer.
    let facade = AdminFacade::with_default_use_cases(services.clone());
    let result = facade
        .execute(
            "ingest_feed_items",
            json!({
                "sourceId": source.id,
                "items": [{ "guid": "preview", "title": "Preview only", "content": "Not stored." }]
            }),
            ExecuteOptions {
                dry_run: true,
                ..ExecuteOptions::default()
            },
        )
        .await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    let stats = facade.audit_log().stats();
    info!(total = stats.total, dry_runs = stats.dry_runs, "audit");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_headline_strips_heading_marks() {
        let (title, content) = split_headline("## Big news\n\nSomething happened.\nMore.");
        assert_eq!(title, "Big news");
        assert_eq!(content, "Something happened.\nMore.");
    }

    #[test]
    fn test_split_headline_single_line() {
        let (title, content) = split_headline("  Only a title  ");
        assert_eq!(title, "Only a title");
        assert_eq!(content, "");
    }
}
