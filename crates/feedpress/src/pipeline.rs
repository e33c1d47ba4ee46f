//! Generation pipeline: from fired rules to stored articles.
//!
//! ```text
//! NewFeedItems ─► AutomationHandler
//!                    │ load rules, build context
//!                    ▼
//!              automation::evaluate ─► RuleDecision*
//!                    │
//!                    ▼
//!              GenerationPipeline
//!                    │ claim item ─► ArticleGenerator ─► store article ─► mark processed
//!                    ▼
//!              ArticleGenerated
//! ```
//!
//! Items are processed one at a time with the configured inter-item delay.
//! A failed generation releases the item back to `pending`.
//!
//! Scheduled and manual runs enter at [`GenerationPipeline::run_scheduled`]
//! and [`GenerationPipeline::run_manual`]. Their contexts carry no items, so
//! `GenerateArticle` works through the source's pending backlog instead.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::automation::{self, Action, AutomationContext, AutomationRule, RuleDecision, Trigger};
use crate::bus::{EventBus, EventEnvelope, EventHandler};
use crate::config::FeedpressConfig;
use crate::events::{ArticleGenerated, NewFeedItems};
use crate::id::{FeedItemId, RuleId, SourceId};
use crate::lifecycle::{next_status, ArticleStatus, AutomationFlags, StageResult};
use crate::model::{
    slugify, Article, FeedItemSummary, GenerationMetadata, PublishTarget, SeoFields, Source,
};
use crate::store::{SharedStores, StoreError};

// =============================================================================
// Collaborator
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub source_id: SourceId,
    pub item: FeedItemSummary,
    pub prompt_template: Option<String>,
    pub model: Option<String>,
}

/// Text produced by an [`ArticleGenerator`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneratedText {
    pub title: String,
    pub content: String,
    pub excerpt: Option<String>,
    pub seo: SeoFields,
    pub metadata: GenerationMetadata,
}

/// Turns one feed item into article text. Usually an LLM provider.
#[async_trait]
pub trait ArticleGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText>;
}

// =============================================================================
// Pipeline
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub feed_item_id: FeedItemId,
    pub error: String,
}

/// What one pipeline run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub source_id: SourceId,
    pub rules_evaluated: usize,
    pub rules_fired: Vec<RuleId>,
    pub rules_disqualified: Vec<RuleId>,
    pub generated: Vec<Article>,
    pub failures: Vec<ItemFailure>,
    /// Items another run had already claimed.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct GenerationPipeline {
    stores: SharedStores,
    generator: Arc<dyn ArticleGenerator>,
    bus: EventBus,
    config: FeedpressConfig,
}

impl GenerationPipeline {
    pub fn new(
        stores: SharedStores,
        generator: Arc<dyn ArticleGenerator>,
        bus: EventBus,
        config: FeedpressConfig,
    ) -> Self {
        Self {
            stores,
            generator,
            bus,
            config,
        }
    }

    /// Evaluate `rules` against `ctx` and execute every decision.
    ///
    /// Fired rules are saved with their execution recorded before any action runs.
    pub async fn run_rules(
        &self,
        source: &Source,
        rules: &[AutomationRule],
        ctx: &AutomationContext,
    ) -> Result<RunSummary, StoreError> {
        let evaluation = automation::evaluate(rules, ctx);
        let mut summary = RunSummary {
            source_id: source.id,
            rules_evaluated: rules.len(),
            rules_disqualified: evaluation.disqualified.iter().map(|d| d.rule_id).collect(),
            ..RunSummary::default()
        };

        for decision in &evaluation.decisions {
            if let Some(rule) = rules.iter().find(|r| r.id() == decision.rule_id) {
                self.stores
                    .save_rule(&rule.record_execution(ctx.trigger.at))
                    .await?;
            }
            summary.rules_fired.push(decision.rule_id);
        }

        for decision in &evaluation.decisions {
            self.execute(source, decision, ctx, &mut summary).await?;
        }

        info!(
            source_id = %source.id,
            trigger = %ctx.trigger.kind,
            evaluated = summary.rules_evaluated,
            fired = summary.rules_fired.len(),
            generated = summary.generated.len(),
            failed = summary.failures.len(),
            "automation run finished"
        );
        Ok(summary)
    }

    /// One scheduler tick at `now` over every source with a scheduled rule.
    ///
    /// Each rule decides for itself whether its interval has elapsed.
    pub async fn run_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<RunSummary>, StoreError> {
        let mut summaries = Vec::new();
        for source in self.stores.list_sources().await? {
            let rules = self.stores.rules_for_source(source.id).await?;
            let scheduled = rules
                .iter()
                .any(|r| r.is_enabled() && matches!(r.trigger(), Trigger::Scheduled { .. }));
            if !scheduled {
                continue;
            }
            let ctx = AutomationContext::scheduled(source.id, now).with_source(&source);
            summaries.push(self.run_rules(&source, &rules, &ctx).await?);
        }
        debug!(sources = summaries.len(), "scheduled automation tick finished");
        Ok(summaries)
    }

    /// Fire the source's manual rules, or only `rule_id` when given.
    pub async fn run_manual(
        &self,
        source_id: SourceId,
        rule_id: Option<RuleId>,
        now: DateTime<Utc>,
    ) -> Result<RunSummary, StoreError> {
        let source = self
            .stores
            .find_source(source_id)
            .await?
            .ok_or_else(|| StoreError::not_found("source", source_id))?;
        let rules = self.stores.rules_for_source(source_id).await?;
        let ctx = AutomationContext::manual(source_id, rule_id, now).with_source(&source);
        self.run_rules(&source, &rules, &ctx).await
    }

    async fn execute(
        &self,
        source: &Source,
        decision: &RuleDecision,
        ctx: &AutomationContext,
        summary: &mut RunSummary,
    ) -> Result<(), StoreError> {
        let flags = source.automation.flags().union(action_flags(&decision.actions));
        let target = publish_target(source, &decision.actions);

        for action in &decision.actions {
            let Action::GenerateArticle {
                prompt_template,
                model,
                max_items,
            } = action
            else {
                continue;
            };

            let limit = max_items.unwrap_or(self.config.stage_batch_size);
            let items: Vec<FeedItemSummary> = match &ctx.new_items {
                Some(items) => items.iter().take(limit).cloned().collect(),
                None => self
                    .stores
                    .pending_feed_items(source.id, limit)
                    .await?
                    .iter()
                    .map(|item| item.summary())
                    .collect(),
            };

            for (index, item) in items.into_iter().enumerate() {
                if index > 0 {
                    self.pause().await;
                }
                let request = GenerationRequest {
                    source_id: source.id,
                    item,
                    prompt_template: prompt_template.clone(),
                    model: model.clone(),
                };
                self.generate_one(request, flags, target.clone(), summary)
                    .await?;
            }
        }
        Ok(())
    }

    /// Claim, generate and store one item.
    async fn generate_one(
        &self,
        request: GenerationRequest,
        flags: AutomationFlags,
        target: Option<PublishTarget>,
        summary: &mut RunSummary,
    ) -> Result<(), StoreError> {
        let item_id = request.item.id;
        if !self.stores.claim_feed_item(item_id).await? {
            debug!(feed_item_id = %item_id, "feed item already claimed");
            summary.skipped += 1;
            return Ok(());
        }

        let text = match self.call_generator(&request).await {
            Ok(text) => text,
            Err(e) => {
                warn!(feed_item_id = %item_id, error = %e, "article generation failed");
                self.stores.release_feed_item(item_id).await?;
                summary.failures.push(ItemFailure {
                    feed_item_id: item_id,
                    error: format!("{e:#}"),
                });
                return Ok(());
            }
        };

        let stored = match build_article(&request, text, flags, target) {
            Ok(article) => self.stores.insert_article(article).await,
            Err(e) => Err(e),
        };
        let article = match stored {
            Ok(article) => article,
            Err(e) => {
                self.stores.release_feed_item(item_id).await?;
                return Err(e);
            }
        };
        self.stores.complete_feed_item(item_id, article.id).await?;

        info!(
            article_id = %article.id,
            feed_item_id = %item_id,
            status = %article.status,
            "article generated"
        );
        self.bus
            .publish(ArticleGenerated {
                article_id: article.id,
                source_id: article.source_id,
                feed_item_id: Some(item_id),
                status: article.status,
            })
            .await;
        summary.generated.push(article);
        Ok(())
    }

    async fn call_generator(&self, request: &GenerationRequest) -> Result<GeneratedText> {
        let limit = self.config.external_call_timeout();
        let text = tokio::time::timeout(limit, self.generator.generate(request))
            .await
            .map_err(|_| anyhow!("generation timed out after {limit:?}"))??;
        if text.title.trim().is_empty() || text.content.trim().is_empty() {
            return Err(anyhow!("generator returned an empty title or body"));
        }
        Ok(text)
    }

    async fn pause(&self) {
        let delay = self.config.inter_item_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Flags implied by the actions of a fired rule.
fn action_flags(actions: &[Action]) -> AutomationFlags {
    AutomationFlags {
        auto_generate_image: actions
            .iter()
            .any(|a| matches!(a, Action::GenerateImage { .. })),
        auto_publish: actions
            .iter()
            .any(|a| matches!(a, Action::PublishArticle { .. })),
    }
}

/// Target named by a `PublishArticle` action, else the source default.
fn publish_target(source: &Source, actions: &[Action]) -> Option<PublishTarget> {
    actions
        .iter()
        .find_map(|a| match a {
            Action::PublishArticle { target } => target.clone(),
            _ => None,
        })
        .or_else(|| source.automation.default_target.clone())
}

fn build_article(
    request: &GenerationRequest,
    text: GeneratedText,
    flags: AutomationFlags,
    target: Option<PublishTarget>,
) -> Result<Article, StoreError> {
    let status = next_status(ArticleStatus::Draft, flags, &StageResult::TextGenerated)
        .map_err(|e| StoreError::Backend(anyhow!(e)))?;

    let mut article = Article::new(request.source_id, text.title, text.content, status, flags);
    article.feed_item_id = Some(request.item.id);
    article.slug = Some(slugify(&article.title));
    article.excerpt = text.excerpt;
    article.seo = text.seo;
    article.generation = text.metadata;
    article.publish_target = target;
    Ok(article)
}

// =============================================================================
// Event handler
// =============================================================================

/// Runs the source's rules whenever new items arrive.
pub struct AutomationHandler {
    stores: SharedStores,
    pipeline: GenerationPipeline,
}

impl AutomationHandler {
    pub fn new(stores: SharedStores, pipeline: GenerationPipeline) -> Self {
        Self { stores, pipeline }
    }
}

#[async_trait]
impl EventHandler<NewFeedItems> for AutomationHandler {
    fn name(&self) -> &'static str {
        "automation"
    }

    async fn handle(&self, event: &NewFeedItems, envelope: &EventEnvelope) -> Result<()> {
        let source = self
            .stores
            .find_source(event.source_id)
            .await?
            .ok_or_else(|| anyhow!("source {} not found", event.source_id))?;
        let rules = self.stores.rules_for_source(source.id).await?;
        if rules.is_empty() {
            debug!(source_id = %source.id, "no automation rules for source");
            return Ok(());
        }

        let ctx = AutomationContext::for_new_items(
            source.id,
            event.new_feed_items.clone(),
            envelope.occurred_at,
        )
        .with_source(&source);

        self.pipeline.run_rules(&source, &rules, &ctx).await?;
        Ok(())
    }
}
