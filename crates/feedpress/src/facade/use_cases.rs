//! Built-in admin use cases.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Checks, ExecuteOptions, FacadeError, UseCase};
use crate::automation::{AutomationRule, NewAutomationRule, Trigger};
use crate::id::{ArticleId, PublicationId, RuleId, SourceId};
use crate::ingest::IngestReport;
use crate::lifecycle::{next_status, ArticleStatus, StageResult};
use crate::model::{Article, RawFeedItem};
use crate::pipeline::RunSummary;
use crate::publish::{PublishReceipt, PublishRequest};
use crate::services::Services;
use crate::stages::advance_article;
use crate::store::StoreError;

// =============================================================================
// ingest_feed_items
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestFeedItemsInput {
    pub source_id: SourceId,
    #[serde(default)]
    pub items: Vec<RawFeedItem>,
}

/// Push a fetched batch through the deduplicating gate.
pub struct IngestFeedItems;

#[async_trait]
impl UseCase for IngestFeedItems {
    const NAME: &'static str = "ingest_feed_items";
    type Input = IngestFeedItemsInput;
    type Output = IngestReport;

    async fn check(
        &self,
        input: &Self::Input,
        services: &Services,
        checks: &mut Checks,
    ) -> Result<(), StoreError> {
        if services.stores.find_source(input.source_id).await?.is_none() {
            checks.error("sourceId", "source not found");
        }
        if input.items.is_empty() {
            checks.warn("no items to ingest");
        }
        let unkeyed = input
            .items
            .iter()
            .filter(|raw| {
                let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
                blank(&raw.guid) && blank(&raw.url)
            })
            .count();
        if unkeyed > 0 {
            checks.warn(format!(
                "{unkeyed} item(s) have neither guid nor url and cannot be deduplicated"
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        input: Self::Input,
        services: &Services,
    ) -> Result<Self::Output, FacadeError> {
        Ok(services
            .ingestion()
            .ingest(input.source_id, input.items)
            .await?)
    }
}

// =============================================================================
// create_automation_rule
// =============================================================================

/// Create a rule from the `{type, parameters}` wire shape.
pub struct CreateAutomationRule;

#[async_trait]
impl UseCase for CreateAutomationRule {
    const NAME: &'static str = "create_automation_rule";
    type Input = NewAutomationRule;
    type Output = AutomationRule;

    async fn check(
        &self,
        input: &Self::Input,
        services: &Services,
        checks: &mut Checks,
    ) -> Result<(), StoreError> {
        if let Err(errors) = AutomationRule::validate(input) {
            checks.errors(errors);
        }
        if let Some(source_id) = input.source_id {
            if services.stores.find_source(source_id).await?.is_none() {
                checks.error("sourceId", "source not found");
            }
        }
        if input.is_enabled == Some(false) {
            checks.warn("rule will be created disabled");
        }
        Ok(())
    }

    async fn execute(
        &self,
        input: Self::Input,
        services: &Services,
    ) -> Result<Self::Output, FacadeError> {
        let rule = AutomationRule::create(&input)?;
        Ok(services.stores.insert_rule(rule).await?)
    }
}

// =============================================================================
// set_rule_enabled
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetRuleEnabledInput {
    pub rule_id: RuleId,
    pub enabled: bool,
}

pub struct SetRuleEnabled;

#[async_trait]
impl UseCase for SetRuleEnabled {
    const NAME: &'static str = "set_rule_enabled";
    type Input = SetRuleEnabledInput;
    type Output = AutomationRule;

    async fn check(
        &self,
        input: &Self::Input,
        services: &Services,
        checks: &mut Checks,
    ) -> Result<(), StoreError> {
        match services.stores.find_rule(input.rule_id).await? {
            None => checks.error("ruleId", "rule not found"),
            Some(rule) if rule.is_enabled() == input.enabled => {
                let state = if input.enabled { "enabled" } else { "disabled" };
                checks.warn(format!("rule is already {state}"));
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn execute(
        &self,
        input: Self::Input,
        services: &Services,
    ) -> Result<Self::Output, FacadeError> {
        let rule = services
            .stores
            .find_rule(input.rule_id)
            .await?
            .ok_or_else(|| StoreError::not_found("rule", input.rule_id))?
            .with_enabled(input.enabled);
        services.stores.save_rule(&rule).await?;
        Ok(rule)
    }
}

// =============================================================================
// advance_article
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceArticleInput {
    pub article_id: ArticleId,
    pub result: StageResult,
}

/// Report a stage outcome by hand (approval, abandonment, manual image request).
pub struct AdvanceArticle;

#[async_trait]
impl UseCase for AdvanceArticle {
    const NAME: &'static str = "advance_article";
    type Input = AdvanceArticleInput;
    type Output = Article;

    async fn check(
        &self,
        input: &Self::Input,
        services: &Services,
        checks: &mut Checks,
    ) -> Result<(), StoreError> {
        let Some(article) = services.stores.find_article(input.article_id).await? else {
            checks.error("articleId", "article not found");
            return Ok(());
        };
        match next_status(article.status, article.flags, &input.result) {
            Ok(next) if next == article.status => {
                checks.warn(format!("article stays {next}"));
            }
            Ok(_) => {}
            Err(e) => checks.error("result", e.to_string()),
        }
        Ok(())
    }

    async fn execute(
        &self,
        input: Self::Input,
        services: &Services,
    ) -> Result<Self::Output, FacadeError> {
        Ok(advance_article(&services.stores, &services.bus, input.article_id, input.result).await?)
    }
}

// =============================================================================
// publish_article
// =============================================================================

/// Publish an article; the call's idempotency key applies when the request has none.
pub struct PublishArticle;

#[async_trait]
impl UseCase for PublishArticle {
    const NAME: &'static str = "publish_article";
    type Input = PublishRequest;
    type Output = PublishReceipt;

    fn normalize(&self, mut input: Self::Input, options: &ExecuteOptions) -> Self::Input {
        if input.options.idempotency_key.is_none() {
            input.options.idempotency_key = options.idempotency_key.clone();
        }
        input
    }

    async fn check(
        &self,
        input: &Self::Input,
        services: &Services,
        checks: &mut Checks,
    ) -> Result<(), StoreError> {
        checks.errors(input.validate());

        let platform = input.target.platform.trim();
        if !platform.is_empty() && !services.publishers.supports(platform) {
            checks.error(
                "target.platform",
                format!("platform {platform:?} is not supported"),
            );
        }

        match services.stores.find_article(input.article_id).await? {
            None => checks.error("articleId", "article not found"),
            Some(article) if article.status != ArticleStatus::ReadyToPublish => {
                checks.warn(format!("article is {}, not ready_to_publish", article.status));
            }
            Some(_) => {}
        }

        if input.options.scheduled_at.is_some_and(|at| at <= Utc::now()) {
            checks.warn("scheduledAt is in the past; the article will publish immediately");
        }
        Ok(())
    }

    async fn execute(
        &self,
        input: Self::Input,
        services: &Services,
    ) -> Result<Self::Output, FacadeError> {
        Ok(services.orchestrator().publish(input).await?)
    }
}

// =============================================================================
// retry_publication
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPublicationInput {
    pub publication_id: PublicationId,
}

pub struct RetryPublication;

#[async_trait]
impl UseCase for RetryPublication {
    const NAME: &'static str = "retry_publication";
    type Input = RetryPublicationInput;
    type Output = PublishReceipt;

    async fn check(
        &self,
        input: &Self::Input,
        services: &Services,
        checks: &mut Checks,
    ) -> Result<(), StoreError> {
        match services.stores.find_publication(input.publication_id).await? {
            None => checks.error("publicationId", "publication not found"),
            Some(publication) if !publication.is_retry_eligible() => checks.error(
                "publicationId",
                format!(
                    "publication is {} with {}/{} retries",
                    publication.status, publication.retry_count, publication.max_retries
                ),
            ),
            Some(_) => {}
        }
        Ok(())
    }

    async fn execute(
        &self,
        input: Self::Input,
        services: &Services,
    ) -> Result<Self::Output, FacadeError> {
        Ok(services.orchestrator().retry(input.publication_id).await?)
    }
}

// =============================================================================
// run_automation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAutomationInput {
    pub source_id: SourceId,
    /// Fire only this rule; every manual rule of the source otherwise.
    #[serde(default)]
    pub rule_id: Option<RuleId>,
}

/// Fire a source's manually triggered rules on demand.
pub struct RunAutomation;

#[async_trait]
impl UseCase for RunAutomation {
    const NAME: &'static str = "run_automation";
    type Input = RunAutomationInput;
    type Output = RunSummary;

    async fn check(
        &self,
        input: &Self::Input,
        services: &Services,
        checks: &mut Checks,
    ) -> Result<(), StoreError> {
        if services.stores.find_source(input.source_id).await?.is_none() {
            checks.error("sourceId", "source not found");
            return Ok(());
        }

        let Some(rule_id) = input.rule_id else {
            let rules = services.stores.rules_for_source(input.source_id).await?;
            let manual = rules
                .iter()
                .any(|r| r.is_enabled() && *r.trigger() == Trigger::Manual);
            if !manual {
                checks.warn("source has no enabled manual rules; nothing will fire");
            }
            return Ok(());
        };

        match services.stores.find_rule(rule_id).await? {
            None => checks.error("ruleId", "rule not found"),
            Some(rule) if rule.source_id() != input.source_id => {
                checks.error("ruleId", "rule belongs to another source");
            }
            Some(rule) if *rule.trigger() != Trigger::Manual => {
                checks.error("ruleId", "rule is not manually triggered");
            }
            Some(rule) if !rule.is_enabled() => {
                checks.warn("rule is disabled and will not fire");
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn execute(
        &self,
        input: Self::Input,
        services: &Services,
    ) -> Result<Self::Output, FacadeError> {
        Ok(services
            .pipeline()
            .run_manual(input.source_id, input.rule_id, Utc::now())
            .await?)
    }
}

// =============================================================================
// run_scheduled_rules
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunScheduledRulesInput {
    /// Tick time; the call time when absent.
    pub at: Option<DateTime<Utc>>,
}

/// One scheduler tick over every source with a scheduled rule.
pub struct RunScheduledRules;

#[async_trait]
impl UseCase for RunScheduledRules {
    const NAME: &'static str = "run_scheduled_rules";
    type Input = RunScheduledRulesInput;
    type Output = Vec<RunSummary>;

    fn normalize(&self, mut input: Self::Input, _options: &ExecuteOptions) -> Self::Input {
        input.at.get_or_insert_with(Utc::now);
        input
    }

    async fn check(
        &self,
        input: &Self::Input,
        _services: &Services,
        checks: &mut Checks,
    ) -> Result<(), StoreError> {
        if input.at.is_some_and(|at| at > Utc::now()) {
            checks.warn("tick time is in the future; intervals are measured against it");
        }
        Ok(())
    }

    async fn execute(
        &self,
        input: Self::Input,
        services: &Services,
    ) -> Result<Self::Output, FacadeError> {
        let at = input.at.unwrap_or_else(Utc::now);
        Ok(services.pipeline().run_scheduled(at).await?)
    }
}
