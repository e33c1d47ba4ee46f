//! Stage runners and the shared transition path.
//!
//! Every status change, automated or manual, goes through [`advance_article`]:
//! read the article, plan with [`ArticleTransition::plan`], store with the
//! version check, announce [`ArticleStatusChanged`].
//!
//! Runners work one article at a time and sleep the configured inter-item
//! delay between articles.

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::FeedpressConfig;
use crate::error::{Categorizable, ErrorCategory};
use crate::events::ArticleStatusChanged;
use crate::id::ArticleId;
use crate::lifecycle::{ArticleStatus, ArticleTransition, StageResult, TransitionError};
use crate::model::{Article, FeaturedMedia, PublicationStatus};
use crate::publish::{
    PublicationOrchestrator, PublishError, PublishOptions, PublishReceipt, PublishRequest,
};
use crate::store::{SharedStores, StoreError};

// =============================================================================
// Transition path
// =============================================================================

#[derive(Debug, Error)]
pub enum AdvanceError {
    #[error("article {0} not found")]
    NotFound(ArticleId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Categorizable for AdvanceError {
    fn category(&self) -> ErrorCategory {
        match self {
            AdvanceError::NotFound(_) => ErrorCategory::NotFound,
            AdvanceError::Transition(e) => e.category(),
            AdvanceError::Store(e) => e.category(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AdvanceError::NotFound(_) => "article_not_found",
            AdvanceError::Transition(e) => e.code(),
            AdvanceError::Store(e) => e.code(),
        }
    }

    fn safe_message(&self) -> Cow<'static, str> {
        match self {
            AdvanceError::NotFound(_) => self.to_string().into(),
            AdvanceError::Transition(e) => e.safe_message(),
            AdvanceError::Store(e) => e.safe_message(),
        }
    }
}

/// Apply `result` to the stored article.
pub async fn advance_article(
    stores: &SharedStores,
    bus: &EventBus,
    article_id: ArticleId,
    result: StageResult,
) -> Result<Article, AdvanceError> {
    let article = stores
        .find_article(article_id)
        .await?
        .ok_or(AdvanceError::NotFound(article_id))?;
    advance_loaded(stores, bus, &article, result).await
}

/// Apply `result` against an article as last read by the caller.
pub async fn advance_loaded(
    stores: &SharedStores,
    bus: &EventBus,
    article: &Article,
    result: StageResult,
) -> Result<Article, AdvanceError> {
    let kind = result.kind();
    let plan = ArticleTransition::plan(article, result)?;
    let updated = stores.transition(&plan).await?;

    info!(
        article_id = %updated.id,
        from = %article.status,
        to = %updated.status,
        result = kind,
        version = updated.version,
        "article advanced"
    );
    if updated.status != article.status {
        bus.publish(ArticleStatusChanged {
            article_id: updated.id,
            from: article.status,
            to: updated.status,
            version: updated.version,
        })
        .await;
    }
    Ok(updated)
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageFailure {
    pub article_id: ArticleId,
    pub error: String,
}

/// Outcome of one stage batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageReport {
    pub processed: usize,
    pub advanced: Vec<ArticleId>,
    pub failed: Vec<StageFailure>,
    /// Articles changed by someone else between read and write.
    pub conflicts: Vec<ArticleId>,
    pub skipped: Vec<ArticleId>,
}

async fn pause(config: &FeedpressConfig, index: usize) {
    let delay = config.inter_item_delay();
    if index > 0 && !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

// =============================================================================
// Image stage
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    pub article_id: ArticleId,
    pub title: String,
    pub excerpt: Option<String>,
    pub style: Option<String>,
}

/// Produces a featured image for an article.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate_image(&self, request: &ImageRequest) -> Result<FeaturedMedia>;
}

/// Attaches images to articles waiting in `generated_image_draft`.
#[derive(Clone)]
pub struct ImageStage {
    stores: SharedStores,
    images: Arc<dyn ImageGenerator>,
    bus: EventBus,
    config: FeedpressConfig,
}

impl ImageStage {
    pub fn new(
        stores: SharedStores,
        images: Arc<dyn ImageGenerator>,
        bus: EventBus,
        config: FeedpressConfig,
    ) -> Self {
        Self {
            stores,
            images,
            bus,
            config,
        }
    }

    pub async fn run_batch(&self) -> Result<StageReport, StoreError> {
        let articles = self
            .stores
            .articles_in_status(ArticleStatus::GeneratedImageDraft, self.config.stage_batch_size)
            .await?;
        let mut report = StageReport::default();

        for (index, article) in articles.iter().enumerate() {
            pause(&self.config, index).await;
            report.processed += 1;

            let result = match self.call(article).await {
                Ok(media) => StageResult::ImageSucceeded { media },
                Err(e) => {
                    warn!(article_id = %article.id, error = %e, "image generation failed");
                    report.failed.push(StageFailure {
                        article_id: article.id,
                        error: format!("{e:#}"),
                    });
                    StageResult::ImageFailed {
                        error: format!("{e:#}"),
                    }
                }
            };

            match advance_loaded(&self.stores, &self.bus, article, result).await {
                Ok(_) => report.advanced.push(article.id),
                Err(AdvanceError::Store(StoreError::VersionConflict { .. })) => {
                    warn!(article_id = %article.id, "article changed during image stage");
                    report.conflicts.push(article.id);
                }
                Err(AdvanceError::Store(e)) => return Err(e),
                Err(e) => {
                    warn!(article_id = %article.id, error = %e, "image result rejected");
                    report.skipped.push(article.id);
                }
            }
        }

        Ok(report)
    }

    async fn call(&self, article: &Article) -> Result<FeaturedMedia> {
        let request = ImageRequest {
            article_id: article.id,
            title: article.title.clone(),
            excerpt: article.excerpt.clone(),
            style: article.generation.image_prompt.clone(),
        };
        let limit = self.config.external_call_timeout();
        tokio::time::timeout(limit, self.images.generate_image(&request))
            .await
            .map_err(|_| anyhow!("image generation timed out after {limit:?}"))?
    }
}

// =============================================================================
// Publish stage
// =============================================================================

/// Publishes articles waiting in `ready_to_publish` to their target.
#[derive(Clone)]
pub struct PublishStage {
    stores: SharedStores,
    orchestrator: PublicationOrchestrator,
    config: FeedpressConfig,
}

impl PublishStage {
    pub fn new(
        stores: SharedStores,
        orchestrator: PublicationOrchestrator,
        config: FeedpressConfig,
    ) -> Self {
        Self {
            stores,
            orchestrator,
            config,
        }
    }

    pub async fn run_batch(&self) -> Result<StageReport, StoreError> {
        let articles = self
            .stores
            .articles_in_status(ArticleStatus::ReadyToPublish, self.config.stage_batch_size)
            .await?;
        let mut report = StageReport::default();

        for (index, article) in articles.iter().enumerate() {
            pause(&self.config, index).await;
            report.processed += 1;

            let Some(target) = article.publish_target.clone() else {
                warn!(article_id = %article.id, "article has no publish target; leaving it for an operator");
                report.skipped.push(article.id);
                continue;
            };

            let request = PublishRequest {
                article_id: article.id,
                target: target.clone(),
                content: article.publish_content(),
                metadata: article.publish_metadata(),
                options: PublishOptions {
                    idempotency_key: Some(format!("auto:{}:{}", article.id, target.key())),
                    ..PublishOptions::default()
                },
            };

            match self.orchestrator.publish(request).await {
                Ok(receipt) => record(&mut report, article.id, &receipt),
                Err(PublishError::Store(e)) => return Err(e),
                Err(e) => {
                    warn!(article_id = %article.id, error = %e, "automatic publish rejected");
                    report.failed.push(StageFailure {
                        article_id: article.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}

fn record(report: &mut StageReport, article_id: ArticleId, receipt: &PublishReceipt) {
    if receipt.status == PublicationStatus::Failed {
        report.failed.push(StageFailure {
            article_id,
            error: receipt.error.clone().unwrap_or_default(),
        });
    } else {
        report.advanced.push(article_id);
    }
}

// =============================================================================
// Publication sweeps
// =============================================================================

/// Dispatch sweep (due publications) and retry sweep (eligible failures).
#[derive(Clone)]
pub struct PublicationSweeper {
    orchestrator: PublicationOrchestrator,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub dispatched: Vec<PublishReceipt>,
    pub retried: Vec<PublishReceipt>,
}

impl PublicationSweeper {
    pub fn new(orchestrator: PublicationOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, PublishError> {
        let dispatched = self.orchestrator.execute_due(now).await?;
        let retried = self.orchestrator.retry_failed().await?;
        info!(
            dispatched = dispatched.len(),
            retried = retried.len(),
            "publication sweep finished"
        );
        Ok(SweepReport {
            dispatched,
            retried,
        })
    }
}
