//! Publication orchestration.
//!
//! A [`Publication`] is created as a frozen snapshot of content and metadata,
//! then handed to the platform [`Publisher`]. Success and failure are both
//! recorded on the publication; failures stay eligible for the retry sweep
//! until `retry_count` reaches `max_retries`.
//!
//! Two guards keep external side effects from repeating:
//!
//! - **Idempotency key**: unique at the store. A repeated key replays the
//!   original publication without calling the platform
//! - **Duplicate guard**: without `allow_duplicate`, an existing non-failed
//!   publication of the same article to the same target is returned as is.
//!   The store holds the guard atomically, and a failed record whose target
//!   was taken over by a newer publication is superseded instead of retried

mod orchestrator;
mod publisher;

pub use orchestrator::PublicationOrchestrator;
pub use publisher::{ExternalPost, NoopPublisher, PlatformRequest, Publisher, PublisherRegistry};

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Categorizable, ErrorCategory, FieldError};
use crate::id::{ArticleId, PublicationId};
use crate::model::{Publication, PublicationStatus, PublishContent, PublishMetadata, PublishTarget};
use crate::store::StoreError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublishOptions {
    /// Defer execution until this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Skip the one-active-publication-per-target guard.
    pub allow_duplicate: bool,
    pub idempotency_key: Option<String>,
}

/// Publish request in the external wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub article_id: ArticleId,
    pub target: PublishTarget,
    pub content: PublishContent,
    #[serde(default)]
    pub metadata: PublishMetadata,
    #[serde(flatten)]
    pub options: PublishOptions,
}

impl PublishRequest {
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.target.platform.trim().is_empty() {
            errors.push(FieldError::new("target.platform", "is required"));
        } else if self.target.platform.contains(':') {
            errors.push(FieldError::new("target.platform", "must not contain ':'"));
        }
        if self.target.site_id.trim().is_empty() {
            errors.push(FieldError::new("target.siteId", "is required"));
        }
        if self.content.title.trim().is_empty() {
            errors.push(FieldError::new("content.title", "is required"));
        }
        if self.content.content.trim().is_empty() {
            errors.push(FieldError::new("content.content", "is required"));
        }
        if let Some(key) = &self.options.idempotency_key {
            if key.trim().is_empty() {
                errors.push(FieldError::new("idempotencyKey", "must not be blank"));
            }
        }
        errors
    }
}

/// How a receipt came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// A new publication was created.
    Created,
    /// The duplicate guard returned an existing publication.
    Existing,
    /// A repeated idempotency key returned the original publication.
    Replayed,
    /// A failed publication was executed again.
    Retried,
    /// A due publication was executed by the dispatch sweep.
    Dispatched,
}

/// Publish response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub publication_id: PublicationId,
    pub article_id: ArticleId,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub status: PublicationStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub disposition: Disposition,
}

impl PublishReceipt {
    pub fn new(publication: &Publication, disposition: Disposition) -> Self {
        Self {
            publication_id: publication.id,
            article_id: publication.article_id,
            external_id: publication.external_id.clone(),
            external_url: publication.external_url.clone(),
            status: publication.status,
            published_at: publication.published_at,
            scheduled_at: publication.scheduled_at,
            retry_count: publication.retry_count,
            error: publication.last_error.clone(),
            disposition,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid publish request")]
    Invalid(Vec<FieldError>),

    #[error("platform {platform:?} is not supported")]
    UnsupportedPlatform { platform: String },

    #[error("idempotency key {key:?} was already used for a different article or target")]
    IdempotencyKeyReuse { key: String },

    #[error("article {0} not found")]
    ArticleNotFound(ArticleId),

    #[error("publication {0} not found")]
    PublicationNotFound(PublicationId),

    #[error("publication {publication_id} is {status} with {retry_count}/{max_retries} retries and cannot be retried")]
    NotRetryable {
        publication_id: PublicationId,
        status: PublicationStatus,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("publication {publication_id} was superseded by publication {active_id}")]
    Superseded {
        publication_id: PublicationId,
        active_id: PublicationId,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Categorizable for PublishError {
    fn category(&self) -> ErrorCategory {
        match self {
            PublishError::Invalid(_) => ErrorCategory::Validation,
            PublishError::UnsupportedPlatform { .. }
            | PublishError::IdempotencyKeyReuse { .. }
            | PublishError::NotRetryable { .. }
            | PublishError::Superseded { .. } => ErrorCategory::BusinessRule,
            PublishError::ArticleNotFound(_) | PublishError::PublicationNotFound(_) => {
                ErrorCategory::NotFound
            }
            PublishError::Store(e) => e.category(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            PublishError::Invalid(_) => "invalid_publish_request",
            PublishError::UnsupportedPlatform { .. } => "unsupported_platform",
            PublishError::IdempotencyKeyReuse { .. } => "idempotency_key_reused",
            PublishError::ArticleNotFound(_) => "article_not_found",
            PublishError::PublicationNotFound(_) => "publication_not_found",
            PublishError::NotRetryable { .. } => "not_retryable",
            PublishError::Superseded { .. } => "publication_superseded",
            PublishError::Store(e) => e.code(),
        }
    }

    fn safe_message(&self) -> Cow<'static, str> {
        match self {
            PublishError::Store(e) => e.safe_message(),
            other => other.to_string().into(),
        }
    }

    fn details(&self) -> serde_json::Value {
        match self {
            PublishError::Invalid(errors) => serde_json::json!({ "fieldErrors": errors }),
            PublishError::UnsupportedPlatform { platform } => {
                serde_json::json!({ "platform": platform })
            }
            _ => serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let article_id = ArticleId::new();
        let request: PublishRequest = serde_json::from_value(json!({
            "articleId": article_id,
            "target": { "platform": "wordpress", "siteId": "7", "siteUrl": "https://blog.test" },
            "content": { "title": "Hello", "content": "<p>hi</p>" },
            "metadata": { "tags": ["rust"] },
            "scheduledAt": "2026-05-01T10:00:00Z",
            "allowDuplicate": true
        }))
        .unwrap();

        assert_eq!(request.article_id, article_id);
        assert_eq!(request.metadata.tags, ["rust"]);
        assert!(request.options.allow_duplicate);
        assert!(request.options.scheduled_at.is_some());
        assert_eq!(request.options.idempotency_key, None);
        assert!(request.validate().is_empty());
    }

    #[test]
    fn test_request_validation_lists_fields() {
        let request = PublishRequest {
            article_id: ArticleId::new(),
            target: PublishTarget::new("", "site"),
            content: PublishContent::default(),
            metadata: PublishMetadata::default(),
            options: PublishOptions {
                idempotency_key: Some("  ".into()),
                ..PublishOptions::default()
            },
        };

        let fields: Vec<String> = request.validate().into_iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            ["target.platform", "content.title", "content.content", "idempotencyKey"]
        );
    }

    #[test]
    fn test_platform_must_not_contain_key_separator() {
        // "a:b" + "c" and "a" + "b:c" would share the target key "a:b:c".
        let mut request = PublishRequest {
            article_id: ArticleId::new(),
            target: PublishTarget::new("a:b", "c"),
            content: PublishContent {
                title: "t".into(),
                content: "c".into(),
                ..PublishContent::default()
            },
            metadata: PublishMetadata::default(),
            options: PublishOptions::default(),
        };
        let errors = request.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "target.platform");

        request.target = PublishTarget::new("a", "b:c");
        assert!(request.validate().is_empty());
    }

    #[test]
    fn test_store_errors_keep_their_category() {
        let err = PublishError::from(StoreError::Backend(anyhow::anyhow!("connection reset")));
        let body = err.to_body();
        assert_eq!(body.category, ErrorCategory::Internal);
        assert!(!body.message.contains("connection reset"));

        let err = PublishError::UnsupportedPlatform {
            platform: "myspace".into(),
        };
        assert_eq!(err.to_body().details["platform"], "myspace");
    }
}
