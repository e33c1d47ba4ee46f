use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ArticleId, PublicationId};

status_enum! {
    /// State of one publication attempt record.
    pub enum PublicationStatus {
        Pending => "pending",
        Scheduled => "scheduled",
        Completed => "completed",
        Failed => "failed",
    }
}

/// Where an article is pushed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishTarget {
    /// Publishing platform, e.g. `"wordpress"`.
    pub platform: String,
    pub site_id: String,
    #[serde(default)]
    pub site_url: String,
    /// Platform credentials and options; opaque to the core.
    #[serde(default)]
    pub configuration: serde_json::Value,
}

impl PublishTarget {
    pub fn new(platform: impl Into<String>, site_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            site_id: site_id.into(),
            site_url: String::new(),
            configuration: serde_json::Value::Null,
        }
    }

    /// Identity used by the duplicate guard. Configuration is not part of it.
    ///
    /// Unambiguous as long as `platform` holds no ':', which publish requests enforce.
    pub fn key(&self) -> String {
        format!("{}:{}", self.platform, self.site_id)
    }
}

/// Content snapshot sent to the platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishContent {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub excerpt: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublishMetadata {
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub author: Option<String>,
    pub featured_media_id: Option<String>,
}

/// Record of an attempt to push an article to an external platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub id: PublicationId,
    pub article_id: ArticleId,
    pub target: PublishTarget,
    pub status: PublicationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub content: PublishContent,
    pub metadata: PublishMetadata,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
    /// Created with the duplicate guard switched off.
    #[serde(default)]
    pub allow_duplicate: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Publication {
    /// Whether the retry sweep may pick this record up.
    pub fn is_retry_eligible(&self) -> bool {
        self.status == PublicationStatus::Failed && self.retry_count < self.max_retries
    }

    /// Whether the dispatch sweep may execute this record now.
    pub fn is_ready_to_execute(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            PublicationStatus::Pending => true,
            PublicationStatus::Scheduled => self.scheduled_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }

    /// Counts against the one-active-publication-per-target guard.
    pub fn is_active(&self) -> bool {
        self.status != PublicationStatus::Failed
    }

    /// Holds the (article, target) slot the store keeps unique.
    pub fn claims_target(&self) -> bool {
        self.is_active() && !self.allow_duplicate
    }

    /// Retire a failed record whose target another publication now holds.
    ///
    /// The record stays failed and leaves the retry sweep for good.
    pub fn supersede(&mut self, by: PublicationId, at: DateTime<Utc>) {
        self.max_retries = self.retry_count;
        self.last_error = Some(format!("superseded by publication {by}"));
        self.updated_at = at;
    }
}
