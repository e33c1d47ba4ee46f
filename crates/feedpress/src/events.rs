//! Facts published on the [`EventBus`](crate::bus::EventBus).

use serde::{Deserialize, Serialize};

use crate::bus::Event;
use crate::id::{ArticleId, FeedItemId, PublicationId, SourceId};
use crate::lifecycle::ArticleStatus;
use crate::model::FeedItemSummary;

/// A source produced items that were not seen before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFeedItems {
    pub source_id: SourceId,
    pub source_configuration: serde_json::Value,
    pub new_feed_items: Vec<FeedItemSummary>,
    pub total_new_items: usize,
}

impl Event for NewFeedItems {
    const TYPE: &'static str = "feed.new_items";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleGenerated {
    pub article_id: ArticleId,
    pub source_id: SourceId,
    pub feed_item_id: Option<FeedItemId>,
    pub status: ArticleStatus,
}

impl Event for ArticleGenerated {
    const TYPE: &'static str = "article.generated";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleStatusChanged {
    pub article_id: ArticleId,
    pub from: ArticleStatus,
    pub to: ArticleStatus,
    pub version: i64,
}

impl Event for ArticleStatusChanged {
    const TYPE: &'static str = "article.status_changed";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicationCompleted {
    pub publication_id: PublicationId,
    pub article_id: ArticleId,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
}

impl Event for PublicationCompleted {
    const TYPE: &'static str = "publication.completed";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicationFailed {
    pub publication_id: PublicationId,
    pub article_id: ArticleId,
    pub error: String,
    pub retry_count: u32,
    pub retry_eligible: bool,
}

impl Event for PublicationFailed {
    const TYPE: &'static str = "publication.failed";
}
