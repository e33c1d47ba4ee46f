use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ArticleId, FeedItemId, SourceId};

status_enum! {
    /// Processing state of a feed item.
    pub enum FeedItemStatus {
        Pending => "pending",
        Processing => "processing",
        Processed => "processed",
    }
}

/// One item as fetched by the external poller, before deduplication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawFeedItem {
    pub guid: Option<String>,
    pub url: Option<String>,
    pub title: String,
    pub content: String,
    pub published_at: Option<DateTime<Utc>>,
}

impl RawFeedItem {
    pub fn with_guid(guid: impl Into<String>) -> Self {
        Self {
            guid: Some(guid.into()),
            ..Self::default()
        }
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }
}

/// The key used to recognise an item seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKey<'a> {
    Guid(&'a str),
    Url(&'a str),
}

/// A deduplicated feed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: FeedItemId,
    pub source_id: SourceId,
    pub guid: Option<String>,
    pub url: Option<String>,
    pub title: String,
    pub content: String,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub status: FeedItemStatus,
    /// Lookup-only reference to the article generated from this item.
    pub article_id: Option<ArticleId>,
}

impl FeedItem {
    /// Build a pending item from a raw fetch, treating blank guid/url as absent.
    pub fn from_raw(source_id: SourceId, raw: RawFeedItem, fetched_at: DateTime<Utc>) -> Self {
        Self {
            id: FeedItemId::new(),
            source_id,
            guid: non_blank(raw.guid),
            url: non_blank(raw.url),
            title: raw.title,
            content: raw.content,
            published_at: raw.published_at,
            fetched_at,
            status: FeedItemStatus::Pending,
            article_id: None,
        }
    }

    /// Guid when present, otherwise url. `None` means the item cannot be deduplicated.
    pub fn identity_key(&self) -> Option<IdentityKey<'_>> {
        self.guid
            .as_deref()
            .map(IdentityKey::Guid)
            .or_else(|| self.url.as_deref().map(IdentityKey::Url))
    }

    pub fn summary(&self) -> FeedItemSummary {
        FeedItemSummary {
            id: self.id,
            guid: self.guid.clone(),
            title: self.title.clone(),
            content: self.content.clone(),
            url: self.url.clone(),
            published_at: self.published_at,
            fetched_at: self.fetched_at,
        }
    }
}

/// Item shape carried by the new-items event and the automation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItemSummary {
    pub id: FeedItemId,
    pub guid: Option<String>,
    pub title: String,
    pub content: String,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_prefers_guid() {
        let raw = RawFeedItem {
            guid: Some("g-1".into()),
            url: Some("https://example.com/a".into()),
            ..RawFeedItem::default()
        };
        let item = FeedItem::from_raw(SourceId::new(), raw, Utc::now());
        assert_eq!(item.identity_key(), Some(IdentityKey::Guid("g-1")));
    }

    #[test]
    fn test_identity_falls_back_to_url() {
        let item = FeedItem::from_raw(
            SourceId::new(),
            RawFeedItem::with_url("https://example.com/a"),
            Utc::now(),
        );
        assert_eq!(
            item.identity_key(),
            Some(IdentityKey::Url("https://example.com/a"))
        );
    }

    #[test]
    fn test_blank_keys_are_absent() {
        let raw = RawFeedItem {
            guid: Some("   ".into()),
            url: Some(String::new()),
            ..RawFeedItem::default()
        };
        let item = FeedItem::from_raw(SourceId::new(), raw, Utc::now());
        assert_eq!(item.guid, None);
        assert_eq!(item.url, None);
        assert_eq!(item.identity_key(), None);
        assert_eq!(item.status, FeedItemStatus::Pending);
    }
}
