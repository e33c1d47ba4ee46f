use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ArticleId, FeedItemId, SourceId};
use crate::lifecycle::{ArticleStatus, AutomationFlags};
use crate::model::{PublishContent, PublishMetadata, PublishTarget};

/// Inputs and costs of the generation call, kept for audit and reproduction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationMetadata {
    pub prompt: String,
    pub model: String,
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
    pub image_prompt: Option<String>,
    pub extra: serde_json::Value,
}

/// Image attached by the image stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturedMedia {
    /// Reference understood by the media host / publishing platform.
    pub media_ref: String,
    pub url: Option<String>,
    pub alt_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeoFields {
    pub title: Option<String>,
    pub description: Option<String>,
    pub keywords: Vec<String>,
}

/// An AI-generated article and its position in the lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: ArticleId,
    pub source_id: SourceId,
    pub feed_item_id: Option<FeedItemId>,
    pub title: String,
    pub content: String,
    pub excerpt: Option<String>,
    pub slug: Option<String>,
    pub seo: SeoFields,
    pub status: ArticleStatus,
    /// Bumped by every stored transition; guards against lost updates.
    pub version: i64,
    /// Automation switches captured when the article was created.
    pub flags: AutomationFlags,
    pub generation: GenerationMetadata,
    pub featured_media: Option<FeaturedMedia>,
    pub publish_target: Option<PublishTarget>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Article {
    pub fn new(
        source_id: SourceId,
        title: impl Into<String>,
        content: impl Into<String>,
        status: ArticleStatus,
        flags: AutomationFlags,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ArticleId::new(),
            source_id,
            feed_item_id: None,
            title: title.into(),
            content: content.into(),
            excerpt: None,
            slug: None,
            seo: SeoFields::default(),
            status,
            version: 0,
            flags,
            generation: GenerationMetadata::default(),
            featured_media: None,
            publish_target: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn publish_content(&self) -> PublishContent {
        PublishContent {
            title: self.title.clone(),
            content: self.content.clone(),
            excerpt: self.excerpt.clone(),
            slug: self.slug.clone(),
        }
    }

    pub fn publish_metadata(&self) -> PublishMetadata {
        PublishMetadata {
            tags: self.seo.keywords.clone(),
            featured_media_id: self.featured_media.as_ref().map(|m| m.media_ref.clone()),
            ..PublishMetadata::default()
        }
    }
}

/// Lowercase, dash-separated slug derived from a title.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("  Rust 2024 -- edition  "), "rust-2024-edition");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn test_publish_metadata_carries_featured_media() {
        let mut article = Article::new(
            SourceId::new(),
            "t",
            "c",
            ArticleStatus::GeneratedWithImage,
            AutomationFlags::default(),
        );
        article.featured_media = Some(FeaturedMedia {
            media_ref: "media-9".into(),
            url: None,
            alt_text: None,
        });
        assert_eq!(
            article.publish_metadata().featured_media_id.as_deref(),
            Some("media-9")
        );
    }
}
