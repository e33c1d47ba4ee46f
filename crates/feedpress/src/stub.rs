//! Deterministic stand-ins for the external generators.
//!
//! Used by dry-run executions and by local development without provider
//! credentials. Output depends only on the request.

use anyhow::{ensure, Result};
use async_trait::async_trait;

use crate::model::{FeaturedMedia, GenerationMetadata, SeoFields};
use crate::pipeline::{ArticleGenerator, GeneratedText, GenerationRequest};
use crate::stages::{ImageGenerator, ImageRequest};

const STUB_MODEL: &str = "stub";

/// Builds an article from the feed item's own title and content.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubArticleGenerator;

#[async_trait]
impl ArticleGenerator for StubArticleGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText> {
        let item = &request.item;
        ensure!(
            !item.title.trim().is_empty() || !item.content.trim().is_empty(),
            "feed item {} has neither title nor content",
            item.id
        );

        let title = if item.title.trim().is_empty() {
            excerpt(&item.content, 60)
        } else {
            item.title.trim().to_string()
        };
        let body = if item.content.trim().is_empty() {
            title.clone()
        } else {
            item.content.trim().to_string()
        };

        Ok(GeneratedText {
            excerpt: Some(excerpt(&body, 160)),
            seo: SeoFields {
                title: Some(title.clone()),
                description: None,
                keywords: Vec::new(),
            },
            metadata: GenerationMetadata {
                prompt: request.prompt_template.clone().unwrap_or_default(),
                model: request
                    .model
                    .clone()
                    .unwrap_or_else(|| STUB_MODEL.to_string()),
                cost_usd: Some(0.0),
                ..GenerationMetadata::default()
            },
            title,
            content: body,
        })
    }
}

/// Returns a placeholder media reference derived from the article id.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubImageGenerator;

#[async_trait]
impl ImageGenerator for StubImageGenerator {
    async fn generate_image(&self, request: &ImageRequest) -> Result<FeaturedMedia> {
        Ok(FeaturedMedia {
            media_ref: format!("stub-image-{}", request.article_id),
            url: None,
            alt_text: Some(request.title.clone()),
        })
    }
}

/// First `max_chars` characters of `text` on a word boundary.
fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    match cut.rfind(char::is_whitespace) {
        Some(end) if end > 0 => format!("{}…", cut[..end].trim_end()),
        _ => format!("{cut}…"),
    }
}
