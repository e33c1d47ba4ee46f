use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::id::{ArticleId, PublicationId};
use crate::model::{PublishContent, PublishMetadata, PublishTarget};

/// What a platform publisher receives: the publication's frozen snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformRequest {
    pub publication_id: PublicationId,
    pub article_id: ArticleId,
    pub target: PublishTarget,
    pub content: PublishContent,
    pub metadata: PublishMetadata,
}

/// Where the platform put the post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalPost {
    pub external_id: String,
    pub external_url: Option<String>,
}

/// Pushes content to one external platform.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Platform name matched against [`PublishTarget::platform`].
    fn platform(&self) -> &str;

    async fn publish(&self, request: &PlatformRequest) -> Result<ExternalPost>;
}

/// Accepts everything and returns synthetic ids. Stands in for a real
/// platform in dry-run mode.
#[derive(Debug, Clone)]
pub struct NoopPublisher {
    platform: String,
}

impl NoopPublisher {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
        }
    }
}

#[async_trait]
impl Publisher for NoopPublisher {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn publish(&self, request: &PlatformRequest) -> Result<ExternalPost> {
        let external_id = format!("dry-run-{}", request.publication_id);
        let external_url = (!request.target.site_url.is_empty()).then(|| {
            format!(
                "{}/?p={}",
                request.target.site_url.trim_end_matches('/'),
                external_id
            )
        });
        Ok(ExternalPost {
            external_id,
            external_url,
        })
    }
}

/// Publishers by platform name.
#[derive(Clone, Default)]
pub struct PublisherRegistry {
    publishers: BTreeMap<String, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `publisher`, replacing any earlier one for the same platform.
    pub fn register(&mut self, publisher: Arc<dyn Publisher>) {
        self.publishers
            .insert(publisher.platform().to_string(), publisher);
    }

    pub fn with(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.register(publisher);
        self
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(platform).cloned()
    }

    pub fn supports(&self, platform: &str) -> bool {
        self.publishers.contains_key(platform)
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.publishers.keys().map(String::as_str)
    }

    /// Same platform set, every publisher replaced by a [`NoopPublisher`].
    pub fn simulated(&self) -> Self {
        let publishers = self
            .publishers
            .keys()
            .map(|platform| {
                let noop: Arc<dyn Publisher> = Arc::new(NoopPublisher::new(platform.clone()));
                (platform.clone(), noop)
            })
            .collect();
        Self { publishers }
    }
}

impl fmt::Debug for PublisherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.publishers.keys()).finish()
    }
}
