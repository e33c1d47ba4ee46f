//! Persistent entities.

mod article;
mod feed_item;
mod publication;
mod source;

pub use article::{slugify, Article, FeaturedMedia, GenerationMetadata, SeoFields};
pub use feed_item::{FeedItem, FeedItemStatus, FeedItemSummary, IdentityKey, RawFeedItem};
pub use publication::{
    Publication, PublicationStatus, PublishContent, PublishMetadata, PublishTarget,
};
pub use source::{AutomationSettings, Source, SourceStatus};
