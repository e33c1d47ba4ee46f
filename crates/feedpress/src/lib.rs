//! # Feedpress
//!
//! Orchestration core for turning content feeds into published articles.
//! Rules decide, stages execute, stores hold authority.
//!
//! ## Architecture
//!
//! ```text
//! poller (external)
//!     │ RawFeedItem batch
//!     ▼
//! IngestionGate ── insert_if_absent ──► FeedItemStore
//!     │
//!     ▼ NewFeedItems
//! EventBus ─────────────────────────────────────────────┐
//!     │                                                 │
//!     ▼                                                 │
//! AutomationHandler                                     │
//!     │ evaluate(rules, ctx)  (pure, per-rule isolated) │
//!     ▼                                                 │
//! GenerationPipeline ── ArticleGenerator ──► Article    │
//!     │                                                 │
//!     ▼ status from lifecycle::next_status              │
//! ImageStage ── ImageGenerator                          │
//!     │                                                 │
//!     ▼                                                 │
//! PublishStage ── PublicationOrchestrator ── Publisher  │
//!     │                  ▲                              │
//!     │                  └── PublicationSweeper         │
//!     └──► ArticleStatusChanged / Publication* ─────────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Dedup at the store**: (source, guid) and (source, url) are unique; the gate never checks first
//! 2. **Rules are pure**: evaluation reads only the rule and the context
//! 3. **Status only moves forward**: every change goes through [`next_status`] and a version check
//! 4. **Publishing is idempotent**: keys are unique at the store and replay the original result
//! 5. **Handlers are isolated**: a failing or panicking subscriber never reaches the publisher
//!
//! ## Guarantees
//!
//! - Single process, at-least-once per process. The bus has no persistence or replay
//! - Durable progress lives in entity status fields (feed items, articles, publications)
//! - Every external call carries a timeout
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use feedpress::{
//!     FeedpressConfig, MemoryStore, PublisherRegistry, Services, StubArticleGenerator,
//!     StubImageGenerator,
//! };
//!
//! let services = Services::new(
//!     Arc::new(MemoryStore::new()),
//!     PublisherRegistry::new().with(Arc::new(my_wordpress_publisher)),
//!     Arc::new(StubArticleGenerator),
//!     Arc::new(StubImageGenerator),
//!     FeedpressConfig::from_env()?,
//! );
//! services.install_automation();
//!
//! let report = services.ingestion().ingest(source_id, fetched_items).await?;
//! services.image_stage().run_batch().await?;
//! services.publish_stage().run_batch().await?;
//! services.sweeper().sweep(chrono::Utc::now()).await?;
//! ```

#[macro_use]
mod macros;

pub mod automation;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod facade;
pub mod id;
pub mod ingest;
pub mod lifecycle;
pub mod model;
pub mod pipeline;
pub mod publish;
pub mod services;
pub mod stages;
pub mod store;
pub mod stub;

pub use automation::{
    evaluate, Action, AutomationContext, AutomationRule, ComponentSpec, Condition, Evaluation,
    NewAutomationRule, RuleDecision, RuleError, Trigger,
};
pub use bus::{Event, EventBus, EventEnvelope, EventHandler, PublishReport, SubscriptionId};
pub use config::FeedpressConfig;
pub use error::{Categorizable, ErrorBody, ErrorCategory, FieldError};
pub use facade::{
    AdminFacade, Checks, ExecuteOptions, ExecutionResult, FacadeError, UseCase, ValidationReport,
};
pub use id::{ArticleId, FeedItemId, Id, PublicationId, RuleId, SourceId};
pub use ingest::{IngestReport, IngestionGate};
pub use lifecycle::{next_status, ArticleStatus, AutomationFlags, StageResult, TransitionError};
pub use macros::UnknownVariant;
pub use model::{
    Article, FeaturedMedia, FeedItem, FeedItemStatus, FeedItemSummary, Publication,
    PublicationStatus, PublishContent, PublishMetadata, PublishTarget, RawFeedItem, Source,
    SourceStatus,
};
pub use pipeline::{ArticleGenerator, AutomationHandler, GeneratedText, GenerationPipeline, GenerationRequest};
pub use publish::{
    PublicationOrchestrator, PublishError, PublishReceipt, PublishRequest, Publisher,
    PublisherRegistry,
};
pub use services::Services;
pub use stages::{
    advance_article, ImageGenerator, ImageRequest, ImageStage, PublicationSweeper, PublishStage,
};
pub use store::{MemoryStore, OverlayStore, SharedStores, StoreError, Stores};
pub use stub::{StubArticleGenerator, StubImageGenerator};

// Re-export async_trait so collaborator implementations don't need their own dependency.
pub use async_trait::async_trait;
