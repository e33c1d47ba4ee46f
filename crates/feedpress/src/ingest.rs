//! Deduplicating ingestion gate.
//!
//! The gate never checks before inserting. Each item goes through
//! [`FeedItemStore::insert_if_absent`](crate::store::FeedItemStore::insert_if_absent),
//! so two overlapping polls of the same source cannot both insert an item with
//! the same guid or url.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, PublishReport};
use crate::events::NewFeedItems;
use crate::id::SourceId;
use crate::model::{FeedItem, RawFeedItem};
use crate::store::{SharedStores, StoreError};

/// Outcome of one ingestion call.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub source_id: SourceId,
    /// Newly stored items, in arrival order.
    pub inserted: Vec<FeedItem>,
    /// Items skipped because their identity key was already taken.
    pub duplicates: usize,
    /// Items stored without any identity key.
    pub unkeyed: usize,
    /// Delivery of the `NewFeedItems` event, when one was published.
    #[serde(skip)]
    pub event: Option<PublishReport>,
}

impl IngestReport {
    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }
}

#[derive(Clone)]
pub struct IngestionGate {
    stores: SharedStores,
    bus: EventBus,
}

impl IngestionGate {
    pub fn new(stores: SharedStores, bus: EventBus) -> Self {
        Self { stores, bus }
    }

    /// Store the unseen items of one fetched batch and announce them.
    pub async fn ingest(
        &self,
        source_id: SourceId,
        raw_items: Vec<RawFeedItem>,
    ) -> Result<IngestReport, StoreError> {
        let source = self
            .stores
            .find_source(source_id)
            .await?
            .ok_or_else(|| StoreError::not_found("source", source_id))?;

        let fetched_at = Utc::now();
        let mut report = IngestReport {
            source_id,
            inserted: Vec::new(),
            duplicates: 0,
            unkeyed: 0,
            event: None,
        };

        for raw in raw_items {
            let item = FeedItem::from_raw(source_id, raw, fetched_at);
            if item.identity_key().is_none() {
                warn!(
                    source_id = %source_id,
                    title = %item.title,
                    "feed item has neither guid nor url; it cannot be deduplicated"
                );
                report.unkeyed += 1;
            }

            match self.stores.insert_if_absent(item.clone()).await? {
                Some(stored) => report.inserted.push(stored),
                None => {
                    debug!(
                        source_id = %source_id,
                        guid = item.guid.as_deref(),
                        url = item.url.as_deref(),
                        "duplicate feed item skipped"
                    );
                    report.duplicates += 1;
                }
            }
        }

        info!(
            source_id = %source_id,
            inserted = report.inserted.len(),
            duplicates = report.duplicates,
            unkeyed = report.unkeyed,
            "feed batch ingested"
        );

        if !report.inserted.is_empty() {
            let event = NewFeedItems {
                source_id,
                source_configuration: source.configuration.clone(),
                new_feed_items: report.inserted.iter().map(FeedItem::summary).collect(),
                total_new_items: report.inserted.len(),
            };
            report.event = Some(self.bus.publish(event).await);
        }

        Ok(report)
    }
}
