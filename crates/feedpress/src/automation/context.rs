use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{RuleId, SourceId};
use crate::model::{FeedItemSummary, Source, SourceStatus};

status_enum! {
    /// What caused an evaluation.
    pub enum TriggerKind {
        NewFeedItems => "new_feed_items",
        Scheduled => "scheduled",
        Manual => "manual",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDescriptor {
    pub kind: TriggerKind,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Read-only view of the owning source at evaluation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub id: SourceId,
    pub name: String,
    pub kind: String,
    pub status: SourceStatus,
    pub configuration: serde_json::Value,
}

impl From<&Source> for SourceSnapshot {
    fn from(source: &Source) -> Self {
        Self {
            id: source.id,
            name: source.name.clone(),
            kind: source.kind.clone(),
            status: source.status,
            configuration: source.configuration.clone(),
        }
    }
}

/// Everything a rule may look at. Built fresh per evaluation, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationContext {
    pub source_id: SourceId,
    pub trigger: TriggerDescriptor,
    pub new_items: Option<Vec<FeedItemSummary>>,
    pub source: Option<SourceSnapshot>,
}

impl AutomationContext {
    pub fn for_new_items(
        source_id: SourceId,
        items: Vec<FeedItemSummary>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id,
            trigger: TriggerDescriptor {
                kind: TriggerKind::NewFeedItems,
                at,
                data: serde_json::json!({ "totalNewItems": items.len() }),
            },
            new_items: Some(items),
            source: None,
        }
    }

    pub fn scheduled(source_id: SourceId, at: DateTime<Utc>) -> Self {
        Self {
            source_id,
            trigger: TriggerDescriptor {
                kind: TriggerKind::Scheduled,
                at,
                data: serde_json::Value::Null,
            },
            new_items: None,
            source: None,
        }
    }

    /// A manual run, optionally aimed at a single rule.
    pub fn manual(source_id: SourceId, rule_id: Option<RuleId>, at: DateTime<Utc>) -> Self {
        let data = match rule_id {
            Some(id) => serde_json::json!({ "ruleId": id }),
            None => serde_json::Value::Null,
        };
        Self {
            source_id,
            trigger: TriggerDescriptor {
                kind: TriggerKind::Manual,
                at,
                data,
            },
            new_items: None,
            source: None,
        }
    }

    pub fn with_source(mut self, source: &Source) -> Self {
        self.source = Some(SourceSnapshot::from(source));
        self
    }

    pub fn with_items(mut self, items: Vec<FeedItemSummary>) -> Self {
        self.new_items = Some(items);
        self
    }

    pub fn item_count(&self) -> usize {
        self.new_items.as_ref().map_or(0, Vec::len)
    }

    /// The rule a manual trigger is aimed at, if any.
    pub fn targeted_rule(&self) -> Option<RuleId> {
        self.trigger
            .data
            .get("ruleId")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
