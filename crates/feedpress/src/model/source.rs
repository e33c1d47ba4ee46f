use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::SourceId;
use crate::lifecycle::AutomationFlags;
use crate::model::PublishTarget;

status_enum! {
    /// Operational state of a content source.
    pub enum SourceStatus {
        Active => "active",
        Paused => "paused",
        Error => "error",
    }
}

/// Per-source automation switches.
///
/// This record is the only place the image/publish flags are read from when an
/// article is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationSettings {
    pub auto_generate_image: bool,
    pub auto_publish: bool,
    /// Where auto-published articles go when the firing rule names no target.
    pub default_target: Option<PublishTarget>,
}

impl AutomationSettings {
    pub fn flags(&self) -> AutomationFlags {
        AutomationFlags {
            auto_generate_image: self.auto_generate_image,
            auto_publish: self.auto_publish,
        }
    }
}

/// An external content origin that is polled for new items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    /// Feed flavour, e.g. `"rss"` or `"sitemap"`.
    pub kind: String,
    pub status: SourceStatus,
    pub configuration: serde_json::Value,
    pub automation: AutomationSettings,
    pub created_at: DateTime<Utc>,
}

impl Source {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: SourceId::new(),
            name: name.into(),
            kind: kind.into(),
            status: SourceStatus::Active,
            configuration: serde_json::Value::Object(Default::default()),
            automation: AutomationSettings::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_automation(mut self, automation: AutomationSettings) -> Self {
        self.automation = automation;
        self
    }

    pub fn with_status(mut self, status: SourceStatus) -> Self {
        self.status = status;
        self
    }
}
