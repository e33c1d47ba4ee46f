use chrono::{DateTime, Duration, Timelike, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::context::{AutomationContext, TriggerKind};
use super::RuleError;
use crate::error::FieldError;
use crate::id::{RuleId, SourceId};
use crate::model::{PublishTarget, SourceStatus};

/// Wire shape shared by triggers, conditions and actions: `{type, parameters}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

impl ComponentSpec {
    pub fn new(kind: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            parameters,
        }
    }

    /// Type names are accepted as `NEW_FEED_ITEMS` or `new_feed_items`.
    fn normalized_kind(&self) -> String {
        self.kind.trim().to_ascii_lowercase()
    }

    fn params<T: DeserializeOwned + Default>(&self, field: &str) -> Result<T, FieldError> {
        if self.parameters.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.parameters.clone())
            .map_err(|e| FieldError::new(format!("{field}.parameters"), e.to_string()))
    }
}

// =============================================================================
// Trigger
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ComponentSpec", into = "ComponentSpec")]
pub enum Trigger {
    /// Fires when the context carries new items for the rule's source.
    NewFeedItems,
    /// Fires when a scheduler tick arrives and the interval has elapsed.
    Scheduled { interval_minutes: u32 },
    /// Fires only when explicitly invoked.
    Manual,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ScheduledParams {
    #[serde(alias = "interval_minutes")]
    interval_minutes: u32,
}

impl Trigger {
    pub fn parse(spec: &ComponentSpec, field: &str) -> Result<Self, FieldError> {
        match spec.normalized_kind().as_str() {
            "new_feed_items" => Ok(Trigger::NewFeedItems),
            "manual" => Ok(Trigger::Manual),
            "scheduled" => {
                let params: ScheduledParams = spec.params(field)?;
                if params.interval_minutes == 0 {
                    return Err(FieldError::new(
                        format!("{field}.parameters.intervalMinutes"),
                        "must be at least 1",
                    ));
                }
                Ok(Trigger::Scheduled {
                    interval_minutes: params.interval_minutes,
                })
            }
            other => Err(FieldError::new(
                format!("{field}.type"),
                format!("unknown trigger type {other:?}"),
            )),
        }
    }

    fn matches(&self, rule: &AutomationRule, ctx: &AutomationContext) -> bool {
        if ctx.source_id != rule.source_id {
            return false;
        }
        match self {
            Trigger::NewFeedItems => {
                ctx.trigger.kind == TriggerKind::NewFeedItems && ctx.item_count() > 0
            }
            Trigger::Scheduled { interval_minutes } => {
                ctx.trigger.kind == TriggerKind::Scheduled
                    && rule.last_executed_at.map_or(true, |last| {
                        ctx.trigger.at - last >= Duration::minutes(i64::from(*interval_minutes))
                    })
            }
            Trigger::Manual => {
                ctx.trigger.kind == TriggerKind::Manual
                    && ctx.targeted_rule().map_or(true, |id| id == rule.id)
            }
        }
    }
}

impl TryFrom<ComponentSpec> for Trigger {
    type Error = FieldError;

    fn try_from(spec: ComponentSpec) -> Result<Self, Self::Error> {
        Trigger::parse(&spec, "trigger")
    }
}

impl From<Trigger> for ComponentSpec {
    fn from(trigger: Trigger) -> Self {
        match trigger {
            Trigger::NewFeedItems => ComponentSpec::new("NEW_FEED_ITEMS", serde_json::Value::Null),
            Trigger::Scheduled { interval_minutes } => ComponentSpec::new(
                "SCHEDULED",
                serde_json::json!({ "intervalMinutes": interval_minutes }),
            ),
            Trigger::Manual => ComponentSpec::new("MANUAL", serde_json::Value::Null),
        }
    }
}

// =============================================================================
// Condition
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Any,
    All,
}

/// A pure predicate over the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ComponentSpec", into = "ComponentSpec")]
pub enum Condition {
    /// Trigger time falls in `[start_hour, end_hour)` UTC; wraps past midnight.
    TimeRange { start_hour: u8, end_hour: u8 },
    /// Number of new items is within `[min, max]`.
    ItemCount { min: usize, max: Option<usize> },
    /// Case-insensitive keyword match over item title and content.
    ///
    /// Passes when some item matches, or with `exclude` when no item does.
    ContentFilter {
        keywords: Vec<String>,
        mode: MatchMode,
        exclude: bool,
    },
    /// Source status is one of `allowed`.
    SourceStatus { allowed: Vec<SourceStatus> },
    /// Panics when evaluated.
    #[cfg(test)]
    Panic(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TimeRangeParams {
    #[serde(alias = "start_hour")]
    start_hour: u8,
    #[serde(alias = "end_hour")]
    end_hour: u8,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ItemCountParams {
    #[serde(alias = "min_items")]
    min_items: usize,
    #[serde(alias = "max_items")]
    max_items: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ContentFilterParams {
    keywords: Vec<String>,
    mode: MatchMode,
    exclude: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SourceStatusParams {
    allowed: Vec<SourceStatus>,
}

impl Condition {
    pub fn parse(spec: &ComponentSpec, field: &str) -> Result<Self, FieldError> {
        let bad = |name: &str, message: &str| {
            FieldError::new(format!("{field}.parameters.{name}"), message)
        };

        match spec.normalized_kind().as_str() {
            "time_range" => {
                let p: TimeRangeParams = spec.params(field)?;
                if p.start_hour > 23 {
                    return Err(bad("startHour", "must be between 0 and 23"));
                }
                if p.end_hour > 24 {
                    return Err(bad("endHour", "must be between 0 and 24"));
                }
                if p.start_hour == p.end_hour % 24 {
                    return Err(bad("endHour", "must differ from startHour"));
                }
                Ok(Condition::TimeRange {
                    start_hour: p.start_hour,
                    end_hour: p.end_hour,
                })
            }
            "item_count" => {
                let p: ItemCountParams = spec.params(field)?;
                if p.max_items.is_some_and(|max| max < p.min_items) {
                    return Err(bad("maxItems", "must not be below minItems"));
                }
                Ok(Condition::ItemCount {
                    min: p.min_items,
                    max: p.max_items,
                })
            }
            "content_filter" => {
                let p: ContentFilterParams = spec.params(field)?;
                let keywords: Vec<String> = p
                    .keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect();
                if keywords.is_empty() {
                    return Err(bad("keywords", "must contain at least one keyword"));
                }
                Ok(Condition::ContentFilter {
                    keywords,
                    mode: p.mode,
                    exclude: p.exclude,
                })
            }
            "source_status" => {
                let p: SourceStatusParams = spec.params(field)?;
                if p.allowed.is_empty() {
                    return Err(bad("allowed", "must name at least one status"));
                }
                Ok(Condition::SourceStatus { allowed: p.allowed })
            }
            other => Err(FieldError::new(
                format!("{field}.type"),
                format!("unknown condition type {other:?}"),
            )),
        }
    }

    pub fn evaluate(&self, ctx: &AutomationContext) -> bool {
        match self {
            Condition::TimeRange {
                start_hour,
                end_hour,
            } => {
                let hour = ctx.trigger.at.hour() as u8;
                if start_hour < end_hour {
                    (*start_hour..*end_hour).contains(&hour)
                } else {
                    hour >= *start_hour || hour < *end_hour
                }
            }
            Condition::ItemCount { min, max } => {
                let count = ctx.item_count();
                count >= *min && max.map_or(true, |max| count <= max)
            }
            Condition::ContentFilter {
                keywords,
                mode,
                exclude,
            } => {
                let any_item_matches = ctx.new_items.iter().flatten().any(|item| {
                    let text = format!("{} {}", item.title, item.content).to_lowercase();
                    match mode {
                        MatchMode::Any => keywords.iter().any(|k| text.contains(k.as_str())),
                        MatchMode::All => keywords.iter().all(|k| text.contains(k.as_str())),
                    }
                });
                any_item_matches != *exclude
            }
            Condition::SourceStatus { allowed } => ctx
                .source
                .as_ref()
                .is_some_and(|source| allowed.contains(&source.status)),
            #[cfg(test)]
            Condition::Panic(message) => panic!("{message}"),
        }
    }
}

impl TryFrom<ComponentSpec> for Condition {
    type Error = FieldError;

    fn try_from(spec: ComponentSpec) -> Result<Self, Self::Error> {
        Condition::parse(&spec, "condition")
    }
}

impl From<Condition> for ComponentSpec {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::TimeRange {
                start_hour,
                end_hour,
            } => ComponentSpec::new(
                "TIME_RANGE",
                serde_json::json!({ "startHour": start_hour, "endHour": end_hour }),
            ),
            Condition::ItemCount { min, max } => ComponentSpec::new(
                "ITEM_COUNT",
                serde_json::json!({ "minItems": min, "maxItems": max }),
            ),
            Condition::ContentFilter {
                keywords,
                mode,
                exclude,
            } => ComponentSpec::new(
                "CONTENT_FILTER",
                serde_json::json!({ "keywords": keywords, "mode": mode, "exclude": exclude }),
            ),
            Condition::SourceStatus { allowed } => ComponentSpec::new(
                "SOURCE_STATUS",
                serde_json::json!({ "allowed": allowed }),
            ),
            #[cfg(test)]
            Condition::Panic(message) => {
                ComponentSpec::new("PANIC", serde_json::json!({ "message": message }))
            }
        }
    }
}

// =============================================================================
// Action
// =============================================================================

/// Declarative work handed to the pipeline. The engine never executes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ComponentSpec", into = "ComponentSpec")]
pub enum Action {
    GenerateArticle {
        prompt_template: Option<String>,
        model: Option<String>,
        max_items: Option<usize>,
    },
    /// Send generated articles through the image stage.
    GenerateImage { style: Option<String> },
    /// Publish generated articles automatically, to `target` or the source default.
    PublishArticle { target: Option<PublishTarget> },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GenerateArticleParams {
    #[serde(alias = "prompt_template")]
    prompt_template: Option<String>,
    model: Option<String>,
    #[serde(alias = "max_items")]
    max_items: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenerateImageParams {
    style: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PublishArticleParams {
    target: Option<PublishTarget>,
}

impl Action {
    pub fn parse(spec: &ComponentSpec, field: &str) -> Result<Self, FieldError> {
        match spec.normalized_kind().as_str() {
            "generate_article" => {
                let p: GenerateArticleParams = spec.params(field)?;
                if p.max_items == Some(0) {
                    return Err(FieldError::new(
                        format!("{field}.parameters.maxItems"),
                        "must be at least 1",
                    ));
                }
                Ok(Action::GenerateArticle {
                    prompt_template: p.prompt_template,
                    model: p.model,
                    max_items: p.max_items,
                })
            }
            "generate_image" => {
                let p: GenerateImageParams = spec.params(field)?;
                Ok(Action::GenerateImage { style: p.style })
            }
            "publish_article" => {
                let p: PublishArticleParams = spec.params(field)?;
                Ok(Action::PublishArticle { target: p.target })
            }
            other => Err(FieldError::new(
                format!("{field}.type"),
                format!("unknown action type {other:?}"),
            )),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::GenerateArticle { .. } => "generate_article",
            Action::GenerateImage { .. } => "generate_image",
            Action::PublishArticle { .. } => "publish_article",
        }
    }
}

impl TryFrom<ComponentSpec> for Action {
    type Error = FieldError;

    fn try_from(spec: ComponentSpec) -> Result<Self, Self::Error> {
        Action::parse(&spec, "action")
    }
}

impl From<Action> for ComponentSpec {
    fn from(action: Action) -> Self {
        match action {
            Action::GenerateArticle {
                prompt_template,
                model,
                max_items,
            } => ComponentSpec::new(
                "GENERATE_ARTICLE",
                serde_json::json!({
                    "promptTemplate": prompt_template,
                    "model": model,
                    "maxItems": max_items,
                }),
            ),
            Action::GenerateImage { style } => {
                ComponentSpec::new("GENERATE_IMAGE", serde_json::json!({ "style": style }))
            }
            Action::PublishArticle { target } => {
                ComponentSpec::new("PUBLISH_ARTICLE", serde_json::json!({ "target": target }))
            }
        }
    }
}

// =============================================================================
// AutomationRule
// =============================================================================

/// Rule creation request, in the external wire shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewAutomationRule {
    pub source_id: Option<SourceId>,
    pub name: String,
    pub trigger: Option<ComponentSpec>,
    pub conditions: Vec<ComponentSpec>,
    pub actions: Vec<ComponentSpec>,
    pub is_enabled: Option<bool>,
}

/// Flat storage form of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: RuleId,
    pub source_id: SourceId,
    pub name: String,
    pub enabled: bool,
    pub trigger: Trigger,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    pub execution_count: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A stored trigger → conditions → actions tuple owned by one source.
///
/// Values are immutable: [`enable`](Self::enable), [`disable`](Self::disable)
/// and [`record_execution`](Self::record_execution) return new snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RuleRecord", into = "RuleRecord")]
pub struct AutomationRule {
    id: RuleId,
    source_id: SourceId,
    name: String,
    enabled: bool,
    trigger: Trigger,
    conditions: Vec<Condition>,
    actions: Vec<Action>,
    execution_count: u64,
    last_executed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl AutomationRule {
    /// Validate every part of `input`, collecting all field errors.
    pub fn validate(input: &NewAutomationRule) -> Result<ValidatedRule, Vec<FieldError>> {
        let mut errors = Vec::new();

        if input.source_id.is_none() {
            errors.push(FieldError::new("sourceId", "is required"));
        }
        let name = input.name.trim();
        if name.is_empty() {
            errors.push(FieldError::new("name", "is required"));
        }

        let trigger = match &input.trigger {
            None => {
                errors.push(FieldError::new("trigger", "is required"));
                None
            }
            Some(spec) => Trigger::parse(spec, "trigger")
                .map_err(|e| errors.push(e))
                .ok(),
        };

        let conditions: Vec<Condition> = input
            .conditions
            .iter()
            .enumerate()
            .filter_map(|(i, spec)| {
                Condition::parse(spec, &format!("conditions[{i}]"))
                    .map_err(|e| errors.push(e))
                    .ok()
            })
            .collect();

        if input.actions.is_empty() {
            errors.push(FieldError::new("actions", "at least one action is required"));
        }
        let actions: Vec<Action> = input
            .actions
            .iter()
            .enumerate()
            .filter_map(|(i, spec)| {
                Action::parse(spec, &format!("actions[{i}]"))
                    .map_err(|e| errors.push(e))
                    .ok()
            })
            .collect();

        match (input.source_id, trigger) {
            (Some(source_id), Some(trigger)) if errors.is_empty() => Ok(ValidatedRule {
                source_id,
                name: name.to_string(),
                enabled: input.is_enabled.unwrap_or(true),
                trigger,
                conditions,
                actions,
            }),
            _ => Err(errors),
        }
    }

    /// Validated factory.
    pub fn create(input: &NewAutomationRule) -> Result<Self, RuleError> {
        let valid = Self::validate(input).map_err(RuleError::Invalid)?;
        Ok(valid.into_rule(Utc::now()))
    }

    pub fn restore(record: RuleRecord) -> Self {
        record.into()
    }

    pub fn to_record(&self) -> RuleRecord {
        self.clone().into()
    }

    pub fn id(&self) -> RuleId {
        self.id
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    pub fn last_executed_at(&self) -> Option<DateTime<Utc>> {
        self.last_executed_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn enable(&self) -> Self {
        self.with_enabled(true)
    }

    pub fn disable(&self) -> Self {
        self.with_enabled(false)
    }

    pub fn with_enabled(&self, enabled: bool) -> Self {
        Self {
            enabled,
            ..self.clone()
        }
    }

    /// Snapshot with one more condition, bypassing validation.
    #[cfg(test)]
    pub(crate) fn with_condition(&self, condition: Condition) -> Self {
        let mut rule = self.clone();
        rule.conditions.push(condition);
        rule
    }

    /// Snapshot after one more execution at `at`.
    pub fn record_execution(&self, at: DateTime<Utc>) -> Self {
        Self {
            execution_count: self.execution_count.saturating_add(1),
            last_executed_at: Some(at),
            ..self.clone()
        }
    }

    /// `enabled && trigger matches && every condition holds`.
    ///
    /// Pure: depends only on the rule value and `ctx`.
    pub fn should_execute(&self, ctx: &AutomationContext) -> bool {
        self.enabled
            && self.trigger.matches(self, ctx)
            && self.conditions.iter().all(|c| c.evaluate(ctx))
    }
}

/// Output of [`AutomationRule::validate`]: a rule minus identity and counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRule {
    pub source_id: SourceId,
    pub name: String,
    pub enabled: bool,
    pub trigger: Trigger,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

impl ValidatedRule {
    pub fn into_rule(self, created_at: DateTime<Utc>) -> AutomationRule {
        AutomationRule {
            id: RuleId::new(),
            source_id: self.source_id,
            name: self.name,
            enabled: self.enabled,
            trigger: self.trigger,
            conditions: self.conditions,
            actions: self.actions,
            execution_count: 0,
            last_executed_at: None,
            created_at,
        }
    }
}

impl From<RuleRecord> for AutomationRule {
    fn from(r: RuleRecord) -> Self {
        Self {
            id: r.id,
            source_id: r.source_id,
            name: r.name,
            enabled: r.enabled,
            trigger: r.trigger,
            conditions: r.conditions,
            actions: r.actions,
            execution_count: r.execution_count,
            last_executed_at: r.last_executed_at,
            created_at: r.created_at,
        }
    }
}

impl From<AutomationRule> for RuleRecord {
    fn from(r: AutomationRule) -> Self {
        Self {
            id: r.id,
            source_id: r.source_id,
            name: r.name,
            enabled: r.enabled,
            trigger: r.trigger,
            conditions: r.conditions,
            actions: r.actions,
            execution_count: r.execution_count,
            last_executed_at: r.last_executed_at,
            created_at: r.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn input(source_id: SourceId) -> NewAutomationRule {
        NewAutomationRule {
            source_id: Some(source_id),
            name: "nightly".into(),
            trigger: Some(ComponentSpec::new("SCHEDULED", json!({ "intervalMinutes": 30 }))),
            conditions: vec![],
            actions: vec![ComponentSpec::new("GENERATE_ARTICLE", json!(null))],
            is_enabled: None,
        }
    }

    fn errors(input: &NewAutomationRule) -> Vec<FieldError> {
        match AutomationRule::validate(input) {
            Ok(_) => panic!("expected validation errors"),
            Err(errors) => errors,
        }
    }

    fn at_hour(hour: u32) -> AutomationContext {
        let at = Utc.with_ymd_and_hms(2026, 6, 1, hour, 30, 0).unwrap();
        AutomationContext::scheduled(SourceId::new(), at)
    }

    fn time_range(start: u8, end: u8) -> Result<Condition, FieldError> {
        Condition::parse(
            &ComponentSpec::new("time_range", json!({ "startHour": start, "endHour": end })),
            "conditions[0]",
        )
    }

    #[test]
    fn test_type_names_are_case_insensitive() {
        for kind in ["MANUAL", "manual", " Manual "] {
            let spec = ComponentSpec::new(kind, json!(null));
            assert_eq!(Trigger::parse(&spec, "trigger").unwrap(), Trigger::Manual);
        }
    }

    #[test]
    fn test_malformed_parameters_name_the_component() {
        let mut bad = input(SourceId::new());
        bad.trigger = Some(ComponentSpec::new(
            "SCHEDULED",
            json!({ "intervalMinutes": "hourly" }),
        ));
        bad.conditions = vec![ComponentSpec::new("TIME_RANGE", json!({ "startHour": -1 }))];
        bad.actions = vec![ComponentSpec::new("GENERATE_ARTICLE", json!([1, 2]))];

        let fields: Vec<String> = errors(&bad).into_iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            [
                "trigger.parameters",
                "conditions[0].parameters",
                "actions[0].parameters",
            ]
        );
    }

    #[test]
    fn test_out_of_range_parameters() {
        let mut bad = input(SourceId::new());
        bad.trigger = Some(ComponentSpec::new("SCHEDULED", json!({ "intervalMinutes": 0 })));
        bad.actions = vec![ComponentSpec::new("GENERATE_ARTICLE", json!({ "maxItems": 0 }))];

        let fields: Vec<String> = errors(&bad).into_iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            ["trigger.parameters.intervalMinutes", "actions[0].parameters.maxItems"]
        );
    }

    #[test]
    fn test_unknown_types_are_rejected() {
        let mut bad = input(SourceId::new());
        bad.trigger = Some(ComponentSpec::new("WEBHOOK", json!(null)));
        bad.actions = vec![
            ComponentSpec::new("GENERATE_ARTICLE", json!(null)),
            ComponentSpec::new("SEND_EMAIL", json!({ "to": "ops@example.test" })),
        ];

        let errors = errors(&bad);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "trigger.type");
        assert_eq!(errors[0].message, "unknown trigger type \"webhook\"");
        assert_eq!(errors[1].field, "actions[1].type");
        assert_eq!(errors[1].message, "unknown action type \"send_email\"");
    }

    #[test]
    fn test_unknown_type_fails_deserialization() {
        let err = serde_json::from_value::<Action>(json!({ "type": "TWEET" })).unwrap_err();
        assert!(err.to_string().contains("unknown action type"));
    }

    #[test]
    fn test_empty_action_list_is_rejected() {
        let mut bad = input(SourceId::new());
        bad.actions.clear();

        let errors = errors(&bad);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "actions");
        assert_eq!(errors[0].message, "at least one action is required");
    }

    #[test]
    fn test_time_range_wraps_past_midnight() {
        let night = time_range(22, 6).unwrap();
        for hour in [22, 23, 0, 3, 5] {
            assert!(night.evaluate(&at_hour(hour)), "hour {hour}");
        }
        for hour in [6, 12, 21] {
            assert!(!night.evaluate(&at_hour(hour)), "hour {hour}");
        }

        let evening = time_range(18, 24).unwrap();
        assert!(evening.evaluate(&at_hour(23)));
        assert!(!evening.evaluate(&at_hour(0)));
        assert!(!evening.evaluate(&at_hour(17)));
    }

    #[test]
    fn test_time_range_bounds() {
        assert_eq!(time_range(5, 5).unwrap_err().field, "conditions[0].parameters.endHour");
        assert_eq!(time_range(0, 24).unwrap_err().field, "conditions[0].parameters.endHour");
        assert_eq!(time_range(24, 3).unwrap_err().field, "conditions[0].parameters.startHour");
        assert_eq!(time_range(3, 25).unwrap_err().field, "conditions[0].parameters.endHour");
    }

    #[test]
    fn test_record_execution_saturates() {
        let rule = AutomationRule::create(&input(SourceId::new())).unwrap();
        let mut record = rule.to_record();
        record.execution_count = u64::MAX;
        let worn = AutomationRule::restore(record);

        let at = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let after = worn.record_execution(at);
        assert_eq!(after.execution_count(), u64::MAX);
        assert_eq!(after.last_executed_at(), Some(at));
    }

    #[test]
    fn test_enable_and_disable_return_new_snapshots() {
        let source_id = SourceId::new();
        let rule = AutomationRule::create(&input(source_id)).unwrap();
        assert!(rule.is_enabled());

        let disabled = rule.disable();
        assert!(rule.is_enabled());
        assert!(!disabled.is_enabled());
        assert_eq!(disabled.id(), rule.id());
        assert!(disabled.enable().is_enabled());

        let ctx = AutomationContext::scheduled(source_id, Utc::now());
        assert!(rule.should_execute(&ctx));
        assert!(!disabled.should_execute(&ctx));

        let mut off = input(source_id);
        off.is_enabled = Some(false);
        assert!(!AutomationRule::create(&off).unwrap().is_enabled());
    }

    #[test]
    fn test_content_filter_ignores_blank_keywords() {
        let spec = ComponentSpec::new(
            "CONTENT_FILTER",
            json!({ "keywords": ["  ", " Rust "], "mode": "all" }),
        );
        assert_eq!(
            Condition::parse(&spec, "conditions[0]").unwrap(),
            Condition::ContentFilter {
                keywords: vec!["rust".into()],
                mode: MatchMode::All,
                exclude: false,
            }
        );

        let blank = ComponentSpec::new("CONTENT_FILTER", json!({ "keywords": [" "] }));
        assert_eq!(
            Condition::parse(&blank, "conditions[0]").unwrap_err().field,
            "conditions[0].parameters.keywords"
        );
    }
}
