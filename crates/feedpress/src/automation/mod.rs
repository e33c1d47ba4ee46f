//! Automation rules: trigger → conditions → actions, owned by one source.
//!
//! Rules decide; they never act. [`evaluate`] returns ordered
//! [`RuleDecision`]s and the pipeline executes them.

mod context;
mod engine;
mod rule;

pub use context::{AutomationContext, SourceSnapshot, TriggerDescriptor, TriggerKind};
pub use engine::{evaluate, Disqualified, Evaluation, RuleDecision};
pub use rule::{
    Action, AutomationRule, ComponentSpec, Condition, MatchMode, NewAutomationRule, RuleRecord,
    Trigger, ValidatedRule,
};

use thiserror::Error;

use crate::error::{Categorizable, ErrorCategory, FieldError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("invalid automation rule: {}", summarize(.0))]
    Invalid(Vec<FieldError>),
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Categorizable for RuleError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Validation
    }

    fn code(&self) -> &'static str {
        "invalid_rule"
    }

    fn details(&self) -> serde_json::Value {
        match self {
            RuleError::Invalid(errors) => serde_json::json!({ "fieldErrors": errors }),
        }
    }
}
