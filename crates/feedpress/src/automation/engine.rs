//! Rule evaluation.
//!
//! The engine decides, it does not act: evaluation returns the ordered actions
//! of every rule that fired, and the caller hands them to the pipeline.
//! A rule that panics while evaluating is disqualified for this context only.

use std::panic::{catch_unwind, AssertUnwindSafe};

use smallvec::SmallVec;
use tracing::{debug, error};

use super::context::AutomationContext;
use super::rule::{Action, AutomationRule};
use crate::error::panic_message;
use crate::id::RuleId;

/// Actions of one fired rule, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDecision {
    pub rule_id: RuleId,
    pub rule_name: String,
    pub actions: SmallVec<[Action; 3]>,
}

/// A rule whose evaluation blew up.
#[derive(Debug, Clone, PartialEq)]
pub struct Disqualified {
    pub rule_id: RuleId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub decisions: Vec<RuleDecision>,
    pub disqualified: Vec<Disqualified>,
}

impl Evaluation {
    pub fn fired(&self) -> bool {
        !self.decisions.is_empty()
    }
}

/// Evaluate `rules` against `ctx`, in order.
pub fn evaluate(rules: &[AutomationRule], ctx: &AutomationContext) -> Evaluation {
    let mut evaluation = Evaluation::default();

    for rule in rules {
        match catch_unwind(AssertUnwindSafe(|| rule.should_execute(ctx))) {
            Ok(true) => {
                debug!(rule_id = %rule.id(), rule = rule.name(), "rule fired");
                evaluation.decisions.push(RuleDecision {
                    rule_id: rule.id(),
                    rule_name: rule.name().to_string(),
                    actions: rule.actions().iter().cloned().collect(),
                });
            }
            Ok(false) => {}
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(
                    rule_id = %rule.id(),
                    rule = rule.name(),
                    panic = %reason,
                    "rule panicked during evaluation"
                );
                evaluation.disqualified.push(Disqualified {
                    rule_id: rule.id(),
                    reason,
                });
            }
        }
    }

    evaluation
}
