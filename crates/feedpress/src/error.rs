//! Error categories and the structured error body returned across boundaries.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` crosses a use-case boundary.**
//!
//! - `anyhow` is internal transport (collaborators, event handlers, storage backends)
//! - Each module boundary has its own `thiserror` enum implementing [`Categorizable`]
//! - Callers only ever see an [`ErrorBody`]: `{code, message, details}`

use std::any::Any;
use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of a boundary error.
///
/// The category decides retry policy and how much detail may be exposed:
///
/// - `Validation`, `BusinessRule`, `NotFound`, `Conflict`: safe to expose details
/// - `ExternalService`, `Internal`: generic messages only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed input. Never retried.
    Validation,
    /// Well-formed input that violates a business rule (duplicate, unsupported platform).
    BusinessRule,
    /// Referenced entity does not exist.
    NotFound,
    /// Optimistic concurrency conflict; the caller may re-read and retry.
    Conflict,
    /// Generation or publishing provider failure. Eligible for a retry sweep.
    ExternalService,
    /// Storage or programmer error.
    Internal,
}

impl ErrorCategory {
    /// Whether an automatic retry sweep may pick this failure up again.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::ExternalService | ErrorCategory::Conflict)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation_error"),
            ErrorCategory::BusinessRule => write!(f, "business_rule_violation"),
            ErrorCategory::NotFound => write!(f, "not_found"),
            ErrorCategory::Conflict => write!(f, "conflict"),
            ErrorCategory::ExternalService => write!(f, "external_service_error"),
            ErrorCategory::Internal => write!(f, "internal_error"),
        }
    }
}

/// Errors that can be turned into a safe, structured [`ErrorBody`].
///
/// # Safe Message Contract
///
/// - `Validation`, `BusinessRule`, `NotFound` and `Conflict` MAY return their Display string
/// - `ExternalService` and `Internal` MUST return generic messages
pub trait Categorizable: std::error::Error {
    fn category(&self) -> ErrorCategory;

    /// Stable machine-readable code, e.g. `"unsupported_platform"`.
    fn code(&self) -> &'static str;

    fn safe_message(&self) -> Cow<'static, str> {
        match self.category() {
            ErrorCategory::ExternalService => "An external service failed".into(),
            ErrorCategory::Internal => "An internal error occurred".into(),
            _ => self.to_string().into(),
        }
    }

    fn details(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            category: self.category(),
            message: self.safe_message().into_owned(),
            details: self.details(),
        }
    }
}

/// Structured error returned to callers instead of a raw error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            category,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.category, self.message)
    }
}

/// A validation problem attached to one input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Dotted path into the input, e.g. `"conditions[1].parameters.maxItems"`.
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
