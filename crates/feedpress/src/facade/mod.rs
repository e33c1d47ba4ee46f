//! Admin facade: a single `validate` / `execute` surface over operator actions.
//!
//! Every use case is registered under a stable name and takes JSON input.
//! `execute` always returns an [`ExecutionResult`]; failures are reported in
//! it as an [`ErrorBody`], never raised.
//!
//! ```text
//! execute(name, input, options)
//!     │
//!     ├─► dry_run? ─► Services::simulated()   (scratch overlay, stub collaborators)
//!     │
//!     ├─► validate ─► invalid ─► ExecutionResult { success: false, validation_failed }
//!     │
//!     └─► run (panic-isolated) ─► ExecutionResult { data | error }
//!                                       │
//!                                       └─► tracing + AuditLog
//! ```

mod audit;
mod use_cases;

pub use audit::{AuditEntry, AuditLog, AuditStats};
pub use use_cases::{
    AdvanceArticle, AdvanceArticleInput, CreateAutomationRule, IngestFeedItems,
    IngestFeedItemsInput, PublishArticle, RetryPublication, RetryPublicationInput, RunAutomation,
    RunAutomationInput, RunScheduledRules, RunScheduledRulesInput, SetRuleEnabled,
    SetRuleEnabledInput,
};

use std::borrow::Cow;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::automation::RuleError;
use crate::error::{panic_message, Categorizable, ErrorBody, ErrorCategory, FieldError};
use crate::publish::PublishError;
use crate::services::Services;
use crate::stages::AdvanceError;
use crate::store::StoreError;

// =============================================================================
// Contract types
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<FieldError>,
    pub warnings: Vec<String>,
    /// Input after defaults were applied; what `execute` runs with.
    pub normalized_input: Option<Value>,
}

impl ValidationReport {
    fn rejected(errors: Vec<FieldError>) -> Self {
        Self {
            is_valid: false,
            errors,
            warnings: Vec::new(),
            normalized_input: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecuteOptions {
    /// Run against a scratch overlay with stub collaborators.
    pub dry_run: bool,
    /// Default idempotency key for use cases with external side effects.
    pub idempotency_key: Option<String>,
    pub user_id: Option<String>,
    /// Generated when absent.
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub use_case: String,
    pub request_id: String,
    pub dry_run: bool,
    pub data: Option<Value>,
    pub error: Option<ErrorBody>,
    pub validation: ValidationReport,
    pub duration_ms: u64,
}

/// Findings of a use case's semantic checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checks {
    errors: Vec<FieldError>,
    warnings: Vec<String>,
}

impl Checks {
    pub fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError::new(field, message));
    }

    pub fn errors(&mut self, errors: impl IntoIterator<Item = FieldError>) {
        self.errors.extend(errors);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn into_report(self, normalized_input: Value) -> ValidationReport {
        ValidationReport {
            is_valid: self.errors.is_empty(),
            errors: self.errors,
            warnings: self.warnings,
            normalized_input: Some(normalized_input),
        }
    }
}

#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("unknown use case {0:?}")]
    UnknownUseCase(String),

    #[error("input failed validation")]
    ValidationFailed(Vec<FieldError>),

    #[error("use case panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Advance(#[from] AdvanceError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode use case data: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl Categorizable for FacadeError {
    fn category(&self) -> ErrorCategory {
        match self {
            FacadeError::UnknownUseCase(_) => ErrorCategory::NotFound,
            FacadeError::ValidationFailed(_) => ErrorCategory::Validation,
            FacadeError::Panicked(_) | FacadeError::Encoding(_) => ErrorCategory::Internal,
            FacadeError::Rule(e) => e.category(),
            FacadeError::Advance(e) => e.category(),
            FacadeError::Publish(e) => e.category(),
            FacadeError::Store(e) => e.category(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            FacadeError::UnknownUseCase(_) => "unknown_use_case",
            FacadeError::ValidationFailed(_) => "validation_failed",
            FacadeError::Panicked(_) => "internal_error",
            FacadeError::Encoding(_) => "encoding_error",
            FacadeError::Rule(e) => e.code(),
            FacadeError::Advance(e) => e.code(),
            FacadeError::Publish(e) => e.code(),
            FacadeError::Store(e) => e.code(),
        }
    }

    fn safe_message(&self) -> Cow<'static, str> {
        match self {
            FacadeError::Rule(e) => e.safe_message(),
            FacadeError::Advance(e) => e.safe_message(),
            FacadeError::Publish(e) => e.safe_message(),
            FacadeError::Store(e) => e.safe_message(),
            FacadeError::Panicked(_) | FacadeError::Encoding(_) => {
                "An internal error occurred".into()
            }
            other => other.to_string().into(),
        }
    }

    fn details(&self) -> Value {
        match self {
            FacadeError::ValidationFailed(errors) => serde_json::json!({ "fieldErrors": errors }),
            FacadeError::Rule(e) => e.details(),
            FacadeError::Publish(e) => e.details(),
            _ => Value::Null,
        }
    }
}

// =============================================================================
// Use case trait
// =============================================================================

/// One operator action.
#[async_trait]
pub trait UseCase: Send + Sync + 'static {
    /// Registration name, e.g. `"publish_article"`.
    const NAME: &'static str;

    type Input: DeserializeOwned + Serialize + Send + Sync;
    type Output: Serialize + Send;

    /// Apply defaults from the call options.
    fn normalize(&self, input: Self::Input, _options: &ExecuteOptions) -> Self::Input {
        input
    }

    /// Record everything that would make `execute` fail. Reads only.
    async fn check(
        &self,
        input: &Self::Input,
        services: &Services,
        checks: &mut Checks,
    ) -> Result<(), StoreError>;

    async fn execute(
        &self,
        input: Self::Input,
        services: &Services,
    ) -> Result<Self::Output, FacadeError>;
}

#[async_trait]
trait AnyUseCase: Send + Sync {
    async fn validate_any(
        &self,
        input: Value,
        services: &Services,
        options: &ExecuteOptions,
    ) -> Result<ValidationReport, FacadeError>;

    async fn execute_any(&self, input: Value, services: &Services) -> Result<Value, FacadeError>;
}

struct UseCaseWrapper<U>(U);

#[async_trait]
impl<U: UseCase> AnyUseCase for UseCaseWrapper<U> {
    async fn validate_any(
        &self,
        input: Value,
        services: &Services,
        options: &ExecuteOptions,
    ) -> Result<ValidationReport, FacadeError> {
        let input: U::Input = match serde_json::from_value(input) {
            Ok(input) => input,
            Err(e) => {
                return Ok(ValidationReport::rejected(vec![FieldError::new(
                    "input",
                    e.to_string(),
                )]))
            }
        };
        let input = self.0.normalize(input, options);

        let mut checks = Checks::default();
        self.0.check(&input, services, &mut checks).await?;
        Ok(checks.into_report(serde_json::to_value(&input)?))
    }

    async fn execute_any(&self, input: Value, services: &Services) -> Result<Value, FacadeError> {
        let input: U::Input = serde_json::from_value(input)?;
        let output = self.0.execute(input, services).await?;
        Ok(serde_json::to_value(output)?)
    }
}

// =============================================================================
// Facade
// =============================================================================

pub struct AdminFacade {
    services: Services,
    use_cases: HashMap<&'static str, Arc<dyn AnyUseCase>>,
    audit: AuditLog,
}

impl AdminFacade {
    /// A facade with no use cases registered.
    pub fn new(services: Services) -> Self {
        Self {
            services,
            use_cases: HashMap::new(),
            audit: AuditLog::new(),
        }
    }

    /// A facade with every built-in use case registered.
    pub fn with_default_use_cases(services: Services) -> Self {
        let mut facade = Self::new(services);
        facade.register(IngestFeedItems);
        facade.register(CreateAutomationRule);
        facade.register(SetRuleEnabled);
        facade.register(AdvanceArticle);
        facade.register(PublishArticle);
        facade.register(RetryPublication);
        facade.register(RunAutomation);
        facade.register(RunScheduledRules);
        facade
    }

    /// Register `use_case`, replacing any earlier one with the same name.
    pub fn register<U: UseCase>(&mut self, use_case: U) {
        self.use_cases
            .insert(U::NAME, Arc::new(UseCaseWrapper(use_case)));
    }

    /// Registered names, sorted.
    pub fn use_cases(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.use_cases.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Check `input` against the live stores without changing anything.
    pub async fn validate(
        &self,
        use_case: &str,
        input: Value,
    ) -> Result<ValidationReport, FacadeError> {
        let handler = self.lookup(use_case)?;
        handler
            .validate_any(input, &self.services, &ExecuteOptions::default())
            .await
    }

    /// Validate, then run `use_case`. Never fails; see [`ExecutionResult`].
    pub async fn execute(
        &self,
        use_case: &str,
        input: Value,
        options: ExecuteOptions,
    ) -> ExecutionResult {
        let started = Instant::now();
        let request_id = options
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let services = if options.dry_run {
            self.services.simulated()
        } else {
            self.services.clone()
        };
        let (validation, outcome) = self.run(use_case, input, &options, &services).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (data, error) = match outcome {
            Ok(data) => (Some(data), None),
            Err(e) => (None, Some(e.to_body())),
        };
        let result = ExecutionResult {
            success: error.is_none(),
            use_case: use_case.to_string(),
            request_id,
            dry_run: options.dry_run,
            data,
            error,
            validation,
            duration_ms,
        };

        self.audit(&result, &options);
        result
    }

    fn lookup(&self, use_case: &str) -> Result<Arc<dyn AnyUseCase>, FacadeError> {
        self.use_cases
            .get(use_case)
            .cloned()
            .ok_or_else(|| FacadeError::UnknownUseCase(use_case.to_string()))
    }

    async fn run(
        &self,
        use_case: &str,
        input: Value,
        options: &ExecuteOptions,
        services: &Services,
    ) -> (ValidationReport, Result<Value, FacadeError>) {
        let handler = match self.lookup(use_case) {
            Ok(handler) => handler,
            Err(e) => return (ValidationReport::default(), Err(e)),
        };

        let report = match handler.validate_any(input, services, options).await {
            Ok(report) => report,
            Err(e) => return (ValidationReport::default(), Err(e)),
        };
        if !report.is_valid {
            let errors = report.errors.clone();
            return (report, Err(FacadeError::ValidationFailed(errors)));
        }

        let input = report.normalized_input.clone().unwrap_or(Value::Null);
        let outcome = match AssertUnwindSafe(handler.execute_any(input, services))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => Err(FacadeError::Panicked(panic_message(panic.as_ref()))),
        };
        (report, outcome)
    }

    fn audit(&self, result: &ExecutionResult, options: &ExecuteOptions) {
        match &result.error {
            None => info!(
                use_case = %result.use_case,
                request_id = %result.request_id,
                user_id = options.user_id.as_deref(),
                dry_run = result.dry_run,
                duration_ms = result.duration_ms,
                "admin use case executed"
            ),
            Some(error) => warn!(
                use_case = %result.use_case,
                request_id = %result.request_id,
                user_id = options.user_id.as_deref(),
                dry_run = result.dry_run,
                duration_ms = result.duration_ms,
                code = %error.code,
                "admin use case failed"
            ),
        }

        self.audit.record(AuditEntry {
            use_case: result.use_case.clone(),
            request_id: result.request_id.clone(),
            user_id: options.user_id.clone(),
            dry_run: result.dry_run,
            success: result.success,
            error_code: result.error.as_ref().map(|e| e.code.clone()),
            duration_ms: result.duration_ms,
            at: Utc::now(),
        });
    }
}
