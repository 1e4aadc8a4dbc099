//! Error handling module
//!
//! Centralized error types and HTTP response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::aggregate::AggregateError;
use crate::domain::DomainError;
use crate::event_store::EventLogError;
use crate::projection::ProjectionError;
use crate::workflow::{WorkflowError, WorkflowExecution};

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Lost an optimistic concurrency race after all retries
    #[error("Concurrent modification: {0}")]
    ConcurrencyConflict(String),

    /// Business rule violation, never retried
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A workflow rolled back because one of its steps was refused
    #[error("{message}")]
    StepRejected { code: &'static str, message: String },

    // Server errors (5xx)
    /// Log write failure or collaborator timeout, already retried
    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),

    /// Compensation could not be completed; needs an operator
    #[error("Compensation failed for workflow {workflow_id}: {reason}")]
    CompensationFailure { workflow_id: Uuid, reason: String },

    /// Stored history failed an integrity check
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl AppError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        AppError::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::NotFound { resource, .. } => match *resource {
                "Account" => "account_not_found",
                "Transfer" => "transfer_not_found",
                "Workflow" => "workflow_not_found",
                _ => "not_found",
            },
            AppError::ConcurrencyConflict(_) => "concurrency_conflict",
            AppError::Domain(e) => e.error_code(),
            AppError::StepRejected { code, .. } => *code,
            AppError::Infrastructure(_) => "infrastructure_error",
            AppError::CompensationFailure { .. } => "compensation_failure",
            AppError::Corrupted(_) => "corrupted_data",
            AppError::Database(_) => "database_error",
            AppError::Internal(_) => "internal_error",
            AppError::Config(_) => "config_error",
        }
    }

    /// Worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ConcurrencyConflict(_) | AppError::Infrastructure(_) | AppError::Database(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::ConcurrencyConflict(_) => StatusCode::CONFLICT,
            AppError::Domain(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            AppError::Domain(e) if e.is_conflict() => StatusCode::CONFLICT,
            AppError::Domain(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::StepRejected { code, .. } => match *code {
                "account_already_exists" => StatusCode::CONFLICT,
                c if c.ends_with("_not_found") => StatusCode::NOT_FOUND,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            },
            AppError::Infrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::CompensationFailure { .. }
            | AppError::Corrupted(_)
            | AppError::Database(_)
            | AppError::Internal(_)
            | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl AppError {
    /// Error for a workflow that did not complete, carrying the code the
    /// failing step recorded
    pub fn from_rolled_back(execution: &WorkflowExecution) -> Self {
        let failed = execution.failed_step().map(|index| &execution.steps[index]);
        let code = failed
            .and_then(|step| step.error_code.as_deref())
            .and_then(DomainError::known_code)
            .unwrap_or("workflow_rolled_back");
        let message = failed
            .and_then(|step| step.error.clone())
            .or_else(|| execution.error.clone())
            .unwrap_or_else(|| format!("workflow {} rolled back", execution.id));

        AppError::StepRejected { code, message }
    }
}

impl From<EventLogError> for AppError {
    fn from(err: EventLogError) -> Self {
        match err {
            EventLogError::ConcurrencyConflict { .. } | EventLogError::DuplicateOperation { .. } => {
                AppError::ConcurrencyConflict(err.to_string())
            }
            EventLogError::Database(e) => AppError::Database(e),
            EventLogError::Unavailable(_) => {
                AppError::Infrastructure(err.to_string())
            }
            EventLogError::Corrupted(reason) => AppError::Corrupted(reason),
            EventLogError::EmptyAppend | EventLogError::Serialization(_) => {
                AppError::Internal(err.to_string())
            }
        }
    }
}

impl From<AggregateError> for AppError {
    fn from(err: AggregateError) -> Self {
        AppError::Corrupted(err.to_string())
    }
}

impl From<ProjectionError> for AppError {
    fn from(err: ProjectionError) -> Self {
        match err {
            ProjectionError::Database(e) => AppError::Database(e),
            ProjectionError::EventLog(e) => e.into(),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<WorkflowError> for AppError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::NotFound(id) => AppError::not_found("Workflow", id),
            WorkflowError::CompensationFailed {
                workflow_id,
                step,
                reason,
            } => AppError::CompensationFailure {
                workflow_id,
                reason: format!("step {step}: {reason}"),
            },
            WorkflowError::RequiresIntervention(workflow_id) => AppError::CompensationFailure {
                workflow_id,
                reason: "awaiting operator intervention".to_string(),
            },
            WorkflowError::NotCancellable { .. } | WorkflowError::AlreadyRunning(_) => {
                AppError::ConcurrencyConflict(err.to_string())
            }
            WorkflowError::InvalidInput(msg) => AppError::InvalidRequest(msg),
            WorkflowError::Database(e) => AppError::Database(e),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Opaque reference for server errors, logged with the cause
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<Uuid>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code().to_string();

        let body = if status.is_server_error() {
            let reference_id = Uuid::new_v4();
            match &self {
                AppError::CompensationFailure { workflow_id, .. } => tracing::error!(
                    reference_id = %reference_id,
                    workflow_id = %workflow_id,
                    error = %self,
                    "Compensation failure surfaced to client"
                ),
                _ => tracing::error!(reference_id = %reference_id, error = ?self, "Request failed"),
            }
            ErrorResponse {
                error: status
                    .canonical_reason()
                    .unwrap_or("Server error")
                    .to_string(),
                error_code,
                details: None,
                reference_id: Some(reference_id),
            }
        } else {
            let details = match &self {
                AppError::Domain(e) => Some(e.to_string()),
                AppError::InvalidRequest(msg)
                | AppError::ConcurrencyConflict(msg)
                | AppError::StepRejected { message: msg, .. } => Some(msg.clone()),
                AppError::NotFound { id, .. } => Some(id.clone()),
                _ => None,
            };
            ErrorResponse {
                error: self.to_string(),
                error_code,
                details,
                reference_id: None,
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_mapping() {
        let err = AppError::from(DomainError::insufficient_funds(10, 5));
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.error_code(), "insufficient_funds");
        assert!(!err.is_retryable());

        let err = AppError::from(DomainError::AccountNotFound(Uuid::nil()));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_event_log_error_mapping() {
        let err = AppError::from(EventLogError::ConcurrencyConflict {
            aggregate_id: Uuid::nil(),
            expected: 1,
            actual: 2,
        });
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert!(err.is_retryable());

        let err = AppError::from(EventLogError::Unavailable("down".into()));
        assert_eq!(err.error_code(), "infrastructure_error");
        assert!(err.status_code().is_server_error());
    }

    #[test]
    fn test_rolled_back_keeps_step_code() {
        use crate::workflow::{StepStatus, WorkflowStatus};

        let mut execution = WorkflowExecution::new(
            Uuid::nil(),
            "create_account",
            serde_json::Value::Null,
            ["open".to_string(), "deposit".to_string()],
            chrono::Utc::now(),
        );
        execution.status = WorkflowStatus::Compensated;
        execution.steps[0].status = StepStatus::Failed;
        execution.steps[0].error_code = Some("account_already_exists".to_string());
        execution.steps[0].error = Some("Account already exists".to_string());

        let err = AppError::from_rolled_back(&execution);
        assert_eq!(err.error_code(), "account_already_exists");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        // Unknown codes are not echoed back
        execution.steps[0].error_code = Some("credit_rejected".to_string());
        let err = AppError::from_rolled_back(&execution);
        assert_eq!(err.error_code(), "workflow_rolled_back");
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_not_found_codes() {
        assert_eq!(
            AppError::not_found("Account", Uuid::nil()).error_code(),
            "account_not_found"
        );
        assert_eq!(
            AppError::not_found("Workflow", Uuid::nil()).error_code(),
            "workflow_not_found"
        );
    }
}
