//! Gateway error taxonomy.
//!
//! Call sites return `anyhow::Result<T>` and attach context with
//! `.context(...)`, matching the rest of the codebase. This enum exists so
//! the control plane's outermost handler can recover a precise `{code}` for
//! `{ok:false, error:{code,message}}` responses without re-deriving it from
//! a downcast chain at every call site.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation_error: {message}")]
    Validation {
        message: String,
        issues: Vec<String>,
    },

    #[error("policy_denied: {0}")]
    PolicyDenied(String),

    #[error("rate_limited")]
    RateLimited,

    #[error("not_found: {0}")]
    NotFound(String),

    #[error("already_exists: {0}")]
    AlreadyExists(String),

    #[error("lock_conflict: {0}")]
    LockConflict(String),

    #[error("io_error: {0}")]
    Io(String),

    #[error("invalid_session: {0}")]
    InvalidSession(String),

    #[error("approval_denied")]
    ApprovalDenied,

    #[error("budget_exceeded")]
    BudgetExceeded,

    #[error("git_checkpoint_failed: {0}")]
    GitCheckpointFailed(String),
}

impl GatewayError {
    /// Short machine-readable code used in control-plane responses.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation { .. } => "validation_error",
            GatewayError::PolicyDenied(_) => "policy_denied",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::AlreadyExists(_) => "already_exists",
            GatewayError::LockConflict(_) => "lock_conflict",
            GatewayError::Io(_) => "io_error",
            GatewayError::InvalidSession(_) => "invalid_session",
            GatewayError::ApprovalDenied => "approval_denied",
            GatewayError::BudgetExceeded => "budget_exceeded",
            GatewayError::GitCheckpointFailed(_) => "git_checkpoint_failed",
        }
    }

    /// HTTP status this error maps to on the control plane.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Validation { .. } => 400,
            GatewayError::PolicyDenied(_) => 403,
            GatewayError::RateLimited => 429,
            GatewayError::NotFound(_) => 404,
            GatewayError::AlreadyExists(_) => 409,
            GatewayError::LockConflict(_) => 409,
            GatewayError::Io(_) => 500,
            GatewayError::InvalidSession(_) => 400,
            GatewayError::ApprovalDenied => 403,
            GatewayError::BudgetExceeded => 429,
            GatewayError::GitCheckpointFailed(_) => 500,
        }
    }
}

/// Wire shape for `error` in every control-plane response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<String>>,
}

/// Convert any `anyhow::Error` into a control-plane error body, recovering a
/// precise code when the chain contains a `GatewayError`, otherwise falling
/// back to `internal_error` with the error's display chain.
pub fn to_error_body(err: &anyhow::Error) -> (u16, ErrorBody) {
    if let Some(gw) = err.downcast_ref::<GatewayError>() {
        let issues = match gw {
            GatewayError::Validation { issues, .. } if !issues.is_empty() => {
                Some(issues.clone())
            }
            _ => None,
        };
        return (
            gw.status(),
            ErrorBody {
                code: gw.code().to_string(),
                message: gw.to_string(),
                issues,
            },
        );
    }
    (
        500,
        ErrorBody {
            code: "internal_error".to_string(),
            message: format!("{err:#}"),
            issues: None,
        },
    )
}
