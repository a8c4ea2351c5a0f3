//! Error types for the orchestration core

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {

    // =============================
    // Request Boundary Errors
    // =============================

    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        issues: Vec<String>,
    },

    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Authentication invalid: {0}")]
    AuthInvalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimit { retry_after_secs: u64 },

    #[error("Benchmarking requires opt-in")]
    BenchmarkOptInRequired,

    // =============================
    // Pipeline Errors
    // =============================

    #[error("Idempotency conflict: {0}")]
    IdempotencyConflict(String),

    #[error("Model output invalid: {0}")]
    ModelOutputInvalid(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Plan dependency unmet: {0}")]
    DependencyUnmet(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Shorthand for a validation failure with structured issues.
    pub fn validation(message: impl Into<String>, issues: Vec<String>) -> Self {
        Self::Validation {
            message: message.into(),
            issues,
        }
    }

    /// Stable machine code surfaced in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::AuthRequired(_) => "AUTH_REQUIRED",
            Self::AuthInvalid(_) => "AUTH_INVALID",
            Self::NotFound(_) => "NOT_FOUND",
            Self::RateLimit { .. } => "RATE_LIMIT",
            Self::BenchmarkOptInRequired => "BENCHMARK_OPT_IN_REQUIRED",
            Self::IdempotencyConflict(_) => "IDEMPOTENCY_CONFLICT",
            Self::ModelOutputInvalid(_) => "MODEL_OUTPUT_INVALID",
            Self::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            Self::Cancelled => "CANCELLED",
            Self::DependencyUnmet(_)
            | Self::Internal(_)
            | Self::Serialization(_)
            | Self::Http(_)
            | Self::Database(_)
            | Self::Io(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the code maps to. Kept as a bare u16 so this module does
    /// not depend on the HTTP layer.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::AuthRequired(_) | Self::AuthInvalid(_) => 401,
            Self::BenchmarkOptInRequired => 403,
            Self::NotFound(_) => 404,
            Self::IdempotencyConflict(_) => 409,
            Self::RateLimit { .. } => 429,
            Self::ModelOutputInvalid(_) => 502,
            Self::ProviderUnavailable(_) => 503,
            Self::Cancelled => 499,
            _ => 500,
        }
    }

    /// Structured details for the envelope, when the variant carries any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Validation { issues, .. } => Some(serde_json::json!({ "issues": issues })),
            Self::RateLimit { retry_after_secs } => {
                Some(serde_json::json!({ "retryAfter": retry_after_secs }))
            }
            _ => None,
        }
    }
}

/// Truncate an upstream error message before surfacing it. Provider bodies
/// can be arbitrarily large and may embed request echoes.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        message.to_string()
    } else {
        message.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_and_status_mapping() {
        let err = OrchestratorError::validation("bad input", vec!["amount missing".into()]);
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(err.http_status(), 400);
        let details = err.details().unwrap();
        assert_eq!(details["issues"][0], "amount missing");

        assert_eq!(
            OrchestratorError::BenchmarkOptInRequired.http_status(),
            403
        );
        assert_eq!(OrchestratorError::Cancelled.code(), "CANCELLED");
        assert_eq!(
            OrchestratorError::DependencyUnmet("x".into()).code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("short", 200), "short");
        let long = "x".repeat(300);
        assert_eq!(truncate_message(&long, 200).chars().count(), 200);
    }
}
