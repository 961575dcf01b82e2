//! Error taxonomy shared by the cache, lifecycle manager, and scheduler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced to synchronous callers of the controller.
///
/// Validation and permission failures carry a message meant for the end
/// user. Infrastructure failures wrap the underlying cause so it can be
/// logged, but render as a generic 500.
#[derive(Debug, Error)]
pub enum TestError {
    /// Malformed or incomplete input (400).
    #[error("{0}")]
    Validation(String),

    /// The caller lacks the permission for this operation (403).
    #[error("{0}")]
    Permission(String),

    /// The referenced test or object does not exist (404).
    #[error("{0}")]
    NotFound(String),

    /// Ownership or schedule conflict. `forbidden` selects 403 over 400.
    #[error("{message}")]
    Conflict { message: String, forbidden: bool },

    /// Queue or storage failure.
    #[error("{message}")]
    Infra {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, TestError>;

impl TestError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn infra(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Infra {
            message: message.into(),
            source,
        }
    }

    /// HTTP status code for this error class.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TestError::Validation(_) => StatusCode::BAD_REQUEST,
            TestError::Permission(_) => StatusCode::FORBIDDEN,
            TestError::NotFound(_) => StatusCode::NOT_FOUND,
            TestError::Conflict { forbidden, .. } => {
                if *forbidden {
                    StatusCode::FORBIDDEN
                } else {
                    StatusCode::BAD_REQUEST
                }
            }
            TestError::Infra { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for errors caused by the caller rather than the system.
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Extension for attaching an infra message to storage/queue results.
pub trait InfraContext<T> {
    fn infra(self, message: impl Into<String>) -> Result<T>;
}

impl<T> InfraContext<T> for anyhow::Result<T> {
    fn infra(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| TestError::infra(message, e))
    }
}

impl IntoResponse for TestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            TestError::Infra { message, source } => {
                tracing::error!(error = %source, "{}", message);
                json!({ "message": message, "error": source.to_string() })
            }
            other => json!({ "message": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(TestError::validation("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(TestError::permission("x").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(TestError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            TestError::Conflict { message: "x".into(), forbidden: true }.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            TestError::infra("boom", anyhow::anyhow!("disk")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_infra_context_keeps_source() {
        let res: anyhow::Result<()> = Err(anyhow::anyhow!("connection reset"));
        let err = res.infra("failed to send job message").unwrap_err();
        assert_eq!(err.to_string(), "failed to send job message");
        assert!(!err.is_client_error());
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("connection reset"));
    }
}
