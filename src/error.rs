use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::response::{ApiResponse, ResponseCode};

/// Bridge error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("control plane returned {status}: {body}")]
    ControlPlane { status: u16, body: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("not found: {resource}")]
    NotFound { resource: String },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (code, message) = match &self {
            AppError::NotFound { resource } => {
                (ResponseCode::NOT_FOUND, format!("not found: {}", resource))
            }
            AppError::Config(_) => (ResponseCode::INTERNAL_ERROR, "configuration error".to_string()),
            AppError::ControlPlane { .. } | AppError::Http(_) | AppError::Timeout(_) => {
                (ResponseCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            _ => (ResponseCode::INTERNAL_ERROR, "internal error".to_string()),
        };

        tracing::error!(error = %self, "health request failed");

        ApiResponse::<()>::error(code, message).into_response()
    }
}

/// Bridge Result alias
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage<T: Into<String>>(msg: T) -> Self {
        Self::Storage(msg.into())
    }

    pub fn execution<T: Into<String>>(msg: T) -> Self {
        Self::Execution(msg.into())
    }

    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn not_found<T: Into<String>>(resource: T) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn control_plane(status: u16, body: impl Into<String>) -> Self {
        Self::ControlPlane {
            status,
            body: body.into(),
        }
    }

    /// Whether retrying the same call later could succeed.
    ///
    /// Transport failures, timeouts, local I/O, throttling and 5xx answers are
    /// transient. Any other control-plane rejection is treated as final.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Io(_) | AppError::Storage(_) | AppError::Http(_) | AppError::Timeout(_) => true,
            AppError::ControlPlane { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// The control plane refused the lease (another bridge owns it or it expired).
    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, AppError::ControlPlane { status: 409 | 410, .. })
    }
}
