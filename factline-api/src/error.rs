//! Error Types for the factline service layer
//!
//! This module defines:
//! - The pipeline taxonomy (`AuthError`, `QuotaError`, `ResolutionError`)
//!   wrapped by `ServiceError`
//! - `ApiError` and `ErrorCode`, the serializable form an HTTP layer renders
//! - `IntoResponse` for `ApiError`, including `Retry-After` on quota denials
//!
//! Cache and counter-store failures never appear here: they are absorbed
//! where they happen.

use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use factline_core::{ConfigError, EntityId, WindowKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// PIPELINE TAXONOMY
// ============================================================================

/// Credential and identity rejections. Always terminal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("No credential presented")]
    MissingCredential,

    #[error("Credential not recognized")]
    UnknownCredential,

    #[error("Credential is not active: {reason}")]
    CredentialInactive { reason: String },

    #[error("Caller is not in the credential's allowed origins")]
    OriginNotAllowed { caller: Option<String> },

    #[error("Identity is not active: {reason}")]
    IdentityInactive { reason: String },
}

/// Quota denials. Terminal for the request, with retry metadata.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuotaError {
    /// A per-credential rate-limit override was exhausted.
    #[error("Rate limit of {limit} exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        limit: u64,
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },

    /// A plan-derived limit was exhausted.
    #[error("{window} quota of {limit} exceeded, retry after {retry_after_secs}s")]
    QuotaExceeded {
        window: WindowKind,
        limit: u64,
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },
}

impl QuotaError {
    /// Remaining requests in the exhausted window. Always zero.
    pub fn remaining(&self) -> u64 {
        0
    }

    pub fn limit(&self) -> u64 {
        match self {
            Self::RateLimited { limit, .. } | Self::QuotaExceeded { limit, .. } => *limit,
        }
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        match self {
            Self::RateLimited { reset_at, .. } | Self::QuotaExceeded { reset_at, .. } => *reset_at,
        }
    }

    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            }
            | Self::QuotaExceeded {
                retry_after_secs, ..
            } => *retry_after_secs,
        }
    }
}

/// Resolution failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Unknown category: {value}")]
    InvalidCategory { value: String },

    #[error("No fact available: {reason}")]
    NoFactAvailable { reason: String },
}

/// Everything `FactService` can surface to its caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// The identity or fact store could not be reached.
    #[error("Service unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: EntityId },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Authentication Errors (401, 403)
    // ========================================================================
    /// No credential was presented
    MissingCredential,

    /// Credential does not match any stored credential
    InvalidCredential,

    /// Credential is suspended, revoked, or expired
    CredentialInactive,

    /// Caller IP/origin is outside the credential's restriction list
    OriginNotAllowed,

    /// Owning identity is suspended or locked
    IdentityInactive,

    // ========================================================================
    // Quota Errors (429)
    // ========================================================================
    /// Per-credential rate limit exceeded
    RateLimited,

    /// Plan quota exceeded
    QuotaExceeded,

    // ========================================================================
    // Request Errors (400, 404)
    // ========================================================================
    /// Category is not one of the fixed categories
    InvalidCategory,

    /// Requested entity does not exist
    EntityNotFound,

    // ========================================================================
    // Server Errors (500, 503)
    // ========================================================================
    /// Every resolution tier came up empty
    NoFactAvailable,

    /// A required backing store is unavailable
    ServiceUnavailable,

    /// Internal server error
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::MissingCredential
            | ErrorCode::InvalidCredential
            | ErrorCode::CredentialInactive => StatusCode::UNAUTHORIZED,

            ErrorCode::OriginNotAllowed | ErrorCode::IdentityInactive => StatusCode::FORBIDDEN,

            ErrorCode::RateLimited | ErrorCode::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,

            ErrorCode::InvalidCategory => StatusCode::BAD_REQUEST,

            ErrorCode::EntityNotFound => StatusCode::NOT_FOUND,

            ErrorCode::NoFactAvailable | ErrorCode::ServiceUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::MissingCredential => "Authentication required",
            ErrorCode::InvalidCredential => "Invalid credential",
            ErrorCode::CredentialInactive => "Credential is not active",
            ErrorCode::OriginNotAllowed => "Origin not allowed for this credential",
            ErrorCode::IdentityInactive => "Account is not active",
            ErrorCode::RateLimited => "Rate limit exceeded",
            ErrorCode::QuotaExceeded => "Quota exceeded",
            ErrorCode::InvalidCategory => "Unknown category",
            ErrorCode::EntityNotFound => "Entity not found",
            ErrorCode::NoFactAvailable => "No fact available",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::InternalError => "Internal server error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Seconds until retry is worthwhile; rendered as `Retry-After`.
    #[serde(skip)]
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    /// Create a new API error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retry_after_secs: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Add additional details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl ServiceError {
    /// The API error code this error renders as.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::Auth(auth) => match auth {
                AuthError::MissingCredential => ErrorCode::MissingCredential,
                AuthError::UnknownCredential => ErrorCode::InvalidCredential,
                AuthError::CredentialInactive { .. } => ErrorCode::CredentialInactive,
                AuthError::OriginNotAllowed { .. } => ErrorCode::OriginNotAllowed,
                AuthError::IdentityInactive { .. } => ErrorCode::IdentityInactive,
            },
            ServiceError::Quota(QuotaError::RateLimited { .. }) => ErrorCode::RateLimited,
            ServiceError::Quota(QuotaError::QuotaExceeded { .. }) => ErrorCode::QuotaExceeded,
            ServiceError::Resolution(ResolutionError::InvalidCategory { .. }) => {
                ErrorCode::InvalidCategory
            }
            ServiceError::Resolution(ResolutionError::NoFactAvailable { .. }) => {
                ErrorCode::NoFactAvailable
            }
            ServiceError::Unavailable { .. } => ErrorCode::ServiceUnavailable,
            ServiceError::NotFound { .. } => ErrorCode::EntityNotFound,
            ServiceError::Config(_) => ErrorCode::InternalError,
        }
    }

    /// HTTP status this error renders as.
    pub fn status_code(&self) -> StatusCode {
        self.code().status_code()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let code = err.code();
        match err {
            ServiceError::Quota(quota) => {
                let details = serde_json::json!({
                    "limit": quota.limit(),
                    "remaining": quota.remaining(),
                    "reset_at": quota.reset_at().to_rfc3339(),
                });
                ApiError::new(code, quota.to_string())
                    .with_details(details)
                    .with_retry_after(quota.retry_after_secs())
            }
            ServiceError::Unavailable { reason } => {
                tracing::error!(%reason, "backing store unavailable");
                ApiError::from_code(code)
            }
            ServiceError::NotFound { entity, id } => {
                ApiError::new(code, format!("{} with id {} not found", entity, id))
            }
            ServiceError::Config(config) => {
                tracing::error!(error = %config, "configuration error");
                ApiError::from_code(code)
            }
            other => ApiError::new(code, other.to_string()),
        }
    }
}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after_secs;
        let mut response = (status, Json(self)).into_response();

        if let Some(secs) = retry_after {
            response.headers_mut().insert(
                HeaderName::from_static("retry-after"),
                HeaderValue::from_str(&secs.to_string())
                    .unwrap_or_else(|_| HeaderValue::from_static("60")),
            );
        }
        response
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

/// Result type alias for HTTP-facing operations.
pub type ApiResult<T> = Result<T, ApiError>;
