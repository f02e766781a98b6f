use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Fixed message returned for every malformed document.
///
/// Parser internals (entity names, file paths, byte offsets) are logged but
/// never echoed to the caller.
pub const MALFORMED_INPUT_MESSAGE: &str = "Malformed ADF document";

/// Application-specific error types.
#[derive(Debug)]
pub enum AppError {
    /// Body exceeds the configured payload limit.
    PayloadTooLarge { limit_bytes: usize },
    /// Source IP exceeded its request budget for the sliding window.
    RateLimited { retry_after_secs: u64 },
    /// Missing or invalid vendor signature or bearer token.
    Unauthorized(String),
    /// Source IP is outside the configured allowlist.
    Forbidden(String),
    /// Body could not be decoded or parsed (includes DOCTYPE/ENTITY attempts).
    MalformedInput(String),
    /// Document parsed but failed business validation.
    ValidationFailed { field: String, reason: String },
    /// Persistence layer is unreachable or refusing work.
    StorageUnavailable(String),
    /// Resource not found error.
    NotFound(String),
    /// Internal server error.
    InternalError(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl AppError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::ValidationFailed {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Metric label for the outcome this error represents.
    pub fn outcome(&self) -> IngestOutcome {
        match self {
            AppError::PayloadTooLarge { .. } => IngestOutcome::PayloadTooLarge,
            AppError::RateLimited { .. } => IngestOutcome::RateLimited,
            AppError::Unauthorized(_) => IngestOutcome::Unauthorized,
            AppError::Forbidden(_) => IngestOutcome::Forbidden,
            AppError::MalformedInput(_) => IngestOutcome::MalformedInput,
            AppError::ValidationFailed { .. } => IngestOutcome::ValidationFailed,
            AppError::StorageUnavailable(_) => IngestOutcome::StorageUnavailable,
            AppError::NotFound(_) | AppError::InternalError(_) => IngestOutcome::InternalError,
            AppError::WithContext { source, .. } => source.outcome(),
        }
    }
}

/// Terminal outcome of one ingest request, attached to every response as an
/// extension so the metrics middleware can classify it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Created,
    PayloadTooLarge,
    RateLimited,
    Unauthorized,
    Forbidden,
    MalformedInput,
    ValidationFailed,
    StorageUnavailable,
    InternalError,
    /// The request future was dropped before a response was produced
    /// (outer request timeout or client disconnect).
    Aborted,
}

impl IngestOutcome {
    pub const ALL: [IngestOutcome; 10] = [
        IngestOutcome::Created,
        IngestOutcome::PayloadTooLarge,
        IngestOutcome::RateLimited,
        IngestOutcome::Unauthorized,
        IngestOutcome::Forbidden,
        IngestOutcome::MalformedInput,
        IngestOutcome::ValidationFailed,
        IngestOutcome::StorageUnavailable,
        IngestOutcome::InternalError,
        IngestOutcome::Aborted,
    ];

    pub fn as_label(&self) -> &'static str {
        match self {
            IngestOutcome::Created => "created",
            IngestOutcome::PayloadTooLarge => "payload_too_large",
            IngestOutcome::RateLimited => "rate_limited",
            IngestOutcome::Unauthorized => "unauthorized",
            IngestOutcome::Forbidden => "forbidden",
            IngestOutcome::MalformedInput => "malformed_input",
            IngestOutcome::ValidationFailed => "validation_failed",
            IngestOutcome::StorageUnavailable => "storage_unavailable",
            IngestOutcome::InternalError => "internal_error",
            IngestOutcome::Aborted => "aborted",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, IngestOutcome::Created)
    }

    /// Best-effort classification for responses that carry no outcome extension.
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            s if s.is_success() => IngestOutcome::Created,
            StatusCode::PAYLOAD_TOO_LARGE => IngestOutcome::PayloadTooLarge,
            StatusCode::TOO_MANY_REQUESTS => IngestOutcome::RateLimited,
            StatusCode::UNAUTHORIZED => IngestOutcome::Unauthorized,
            StatusCode::FORBIDDEN => IngestOutcome::Forbidden,
            StatusCode::REQUEST_TIMEOUT => IngestOutcome::Aborted,
            StatusCode::BAD_REQUEST | StatusCode::UNSUPPORTED_MEDIA_TYPE => {
                IngestOutcome::MalformedInput
            }
            StatusCode::UNPROCESSABLE_ENTITY => IngestOutcome::ValidationFailed,
            StatusCode::SERVICE_UNAVAILABLE => IngestOutcome::StorageUnavailable,
            _ => IngestOutcome::InternalError,
        }
    }
}

impl fmt::Display for AppError {
    /// Formats the error for display.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::PayloadTooLarge { limit_bytes } => {
                write!(f, "Payload too large: limit is {} bytes", limit_bytes)
            }
            AppError::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited: retry after {}s", retry_after_secs)
            }
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::MalformedInput(msg) => write!(f, "Malformed input: {}", msg),
            AppError::ValidationFailed { field, reason } => {
                write!(f, "Validation failed: {}: {}", field, reason)
            }
            AppError::StorageUnavailable(msg) => write!(f, "Storage unavailable: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Converts the error into an HTTP response.
    ///
    /// Maps each error variant to an appropriate HTTP status code and JSON body,
    /// and tags the response with its `IngestOutcome`.
    fn into_response(self) -> Response {
        let outcome = self.outcome();

        let mut response = match &self {
            AppError::PayloadTooLarge { limit_bytes } => {
                tracing::warn!("Rejected oversized payload (limit {} bytes)", limit_bytes);
                (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Json(json!({
                        "error": format!("Payload exceeds maximum size of {} bytes", limit_bytes),
                    })),
                )
                    .into_response()
            }
            AppError::RateLimited { retry_after_secs } => {
                tracing::warn!("Rate limit exceeded, retry after {}s", retry_after_secs);
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "error": "Too many requests",
                    })),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            AppError::Unauthorized(msg) => {
                tracing::warn!("Unauthorized request: {}", msg);
                (StatusCode::UNAUTHORIZED, Json(json!({ "error": msg }))).into_response()
            }
            AppError::Forbidden(msg) => {
                tracing::warn!("Forbidden request: {}", msg);
                (StatusCode::FORBIDDEN, Json(json!({ "error": msg }))).into_response()
            }
            AppError::MalformedInput(detail) => {
                tracing::warn!("Malformed ADF input: {}", detail);
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": MALFORMED_INPUT_MESSAGE,
                    })),
                )
                    .into_response()
            }
            AppError::ValidationFailed { field, reason } => {
                tracing::warn!("ADF validation failed: {}: {}", field, reason);
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": format!("{}: {}", field, reason),
                        "field": field,
                    })),
                )
                    .into_response()
            }
            AppError::StorageUnavailable(msg) => {
                tracing::error!("Storage unavailable: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": "Storage unavailable, retry later",
                    })),
                )
                    .into_response()
            }
            AppError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": msg }))).into_response()
            }
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": "Internal server error",
                    })),
                )
                    .into_response()
            }
            AppError::WithContext { context, source } => {
                // The inner arm logs at its own level
                tracing::debug!("Error context: {}", context);
                return (*source.clone()).into_response();
            }
        };

        response.extensions_mut().insert(outcome);
        response
    }
}

// Make AppError cloneable for WithContext variant
impl Clone for AppError {
    fn clone(&self) -> Self {
        match self {
            AppError::PayloadTooLarge { limit_bytes } => AppError::PayloadTooLarge {
                limit_bytes: *limit_bytes,
            },
            AppError::RateLimited { retry_after_secs } => AppError::RateLimited {
                retry_after_secs: *retry_after_secs,
            },
            AppError::Unauthorized(msg) => AppError::Unauthorized(msg.clone()),
            AppError::Forbidden(msg) => AppError::Forbidden(msg.clone()),
            AppError::MalformedInput(msg) => AppError::MalformedInput(msg.clone()),
            AppError::ValidationFailed { field, reason } => AppError::ValidationFailed {
                field: field.clone(),
                reason: reason.clone(),
            },
            AppError::StorageUnavailable(msg) => AppError::StorageUnavailable(msg.clone()),
            AppError::NotFound(msg) => AppError::NotFound(msg.clone()),
            AppError::InternalError(msg) => AppError::InternalError(msg.clone()),
            AppError::WithContext { source, context } => AppError::WithContext {
                source: source.clone(),
                context: context.clone(),
            },
        }
    }
}

impl From<sqlx::Error> for AppError {
    /// Constraint violations are the caller's fault; everything else is the store's.
    fn from(err: sqlx::Error) -> Self {
        if is_constraint_violation(&err) {
            let constraint = err
                .as_database_error()
                .and_then(|db_err| db_err.constraint())
                .unwrap_or("lead")
                .to_string();
            return AppError::validation(constraint, "rejected by storage constraint");
        }
        AppError::StorageUnavailable(err.to_string())
    }
}

/// True for errors caused by the row itself rather than the database's health.
pub fn is_constraint_violation(err: &sqlx::Error) -> bool {
    use sqlx::error::ErrorKind;
    err.as_database_error().is_some_and(|db_err| {
        matches!(
            db_err.kind(),
            ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation
        )
    })
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }
}
