use thiserror::Error;

// Import Axum types for HTTP response conversion
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// The custom error type for the application.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller-supplied data failed schema checks.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Identifier or informant already known to the pipeline.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// A not found error (resource does not exist).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A conflict error (resource already exists).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An authentication error (missing or invalid access token).
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Failure establishing the document store connection.
    #[error("Store connection error: {0}")]
    StoreConnect(String),

    /// Failure executing a document store operation.
    #[error("Store operation error: {0}")]
    Store(#[from] mongodb::error::Error),

    /// An error from the vector index or its embedding backend.
    #[error("Vector store error: {0}")]
    VectorDb(String),

    /// The vector service has not finished initializing.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// An AI provider error that survived the retry policy.
    #[error("AI provider error: {0}")]
    AiProvider(String),

    /// A scheduler setup error.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// An error originating from IO operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A BSON serialization error.
    #[error("BSON serialization error: {0}")]
    Bson(#[from] bson::ser::Error),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// An error from an embedded sqlite database (chunk index or
    /// conversation sidecar).
    #[error("Embedded database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// An internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A type alias for `Result<T, Error>` to simplify function signatures.
pub type Result<T> = std::result::Result<T, Error>;

/// Helper function to create standardized error response bodies
fn create_error_body(msg: String, code: &str) -> serde_json::Value {
    serde_json::json!({ "error": msg, "code": code })
}

/// Log error at appropriate level based on error type
/// Client-facing errors (4xx) are logged as warnings, server errors (5xx) as errors
fn log_error(error: &Error, error_code: &str, status_code: u16) {
    if status_code >= 500 {
        tracing::error!(
            error_code,
            error = %error,
            status_code,
            "Error returned to client"
        );
    } else {
        tracing::warn!(
            error_code,
            error = %error,
            status_code,
            "Error returned to client"
        );
    }
}

/// Convert custom Error to HTTP response
///
/// Maps each error variant to an appropriate HTTP status code and returns a
/// JSON response with an error message and error code.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        log_error(&self, self.error_code(), self.status_code().as_u16());

        let status = self.status_code();
        let body = match self {
            Error::Validation(msg) => create_error_body(msg, "VALIDATION_ERROR"),
            Error::Duplicate(msg) => create_error_body(msg, "DUPLICATE"),
            Error::NotFound(msg) => create_error_body(msg, "NOT_FOUND"),
            Error::Conflict(msg) => create_error_body(msg, "CONFLICT"),
            Error::Unauthorized(msg) => create_error_body(msg, "UNAUTHORIZED"),
            Error::ServiceUnavailable(msg) => {
                serde_json::json!({ "error": msg, "code": "SERVICE_UNAVAILABLE", "retry_after": 5 })
            }
            Error::StoreConnect(_) | Error::Store(_) => {
                create_error_body("Document store error".to_string(), "STORE_ERROR")
            }
            Error::VectorDb(msg) => create_error_body(msg, "VECTOR_DB_ERROR"),
            Error::AiProvider(msg) => create_error_body(msg, "AI_PROVIDER_ERROR"),
            Error::Scheduler(msg) => create_error_body(msg, "SCHEDULER_ERROR"),
            Error::Json(e) => {
                create_error_body(format!("Invalid JSON payload: {}", e), "VALIDATION_ERROR")
            }
            Error::Bson(_) => {
                create_error_body("Document encoding error".to_string(), "INTERNAL_ERROR")
            }
            Error::Io(_) => create_error_body("IO error".to_string(), "INTERNAL_ERROR"),
            Error::Config(_) => {
                create_error_body("Configuration error".to_string(), "CONFIG_ERROR")
            }
            Error::Sqlite(_) => create_error_body(
                "Embedded database error".to_string(),
                "INTERNAL_ERROR",
            ),
            Error::Internal(msg) => create_error_body(msg, "INTERNAL_ERROR"),
        };

        (status, Json(body)).into_response()
    }
}

impl Error {
    /// Helper method to get the HTTP status code for an error
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Duplicate(_) | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Helper method to get the error code for logging
    fn error_code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Duplicate(_) => "DUPLICATE",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::StoreConnect(_) | Error::Store(_) => "STORE_ERROR",
            Error::VectorDb(_) => "VECTOR_DB_ERROR",
            Error::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Error::AiProvider(_) => "AI_PROVIDER_ERROR",
            Error::Scheduler(_) => "SCHEDULER_ERROR",
            Error::Io(_) => "INTERNAL_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Bson(_) => "INTERNAL_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Sqlite(_) => "INTERNAL_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
