//! Error types for the job recommender
//!
//! Each layer owns a `thiserror` enum. `AppError` is the HTTP-facing error
//! and converts to a JSON response for API clients.

use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::Serialize;
use thiserror::Error;

/// Result type for HTTP handlers
pub type Result<T> = std::result::Result<T, AppError>;

/// Similarity index and position map errors
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("position recorded out of order: expected {expected}, got {actual}")]
    PositionOutOfOrder { expected: usize, actual: usize },

    #[error("index payload is corrupt: {0}")]
    Corrupt(String),

    #[error("index serialization failed: {0}")]
    Encode(String),
}

/// Durable store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("index {name} was rewritten elsewhere: expected generation {expected}, found {found:?}")]
    GenerationConflict {
        name: String,
        expected: i64,
        found: Option<i64>,
    },
}

/// Embedding source errors
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding server returned {actual} vectors for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },

    #[error("cannot embed empty text")]
    EmptyInput,
}

impl EmbeddingError {
    /// Worth another attempt against the same server
    pub fn is_transient(&self) -> bool {
        match self {
            EmbeddingError::Http(_) => true,
            EmbeddingError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    /// The input itself is rejected; retrying it can never succeed
    pub fn is_permanent(&self) -> bool {
        match self {
            EmbeddingError::EmptyInput => true,
            EmbeddingError::Status { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            _ => false,
        }
    }
}

/// Inbound event decoding errors
#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Malformed(err.to_string())
    }
}

/// Message transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("subscription failed: {0}")]
    Subscribe(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    #[error("transport is not connected")]
    NotConnected,
}

/// Failure while handling a decoded event or running a batch pass
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl ServiceError {
    /// Handling the same event again would fail the same way
    pub fn is_permanent(&self) -> bool {
        matches!(self, ServiceError::Embedding(e) if e.is_permanent())
    }
}

/// HTTP-facing application errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
    message: String,
    status: u16,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let error = match self {
            AppError::BadRequest(_) => "validation_error",
            AppError::Unavailable(_) => "unavailable_error",
            AppError::Internal(_) => "server_error",
        };

        HttpResponse::build(status).json(ErrorResponse {
            error,
            message: self.to_string(),
            status: status.as_u16(),
        })
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Internal(err.to_string())
    }
}
