use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// A download was requested while another one holds the download token.
    #[error("A download is already in progress: {0}")]
    AlreadyInProgress(String),

    /// The remote API or the local store does not know the resource.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport failure while talking to the content API.
    #[error("Network error: {0}")]
    Network(String),

    /// Underlying persistence failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Status update for a queue row that does not exist.
    #[error("Queue item not found: {0}")]
    QueueItemMissing(i64),

    /// The download was cancelled before it finished.
    #[error("Download cancelled: {0}")]
    Cancelled(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::AlreadyInProgress(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) | AppError::QueueItemMissing(_) => StatusCode::NOT_FOUND,
            AppError::Network(_) => StatusCode::BAD_GATEWAY,
            AppError::Cancelled(_) => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!(error = %self, "Request error");

        (status, self.to_string()).into_response()
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;
