use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PulseError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Permission(String),

    #[error("Too many requests, retry in {0}s")]
    RateLimited(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<duckdb::Error> for PulseError {
    fn from(err: duckdb::Error) -> Self {
        PulseError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for PulseError {
    fn from(err: serde_json::Error) -> Self {
        PulseError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for PulseError {
    fn from(err: reqwest::Error) -> Self {
        PulseError::Http(err.to_string())
    }
}

impl From<std::io::Error> for PulseError {
    fn from(err: std::io::Error) -> Self {
        PulseError::Io(err.to_string())
    }
}

impl PulseError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PulseError::Validation(_) | PulseError::Serialization(_) => StatusCode::BAD_REQUEST,
            PulseError::Permission(_) => StatusCode::FORBIDDEN,
            PulseError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            PulseError::NotFound(_) => StatusCode::NOT_FOUND,
            PulseError::LockTimeout(_) => StatusCode::CONFLICT,
            PulseError::Database(_)
            | PulseError::Stream(_)
            | PulseError::Config(_)
            | PulseError::Http(_)
            | PulseError::Io(_)
            | PulseError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PulseError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, PulseError>;
