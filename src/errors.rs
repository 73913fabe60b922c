//! HTTP-facing error replies.

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt;

use crate::store::StoreError;

/// A handler error rendered as a plain-text reply.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Map a store failure onto its response status: absent objects are 404,
    /// everything else is a 500.
    pub fn from_store(err: &StoreError) -> Self {
        if err.is_not_found() {
            Self::new(StatusCode::NOT_FOUND, err.to_string())
        } else {
            Self::internal(err.to_string())
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Body::from(self.message)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_statuses() {
        let err = AppError::from_store(&StoreError::NotFound);
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = AppError::from_store(&StoreError::Io("boom".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "disk i/o: boom");
    }
}
