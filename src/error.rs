//! Error types for the document store.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("collection {0} is not in the database")]
    CollectionNotFound(String),

    #[error("view {0} is not in the collection")]
    ViewNotFound(String),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(String),

    #[error("Some views not found: {}", .0.join(","))]
    ViewsNotFound(Vec<String>),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Pipeline function not registered: {0}")]
    PipelineNotRegistered(String),

    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("View already exists: {0}")]
    ViewExists(String),

    #[error("You must supply a ticket for each view ({0})")]
    TicketRequired(String),

    #[error("Invalid ticket(s): {}", .0.join(","))]
    InvalidTicket(Vec<String>),

    #[error("Pipeline failure: {0}")]
    Pipeline(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid blob format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Data directory is locked by another process")]
    Locked,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl DbError {
    /// HTTP-style status classification used by the API layer.
    pub fn status(&self) -> u16 {
        match self {
            DbError::CollectionNotFound(_)
            | DbError::ViewNotFound(_)
            | DbError::SubscriptionNotFound(_)
            | DbError::ViewsNotFound(_)
            | DbError::BlobNotFound(_) => 404,
            DbError::TicketRequired(_) | DbError::InvalidTicket(_) => 403,
            DbError::CollectionExists(_) | DbError::ViewExists(_) => 409,
            DbError::InvalidOperation(_) | DbError::PipelineNotRegistered(_) => 400,
            _ => 500,
        }
    }

    /// True for the not-found family.
    pub fn is_not_found(&self) -> bool {
        self.status() == 404
    }

    /// Structured `{status, message}` body for API callers.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            status: self.status(),
            message: self.to_string(),
        }
    }
}

/// Failure body returned to API callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for DbError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DbError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        DbError::Deserialization(e.to_string())
    }
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(DbError::CollectionNotFound("c".into()).status(), 404);
        assert_eq!(DbError::ViewNotFound("v".into()).status(), 404);
        assert_eq!(DbError::InvalidTicket(vec!["v".into()]).status(), 403);
        assert_eq!(DbError::TicketRequired("v".into()).status(), 403);
        assert_eq!(DbError::Storage("disk".into()).status(), 500);
        assert_eq!(DbError::CollectionExists("c".into()).status(), 409);
    }

    #[test]
    fn test_response_body() {
        let resp = DbError::ViewsNotFound(vec!["a".into(), "b".into()]).to_response();
        assert_eq!(resp.status, 404);
        assert_eq!(resp.message, "Some views not found: a,b");

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["Status"], 404);
    }
}
