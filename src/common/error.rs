//! Error types for distsync

use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Lookup Errors ===
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    // === Placement Errors ===
    #[error("Insufficient replicas for chunk {chunk}: need {needed}, have {available}")]
    InsufficientReplicas {
        chunk: u64,
        needed: usize,
        available: usize,
    },

    // === Replica Errors (per attempt) ===
    #[error("Write to {node} failed: {reason}")]
    ReplicaWrite { node: String, reason: String },

    #[error("Read from {node} failed: {reason}")]
    ReplicaRead { node: String, reason: String },

    #[error("Chunk not present on {node}")]
    ChunkMissing { node: String },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("All replicas exhausted for chunk {chunk}")]
    ReplicaExhausted { chunk: u64 },

    // === Storage Node Errors ===
    #[error("Capacity exceeded: need {needed} bytes, {available} available")]
    CapacityExceeded { needed: u64, available: u64 },

    // === Metadata Errors ===
    #[error("Metadata persistence failed: {0}")]
    MetadataPersistence(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON body returned by both HTTP APIs on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<usize>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            chunk: None,
            needed: None,
            available: None,
        }
    }
}

impl From<&Error> for ErrorBody {
    fn from(e: &Error) -> Self {
        let mut body = ErrorBody::new(e.kind(), e.to_string());
        match *e {
            Error::InsufficientReplicas {
                chunk,
                needed,
                available,
            } => {
                body.chunk = Some(chunk);
                body.needed = Some(needed);
                body.available = Some(available);
            }
            Error::ReplicaExhausted { chunk } => body.chunk = Some(chunk),
            _ => {}
        }
        body
    }
}

impl Error {
    /// Stable outcome name surfaced to clients.
    ///
    /// Per-attempt replica failures never reach a client directly; if one
    /// leaks out anyway it is reported as `internal`.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::InvalidFilename(_) => "invalid_filename",
            Error::InsufficientReplicas { .. } => "insufficient_replicas",
            Error::ReplicaExhausted { .. } => "replica_exhausted",
            Error::Timeout(_) => "timeout",
            Error::MetadataPersistence(_) => "metadata_persistence",
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::ChunkMissing { .. } => "chunk_missing",
            Error::InvalidConfig(_) => "invalid_config",
            _ => "internal",
        }
    }

    /// Rebuild an error from a remote [`ErrorBody`].
    pub fn from_body(body: ErrorBody) -> Self {
        match body.error.as_str() {
            "not_found" => Error::NotFound(body.message),
            "invalid_filename" => Error::InvalidFilename(body.message),
            "timeout" => Error::Timeout(body.message),
            "metadata_persistence" => Error::MetadataPersistence(body.message),
            "invalid_config" => Error::InvalidConfig(body.message),
            "insufficient_replicas" => Error::InsufficientReplicas {
                chunk: body.chunk.unwrap_or(0),
                needed: body.needed.unwrap_or(0),
                available: body.available.unwrap_or(0),
            },
            "replica_exhausted" => Error::ReplicaExhausted {
                chunk: body.chunk.unwrap_or(0),
            },
            _ => Error::Http(format!("{}: {}", body.error, body.message)),
        }
    }

    /// Is this a single replica's failure that the caller recovers from
    /// by moving on to another candidate?
    pub fn is_replica_failure(&self) -> bool {
        matches!(
            self,
            Error::ReplicaWrite { .. }
                | Error::ReplicaRead { .. }
                | Error::ChunkMissing { .. }
                | Error::ChecksumMismatch { .. }
                | Error::CapacityExceeded { .. }
        )
    }

    /// Does a successful copy elsewhere warrant rewriting this replica?
    pub fn needs_repair(&self) -> bool {
        matches!(
            self,
            Error::ChunkMissing { .. } | Error::ChecksumMismatch { .. }
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) | Error::ChunkMissing { .. } => StatusCode::NOT_FOUND,
            Error::InvalidFilename(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::InsufficientReplicas { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::ReplicaExhausted { .. } => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::CapacityExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        }
        let body = ErrorBody::from(&self);
        (status, axum::Json(body)).into_response()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", e))
    }
}
