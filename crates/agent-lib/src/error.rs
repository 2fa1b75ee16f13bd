//! Error types for the agent's library seams

use thiserror::Error;

/// Failures of the container runtime capability set
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to list containers: {0}")]
    List(String),

    #[error("failed to decode stats sample: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("event stream failed: {0}")]
    Events(String),

    #[error("failed to query host information: {0}")]
    Info(String),

    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
}

/// Reasons a log line could not be turned into structured data directly.
///
/// These never reach callers of the normalizer; they select which fallback
/// is used and are logged as diagnostics.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid extraction pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("line does not match extraction pattern {pattern:?}")]
    PatternMismatch { pattern: String },

    #[error("line is not a JSON object, using it as message")]
    NotJson,

    #[error("failed to encode extracted fields: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures of the collector transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("invalid connection request: {0}")]
    InvalidRequest(String),

    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("failed to send batch: {0}")]
    Send(String),

    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures of the geo lookup collaborator
#[derive(Debug, Error)]
pub enum GeoError {
    #[error("no geo database loaded")]
    NotLoaded,

    #[error("invalid ip address {0:?}")]
    InvalidIp(String),

    #[error("geo lookup failed: {0}")]
    Lookup(String),

    #[error("field {0} not found in log record")]
    FieldMissing(String),

    #[error("log record is not a JSON object")]
    InvalidRecord,

    #[error("failed to open geo database {path}: {reason}")]
    Open { path: String, reason: String },
}
