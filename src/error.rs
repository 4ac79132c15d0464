//! Error taxonomy shared by every subsystem.
//!
//! Each variant maps to a stable `kind()` string, a retryability class, and a
//! JSON-RPC error code for the protocol layer. Secrets never appear in
//! `Display` output; callers log causes via `tracing` instead of returning
//! them to clients.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("file read failed: {path}: {reason}")]
    FileRead { path: String, reason: String },

    #[error("metadata extraction failed: {0}")]
    MetadataExtraction(String),

    #[error("embedding generation failed: {0}")]
    EmbeddingGeneration(String),

    #[error("vector upload failed: {0}")]
    VectorUpload(String),

    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("validation: {0}")]
    Validation(String),

    #[error("authentication: {0}")]
    Authentication(String),

    #[error("search cluster connection failed: {0}")]
    SearchConnection(String),

    #[error("search mapping error: {0}")]
    SearchMapping(String),

    #[error("search indexing error: {0}")]
    SearchIndexing(String),

    #[error("bulk indexing error: {failed} of {total} documents failed")]
    SearchBulkIndex { failed: usize, total: usize, reasons: Vec<String> },

    #[error("search query failed: {0}")]
    SearchQuery(String),

    #[error("search unavailable: {0}")]
    SearchUnavailable(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("canceled")]
    Canceled,

    #[error("no source config matches '{0}'")]
    ConfigMissing(String),

    #[error("partial write for document '{id}': {detail}")]
    PartialWrite { id: String, detail: String },

    #[error("tool '{0}' already exists")]
    AlreadyExists(String),

    #[error("tool '{0}' not found")]
    NotFound(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("unknown: {0}")]
    Unknown(String),
}

impl Error {
    /// Stable machine-readable kind, used in structured logs and progress
    /// event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::FileRead { .. } => "file_read",
            Error::MetadataExtraction(_) => "metadata_extraction",
            Error::EmbeddingGeneration(_) => "embedding_generation",
            Error::VectorUpload(_) => "vector_upload",
            Error::NetworkTimeout(_) => "network_timeout",
            Error::RateLimited { .. } => "rate_limited",
            Error::Validation(_) => "validation",
            Error::Authentication(_) => "authentication",
            Error::SearchConnection(_) => "search_connection",
            Error::SearchMapping(_) => "search_mapping",
            Error::SearchIndexing(_) => "search_indexing",
            Error::SearchBulkIndex { .. } => "search_bulk_index",
            Error::SearchQuery(_) => "search_query",
            Error::SearchUnavailable(_) => "search_unavailable",
            Error::Timeout(_) => "timeout",
            Error::Canceled => "canceled",
            Error::ConfigMissing(_) => "config_missing",
            Error::PartialWrite { .. } => "partial_write",
            Error::AlreadyExists(_) => "already_exists",
            Error::NotFound(_) => "not_found",
            Error::Internal(_) => "internal",
            Error::Unknown(_) => "unknown",
        }
    }

    /// Whether the operation may be retried. Rate limiting carries its own
    /// server-provided delay, exposed via [`Error::retry_after`].
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::NetworkTimeout(_)
                | Error::Timeout(_)
                | Error::RateLimited { .. }
                | Error::SearchConnection(_)
                | Error::EmbeddingGeneration(_)
                | Error::VectorUpload(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// JSON-RPC 2.0 error code for the protocol layer.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Error::Validation(_) => -32602,
            Error::NotFound(_) => -32601,
            _ => -32603,
        }
    }

    /// Classify an HTTP status from an outbound call (cluster or embedder).
    /// 4xx is terminal except 408 and 429; 5xx is retryable.
    pub fn from_status(status: u16, context: &str, retry_after: Option<Duration>) -> Error {
        match status {
            408 => Error::NetworkTimeout(context.to_string()),
            429 => Error::RateLimited { retry_after },
            s if s >= 500 => Error::SearchConnection(format!("{context}: HTTP {s}")),
            s if s >= 400 => Error::SearchQuery(format!("{context}: HTTP {s}")),
            s => Error::Unknown(format!("{context}: HTTP {s}")),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::NetworkTimeout(e.to_string())
        } else if e.is_connect() {
            // DNS / connection refused: terminal, not worth retrying
            Error::SearchConnection(e.to_string())
        } else {
            Error::Unknown(e.to_string())
        }
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Internal(format!("hash store: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(Error::from_status(408, "x", None).kind(), "network_timeout");
        assert_eq!(Error::from_status(429, "x", None).kind(), "rate_limited");
        assert_eq!(Error::from_status(503, "x", None).kind(), "search_connection");
        assert_eq!(Error::from_status(400, "x", None).kind(), "search_query");
        assert!(Error::from_status(503, "x", None).retryable());
        assert!(!Error::from_status(400, "x", None).retryable());
    }

    #[test]
    fn rate_limited_carries_delay() {
        let e = Error::from_status(429, "x", Some(Duration::from_secs(7)));
        assert_eq!(e.retry_after(), Some(Duration::from_secs(7)));
        assert!(e.retryable());
    }

    #[test]
    fn jsonrpc_codes() {
        assert_eq!(Error::Validation("bad".into()).jsonrpc_code(), -32602);
        assert_eq!(Error::NotFound("t".into()).jsonrpc_code(), -32601);
        assert_eq!(Error::Internal("x".into()).jsonrpc_code(), -32603);
    }
}
