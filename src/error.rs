//! Error taxonomy for the indexing, routing, and chat pipeline.
//!
//! Domain failures are typed so callers (the HTTP layer, the chat turn
//! boundary, the batch indexer) can react to each one differently. Provider
//! and I/O failures are carried through unchanged.

use thiserror::Error;

/// Convenience alias used by the core modules.
pub type Result<T> = std::result::Result<T, DocGraphError>;

#[derive(Debug, Error)]
pub enum DocGraphError {
    /// The uploaded file could not be turned into text.
    #[error("unreadable document {filename}: {reason}")]
    UnreadableDocument { filename: String, reason: String },

    /// Extraction succeeded but produced no chunkable text.
    #[error("document {0} produced no chunks")]
    EmptyDocument(String),

    #[error("invalid chunking: chunk_size={chunk_size}, overlap={overlap} (need 0 <= overlap < chunk_size)")]
    InvalidChunking { chunk_size: usize, overlap: usize },

    /// A composite router was requested over zero indices.
    #[error("cannot build a collection from an empty set of indices")]
    EmptyBuild,

    #[error("summary for {summary_id} does not belong to index {index_id}")]
    MissingSummary { index_id: String, summary_id: String },

    /// A named index or collection does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    NameCollision { kind: &'static str, name: String },

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// The agent exceeded its iteration or time budget for one turn.
    #[error("reasoning stopped after {iterations} iteration(s): {reason}")]
    ReasoningTimeout { iterations: usize, reason: String },

    #[error("no collection is active; index documents and select a collection first")]
    NoActiveAgent,

    #[error("no uploaded documents to index")]
    NoDocuments,

    #[error("temperature must be within [0.0, 2.0], got {0}")]
    InvalidTemperature(f32),

    /// The reasoning queue stayed full for longer than the queue timeout.
    #[error("too many concurrent chat turns; try again shortly")]
    Busy,

    #[error("provider error: {0}")]
    Provider(#[source] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DocGraphError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        DocGraphError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DocGraphError::UnreadableDocument { .. } => "unreadable_document",
            DocGraphError::EmptyDocument(_) => "empty_document",
            DocGraphError::InvalidChunking { .. } => "bad_request",
            DocGraphError::EmptyBuild => "empty_build",
            DocGraphError::MissingSummary { .. } => "bad_request",
            DocGraphError::NotFound { .. } => "not_found",
            DocGraphError::NameCollision { .. } => "conflict",
            DocGraphError::InvalidName(_) => "bad_request",
            DocGraphError::ReasoningTimeout { .. } => "timeout",
            DocGraphError::NoActiveAgent => "no_active_agent",
            DocGraphError::NoDocuments => "no_documents",
            DocGraphError::InvalidTemperature(_) => "bad_request",
            DocGraphError::Busy => "busy",
            DocGraphError::Provider(_) => "provider_error",
            DocGraphError::Io(_) | DocGraphError::Serde(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for DocGraphError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<DocGraphError>() {
            Ok(inner) => inner,
            Err(other) => DocGraphError::Provider(other),
        }
    }
}
