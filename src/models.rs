//! Core data models shared by the indexing and chat pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A document after text extraction, ready for chunking.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Filename stem; also the name the index is stored under.
    pub id: String,
    pub filename: String,
    pub path: Option<PathBuf>,
    pub text: String,
}

/// A bounded, possibly-overlapping segment of a document's text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// Character offset of the first char (inclusive).
    pub start: usize,
    /// Character offset one past the last char.
    pub end: usize,
    pub hash: String,
}

/// Short description of an index, used as routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexSummary {
    pub index_id: String,
    pub text: String,
}

/// A chunk that supported an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceChunk {
    pub document_id: String,
    pub chunk_index: i64,
    pub score: f32,
    pub text: String,
}

/// Answer synthesized from one or more indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceChunk>,
}

/// One visible exchange in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub user: String,
    pub response: String,
}
