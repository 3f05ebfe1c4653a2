//! Per-document retrieval index and the document indexer.
//!
//! A [`VectorIndex`] holds one document's chunks and their embeddings.
//! Queries embed the question, rank chunks by cosine similarity, and hand the
//! best passages to the [`ChatModel`] for synthesis.
//!
//! [`DocumentIndexer`] turns a [`SourceDocument`] into an index plus an
//! [`IndexSummary`], produced by asking the fresh index [`SUMMARY_PROMPT`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::chunk::chunk_text;
use crate::embedding::{cosine_similarity, embed_batched, embed_one, Embedder};
use crate::error::{DocGraphError, Result};
use crate::llm::ChatModel;
use crate::models::{Chunk, IndexSummary, QueryResponse, SourceChunk, SourceDocument};

/// Fixed prompt issued against every new index to obtain its summary.
pub const SUMMARY_PROMPT: &str =
    "Summarize this document: what is it about, and which topics, names, and terms does it cover?";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub embedding_model: String,
    pub dims: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub created_at: String,
}

/// Embedding-backed index over one document's chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndex {
    pub document_id: String,
    pub source_filename: String,
    pub chunks: Vec<Chunk>,
    pub embeddings: Vec<Vec<f32>>,
    pub metadata: IndexMetadata,
}

/// Knobs shared by every query against an index.
#[derive(Clone, Copy, Debug)]
pub struct QueryOptions {
    pub top_k: usize,
    pub temperature: f32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: 3,
            temperature: 0.0,
        }
    }
}

impl VectorIndex {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Rank chunks against a pre-computed query vector, best first.
    pub fn retrieve(&self, query_vec: &[f32], top_k: usize) -> Vec<SourceChunk> {
        let mut scored: Vec<SourceChunk> = self
            .chunks
            .iter()
            .zip(self.embeddings.iter())
            .map(|(chunk, vector)| SourceChunk {
                document_id: self.document_id.clone(),
                chunk_index: chunk.chunk_index,
                score: cosine_similarity(query_vec, vector),
                text: chunk.text.clone(),
            })
            .collect();
        // Ties keep document order.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_index.cmp(&b.chunk_index))
        });
        scored.truncate(top_k);
        scored
    }

    /// Answer a question from this index.
    pub async fn query(
        &self,
        question: &str,
        embedder: &dyn Embedder,
        model: &dyn ChatModel,
        options: QueryOptions,
    ) -> Result<QueryResponse> {
        let query_vec = embed_one(embedder, question).await?;
        let sources = self.retrieve(&query_vec, options.top_k);
        let passages: Vec<String> = sources.iter().map(|s| s.text.clone()).collect();
        let answer = model
            .synthesize(question, &passages, options.temperature)
            .await?;
        Ok(QueryResponse { answer, sources })
    }
}

/// Builds indices and summaries from documents.
#[derive(Clone)]
pub struct DocumentIndexer {
    embedder: Arc<dyn Embedder>,
    model: Arc<dyn ChatModel>,
    batch_size: usize,
    summary_options: QueryOptions,
}

impl DocumentIndexer {
    pub fn new(embedder: Arc<dyn Embedder>, model: Arc<dyn ChatModel>) -> Self {
        Self {
            embedder,
            model,
            batch_size: 64,
            summary_options: QueryOptions::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_summary_options(mut self, options: QueryOptions) -> Self {
        self.summary_options = options;
        self
    }

    /// Chunk and embed a document.
    pub async fn build_index(
        &self,
        document: &SourceDocument,
        chunk_size: usize,
        overlap: usize,
    ) -> Result<VectorIndex> {
        let chunks = chunk_text(&document.id, &document.text, chunk_size, overlap)?;
        if chunks.is_empty() {
            return Err(DocGraphError::EmptyDocument(document.filename.clone()));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = embed_batched(self.embedder.as_ref(), &texts, self.batch_size).await?;

        tracing::debug!(
            document = %document.id,
            chunks = chunks.len(),
            "built vector index"
        );

        Ok(VectorIndex {
            document_id: document.id.clone(),
            source_filename: document.filename.clone(),
            chunks,
            embeddings,
            metadata: IndexMetadata {
                embedding_model: self.embedder.model_name().to_string(),
                dims: self.embedder.dims(),
                chunk_size,
                chunk_overlap: overlap,
                created_at: Utc::now().to_rfc3339(),
            },
        })
    }

    /// Ask the index [`SUMMARY_PROMPT`].
    pub async fn summarize(&self, index: &VectorIndex) -> Result<IndexSummary> {
        let response = index
            .query(
                SUMMARY_PROMPT,
                self.embedder.as_ref(),
                self.model.as_ref(),
                self.summary_options,
            )
            .await?;
        Ok(IndexSummary {
            index_id: index.document_id.clone(),
            text: response.answer,
        })
    }

    /// Build the index and its summary.
    pub async fn index_document(
        &self,
        document: &SourceDocument,
        chunk_size: usize,
        overlap: usize,
    ) -> Result<(VectorIndex, IndexSummary)> {
        let index = self.build_index(document, chunk_size, overlap).await?;
        let summary = self.summarize(&index).await?;
        Ok((index, summary))
    }
}
