//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`HashEmbedder`]**: deterministic feature-hashing bag of words; offline, no model.
//! - **[`OpenAIEmbedder`]**: calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Use [`create_embedder`] to pick one from configuration:
//!
//! ```rust
//! # use docgraph::config::EmbeddingConfig;
//! # use docgraph::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "hash"
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.model_name(), "hash");
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::http::{client_with_timeout, post_json_with_retry};

/// Text-in, vector-out oracle.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text.
pub async fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

/// Embed many texts in batches of `batch_size`.
pub async fn embed_batched(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = embedder.embed(batch).await?;
        if vectors.len() != batch.len() {
            bail!(
                "embedding provider returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            );
        }
        out.extend(vectors);
    }
    Ok(out)
}

// ============ Hash Embedder ============

/// Deterministic bag-of-words embedder.
///
/// Each lowercase alphanumeric token is hashed (SHA-256) into one of `dims`
/// buckets with a sign bit, then the vector is L2-normalized. Texts sharing
/// vocabulary get high cosine similarity, which is enough for offline use
/// and reproducible tests.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        normalize(&mut v);
        v
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Lowercase alphanumeric tokens of at least two characters.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// ============ OpenAI Embedder ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST {url}/v1/embeddings` (default `https://api.openai.com`).
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        Ok(Self {
            model,
            dims: config.dims.unwrap_or(1536),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            max_retries: config.max_retries,
            client: client_with_timeout(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/v1/embeddings", self.url.trim_end_matches('/'));
        let json = post_json_with_retry(
            &self.client,
            &url,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_f32_vec(embedding)));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Embedder ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST {url}/api/embed` (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        Ok(Self {
            model,
            dims: config.dims.unwrap_or(768),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_retries: config.max_retries,
            client: client_with_timeout(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let json =
            post_json_with_retry(&self.client, &url, None, &body, self.max_retries, "Ollama")
                .await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|e| {
            e.as_array()
                .map(|arr| to_f32_vec(arr))
                .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

fn to_f32_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Create the configured [`Embedder`].
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims.unwrap_or(256)))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_and_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn hash_embedder_prefers_shared_vocabulary() {
        let e = HashEmbedder::new(512);
        let texts = vec![
            "rust cargo crates borrow checker".to_string(),
            "cargo crates and the borrow checker in rust".to_string(),
            "python pandas dataframe notebook".to_string(),
        ];
        let v = e.embed(&texts).await.unwrap();
        assert_eq!(v.len(), 3);
        assert!(v.iter().all(|x| x.len() == 512));
        assert!(cosine_similarity(&v[0], &v[1]) > cosine_similarity(&v[0], &v[2]));
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let e = HashEmbedder::default();
        let a = embed_one(&e, "same words here").await.unwrap();
        let b = embed_one(&e, "same words here").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn batched_embedding_preserves_order_and_count() {
        let e = HashEmbedder::new(64);
        let texts: Vec<String> = (0..10).map(|i| format!("text number {}", i)).collect();
        let batched = embed_batched(&e, &texts, 3).await.unwrap();
        let direct = e.embed(&texts).await.unwrap();
        assert_eq!(batched, direct);
    }

    #[test]
    fn parses_openai_response_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.5, 0.5] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn parses_ollama_response() {
        let json = serde_json::json!({ "embeddings": [[0.1, 0.2], [0.3, 0.4]] });
        let v = parse_ollama_response(&json).unwrap();
        assert_eq!(v.len(), 2);
        assert!(parse_ollama_response(&serde_json::json!({})).is_err());
    }
}
