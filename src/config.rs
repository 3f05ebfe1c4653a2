//! TOML configuration parsing and validation.
//!
//! Every section has defaults, so an empty file (or [`Config::minimal`])
//! yields a fully offline setup: the `hash` embedder, the `extractive`
//! chat model, and storage under `./data`.
//!
//! ```toml
//! [storage]
//! indices_dir = "./data/indices"
//! collections_dir = "./data/collections"
//! uploads_dir = "./data/uploads"
//! overwrite = "replace"
//!
//! [chunking]
//! chunk_size = 1000
//! overlap = 40
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [agent]
//! temperature = 0.1
//! max_iterations = 6
//! max_concurrent_turns = 1
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::store::OverwritePolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_indices_dir")]
    pub indices_dir: PathBuf,
    #[serde(default = "default_collections_dir")]
    pub collections_dir: PathBuf,
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default)]
    pub overwrite: OverwritePolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            indices_dir: default_indices_dir(),
            collections_dir: default_collections_dir(),
            uploads_dir: default_uploads_dir(),
            overwrite: OverwritePolicy::default(),
        }
    }
}

fn default_indices_dir() -> PathBuf {
    PathBuf::from("./data/indices")
}
fn default_collections_dir() -> PathBuf {
    PathBuf::from("./data/collections")
}
fn default_uploads_dir() -> PathBuf {
    PathBuf::from("./data/uploads")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Window size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters shared by consecutive windows.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    40
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama, OpenAI-compatible gateways).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "extractive".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Model calls allowed per turn before giving up.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Wall-clock budget for one turn.
    #[serde(default = "default_turn_timeout_secs")]
    pub timeout_secs: u64,
    /// Reasoning loops allowed to run at once, process-wide.
    #[serde(default = "default_max_concurrent_turns")]
    pub max_concurrent_turns: usize,
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
    /// Past turns replayed to the model as memory.
    #[serde(default = "default_memory_window")]
    pub memory_window: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_iterations: default_max_iterations(),
            timeout_secs: default_turn_timeout_secs(),
            max_concurrent_turns: default_max_concurrent_turns(),
            queue_timeout_secs: default_queue_timeout_secs(),
            memory_window: default_memory_window(),
        }
    }
}

fn default_temperature() -> f32 {
    0.1
}
fn default_max_iterations() -> usize {
    6
}
fn default_turn_timeout_secs() -> u64 {
    120
}
fn default_max_concurrent_turns() -> usize {
    1
}
fn default_queue_timeout_secs() -> u64 {
    30
}
fn default_memory_window() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    /// `embedding` or `keyword`.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_max_children")]
    pub max_children: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// Chunks retrieved per index query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_children: default_max_children(),
            min_score: default_min_score(),
            top_k: default_top_k(),
        }
    }
}

fn default_strategy() -> String {
    "embedding".to_string()
}
fn default_max_children() -> usize {
    2
}
fn default_min_score() -> f32 {
    0.2
}
fn default_top_k() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

/// Starter file written by `docgraph init`.
pub const EXAMPLE_CONFIG: &str = r#"# docgraph configuration

[storage]
indices_dir = "./data/indices"
collections_dir = "./data/collections"
uploads_dir = "./data/uploads"
overwrite = "replace"           # or "reject"

[chunking]
chunk_size = 1000
overlap = 40

[embedding]
provider = "hash"               # hash | openai | ollama
# model = "text-embedding-3-small"
# dims = 1536

[llm]
provider = "extractive"         # extractive | openai
# model = "gpt-4o-mini"

[agent]
temperature = 0.1
max_iterations = 6
timeout_secs = 120
max_concurrent_turns = 1
queue_timeout_secs = 30
memory_window = 10

[routing]
strategy = "embedding"          # embedding | keyword
max_children = 2
min_score = 0.2
top_k = 3

[server]
bind = "127.0.0.1:8000"
"#;

impl Config {
    /// Offline defaults rooted at `./data`.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Offline defaults with every storage directory under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Self::default();
        config.storage.indices_dir = root.join("indices");
        config.storage.collections_dir = root.join("collections");
        config.storage.uploads_dir = root.join("uploads");
        config
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.overlap must be < chunking.chunk_size");
    }

    match config.embedding.provider.as_str() {
        "hash" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.llm.provider.as_str() {
        "extractive" => {}
        "openai" => {
            if config.llm.model.is_none() {
                anyhow::bail!("llm.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be extractive or openai.",
            other
        ),
    }

    if !(0.0..=2.0).contains(&config.agent.temperature) {
        anyhow::bail!("agent.temperature must be in [0.0, 2.0]");
    }
    if config.agent.max_iterations == 0 {
        anyhow::bail!("agent.max_iterations must be >= 1");
    }
    if config.agent.max_concurrent_turns == 0 {
        anyhow::bail!("agent.max_concurrent_turns must be >= 1");
    }

    match config.routing.strategy.as_str() {
        "embedding" | "keyword" => {}
        other => anyhow::bail!(
            "Unknown routing strategy: '{}'. Must be embedding or keyword.",
            other
        ),
    }
    if config.routing.max_children == 0 || config.routing.top_k == 0 {
        anyhow::bail!("routing.max_children and routing.top_k must be >= 1");
    }

    Ok(())
}
