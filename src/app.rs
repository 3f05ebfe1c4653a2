//! Application state and the operations exposed to the CLI and HTTP server.
//!
//! [`AppContext`] is the one place that holds long-lived state:
//!
//! | State | Guard |
//! |-------|-------|
//! | pending uploads | `std::sync::Mutex` |
//! | active agent | `std::sync::RwLock<Option<Arc<ActiveAgent>>>`, replaced wholesale |
//! | executor of the active agent | `tokio::sync::Mutex`, one turn at a time |
//! | conversation sessions | `std::sync::Mutex`, owned by the active agent |
//! | concurrent reasoning loops | `tokio::sync::Semaphore` |
//!
//! Switching collections builds the new agent completely before swapping it
//! in, so readers see either the old agent or the new one. Sessions belong to
//! the agent and are discarded with it.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::agent::{AgentExecutor, AgentSettings, ToolInvocation};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{DocGraphError, Result};
use crate::extract::{document_id_for, load_document};
use crate::index::{DocumentIndexer, QueryOptions};
use crate::llm::{create_chat_model, ChatModel};
use crate::models::Turn;
use crate::progress::{IndexProgressEvent, IndexProgressReporter};
use crate::router::{build_router, create_ranker, Ranker, RoutingOptions, ToolEntry};
use crate::session::ConversationSession;
use crate::store::{validate_name, IndexStore, OverwritePolicy, RouterStore};

/// Shown when chatting before any collection is selected. Not recorded.
pub const NO_ACTIVE_AGENT_MESSAGE: &str =
    "There is no available document to chat with. Index documents and select a collection before chatting.";

/// Recorded as the response when a turn runs out of iterations or time.
pub const REASONING_FALLBACK_MESSAGE: &str =
    "Sorry, I could not work out an answer in time. Please try rephrasing or narrowing the question.";

/// Recorded as the response when a provider call fails mid-turn.
pub const PROVIDER_FALLBACK_MESSAGE: &str =
    "Sorry, something went wrong while answering. Please try again.";

/// A file handed to [`AppContext::upload`].
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Per-document line of a batch report.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentReport {
    pub filename: String,
    pub document_id: String,
    pub chunks: usize,
    pub error: Option<String>,
}

/// Outcome of [`AppContext::index_batch`].
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub collection: String,
    pub documents: Vec<DocumentReport>,
    pub collection_saved: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.documents.iter().filter(|d| d.error.is_none()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &DocumentReport> {
        self.documents.iter().filter(|d| d.error.is_some())
    }

    /// One-paragraph summary for people.
    pub fn status_text(&self) -> String {
        let total = self.documents.len();
        if self.collection_saved {
            return format!(
                "Done. Indexed {} of {} document(s) into collection '{}'.",
                self.succeeded(),
                total,
                self.collection
            );
        }
        let failures: Vec<String> = self
            .failed()
            .map(|d| format!("{}: {}", d.filename, d.error.as_deref().unwrap_or("unknown error")))
            .collect();
        format!(
            "Failed. Indexed {} of {} document(s); collection '{}' was not saved. {}",
            self.succeeded(),
            total,
            self.collection,
            failures.join("; ")
        )
    }
}

/// Returned by [`AppContext::select_collection`].
#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub collection: String,
    pub history: Vec<Turn>,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Answered,
    NoActiveAgent,
    ReasoningTimeout,
    ProviderError,
}

/// Returned by [`AppContext::chat`].
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub status: TurnStatus,
    pub answer: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub history: Vec<Turn>,
}

/// The agent bound to the selected collection, with its sessions.
pub struct ActiveAgent {
    collection: String,
    executor: tokio::sync::Mutex<AgentExecutor>,
    sessions: Mutex<HashMap<String, ConversationSession>>,
    tools: Vec<ToolEntry>,
}

impl ActiveAgent {
    fn new(collection: String, executor: AgentExecutor) -> Self {
        let tools = executor.tools().entries().to_vec();
        Self {
            collection,
            executor: tokio::sync::Mutex::new(executor),
            sessions: Mutex::new(HashMap::new()),
            tools,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConversationSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct AppContext {
    config: Config,
    index_store: IndexStore,
    router_store: RouterStore,
    embedder: Arc<dyn Embedder>,
    model: Arc<dyn ChatModel>,
    ranker: Arc<dyn Ranker>,
    pending_uploads: Mutex<Vec<PathBuf>>,
    active: RwLock<Option<Arc<ActiveAgent>>>,
    turn_slots: Arc<Semaphore>,
}

impl AppContext {
    /// Build providers from configuration.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let model = create_chat_model(&config.llm)?;
        Self::with_providers(config, embedder, model)
    }

    /// Use the given providers; the ranker still follows `routing.strategy`.
    pub fn with_providers(
        config: Config,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn ChatModel>,
    ) -> anyhow::Result<Self> {
        let ranker = create_ranker(&config.routing.strategy, embedder.clone())?;
        Ok(Self::with_ranker(config, embedder, model, ranker))
    }

    pub fn with_ranker(
        config: Config,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn ChatModel>,
        ranker: Arc<dyn Ranker>,
    ) -> Self {
        let policy = config.storage.overwrite;
        Self {
            index_store: IndexStore::new(&config.storage.indices_dir, "index", policy),
            router_store: RouterStore::new(&config.storage.collections_dir, "collection", policy),
            turn_slots: Arc::new(Semaphore::new(config.agent.max_concurrent_turns.max(1))),
            config,
            embedder,
            model,
            ranker,
            pending_uploads: Mutex::new(Vec::new()),
            active: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index_store(&self) -> &IndexStore {
        &self.index_store
    }

    pub fn router_store(&self) -> &RouterStore {
        &self.router_store
    }

    /// Create the storage directories.
    pub async fn init_storage(&self) -> Result<()> {
        self.index_store.init().await?;
        self.router_store.init().await?;
        tokio::fs::create_dir_all(&self.config.storage.uploads_dir).await?;
        Ok(())
    }

    // ============ Uploads ============

    /// Copy files into the uploads directory and make them the pending batch.
    ///
    /// Only the basename of each filename is kept.
    pub async fn upload(&self, files: Vec<UploadedFile>) -> Result<Vec<PathBuf>> {
        let dir = &self.config.storage.uploads_dir;
        tokio::fs::create_dir_all(dir).await?;

        let mut paths = Vec::with_capacity(files.len());
        for file in files {
            let basename = Path::new(&file.filename)
                .file_name()
                .and_then(|n| n.to_str())
                .filter(|n| !n.starts_with('.'))
                .ok_or_else(|| DocGraphError::InvalidName(file.filename.clone()))?;
            let destination = dir.join(basename);
            tokio::fs::write(&destination, &file.bytes).await?;
            if !paths.contains(&destination) {
                paths.push(destination);
            }
        }

        tracing::info!(files = paths.len(), "staged uploads");
        *self.pending_uploads.lock().unwrap_or_else(|e| e.into_inner()) = paths.clone();
        Ok(paths)
    }

    /// Read local files and stage them as an upload.
    pub async fn upload_paths(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(path).await?;
            files.push(UploadedFile {
                filename: path.to_string_lossy().into_owned(),
                bytes,
            });
        }
        self.upload(files).await
    }

    pub fn pending_uploads(&self) -> Vec<PathBuf> {
        self.pending_uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ============ Indexing ============

    /// Index every pending upload and compose them into `collection`.
    ///
    /// A failing document is reported and skipped; the others still get
    /// indexed and saved. The collection is written only when every document
    /// succeeded.
    pub async fn index_batch(
        &self,
        chunk_size: usize,
        overlap: usize,
        collection: &str,
        progress: &dyn IndexProgressReporter,
    ) -> Result<BatchReport> {
        validate_name(collection)?;
        if chunk_size == 0 || overlap >= chunk_size {
            return Err(DocGraphError::InvalidChunking {
                chunk_size,
                overlap,
            });
        }
        if self.router_store.policy() == OverwritePolicy::Reject
            && self.router_store.exists(collection).await?
        {
            return Err(DocGraphError::NameCollision {
                kind: "collection",
                name: collection.to_string(),
            });
        }

        let pending = self.pending_uploads();
        if pending.is_empty() {
            return Err(DocGraphError::NoDocuments);
        }

        let indexer = DocumentIndexer::new(self.embedder.clone(), self.model.clone())
            .with_batch_size(self.config.embedding.batch_size)
            .with_summary_options(QueryOptions {
                top_k: self.config.routing.top_k,
                temperature: 0.0,
            });

        tracing::info!(
            collection,
            documents = pending.len(),
            chunk_size,
            overlap,
            "indexing batch"
        );

        let ids = batch_document_ids(&pending);
        let total = pending.len();
        let mut members = Vec::with_capacity(total);
        let mut documents = Vec::with_capacity(total);
        for (i, path) in pending.iter().enumerate() {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            progress.report(IndexProgressEvent::Indexing {
                document: filename.clone(),
                n: i + 1,
                total,
            });

            let result = async {
                let mut document = load_document(path).await?;
                document.id = ids[i].clone();
                let (index, summary) = indexer
                    .index_document(&document, chunk_size, overlap)
                    .await?;
                self.index_store.save(&index, &document.id).await?;
                Ok::<_, DocGraphError>((index, summary))
            }
            .await;

            match result {
                Ok((index, summary)) => {
                    tracing::info!(document = %filename, chunks = index.len(), "indexed document");
                    progress.report(IndexProgressEvent::Indexed {
                        document: filename.clone(),
                        chunks: index.len(),
                    });
                    documents.push(DocumentReport {
                        filename,
                        document_id: index.document_id.clone(),
                        chunks: index.len(),
                        error: None,
                    });
                    members.push((index, summary));
                }
                Err(e) => {
                    tracing::warn!(document = %filename, error = %e, "failed to index document");
                    progress.report(IndexProgressEvent::Failed {
                        document: filename.clone(),
                        error: e.to_string(),
                    });
                    documents.push(DocumentReport {
                        document_id: ids[i].clone(),
                        filename,
                        chunks: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let mut report = BatchReport {
            collection: collection.to_string(),
            documents,
            collection_saved: false,
        };
        if report.failed().next().is_some() {
            tracing::warn!(collection, "batch had failures; collection not saved");
            return Ok(report);
        }

        progress.report(IndexProgressEvent::Composing {
            collection: collection.to_string(),
            children: members.len(),
        });
        let router = build_router(collection, members)?;
        self.router_store.save(&router, collection).await?;
        progress.report(IndexProgressEvent::Saved {
            collection: collection.to_string(),
        });
        tracing::info!(collection, children = router.len(), "saved collection");

        report.collection_saved = true;
        Ok(report)
    }

    // ============ Collections & Agent ============

    pub async fn list_collections(&self) -> Result<Vec<String>> {
        self.router_store.list_names().await
    }

    fn active_agent(&self) -> Option<Arc<ActiveAgent>> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn active_collection(&self) -> Option<String> {
        self.active_agent().map(|a| a.collection.clone())
    }

    /// Load `name` and make it the active agent, discarding all sessions.
    ///
    /// On any error the previous agent stays active.
    pub async fn select_collection(&self, name: &str) -> Result<Selection> {
        let router = self.router_store.load(name).await?;
        if router.is_empty() {
            return Err(DocGraphError::EmptyBuild);
        }
        let router = Arc::new(router);
        let settings = AgentSettings::from_config(&self.config.agent);
        let routing = RoutingOptions::from_config(&self.config.routing, settings.temperature);
        let executor = AgentExecutor::new(
            router,
            self.model.clone(),
            self.embedder.clone(),
            self.ranker.clone(),
            settings,
            routing,
        );
        let agent = Arc::new(ActiveAgent::new(name.to_string(), executor));
        tracing::info!(
            collection = name,
            tools = agent.tools.len(),
            temperature = settings.temperature,
            "activated collection"
        );

        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Some(agent);
        Ok(Selection {
            collection: name.to_string(),
            history: Vec::new(),
            temperature: settings.temperature,
        })
    }

    /// Activate the first saved collection, if there is one and no agent is
    /// active yet. Failures are logged and leave the context without an agent.
    pub async fn activate_first_collection(&self) -> Option<String> {
        if let Some(active) = self.active_collection() {
            return Some(active);
        }
        let first = match self.list_collections().await {
            Ok(names) => names.into_iter().next()?,
            Err(e) => {
                tracing::warn!(error = %e, "could not list collections");
                return None;
            }
        };
        match self.select_collection(&first).await {
            Ok(selection) => Some(selection.collection),
            Err(e) => {
                tracing::warn!(collection = %first, error = %e, "could not activate collection");
                None
            }
        }
    }

    /// Tools offered by the active agent.
    pub fn tools(&self) -> Result<Vec<ToolEntry>> {
        self.active_agent()
            .map(|a| a.tools.clone())
            .ok_or(DocGraphError::NoActiveAgent)
    }

    /// Takes effect from the next model call; waits for a running turn.
    pub async fn set_temperature(&self, value: f32) -> Result<f32> {
        if !(0.0..=2.0).contains(&value) {
            return Err(DocGraphError::InvalidTemperature(value));
        }
        let agent = self.active_agent().ok_or(DocGraphError::NoActiveAgent)?;
        agent.executor.lock().await.set_temperature(value)?;
        tracing::info!(temperature = value, "changed temperature");
        Ok(value)
    }

    pub async fn temperature(&self) -> Option<f32> {
        let agent = self.active_agent()?;
        let executor = agent.executor.lock().await;
        Some(executor.temperature())
    }

    // ============ Chat ============

    /// Run one turn in `session_id`.
    ///
    /// Only [`DocGraphError::Busy`] escapes; every other failure is rendered
    /// as a fallback answer.
    pub async fn chat(&self, session_id: &str, message: &str) -> Result<ChatReply> {
        let Some(agent) = self.active_agent() else {
            return Ok(ChatReply {
                status: TurnStatus::NoActiveAgent,
                answer: NO_ACTIVE_AGENT_MESSAGE.to_string(),
                tool_calls: Vec::new(),
                history: Vec::new(),
            });
        };

        let queue_timeout = Duration::from_secs(self.config.agent.queue_timeout_secs);
        let _permit = match tokio::time::timeout(queue_timeout, self.turn_slots.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(DocGraphError::Busy),
        };

        let executor = agent.executor.lock().await;
        let memory = {
            let mut sessions = agent.sessions();
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| ConversationSession::new(self.config.agent.memory_window))
                .memory()
                .clone()
        };

        let (status, answer, tool_calls) = match executor.run_turn(message, &memory).await {
            Ok(outcome) => (TurnStatus::Answered, outcome.answer, outcome.tool_calls),
            Err(e @ DocGraphError::ReasoningTimeout { .. }) => {
                tracing::warn!(session = session_id, error = %e, "reasoning gave up");
                (
                    TurnStatus::ReasoningTimeout,
                    REASONING_FALLBACK_MESSAGE.to_string(),
                    Vec::new(),
                )
            }
            Err(e) => {
                tracing::error!(session = session_id, error = %e, "chat turn failed");
                (
                    TurnStatus::ProviderError,
                    PROVIDER_FALLBACK_MESSAGE.to_string(),
                    Vec::new(),
                )
            }
        };
        drop(executor);

        let history = {
            let mut sessions = agent.sessions();
            let session = sessions
                .entry(session_id.to_string())
                .or_insert_with(|| ConversationSession::new(self.config.agent.memory_window));
            session.append(message, &answer);
            session.current_history().to_vec()
        };

        Ok(ChatReply {
            status,
            answer,
            tool_calls,
            history,
        })
    }

    pub fn history(&self, session_id: &str) -> Vec<Turn> {
        self.active_agent()
            .and_then(|agent| {
                agent
                    .sessions()
                    .get(session_id)
                    .map(|s| s.current_history().to_vec())
            })
            .unwrap_or_default()
    }

    /// Clear visible history and agent memory of one session.
    pub fn clear_history(&self, session_id: &str) -> Vec<Turn> {
        if let Some(agent) = self.active_agent() {
            if let Some(session) = agent.sessions().get_mut(session_id) {
                session.clear();
                tracing::info!(session = session_id, "cleared chat history");
            }
        }
        Vec::new()
    }
}

/// One index name per pending file: the file's document id, with `_2`,
/// `_3`, ... appended when files in the batch share a stem (`A.pdf` and
/// `A.txt`). Compared case-insensitively.
fn batch_document_ids(paths: &[PathBuf]) -> Vec<String> {
    let mut taken = HashSet::new();
    paths
        .iter()
        .map(|path| {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let base = document_id_for(&filename);
            let mut id = base.clone();
            let mut n = 2;
            while !taken.insert(id.to_lowercase()) {
                id = format!("{}_{}", base, n);
                n += 1;
            }
            id
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::llm::ExtractiveModel;
    use crate::progress::{NoProgress, RecordingProgress};
    use tempfile::TempDir;

    fn ctx(tmp: &TempDir) -> AppContext {
        let mut config = Config::rooted_at(tmp.path());
        config.routing.strategy = "keyword".to_string();
        AppContext::from_config(config).unwrap()
    }

    fn text_file(name: &str, body: &str) -> UploadedFile {
        UploadedFile {
            filename: name.to_string(),
            bytes: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn upload_keeps_basename_only() {
        let tmp = TempDir::new().unwrap();
        let app = ctx(&tmp);
        let paths = app
            .upload(vec![text_file("/some/where/notes.txt", "hello")])
            .await
            .unwrap();
        assert_eq!(paths, vec![tmp.path().join("uploads").join("notes.txt")]);
        assert_eq!(app.pending_uploads(), paths);
    }

    #[tokio::test]
    async fn index_without_uploads_is_no_documents() {
        let tmp = TempDir::new().unwrap();
        let app = ctx(&tmp);
        let err = app.index_batch(100, 10, "c", &NoProgress).await.unwrap_err();
        assert!(matches!(err, DocGraphError::NoDocuments));
    }

    #[tokio::test]
    async fn invalid_chunking_is_rejected_up_front() {
        let tmp = TempDir::new().unwrap();
        let app = ctx(&tmp);
        app.upload(vec![text_file("a.txt", "text")]).await.unwrap();
        let err = app.index_batch(10, 10, "c", &NoProgress).await.unwrap_err();
        assert!(matches!(err, DocGraphError::InvalidChunking { .. }));
        assert!(app.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_reports_progress_in_order() {
        let tmp = TempDir::new().unwrap();
        let app = ctx(&tmp);
        app.upload(vec![
            text_file("a.txt", "alpha document body"),
            text_file("b.txt", "beta document body"),
        ])
        .await
        .unwrap();
        let progress = RecordingProgress::new();
        let report = app.index_batch(100, 10, "c", &progress).await.unwrap();
        assert!(report.collection_saved);
        assert!(report.status_text().starts_with("Done."));

        let phases: Vec<String> = progress
            .events()
            .iter()
            .map(|e| serde_json::to_value(e).unwrap()["phase"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            phases,
            ["indexing", "indexed", "indexing", "indexed", "composing", "saved"]
        );
    }

    #[tokio::test]
    async fn reject_policy_refuses_existing_collection() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::rooted_at(tmp.path());
        config.storage.overwrite = OverwritePolicy::Reject;
        let app = AppContext::with_providers(
            config,
            Arc::new(HashEmbedder::default()),
            Arc::new(ExtractiveModel::new()),
        )
        .unwrap();
        app.upload(vec![text_file("a.txt", "alpha")]).await.unwrap();
        app.index_batch(100, 10, "c", &NoProgress).await.unwrap();
        let err = app.index_batch(100, 10, "c", &NoProgress).await.unwrap_err();
        assert!(matches!(err, DocGraphError::NameCollision { .. }));
    }

    #[tokio::test]
    async fn temperature_requires_active_agent() {
        let tmp = TempDir::new().unwrap();
        let app = ctx(&tmp);
        assert!(matches!(
            app.set_temperature(0.5).await,
            Err(DocGraphError::NoActiveAgent)
        ));
        assert!(matches!(
            app.set_temperature(-1.0).await,
            Err(DocGraphError::InvalidTemperature(_))
        ));
        assert!(app.temperature().await.is_none());
    }
}
