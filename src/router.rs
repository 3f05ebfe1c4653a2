//! Composite router over a collection of per-document indices.
//!
//! ```text
//!                ┌──────────────────────────────┐
//!   question ──▶ │        CompositeRouter        │
//!                │  Ranker(question, summaries)  │
//!                └──────┬──────────┬────────────┘
//!                       ▼          ▼
//!                 ┌──────────┐ ┌──────────┐
//!                 │ index A  │ │ index B  │   …one child per document
//!                 │ summary  │ │ summary  │
//!                 └──────────┘ └──────────┘
//!                       └────┬─────┘
//!                            ▼
//!                  synthesized answer
//! ```
//!
//! Children are fixed at construction: [`build_router`] is the only way to
//! make one, and it refuses an empty input. Child selection is delegated to a
//! [`Ranker`], so routing can be tested with deterministic rankers.
//!
//! The [`ToolTable`] is derived from the children once and handed to the
//! agent: one `query_<document>` tool per child plus [`COMPOSITE_TOOL_NAME`].

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::RoutingConfig;
use crate::embedding::{cosine_similarity, embed_batched, embed_one, tokenize, Embedder};
use crate::error::{DocGraphError, Result};
use crate::index::{QueryOptions, VectorIndex};
use crate::llm::{ChatModel, ToolSpec};
use crate::models::{IndexSummary, QueryResponse, SourceChunk};

/// Name of the tool that routes automatically across all children.
pub const COMPOSITE_TOOL_NAME: &str = "query_collection";

/// One routable member of a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterChild {
    pub tool_name: String,
    pub summary: IndexSummary,
    pub index: VectorIndex,
}

/// Indices plus their summaries, queryable as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeRouter {
    pub name: String,
    pub created_at: String,
    children: Vec<RouterChild>,
}

/// A child index chosen by a [`Ranker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedCandidate {
    /// Position in [`CompositeRouter::children`].
    pub child: usize,
    pub score: f32,
}

/// Orders children by relevance to a query, best first.
#[async_trait]
pub trait Ranker: Send + Sync {
    async fn rank(&self, query: &str, summaries: &[&str]) -> anyhow::Result<Vec<RankedCandidate>>;
}

/// How many children a routed query may touch.
#[derive(Debug, Clone, Copy)]
pub struct RoutingOptions {
    pub max_children: usize,
    pub min_score: f32,
    pub query: QueryOptions,
}

impl RoutingOptions {
    pub fn from_config(routing: &RoutingConfig, temperature: f32) -> Self {
        Self {
            max_children: routing.max_children,
            min_score: routing.min_score,
            query: QueryOptions {
                top_k: routing.top_k,
                temperature,
            },
        }
    }
}

impl Default for RoutingOptions {
    fn default() -> Self {
        Self {
            max_children: 2,
            min_score: 0.2,
            query: QueryOptions::default(),
        }
    }
}

/// Answer from a routed query, with the children that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct RoutedResponse {
    pub answer: String,
    pub routed_to: Vec<String>,
    pub sources: Vec<SourceChunk>,
}

/// Compose indices and their summaries into a router.
///
/// Children keep insertion order; tool names are derived from document ids
/// and made unique with numeric suffixes.
pub fn build_router(
    name: &str,
    members: Vec<(VectorIndex, IndexSummary)>,
) -> Result<CompositeRouter> {
    if members.is_empty() {
        return Err(DocGraphError::EmptyBuild);
    }

    let mut used = HashSet::new();
    used.insert(COMPOSITE_TOOL_NAME.to_string());

    let mut children = Vec::with_capacity(members.len());
    for (index, summary) in members {
        if summary.index_id != index.document_id {
            return Err(DocGraphError::MissingSummary {
                index_id: index.document_id.clone(),
                summary_id: summary.index_id.clone(),
            });
        }
        let base = format!("query_{}", slug(&index.document_id));
        let mut tool_name = base.clone();
        let mut n = 2;
        while !used.insert(tool_name.clone()) {
            tool_name = format!("{}_{}", base, n);
            n += 1;
        }
        children.push(RouterChild {
            tool_name,
            summary,
            index,
        });
    }

    Ok(CompositeRouter {
        name: name.to_string(),
        created_at: Utc::now().to_rfc3339(),
        children,
    })
}

/// Lowercase `[a-z0-9_]` form of a document id, for tool names.
fn slug(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    let mut last_underscore = false;
    for c in id.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "document".to_string()
    } else {
        trimmed.to_string()
    }
}

impl CompositeRouter {
    pub fn children(&self) -> &[RouterChild] {
        &self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn child_by_tool(&self, tool_name: &str) -> Option<&RouterChild> {
        self.children.iter().find(|c| c.tool_name == tool_name)
    }

    pub fn summaries(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.summary.text.as_str()).collect()
    }

    /// Query one child directly.
    pub async fn query_child(
        &self,
        child: usize,
        question: &str,
        embedder: &dyn Embedder,
        model: &dyn ChatModel,
        options: QueryOptions,
    ) -> Result<QueryResponse> {
        let child = self
            .children
            .get(child)
            .ok_or_else(|| DocGraphError::not_found("index", child.to_string()))?;
        child.index.query(question, embedder, model, options).await
    }

    /// Pick children for a question: candidates at or above `min_score`, at
    /// most `max_children`, falling back to the single best candidate.
    pub async fn select(
        &self,
        question: &str,
        ranker: &dyn Ranker,
        options: &RoutingOptions,
    ) -> Result<Vec<RankedCandidate>> {
        if self.children.is_empty() {
            return Err(DocGraphError::EmptyBuild);
        }
        let ranked = ranker.rank(question, &self.summaries()).await?;
        let valid: Vec<RankedCandidate> = ranked
            .into_iter()
            .filter(|c| c.child < self.children.len())
            .collect();

        let mut selected: Vec<RankedCandidate> = valid
            .iter()
            .copied()
            .filter(|c| c.score >= options.min_score)
            .take(options.max_children.max(1))
            .collect();
        if selected.is_empty() {
            selected.extend(valid.first().copied());
        }
        if selected.is_empty() {
            // A ranker that returns nothing still routes somewhere.
            selected.push(RankedCandidate { child: 0, score: 0.0 });
        }
        Ok(selected)
    }

    /// Route a question to the relevant children and combine their answers.
    pub async fn query(
        &self,
        question: &str,
        ranker: &dyn Ranker,
        embedder: &dyn Embedder,
        model: &dyn ChatModel,
        options: &RoutingOptions,
    ) -> Result<RoutedResponse> {
        let selected = self.select(question, ranker, options).await?;

        let mut answers: Vec<(String, String)> = Vec::with_capacity(selected.len());
        let mut sources = Vec::new();
        for candidate in &selected {
            let child = self
                .children
                .get(candidate.child)
                .ok_or(DocGraphError::EmptyBuild)?;
            tracing::debug!(
                collection = %self.name,
                child = %child.index.document_id,
                score = candidate.score,
                "routing query"
            );
            let response = child
                .index
                .query(question, embedder, model, options.query)
                .await?;
            answers.push((child.index.document_id.clone(), response.answer));
            sources.extend(response.sources);
        }

        let routed_to: Vec<String> = answers.iter().map(|(id, _)| id.clone()).collect();
        let answer = match answers.as_slice() {
            [(_, only)] => only.clone(),
            _ => {
                let labelled: Vec<String> = answers
                    .iter()
                    .map(|(id, answer)| format!("[{}] {}", id, answer))
                    .collect();
                model
                    .synthesize(question, &labelled, options.query.temperature)
                    .await?
            }
        };

        Ok(RoutedResponse {
            answer,
            routed_to,
            sources,
        })
    }
}

// ============ Rankers ============

/// Ranks children by cosine similarity between query and summary embeddings.
///
/// Summary vectors are computed lazily on first use and cached.
pub struct EmbeddingRanker {
    embedder: Arc<dyn Embedder>,
    cache: tokio::sync::Mutex<Option<(Vec<String>, Vec<Vec<f32>>)>>,
}

impl EmbeddingRanker {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            cache: tokio::sync::Mutex::new(None),
        }
    }

    async fn summary_vectors(&self, summaries: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut cache = self.cache.lock().await;
        if let Some((keys, vectors)) = cache.as_ref() {
            if keys.iter().map(String::as_str).eq(summaries.iter().copied()) {
                return Ok(vectors.clone());
            }
        }
        let texts: Vec<String> = summaries.iter().map(|s| s.to_string()).collect();
        let vectors = embed_batched(self.embedder.as_ref(), &texts, 64).await?;
        *cache = Some((texts, vectors.clone()));
        Ok(vectors)
    }
}

#[async_trait]
impl Ranker for EmbeddingRanker {
    async fn rank(&self, query: &str, summaries: &[&str]) -> anyhow::Result<Vec<RankedCandidate>> {
        let query_vec = embed_one(self.embedder.as_ref(), query).await?;
        let summary_vecs = self.summary_vectors(summaries).await?;
        let mut ranked: Vec<RankedCandidate> = summary_vecs
            .iter()
            .enumerate()
            .map(|(child, v)| RankedCandidate {
                child,
                score: cosine_similarity(&query_vec, v),
            })
            .collect();
        sort_ranked(&mut ranked);
        Ok(ranked)
    }
}

/// Ranks children by the share of query terms found in each summary.
///
/// Deterministic and offline; scores lie in `[0, 1]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordRanker;

#[async_trait]
impl Ranker for KeywordRanker {
    async fn rank(&self, query: &str, summaries: &[&str]) -> anyhow::Result<Vec<RankedCandidate>> {
        let terms: HashSet<String> = tokenize(query).collect();
        let mut ranked: Vec<RankedCandidate> = summaries
            .iter()
            .enumerate()
            .map(|(child, summary)| {
                let vocabulary: HashSet<String> = tokenize(summary).collect();
                let hits = terms.iter().filter(|t| vocabulary.contains(*t)).count();
                let score = if terms.is_empty() {
                    0.0
                } else {
                    hits as f32 / terms.len() as f32
                };
                RankedCandidate { child, score }
            })
            .collect();
        sort_ranked(&mut ranked);
        Ok(ranked)
    }
}

/// Best score first; ties keep insertion order.
fn sort_ranked(ranked: &mut [RankedCandidate]) {
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.child.cmp(&b.child))
    });
}

/// Create the configured ranker.
pub fn create_ranker(strategy: &str, embedder: Arc<dyn Embedder>) -> anyhow::Result<Arc<dyn Ranker>> {
    match strategy {
        "embedding" => Ok(Arc::new(EmbeddingRanker::new(embedder))),
        "keyword" => Ok(Arc::new(KeywordRanker)),
        other => anyhow::bail!("Unknown routing strategy: {}", other),
    }
}

// ============ Tool Table ============

/// What a tool invocation queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "child", rename_all = "lowercase")]
pub enum ToolTarget {
    /// A single member index, by position.
    Child(usize),
    /// Automatic routing across the collection.
    Composite,
}

/// Serializable tool info for listing.
#[derive(Debug, Clone, Serialize)]
pub struct ToolEntry {
    pub name: String,
    pub description: String,
    pub target: ToolTarget,
    pub parameters: Value,
}

/// Fixed map from tool name to query capability, built once per router.
#[derive(Debug, Clone)]
pub struct ToolTable {
    entries: Vec<ToolEntry>,
    specs: Vec<ToolSpec>,
}

impl ToolTable {
    pub fn from_router(router: &CompositeRouter) -> Self {
        let mut entries: Vec<ToolEntry> = router
            .children()
            .iter()
            .enumerate()
            .map(|(i, child)| ToolEntry {
                name: child.tool_name.clone(),
                description: format!(
                    "Answers questions about the document '{}'. Contents: {}",
                    child.index.source_filename, child.summary.text
                ),
                target: ToolTarget::Child(i),
                parameters: query_schema(),
            })
            .collect();
        entries.push(ToolEntry {
            name: COMPOSITE_TOOL_NAME.to_string(),
            description: format!(
                "Answers questions across all {} documents of the '{}' collection, \
                 picking the relevant ones automatically. Use it when the question \
                 spans documents or none of the specific tools clearly fits.",
                router.len(),
                router.name
            ),
            target: ToolTarget::Composite,
            parameters: query_schema(),
        });

        let specs = entries
            .iter()
            .map(|e| ToolSpec {
                name: e.name.clone(),
                description: e.description.clone(),
                parameters: e.parameters.clone(),
            })
            .collect();

        Self { entries, specs }
    }

    pub fn entries(&self) -> &[ToolEntry] {
        &self.entries
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn find(&self, name: &str) -> Option<&ToolEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn query_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "A full natural-language question for this source"
            }
        },
        "required": ["query"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::index::DocumentIndexer;
    use crate::llm::ExtractiveModel;
    use crate::models::SourceDocument;

    async fn member(id: &str, text: &str) -> (VectorIndex, IndexSummary) {
        let indexer = DocumentIndexer::new(
            Arc::new(HashEmbedder::new(256)),
            Arc::new(ExtractiveModel::new()),
        );
        let doc = SourceDocument {
            id: id.to_string(),
            filename: format!("{}.pdf", id),
            path: None,
            text: text.to_string(),
        };
        let index = indexer.build_index(&doc, 200, 20).await.unwrap();
        let summary = IndexSummary {
            index_id: id.to_string(),
            text: text.to_string(),
        };
        (index, summary)
    }

    #[test]
    fn empty_build_fails() {
        assert!(matches!(build_router("c", vec![]), Err(DocGraphError::EmptyBuild)));
    }

    #[tokio::test]
    async fn mismatched_summary_fails() {
        let (index, _) = member("A", "alpha text").await;
        let summary = IndexSummary {
            index_id: "B".into(),
            text: "x".into(),
        };
        assert!(matches!(
            build_router("c", vec![(index, summary)]),
            Err(DocGraphError::MissingSummary { .. })
        ));
    }

    #[tokio::test]
    async fn n_members_make_n_children_with_unique_tools() {
        let members = vec![
            member("Report Q1", "quarterly revenue").await,
            member("report-q1", "another revenue report").await,
            member("Zebra", "striped animals").await,
        ];
        let router = build_router("finance", members).unwrap();
        assert_eq!(router.len(), 3);
        let names: Vec<&str> = router.children().iter().map(|c| c.tool_name.as_str()).collect();
        assert_eq!(names, ["query_report_q1", "query_report_q1_2", "query_zebra"]);

        let table = ToolTable::from_router(&router);
        assert_eq!(table.len(), 4);
        assert_eq!(table.find("query_zebra").unwrap().target, ToolTarget::Child(2));
        assert_eq!(table.find(COMPOSITE_TOOL_NAME).unwrap().target, ToolTarget::Composite);
        assert!(table.find("query_zebra").unwrap().description.contains("striped animals"));
    }

    #[tokio::test]
    async fn keyword_ranker_routes_to_matching_summary() {
        let router = build_router(
            "mixed",
            vec![
                member("A", "Rust ownership borrowing lifetimes cargo").await,
                member("B", "Sourdough baking flour hydration starter").await,
            ],
        )
        .unwrap();
        let embedder = HashEmbedder::new(256);
        let model = ExtractiveModel::new();
        let response = router
            .query(
                "how does sourdough hydration work?",
                &KeywordRanker,
                &embedder,
                &model,
                &RoutingOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.routed_to, vec!["B"]);
        assert!(response.answer.contains("Sourdough"));
    }

    #[tokio::test]
    async fn embedding_ranker_routes_to_matching_summary() {
        let router = build_router(
            "mixed",
            vec![
                member("A", "rust ownership borrowing lifetimes cargo crates").await,
                member("B", "sourdough baking flour hydration starter loaf").await,
            ],
        )
        .unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(256));
        let ranker = EmbeddingRanker::new(embedder.clone());
        let selected = router
            .select(
                "rust borrowing and lifetimes",
                &ranker,
                &RoutingOptions {
                    max_children: 1,
                    ..RoutingOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].child, 0);
    }

    #[tokio::test]
    async fn selection_falls_back_to_best_candidate() {
        let router = build_router(
            "mixed",
            vec![member("A", "alpha").await, member("B", "beta").await],
        )
        .unwrap();
        let selected = router
            .select("nothing in common", &KeywordRanker, &RoutingOptions::default())
            .await
            .unwrap();
        assert_eq!(selected, vec![RankedCandidate { child: 0, score: 0.0 }]);
    }

    #[tokio::test]
    async fn multiple_relevant_children_are_combined() {
        let router = build_router(
            "mixed",
            vec![
                member("A", "deployment checklist kubernetes").await,
                member("B", "deployment rollback kubernetes").await,
                member("C", "holiday calendar").await,
            ],
        )
        .unwrap();
        let embedder = HashEmbedder::new(256);
        let model = ExtractiveModel::new();
        let response = router
            .query(
                "kubernetes deployment",
                &KeywordRanker,
                &embedder,
                &model,
                &RoutingOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.routed_to, vec!["A", "B"]);
        assert!(response.answer.contains("[A]"));
        assert!(response.answer.contains("[B]"));
    }

    #[tokio::test]
    async fn router_survives_serde_roundtrip() {
        let router = build_router("c", vec![member("A", "alpha words").await]).unwrap();
        let json = serde_json::to_string(&router).unwrap();
        let back: CompositeRouter = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back.children()[0].tool_name, "query_a");
    }

    #[tokio::test]
    async fn stored_router_without_children_errors_instead_of_panicking() {
        let router: CompositeRouter =
            serde_json::from_str(r#"{"name":"c","created_at":"2024-01-01T00:00:00Z","children":[]}"#)
                .unwrap();
        let embedder = HashEmbedder::new(64);
        let model = ExtractiveModel::new();
        let err = router
            .query("anything", &KeywordRanker, &embedder, &model, &RoutingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DocGraphError::EmptyBuild));
    }

    #[test]
    fn slug_normalizes_ids() {
        assert_eq!(slug("Q3 Report (final)"), "q3_report_final");
        assert_eq!(slug("___"), "document");
    }
}
