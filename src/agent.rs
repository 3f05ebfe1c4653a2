//! Tool-using reasoning loop over a composite router.
//!
//! One turn runs:
//!
//! 1. messages = system prompt (tool list) + replayed memory + user message
//! 2. call the [`ChatModel`] with the [`ToolTable`]
//! 3. run every requested tool, append the results as tool messages
//! 4. repeat until the model answers without tool calls
//!
//! A turn is bounded both by model calls (`max_iterations`) and wall-clock
//! time (`timeout`); hitting either yields
//! [`DocGraphError::ReasoningTimeout`]. Tool calls the executor cannot run
//! (unknown name, missing `query`) are reported back to the model as tool
//! errors so it can correct itself.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::embedding::Embedder;
use crate::error::{DocGraphError, Result};
use crate::index::QueryOptions;
use crate::llm::{ChatMessage, ChatModel, ChatRequest, ToolCall};
use crate::router::{CompositeRouter, Ranker, RoutingOptions, ToolTable, ToolTarget};
use crate::session::AgentMemory;

/// Per-agent reasoning budget and sampling temperature.
#[derive(Debug, Clone, Copy)]
pub struct AgentSettings {
    pub temperature: f32,
    pub max_iterations: usize,
    pub timeout: Duration,
}

impl AgentSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_iterations: config.max_iterations,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

/// One tool call the executor ran during a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub tool: String,
    pub query: String,
}

/// Result of a completed turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub answer: String,
    pub tool_calls: Vec<ToolInvocation>,
    /// Model calls made.
    pub iterations: usize,
}

/// Runs turns against one collection.
pub struct AgentExecutor {
    router: Arc<CompositeRouter>,
    tools: ToolTable,
    model: Arc<dyn ChatModel>,
    embedder: Arc<dyn Embedder>,
    ranker: Arc<dyn Ranker>,
    settings: AgentSettings,
    routing: RoutingOptions,
}

impl AgentExecutor {
    pub fn new(
        router: Arc<CompositeRouter>,
        model: Arc<dyn ChatModel>,
        embedder: Arc<dyn Embedder>,
        ranker: Arc<dyn Ranker>,
        settings: AgentSettings,
        routing: RoutingOptions,
    ) -> Self {
        let tools = ToolTable::from_router(&router);
        Self {
            router,
            tools,
            model,
            embedder,
            ranker,
            settings,
            routing,
        }
    }

    pub fn router(&self) -> &CompositeRouter {
        &self.router
    }

    pub fn tools(&self) -> &ToolTable {
        &self.tools
    }

    pub fn settings(&self) -> AgentSettings {
        self.settings
    }

    pub fn temperature(&self) -> f32 {
        self.settings.temperature
    }

    /// Takes effect from the next model call.
    pub fn set_temperature(&mut self, value: f32) -> Result<()> {
        if !(0.0..=2.0).contains(&value) {
            return Err(DocGraphError::InvalidTemperature(value));
        }
        self.settings.temperature = value;
        Ok(())
    }

    /// Answer `message` given prior conversation `memory`.
    pub async fn run_turn(&self, message: &str, memory: &AgentMemory) -> Result<TurnOutcome> {
        let mut iterations = 0usize;
        let result =
            tokio::time::timeout(self.settings.timeout, self.reason(message, memory, &mut iterations))
                .await;
        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(DocGraphError::ReasoningTimeout {
                iterations,
                reason: format!("turn exceeded {:?}", self.settings.timeout),
            }),
        }
    }

    async fn reason(
        &self,
        message: &str,
        memory: &AgentMemory,
        iterations: &mut usize,
    ) -> Result<TurnOutcome> {
        let mut messages = Vec::with_capacity(memory.replay().len() + 2);
        messages.push(ChatMessage::system(self.system_prompt()));
        messages.extend_from_slice(memory.replay());
        messages.push(ChatMessage::user(message));

        let mut invocations = Vec::new();
        loop {
            if *iterations >= self.settings.max_iterations {
                return Err(DocGraphError::ReasoningTimeout {
                    iterations: *iterations,
                    reason: format!(
                        "no final answer within {} model calls",
                        self.settings.max_iterations
                    ),
                });
            }
            *iterations += 1;

            let completion = self
                .model
                .complete(ChatRequest {
                    messages: &messages,
                    tools: self.tools.specs(),
                    temperature: self.settings.temperature,
                })
                .await?;

            if completion.tool_calls.is_empty() {
                return Ok(TurnOutcome {
                    answer: completion.content.unwrap_or_default(),
                    tool_calls: invocations,
                    iterations: *iterations,
                });
            }

            tracing::debug!(
                iteration = *iterations,
                calls = completion.tool_calls.len(),
                "model requested tools"
            );
            messages.push(ChatMessage::tool_request(completion.tool_calls.clone()));
            for call in &completion.tool_calls {
                let output = match self.invoke(call).await? {
                    ToolResult::Answered { query, answer } => {
                        invocations.push(ToolInvocation {
                            tool: call.name.clone(),
                            query,
                        });
                        answer
                    }
                    ToolResult::Rejected(reason) => {
                        tracing::warn!(tool = %call.name, %reason, "rejected tool call");
                        format!("Error: {}", reason)
                    }
                };
                messages.push(ChatMessage::tool_result(call.id.clone(), output));
            }
        }
    }

    /// Run one tool call. Only provider failures are returned as errors.
    async fn invoke(&self, call: &ToolCall) -> Result<ToolResult> {
        let Some(entry) = self.tools.find(&call.name) else {
            let known: Vec<&str> = self.tools.entries().iter().map(|e| e.name.as_str()).collect();
            return Ok(ToolResult::Rejected(format!(
                "unknown tool '{}'. Available tools: {}",
                call.name,
                known.join(", ")
            )));
        };
        let Some(query) = query_argument(&call.arguments) else {
            return Ok(ToolResult::Rejected(format!(
                "tool '{}' requires a string 'query' argument",
                call.name
            )));
        };

        let routing = RoutingOptions {
            query: QueryOptions {
                temperature: self.settings.temperature,
                ..self.routing.query
            },
            ..self.routing
        };
        let answer = match entry.target {
            ToolTarget::Child(i) => {
                self.router
                    .query_child(
                        i,
                        &query,
                        self.embedder.as_ref(),
                        self.model.as_ref(),
                        routing.query,
                    )
                    .await?
                    .answer
            }
            ToolTarget::Composite => {
                self.router
                    .query(
                        &query,
                        self.ranker.as_ref(),
                        self.embedder.as_ref(),
                        self.model.as_ref(),
                        &routing,
                    )
                    .await?
                    .answer
            }
        };
        Ok(ToolResult::Answered { query, answer })
    }

    fn system_prompt(&self) -> String {
        let mut prompt = format!(
            "You answer questions about the documents in the '{}' collection. \
             Look facts up with the tools below instead of guessing; each \
             document tool covers one document. Cite what the tools return.\n\nTools:\n",
            self.router.name
        );
        for entry in self.tools.entries() {
            prompt.push_str(&format!("- {}: {}\n", entry.name, entry.description));
        }
        prompt
    }
}

enum ToolResult {
    Answered { query: String, answer: String },
    Rejected(String),
}

fn query_argument(arguments: &Value) -> Option<String> {
    arguments
        .get("query")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::index::DocumentIndexer;
    use crate::llm::{Completion, ExtractiveModel, Role};
    use crate::models::SourceDocument;
    use crate::router::{build_router, KeywordRanker, COMPOSITE_TOOL_NAME};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted completions and records what it was sent.
    struct ScriptedModel {
        script: Mutex<VecDeque<Completion>>,
        seen: Mutex<Vec<(Vec<ChatMessage>, f32)>>,
    }

    impl ScriptedModel {
        fn new(script: Vec<Completion>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, request: ChatRequest<'_>) -> anyhow::Result<Completion> {
            self.seen
                .lock()
                .unwrap()
                .push((request.messages.to_vec(), request.temperature));
            Ok(self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Completion::text("done")))
        }
        async fn synthesize(&self, _q: &str, passages: &[String], _t: f32) -> anyhow::Result<String> {
            Ok(passages.join(" "))
        }
    }

    /// Always asks for another tool call.
    struct LoopingModel;

    #[async_trait]
    impl ChatModel for LoopingModel {
        fn model_name(&self) -> &str {
            "looping"
        }
        async fn complete(&self, _request: ChatRequest<'_>) -> anyhow::Result<Completion> {
            Ok(call(COMPOSITE_TOOL_NAME, serde_json::json!({"query": "again"})))
        }
        async fn synthesize(&self, _q: &str, passages: &[String], _t: f32) -> anyhow::Result<String> {
            Ok(passages.join(" "))
        }
    }

    struct SlowModel;

    #[async_trait]
    impl ChatModel for SlowModel {
        fn model_name(&self) -> &str {
            "slow"
        }
        async fn complete(&self, _request: ChatRequest<'_>) -> anyhow::Result<Completion> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Completion::text("too late"))
        }
    }

    fn call(name: &str, arguments: Value) -> Completion {
        Completion {
            content: None,
            tool_calls: vec![ToolCall {
                id: "call_1".into(),
                name: name.into(),
                arguments,
            }],
        }
    }

    async fn router() -> Arc<CompositeRouter> {
        let indexer = DocumentIndexer::new(
            Arc::new(HashEmbedder::new(128)),
            Arc::new(ExtractiveModel::new()),
        );
        let mut members = Vec::new();
        for (id, text) in [
            ("A", "The launch window for the probe opens in March."),
            ("B", "Payroll is processed on the last Friday of each month."),
        ] {
            let doc = SourceDocument {
                id: id.into(),
                filename: format!("{}.pdf", id),
                path: None,
                text: text.into(),
            };
            members.push(indexer.index_document(&doc, 200, 20).await.unwrap());
        }
        Arc::new(build_router("ops", members).unwrap())
    }

    async fn executor(model: Arc<dyn ChatModel>, settings: AgentSettings) -> AgentExecutor {
        AgentExecutor::new(
            router().await,
            model,
            Arc::new(HashEmbedder::new(128)),
            Arc::new(KeywordRanker),
            settings,
            RoutingOptions::default(),
        )
    }

    #[tokio::test]
    async fn extractive_turn_routes_through_composite_tool() {
        let agent = executor(Arc::new(ExtractiveModel::new()), AgentSettings::default()).await;
        let outcome = agent
            .run_turn("When does the launch window open?", &AgentMemory::default())
            .await
            .unwrap();
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_calls[0].tool, COMPOSITE_TOOL_NAME);
        assert!(outcome.answer.contains("March"));
    }

    #[tokio::test]
    async fn child_tool_queries_one_document() {
        let model = Arc::new(ScriptedModel::new(vec![
            call("query_b", serde_json::json!({"query": "payroll day"})),
            Completion::text("last Friday"),
        ]));
        let agent = executor(model.clone(), AgentSettings::default()).await;
        let outcome = agent.run_turn("payroll?", &AgentMemory::default()).await.unwrap();
        assert_eq!(
            outcome.tool_calls,
            vec![ToolInvocation {
                tool: "query_b".into(),
                query: "payroll day".into()
            }]
        );
        let seen = model.seen.lock().unwrap();
        let tool_msg = seen[1].0.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert!(tool_msg.content.contains("Payroll"));
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_back() {
        let model = Arc::new(ScriptedModel::new(vec![
            call("query_zzz", serde_json::json!({"query": "x"})),
            call("query_a", serde_json::json!({"wrong": "x"})),
            Completion::text("recovered"),
        ]));
        let agent = executor(model.clone(), AgentSettings::default()).await;
        let outcome = agent.run_turn("q", &AgentMemory::default()).await.unwrap();
        assert_eq!(outcome.answer, "recovered");
        assert!(outcome.tool_calls.is_empty());

        let seen = model.seen.lock().unwrap();
        assert!(seen[1].0.last().unwrap().content.contains("unknown tool 'query_zzz'"));
        assert!(seen[2].0.last().unwrap().content.contains("requires a string 'query'"));
    }

    #[tokio::test]
    async fn iteration_limit_is_a_reasoning_timeout() {
        let settings = AgentSettings {
            max_iterations: 3,
            ..AgentSettings::default()
        };
        let agent = executor(Arc::new(LoopingModel), settings).await;
        let err = agent.run_turn("q", &AgentMemory::default()).await.unwrap_err();
        assert!(matches!(err, DocGraphError::ReasoningTimeout { iterations: 3, .. }));
    }

    #[tokio::test]
    async fn wall_clock_limit_is_a_reasoning_timeout() {
        let settings = AgentSettings {
            timeout: Duration::from_millis(50),
            ..AgentSettings::default()
        };
        let agent = executor(Arc::new(SlowModel), settings).await;
        let err = agent.run_turn("q", &AgentMemory::default()).await.unwrap_err();
        assert!(matches!(err, DocGraphError::ReasoningTimeout { iterations: 1, .. }));
    }

    #[tokio::test]
    async fn temperature_applies_to_next_call() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let mut agent = executor(model.clone(), AgentSettings::default()).await;
        agent.run_turn("one", &AgentMemory::default()).await.unwrap();

        assert!(matches!(
            agent.set_temperature(2.5),
            Err(DocGraphError::InvalidTemperature(_))
        ));
        agent.set_temperature(0.9).unwrap();
        agent.run_turn("two", &AgentMemory::default()).await.unwrap();

        let seen = model.seen.lock().unwrap();
        assert!((seen[0].1 - 0.1).abs() < 1e-6);
        assert!((seen[1].1 - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn memory_is_replayed_before_the_new_message() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let agent = executor(model.clone(), AgentSettings::default()).await;
        let mut memory = AgentMemory::new(5);
        memory.record("earlier question", "earlier answer");
        agent.run_turn("follow-up", &memory).await.unwrap();

        let seen = model.seen.lock().unwrap();
        let messages = &seen[0].0;
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("query_a"));
        assert_eq!(messages[1].content, "earlier question");
        assert_eq!(messages[2].content, "earlier answer");
        assert_eq!(messages[3].content, "follow-up");
    }
}
