//! Chat-completion provider abstraction.
//!
//! The [`ChatModel`] trait is the generation oracle used for three things:
//! synthesizing an answer from retrieved passages, merging answers from
//! several indices, and driving the agent's tool-calling loop.
//!
//! Implementations:
//! - **[`ExtractiveModel`]**: offline and deterministic. Answers with the
//!   retrieved passages themselves and always routes through the first
//!   matching tool. Useful without an API key and in tests.
//! - **[`OpenAIChatModel`]**: OpenAI-compatible `/v1/chat/completions`
//!   with function calling.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::http::{client_with_timeout, post_json_with_retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the model transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
    pub fn tool_request(calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A tool declaration in OpenAI function-calling shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One model call.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub tools: &'a [ToolSpec],
    pub temperature: f32,
}

/// The model's reply: either tool calls to run, or final content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Run one completion, optionally offering tools.
    async fn complete(&self, request: ChatRequest<'_>) -> Result<Completion>;

    /// Answer `question` from `passages`.
    async fn synthesize(
        &self,
        question: &str,
        passages: &[String],
        temperature: f32,
    ) -> Result<String> {
        let messages = [
            ChatMessage::system(
                "Answer the question using only the provided context. \
                 If the context does not contain the answer, say so.",
            ),
            ChatMessage::user(format!(
                "Context:\n{}\n\nQuestion: {}",
                passages.join("\n---\n"),
                question
            )),
        ];
        let completion = self
            .complete(ChatRequest {
                messages: &messages,
                tools: &[],
                temperature,
            })
            .await?;
        completion
            .content
            .ok_or_else(|| anyhow::anyhow!("model returned no content"))
    }
}

// ============ Extractive Model ============

/// Offline model that answers with retrieved text.
///
/// - With tools offered and no tool output yet for the current user message,
///   it calls `preferred_tool` if offered, else the first tool, passing the
///   user message as the query.
/// - Once tool output is present, it answers with that output.
/// - [`synthesize`](ChatModel::synthesize) returns the passages, trimmed to
///   `max_answer_chars`.
pub struct ExtractiveModel {
    preferred_tool: Option<String>,
    max_answer_chars: usize,
}

impl ExtractiveModel {
    pub fn new() -> Self {
        Self {
            preferred_tool: Some(crate::router::COMPOSITE_TOOL_NAME.to_string()),
            max_answer_chars: 1200,
        }
    }

    pub fn with_preferred_tool(mut self, tool: Option<String>) -> Self {
        self.preferred_tool = tool;
        self
    }
}

impl Default for ExtractiveModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatModel for ExtractiveModel {
    fn model_name(&self) -> &str {
        "extractive"
    }

    async fn complete(&self, request: ChatRequest<'_>) -> Result<Completion> {
        let last_user = request
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .ok_or_else(|| anyhow::anyhow!("no user message in request"))?;

        let tool_output: Vec<&str> = request.messages[last_user + 1..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_str())
            .collect();

        if !tool_output.is_empty() {
            return Ok(Completion::text(truncate_chars(
                &tool_output.join("\n\n"),
                self.max_answer_chars,
            )));
        }

        let question = request.messages[last_user].content.clone();
        let tool = self
            .preferred_tool
            .as_deref()
            .and_then(|name| request.tools.iter().find(|t| t.name == name))
            .or_else(|| request.tools.first());

        match tool {
            Some(tool) => Ok(Completion {
                content: None,
                tool_calls: vec![ToolCall {
                    id: "call_0".to_string(),
                    name: tool.name.clone(),
                    arguments: serde_json::json!({ "query": question }),
                }],
            }),
            None => Ok(Completion::text(truncate_chars(
                &question,
                self.max_answer_chars,
            ))),
        }
    }

    async fn synthesize(
        &self,
        _question: &str,
        passages: &[String],
        _temperature: f32,
    ) -> Result<String> {
        Ok(truncate_chars(
            &passages.join("\n\n"),
            self.max_answer_chars,
        ))
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max).collect();
        out.push('…');
        out
    }
}

// ============ OpenAI Chat Model ============

/// OpenAI-compatible chat completions with function calling.
///
/// Requires `OPENAI_API_KEY`; `llm.url` can point at any compatible gateway.
pub struct OpenAIChatModel {
    model: String,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChatModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model,
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
impl ChatModel for OpenAIChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: ChatRequest<'_>) -> Result<Completion> {
        let body = openai_request_body(&self.model, &request);
        let url = format!("{}/v1/chat/completions", self.url.trim_end_matches('/'));
        let json = post_json_with_retry(
            &self.client,
            &url,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_openai_completion(&json)
    }
}

fn openai_request_body(model: &str, request: &ChatRequest<'_>) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| {
            let mut msg = serde_json::json!({
                "role": m.role,
                "content": m.content,
            });
            if !m.tool_calls.is_empty() {
                msg["tool_calls"] = m
                    .tool_calls
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "id": c.id,
                            "type": "function",
                            "function": {
                                "name": c.name,
                                "arguments": c.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
            }
            if let Some(id) = &m.tool_call_id {
                msg["tool_call_id"] = Value::String(id.clone());
            }
            msg
        })
        .collect();

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "temperature": request.temperature,
    });
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
    }
    body
}

fn parse_openai_completion(json: &Value) -> Result<Completion> {
    let message = json
        .pointer("/choices/0/message")
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message"))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(|c| c.to_string());

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
        for call in calls {
            let id = call.get("id").and_then(|i| i.as_str()).unwrap_or_default();
            let name = call
                .pointer("/function/name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: tool call without name"))?;
            let raw_args = call
                .pointer("/function/arguments")
                .and_then(|a| a.as_str())
                .unwrap_or("{}");
            // Malformed arguments are passed through as a string so the
            // executor can report them back to the model.
            let arguments =
                serde_json::from_str(raw_args).unwrap_or_else(|_| Value::String(raw_args.into()));
            tool_calls.push(ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            });
        }
    }

    if content.is_none() && tool_calls.is_empty() {
        bail!("Invalid OpenAI response: neither content nor tool calls");
    }
    Ok(Completion {
        content,
        tool_calls,
    })
}

/// Create the configured [`ChatModel`].
pub fn create_chat_model(config: &LlmConfig) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveModel::new())),
        "openai" => Ok(Arc::new(OpenAIChatModel::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: String::new(),
            parameters: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn extractive_calls_preferred_tool_first() {
        let model = ExtractiveModel::new();
        let messages = [ChatMessage::user("what is rust?")];
        let tools = [tool("query_a"), tool(crate::router::COMPOSITE_TOOL_NAME)];
        let out = model
            .complete(ChatRequest {
                messages: &messages,
                tools: &tools,
                temperature: 0.0,
            })
            .await
            .unwrap();
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].name, crate::router::COMPOSITE_TOOL_NAME);
        assert_eq!(out.tool_calls[0].arguments["query"], "what is rust?");
    }

    #[tokio::test]
    async fn extractive_answers_with_tool_output() {
        let model = ExtractiveModel::new();
        let messages = [
            ChatMessage::user("q"),
            ChatMessage::tool_request(vec![]),
            ChatMessage::tool_result("call_0", "the answer"),
        ];
        let out = model
            .complete(ChatRequest {
                messages: &messages,
                tools: &[tool("query_a")],
                temperature: 0.0,
            })
            .await
            .unwrap();
        assert_eq!(out.content.as_deref(), Some("the answer"));
        assert!(out.tool_calls.is_empty());
    }

    #[test]
    fn parses_tool_calls_from_openai() {
        let json = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "query_a", "arguments": "{\"query\":\"hi\"}" }
                    }]
                }
            }]
        });
        let c = parse_openai_completion(&json).unwrap();
        assert_eq!(c.content, None);
        assert_eq!(c.tool_calls[0].name, "query_a");
        assert_eq!(c.tool_calls[0].arguments["query"], "hi");
    }

    #[test]
    fn request_body_carries_tools_and_temperature() {
        let messages = [
            ChatMessage::user("hi"),
            ChatMessage::tool_request(vec![ToolCall {
                id: "c1".into(),
                name: "query_a".into(),
                arguments: serde_json::json!({"query": "hi"}),
            }]),
            ChatMessage::tool_result("c1", "result"),
        ];
        let tools = [tool("query_a")];
        let body = openai_request_body(
            "gpt-test",
            &ChatRequest {
                messages: &messages,
                tools: &tools,
                temperature: 0.4,
            },
        );
        assert_eq!(body["tools"][0]["function"]["name"], "query_a");
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["arguments"], "{\"query\":\"hi\"}");
        assert_eq!(body["messages"][2]["tool_call_id"], "c1");
        assert!((body["temperature"].as_f64().unwrap() - 0.4).abs() < 1e-6);
    }
}
