//! LLM provider abstraction: builds HTTP requests and normalizes responses
//! for both Anthropic and OpenAI-compatible APIs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::{ChatContent, ChatMessage, ContentBlock, ModelResponse};
use crate::error::BridgeError;
use crate::settings::{LlmProvider, LlmProviderConfig};

/// What the agent loop sends for one model turn.
pub struct ModelRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [ChatMessage],
    /// Anthropic-shaped tool list (`name`, `description`, `input_schema`).
    pub tools: &'a Value,
}

/// One round-trip to a language model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelResponse, BridgeError>;
}

/// Resolved provider details ready for making an API call.
pub struct ResolvedProvider {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub provider: LlmProvider,
    pub max_tokens: u32,
}

impl ResolvedProvider {
    /// Resolve a provider config into concrete URL / key / model values.
    ///
    /// # Errors
    /// Returns a model error if the API key is missing.
    pub fn from_config(config: &LlmProviderConfig) -> Result<Self, BridgeError> {
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| BridgeError::Model {
                message: "No API key configured.".to_string(),
            })?
            .to_string();

        match config.provider {
            LlmProvider::Anthropic => Ok(Self {
                url: "https://api.anthropic.com/v1/messages".to_string(),
                api_key,
                model: config
                    .model
                    .clone()
                    .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
                provider: LlmProvider::Anthropic,
                max_tokens: config.max_tokens,
            }),
            LlmProvider::OpenAiCompatible => {
                let base = config
                    .base_url
                    .as_deref()
                    .unwrap_or("https://api.openai.com/v1");
                let base = base.trim_end_matches('/');
                Ok(Self {
                    url: format!("{base}/chat/completions"),
                    api_key,
                    model: config.model.clone().unwrap_or_else(|| "gpt-4o".to_string()),
                    provider: LlmProvider::OpenAiCompatible,
                    max_tokens: config.max_tokens,
                })
            }
        }
    }
}

/// reqwest-backed [`ModelClient`].
pub struct HttpModelClient {
    client: reqwest::Client,
    provider: ResolvedProvider,
}

impl HttpModelClient {
    pub fn from_config(config: &LlmProviderConfig) -> Result<Self, BridgeError> {
        Ok(Self {
            client: reqwest::Client::new(),
            provider: ResolvedProvider::from_config(config)?,
        })
    }
}

fn model_error(message: impl Into<String>) -> BridgeError {
    BridgeError::Model {
        message: message.into(),
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelResponse, BridgeError> {
        tracing::debug!(
            model = %self.provider.model,
            messages = request.messages.len(),
            "model request"
        );
        let response = build_request(&self.client, &self.provider, &request)
            .send()
            .await
            .map_err(|e| model_error(format!("API request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(model_error(format!("API error {status}: {text}")));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| model_error(format!("Failed to parse response: {e}")))?;
        parse_response(self.provider.provider, json)
    }
}

/// Build the HTTP request for one model turn.
pub fn build_request(
    client: &reqwest::Client,
    provider: &ResolvedProvider,
    request: &ModelRequest<'_>,
) -> reqwest::RequestBuilder {
    let builder = client
        .post(&provider.url)
        .header("content-type", "application/json");
    match provider.provider {
        LlmProvider::Anthropic => builder
            .header("x-api-key", &provider.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&AnthropicRequest::new(provider, request)),
        LlmProvider::OpenAiCompatible => builder
            .header("Authorization", format!("Bearer {}", provider.api_key))
            .json(&OpenAiRequest::new(provider, request)),
    }
}

/// Decode a provider response into content blocks the agent loop understands.
pub fn parse_response(provider: LlmProvider, json: Value) -> Result<ModelResponse, BridgeError> {
    match provider {
        LlmProvider::Anthropic => {
            let reply: AnthropicResponse = serde_json::from_value(json)
                .map_err(|e| model_error(format!("Unexpected Anthropic response: {e}")))?;
            Ok(ModelResponse {
                blocks: reply.content.into_iter().filter_map(known_block).collect(),
                stop_reason: reply.stop_reason.unwrap_or_default(),
            })
        }
        LlmProvider::OpenAiCompatible => {
            let reply: OpenAiResponse = serde_json::from_value(json)
                .map_err(|e| model_error(format!("Unexpected OpenAI response: {e}")))?;
            reply.into_model_response()
        }
    }
}

/// Keep the block types the loop understands; drop the rest (e.g. thinking).
fn known_block(raw: Value) -> Option<ContentBlock> {
    match serde_json::from_value::<ContentBlock>(raw) {
        Ok(b) => Some(b),
        Err(e) => {
            tracing::debug!(error = %e, "skipping unsupported content block");
            None
        }
    }
}

// ── Anthropic ────────────────────────────────────────────────────

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Messages go out as-is: `ChatMessage` already has the Anthropic shape.
#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    tools: &'a Value,
    messages: &'a [ChatMessage],
}

impl<'a> AnthropicRequest<'a> {
    fn new(provider: &'a ResolvedProvider, request: &ModelRequest<'a>) -> Self {
        Self {
            model: &provider.model,
            max_tokens: provider.max_tokens,
            system: request.system,
            tools: request.tools,
            messages: request.messages,
        }
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
}

// ── OpenAI-compatible ────────────────────────────────────────────

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<OpenAiMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
}

impl<'a> OpenAiRequest<'a> {
    fn new(provider: &'a ResolvedProvider, request: &ModelRequest<'a>) -> Self {
        Self {
            model: &provider.model,
            max_tokens: provider.max_tokens,
            messages: openai_messages(request.system, request.messages),
            tools: openai_tools(request.tools),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
enum OpenAiMessage<'a> {
    System {
        content: &'a str,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<OpenAiToolCall>,
    },
    Tool {
        tool_call_id: &'a str,
        content: &'a str,
    },
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct OpenAiFunctionCall {
    name: String,
    /// JSON-encoded argument object.
    #[serde(default)]
    arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAiFunctionSpec,
}

#[derive(Serialize)]
struct OpenAiFunctionSpec {
    name: String,
    description: String,
    parameters: Value,
}

/// Anthropic-shaped tool entry, as produced by the catalog.
#[derive(Deserialize)]
struct ToolSpec {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    input_schema: Value,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    finish_reason: Option<String>,
    message: OpenAiReply,
}

#[derive(Deserialize)]
struct OpenAiReply {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

impl OpenAiResponse {
    fn into_model_response(self) -> Result<ModelResponse, BridgeError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| model_error("No choices in OpenAI response"))?;

        let mut blocks = Vec::new();
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            blocks.push(ContentBlock::Text { text });
        }
        for call in choice.message.tool_calls {
            // Malformed arguments reach the validator as null and fail there.
            let input = serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
            blocks.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }

        let stop_reason = match choice.finish_reason.as_deref().unwrap_or("stop") {
            "tool_calls" => "tool_use".to_string(),
            "stop" => "end_turn".to_string(),
            "length" => "max_tokens".to_string(),
            other => other.to_string(),
        };
        Ok(ModelResponse {
            blocks,
            stop_reason,
        })
    }
}

/// Flatten the block transcript into OpenAI chat roles. Tool results become
/// one `tool` message each; tool uses ride on the assistant message.
fn openai_messages<'a>(system: &'a str, messages: &'a [ChatMessage]) -> Vec<OpenAiMessage<'a>> {
    let mut out = vec![OpenAiMessage::System { content: system }];
    for msg in messages {
        let assistant = msg.role == "assistant";
        let blocks = match &msg.content {
            ChatContent::Text(text) if assistant => {
                out.push(OpenAiMessage::Assistant {
                    content: Some(text.clone()),
                    tool_calls: Vec::new(),
                });
                continue;
            }
            ChatContent::Text(text) => {
                out.push(OpenAiMessage::User {
                    content: text.clone(),
                });
                continue;
            }
            ChatContent::Blocks(blocks) => blocks,
        };

        let mut text = Vec::new();
        let mut tool_calls = Vec::new();
        let mut had_results = false;
        for block in blocks {
            match block {
                ContentBlock::Text { text: t } => text.push(t.as_str()),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(OpenAiToolCall {
                    id: id.clone(),
                    kind: function_kind(),
                    function: OpenAiFunctionCall {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                }),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    had_results = true;
                    out.push(OpenAiMessage::Tool {
                        tool_call_id: tool_use_id,
                        content,
                    });
                }
            }
        }
        let text = text.join("\n");
        if assistant {
            out.push(OpenAiMessage::Assistant {
                content: (!text.is_empty()).then_some(text),
                tool_calls,
            });
        } else if !had_results && !text.is_empty() {
            out.push(OpenAiMessage::User { content: text });
        }
    }
    out
}

fn openai_tools(tools: &Value) -> Vec<OpenAiTool> {
    let specs: Vec<ToolSpec> = match serde_json::from_value(tools.clone()) {
        Ok(specs) => specs,
        Err(e) => {
            tracing::warn!(error = %e, "tool list is not in the expected shape");
            return Vec::new();
        }
    };
    specs
        .into_iter()
        .map(|spec| OpenAiTool {
            kind: "function",
            function: OpenAiFunctionSpec {
                name: spec.name,
                description: spec.description,
                parameters: spec.input_schema,
            },
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config(provider: LlmProvider) -> LlmProviderConfig {
        LlmProviderConfig {
            provider,
            api_key: Some("k".into()),
            base_url: Some("http://localhost:8080/v1/".into()),
            model: None,
            max_tokens: 1024,
        }
    }

    #[test]
    fn missing_key_is_a_model_error() {
        let cfg = LlmProviderConfig::default();
        assert!(matches!(
            ResolvedProvider::from_config(&cfg),
            Err(BridgeError::Model { .. })
        ));
    }

    #[test]
    fn openai_base_url_is_normalized() {
        let p = ResolvedProvider::from_config(&config(LlmProvider::OpenAiCompatible)).unwrap();
        assert_eq!(p.url, "http://localhost:8080/v1/chat/completions");
        assert_eq!(p.model, "gpt-4o");
    }

    #[test]
    fn openai_response_becomes_tool_use_blocks() {
        let json = json!({
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "undo", "arguments": "{}" }
                    }]
                }
            }]
        });
        let response = parse_response(LlmProvider::OpenAiCompatible, json).unwrap();
        assert_eq!(response.stop_reason, "tool_use");
        assert_eq!(
            response.blocks,
            vec![ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "undo".into(),
                input: json!({})
            }]
        );
    }

    #[test]
    fn empty_choices_is_a_model_error() {
        let err = parse_response(LlmProvider::OpenAiCompatible, json!({ "choices": [] })).unwrap_err();
        assert!(matches!(err, BridgeError::Model { .. }));
    }

    #[test]
    fn tool_results_map_to_tool_role() {
        let messages = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant(vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "undo".into(),
                input: json!({}),
            }]),
            ChatMessage::tool_results(vec![ContentBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: "Undone".into(),
                is_error: false,
            }]),
        ];
        let out = serde_json::to_value(openai_messages("sys", &messages)).unwrap();
        assert_eq!(out.as_array().unwrap().len(), 4);
        assert_eq!(out[0]["role"], "system");
        assert_eq!(out[2]["tool_calls"][0]["function"]["name"], "undo");
        assert_eq!(out[2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert!(out[2].get("content").is_none());
        assert_eq!(out[3]["role"], "tool");
        assert_eq!(out[3]["tool_call_id"], "t1");
    }

    #[test]
    fn catalog_tools_convert_to_functions() {
        let tools = json!([{ "name": "undo", "description": "Undo", "input_schema": { "type": "object" } }]);
        let out = serde_json::to_value(openai_tools(&tools)).unwrap();
        assert_eq!(out[0]["type"], "function");
        assert_eq!(out[0]["function"]["name"], "undo");
        assert_eq!(out[0]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn unknown_anthropic_blocks_are_dropped() {
        let json = json!({
            "stop_reason": "end_turn",
            "content": [
                { "type": "thinking", "thinking": "..." },
                { "type": "text", "text": "Done." }
            ]
        });
        let response = parse_response(LlmProvider::Anthropic, json).unwrap();
        assert_eq!(response.blocks, vec![ContentBlock::Text { text: "Done.".into() }]);
        assert_eq!(response.text(), "Done.");
    }

    #[test]
    fn anthropic_body_carries_configured_max_tokens() {
        let p = ResolvedProvider::from_config(&config(LlmProvider::Anthropic)).unwrap();
        let messages = vec![ChatMessage::user("hi")];
        let tools = json!([]);
        let request = ModelRequest {
            system: "sys",
            messages: &messages,
            tools: &tools,
        };
        let body = serde_json::to_value(AnthropicRequest::new(&p, &request)).unwrap();
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["system"], "sys");
        assert_eq!(body["messages"][0]["content"], "hi");
    }
}
