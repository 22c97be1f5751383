//! Decision-service clients. Both providers normalize structured tool
//! calls to the same `{"action": ..., "input": ...}` text the prompt asks
//! for, so the parser downstream sees a single shape.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::{Provider, ServiceConfig};
use crate::errors::ServiceError;
use crate::tools::ToolSpec;

/// A message in the conversation sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// Bytes of text this request carries.
    pub fn payload_len(&self) -> usize {
        self.system.len() + self.messages.iter().map(|m| m.content.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub text: String,
}

#[async_trait]
pub trait DecisionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ServiceError>;

    fn name(&self) -> &str;
}

/// Builds the client selected by `LLM_PROVIDER`.
pub fn from_config(cfg: ServiceConfig) -> Result<Box<dyn DecisionService>, ServiceError> {
    Ok(match cfg.provider {
        Provider::OpenAi => Box::new(OpenAiService::new(cfg)?),
        Provider::Anthropic => Box::new(AnthropicService::new(cfg)?),
    })
}

fn http_client(cfg: &ServiceConfig) -> Result<Client, ServiceError> {
    Client::builder()
        .timeout(cfg.timeout)
        .build()
        .map_err(|e| ServiceError::Config(e.to_string()))
}

fn transport(e: reqwest::Error) -> ServiceError {
    ServiceError::Transport(e.to_string())
}

async fn read_json(response: reqwest::Response) -> Result<Value, ServiceError> {
    let status = response.status();
    let body = response.text().await.map_err(transport)?;
    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or_else(|| body.chars().take(300).collect());
        return Err(ServiceError::Http {
            status: status.as_u16(),
            message,
        });
    }
    serde_json::from_str(&body).map_err(|e| ServiceError::Decode(e.to_string()))
}

fn tool_call_text(name: &str, input: Value) -> String {
    json!({ "action": name, "input": input }).to_string()
}

pub struct OpenAiService {
    client: Client,
    cfg: ServiceConfig,
}

impl OpenAiService {
    pub fn new(cfg: ServiceConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client(&cfg)?,
            cfg,
        })
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        let mut messages = vec![json!({"role": "system", "content": request.system})];
        messages.extend(
            request
                .messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content})),
        );
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        let mut body = json!({
            "model": self.cfg.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

/// Text of the first choice, or its first tool call rendered as a decision.
pub fn parse_openai_response(resp: &Value) -> Result<CompletionResponse, ServiceError> {
    let message = &resp["choices"][0]["message"];
    if let Some(call) = message["tool_calls"].as_array().and_then(|c| c.first()) {
        let name = call["function"]["name"].as_str().unwrap_or_default();
        let args = match &call["function"]["arguments"] {
            Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| json!({})),
            Value::Object(_) => call["function"]["arguments"].clone(),
            _ => json!({}),
        };
        if !name.is_empty() {
            return Ok(CompletionResponse {
                text: tool_call_text(name, args),
            });
        }
    }
    match message["content"].as_str() {
        Some(text) if !text.trim().is_empty() => Ok(CompletionResponse {
            text: text.to_string(),
        }),
        _ => Err(ServiceError::Empty),
    }
}

#[async_trait]
impl DecisionService for OpenAiService {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ServiceError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.cfg.base_url))
            .bearer_auth(&self.cfg.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(transport)?;
        let value = read_json(response).await?;
        parse_openai_response(&value)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

pub struct AnthropicService {
    client: Client,
    cfg: ServiceConfig,
}

impl AnthropicService {
    const VERSION: &'static str = "2023-06-01";

    pub fn new(cfg: ServiceConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client(&cfg)?,
            cfg,
        })
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        let mut body = json!({
            "model": self.cfg.model,
            "system": request.system,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

/// First `tool_use` block as a decision, else the concatenated text blocks.
pub fn parse_anthropic_response(resp: &Value) -> Result<CompletionResponse, ServiceError> {
    let blocks = resp["content"].as_array().cloned().unwrap_or_default();
    if let Some(tool) = blocks.iter().find(|b| b["type"] == "tool_use") {
        let name = tool["name"].as_str().unwrap_or_default();
        if !name.is_empty() {
            return Ok(CompletionResponse {
                text: tool_call_text(name, tool["input"].clone()),
            });
        }
    }
    let text: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        Err(ServiceError::Empty)
    } else {
        Ok(CompletionResponse { text })
    }
}

#[async_trait]
impl DecisionService for AnthropicService {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ServiceError> {
        let response = self
            .client
            .post(format!("{}/messages", self.cfg.base_url))
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", Self::VERSION)
            .json(&self.body(request))
            .send()
            .await
            .map_err(transport)?;
        let value = read_json(response).await?;
        parse_anthropic_response(&value)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}
