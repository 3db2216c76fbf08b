//! Abstract chat interface consumed by the LLM mediator
//!
//! Concrete provider SDKs stay outside the engine; everything here is the
//! seam the mediator talks through, one thin OpenAI-style HTTP transport,
//! and a scripted implementation for deterministic tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

use crate::config::ProviderConfig;
use crate::error::FractalicError;

/// Chat turn roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw JSON argument string as produced by the model
    pub arguments: String,
}

/// One chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Tool invocations carried by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Which call a tool message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Attachment references forwarded with the message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<PathBuf>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, content)
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            attachments: Vec::new(),
        }
    }

    fn plain(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            attachments: Vec::new(),
        }
    }
}

/// Callable schema advertised to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One chat call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSchema>,
}

/// The model's reply to one chat call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// Provider-side failures; transport errors are retried by the mediator
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl From<ChatError> for FractalicError {
    fn from(e: ChatError) -> Self {
        FractalicError::llm(e.to_string())
    }
}

/// The abstract chat interface
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Issue one chat call
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ChatError>;

    /// Issue one chat call, surfacing tokens as they arrive
    ///
    /// The default delivers the whole reply as a single token; providers
    /// with real streaming transports override this.
    async fn chat_streaming(
        &self,
        request: ChatRequest,
        on_token: &(dyn for<'r> Fn(&'r str) + Send + Sync),
    ) -> Result<ChatResponse, ChatError> {
        let response = self.chat(request).await?;
        if !response.content.is_empty() {
            on_token(&response.content);
        }
        Ok(response)
    }

    fn name(&self) -> &str;
}

/// Generic OpenAI-style chat-completions transport
pub struct HttpChatProvider {
    name: String,
    api_base: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpChatProvider {
    pub fn new(name: impl Into<String>, config: &ProviderConfig) -> Self {
        Self {
            name: name.into(),
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: config.api_key.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn wire_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::Tool => "tool",
                };
                let mut msg = json!({ "role": role });
                if m.attachments.is_empty() {
                    msg["content"] = json!(m.content);
                } else {
                    let mut parts = vec![json!({ "type": "text", "text": m.content })];
                    for path in &m.attachments {
                        parts.push(json!({
                            "type": "image_url",
                            "image_url": { "url": path.display().to_string() }
                        }));
                    }
                    msg["content"] = json!(parts);
                }
                if !m.tool_calls.is_empty() {
                    msg["tool_calls"] = json!(m
                        .tool_calls
                        .iter()
                        .map(|c| json!({
                            "id": c.id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments }
                        }))
                        .collect::<Vec<_>>());
                }
                if let Some(id) = &m.tool_call_id {
                    msg["tool_call_id"] = json!(id);
                }
                msg
            })
            .collect()
    }
}

#[async_trait]
impl ChatProvider for HttpChatProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ChatError> {
        let mut body = json!({
            "model": request.model,
            "messages": Self::wire_messages(&request.messages),
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = request.top_p {
            body["top_p"] = json!(p);
        }
        if !request.stop_sequences.is_empty() {
            body["stop"] = json!(request.stop_sequences);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(request
                .tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                }))
                .collect::<Vec<_>>());
        }

        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ChatError::Transport(format!("status {}", status)));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ChatError::Rejected(format!("status {}: {}", status, detail)));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        let message = &payload["choices"][0]["message"];
        let content = message["content"].as_str().unwrap_or_default().to_string();
        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .map(|c| ToolCallRequest {
                        id: c["id"].as_str().unwrap_or_default().to_string(),
                        name: c["function"]["name"].as_str().unwrap_or_default().to_string(),
                        arguments: c["function"]["arguments"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ChatResponse { content, tool_calls })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Deterministic provider driven by a queue of canned responses
///
/// Every received request is recorded so tests can assert on the exact
/// turns the mediator produced.
#[derive(Default)]
pub struct ScriptedChatProvider {
    responses: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChatProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: ChatResponse) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(response);
        }
    }

    /// Requests seen so far, in order
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatProvider for ScriptedChatProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ChatError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        self.responses
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .ok_or_else(|| ChatError::Rejected("scripted provider exhausted".to_string()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_provider_replays_in_order() {
        let provider = ScriptedChatProvider::new();
        provider.push_response(ChatResponse::text("first"));
        provider.push_response(ChatResponse::text("second"));

        let req = ChatRequest {
            model: "test".to_string(),
            temperature: None,
            top_p: None,
            stop_sequences: Vec::new(),
            messages: vec![ChatMessage::user("hi")],
            tools: Vec::new(),
        };
        assert_eq!(provider.chat(req.clone()).await.unwrap().content, "first");
        assert_eq!(provider.chat(req.clone()).await.unwrap().content, "second");
        assert!(provider.chat(req).await.is_err());
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_default_streaming_emits_one_token() {
        let provider = ScriptedChatProvider::new();
        provider.push_response(ChatResponse::text("hello"));
        let tokens = Mutex::new(Vec::new());
        let req = ChatRequest {
            model: "test".to_string(),
            temperature: None,
            top_p: None,
            stop_sequences: Vec::new(),
            messages: vec![ChatMessage::user("hi")],
            tools: Vec::new(),
        };
        let response = provider
            .chat_streaming(req, &|t| {
                if let Ok(mut tokens) = tokens.lock() {
                    tokens.push(t.to_string());
                }
            })
            .await
            .unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(tokens.lock().unwrap().as_slice(), ["hello"]);
    }

    #[test]
    fn test_wire_messages_carry_tool_plumbing() {
        let mut assistant = ChatMessage::assistant("");
        assistant.tool_calls.push(ToolCallRequest {
            id: "call_1".to_string(),
            name: "echo_tool".to_string(),
            arguments: "{\"msg\":\"hi\"}".to_string(),
        });
        let tool = ChatMessage::tool("call_1", "{\"result\":\"hi\"}");
        let wire = HttpChatProvider::wire_messages(&[assistant, tool]);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "echo_tool");
        assert_eq!(wire[1]["tool_call_id"], "call_1");
    }
}
