//! The LM provider contract: a one-shot chat completion with optional
//! structured-output request. Concrete providers (HTTP, scripted test
//! double) live behind this trait; the Root Loop and Planner are the only
//! callers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A JSON-schema-constrained structured output request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSchemaSpec {
    pub name: String,
    pub schema: Value,
    #[serde(default)]
    pub strict: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    JsonObject,
    JsonSchema { json_schema: JsonSchemaSpec },
}

/// Options accompanying a [`LMProvider::complete`] call.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stop: Option<Vec<String>>,
    pub response_format: Option<ResponseFormat>,
}

/// Token accounting a provider may report back, surfaced into `root_step`
/// trace events verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Option<Usage>,
    pub raw: Option<Value>,
}

/// One-shot chat completion, implemented by a concrete HTTP client or a
/// scripted test double.
#[async_trait]
pub trait LMProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion>;
}

/// The action-vocabulary JSON schema the Root Loop requests from the LM.
/// Every field is nullable so the schema tolerates actions that don't use
/// it; the interpreter's coercion remains the defensive layer of record.
pub fn action_response_format() -> ResponseFormat {
    ResponseFormat::JsonSchema {
        json_schema: JsonSchemaSpec {
            name: "rlm_action".to_string(),
            schema: serde_json::json!({
                "type": "object",
                "additionalProperties": true,
                "properties": {
                    "op": {"type": "string"},
                    "start": {"type": ["integer", "string", "null"]},
                    "end": {"type": ["integer", "string", "null"]},
                    "out": {"type": ["string", "null"]},
                    "format": {"type": ["string", "null"]},
                    "title": {"type": ["string", "null"]},
                    "columns": {"type": ["array", "null"]},
                    "equals": {"type": ["string", "number", "null"]},
                    "comparator": {"type": ["string", "null"]},
                    "includeHeader": {"type": ["boolean", "string", "null"]},
                    "separator": {"type": ["string", "null"]},
                    "needle": {"type": ["string", "null"]},
                    "from": {"type": ["string", "null"]},
                    "maxLines": {"type": ["integer", "string", "null"]},
                    "column": {"type": ["string", "integer", "null"]},
                    "delimiter": {"type": ["string", "null"]},
                    "index": {"type": ["integer", "string", "null"]},
                    "in": {"type": ["string", "null"]},
                    "queryTemplate": {"type": ["string", "null"]},
                    "limit": {"type": ["integer", "string", "null"]},
                    "sep": {"type": ["string", "null"]},
                    "path": {"type": ["string", "null"]},
                    "value": {}
                },
                "required": ["op"]
            }),
            strict: Some(false),
            description: Some("One RLM action per turn.".to_string()),
        },
    }
}

/// The plan-object JSON schema requested by the Planner (§4.9).
pub fn plan_response_format() -> ResponseFormat {
    ResponseFormat::JsonSchema {
        json_schema: JsonSchemaSpec {
            name: "rlm_plan".to_string(),
            schema: serde_json::json!({
                "type": "object",
                "additionalProperties": true,
                "properties": {
                    "mode": {"type": "string", "enum": ["single", "long_run"]},
                    "task": {"type": "string"},
                    "profile": {"type": ["string", "null"], "enum": ["pure", "hybrid", null]},
                    "symbols": {"type": ["array", "null"]},
                    "budget": {"type": ["object", "null"]},
                    "longRun": {"type": ["object", "null"]}
                },
                "required": ["mode", "task"]
            }),
            strict: Some(false),
            description: Some("A Plan describing how to execute a user request.".to_string()),
        },
    }
}

/// A scripted LM for tests: returns each entry in order, one per call,
/// failing once the script runs dry.
pub struct TestLMProvider {
    responses: std::sync::Mutex<std::collections::VecDeque<String>>,
}

impl TestLMProvider {
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl LMProvider for TestLMProvider {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<Completion> {
        let mut responses = self.responses.lock().expect("lock poisoned");
        let text = responses
            .pop_front()
            .ok_or_else(|| Error::provider("test script exhausted"))?;
        Ok(Completion {
            text,
            usage: None,
            raw: None,
        })
    }
}

/// Configuration for [`HttpChatCompletionsProvider`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Extra headers a given backend requires beyond `Authorization`
    /// (e.g. an API-version header).
    pub extra_headers: Vec<(String, String)>,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            timeout_secs: 120,
            extra_headers: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Client {
    let timeout = Duration::from_secs(timeout_secs);
    // Sandboxed environments can panic during proxy auto-detection in
    // reqwest's default client builder; fall back to no-proxy.
    match catch_unwind(AssertUnwindSafe(|| Client::builder().timeout(timeout).build())) {
        Ok(Ok(client)) => client,
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client"),
    }
}

#[derive(Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<&'a ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<ChatCompletionsChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatCompletionsChoice {
    message: ChatCompletionsMessage,
}

#[derive(Deserialize)]
struct ChatCompletionsMessage {
    content: String,
}

/// An [`LMProvider`] backed by any chat-completions-style HTTP API (the
/// OpenAI wire shape, which most self-hosted and third-party backends
/// mirror). Per §4.6, the runtime never places the document body in
/// `messages`; this client simply forwards whatever it is given.
pub struct HttpChatCompletionsProvider {
    config: ClientConfig,
    http: Client,
}

impl HttpChatCompletionsProvider {
    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }
}

#[async_trait]
impl LMProvider for HttpChatCompletionsProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion> {
        let body = ChatCompletionsRequest {
            model: &self.config.model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stop: options.stop.as_deref(),
            response_format: options.response_format.as_ref(),
        };

        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(&self.config.api_key)
            .json(&body);
        for (name, value) in &self.config.extra_headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::provider(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::provider(format!("backend returned {status}: {text}")));
        }

        let parsed: ChatCompletionsResponse = response
            .json()
            .await
            .map_err(|e| Error::provider(format!("invalid response body: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider("backend returned no choices"))?;

        Ok(Completion {
            text: choice.message.content,
            usage: parsed.usage,
            raw: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_provider_returns_in_order() {
        let provider = TestLMProvider::new(["first", "second"]);
        let opts = CompletionOptions::default();
        let a = provider.complete(&[], &opts).await.unwrap();
        let b = provider.complete(&[], &opts).await.unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(b.text, "second");
    }

    #[tokio::test]
    async fn scripted_provider_errors_when_exhausted() {
        let provider = TestLMProvider::new(Vec::<String>::new());
        let opts = CompletionOptions::default();
        assert!(provider.complete(&[], &opts).await.is_err());
    }

    #[test]
    fn client_config_builder_overrides_defaults() {
        let config = ClientConfig::new("key", "https://example.invalid/v1", "test-model")
            .with_timeout(5)
            .with_header("X-Extra", "1");
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.extra_headers, vec![("X-Extra".to_string(), "1".to_string())]);
    }
}
