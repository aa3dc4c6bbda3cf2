//! Chat providers.
//!
//! A provider is a capability: given a strict-JSON prompt it returns the raw
//! model reply plus usage metadata. The HTTP provider targets an
//! OpenAI-compatible chat-completions endpoint with bearer auth and a tiny
//! payload; the scripted provider is the deterministic `env=test`
//! implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::llm::error::TransportError;
use crate::types::LlmConfig;

/// System prompt enforced on every request.
pub const STRICT_SYSTEM_PROMPT: &str = "Return strict JSON, no markdown, no prose.";

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// One provider call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub request_id: String,
    pub prompt: String,
    pub model: String,
    /// Ceiling for the whole HTTP exchange, already clamped to the remaining
    /// total deadline.
    pub call_timeout: Duration,
}

/// Usage metadata reported by a provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMeta {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: u64,
}

/// Raw reply: either a JSON string (HTTP content) or a decoded object.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub raw: Value,
    pub usage: UsageMeta,
}

/// Provider capability. Implementations may suspend internally; the
/// transport drives them to completion on its own runtime.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderReply, TransportError>;
}

/// HTTP chat-completions provider.
#[derive(Debug)]
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn classify(error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else if error.is_decode() {
            TransportError::Protocol(error.to_string())
        } else {
            TransportError::Network(error.to_string())
        }
    }

    fn extract_content(payload: &Value) -> Result<String, TransportError> {
        let content = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|content| !content.is_empty());
        match content {
            Some(content) => Ok(content.to_string()),
            None => Err(TransportError::SchemaValidate {
                message: "missing choices[0].message.content".to_string(),
                raw_snippet: crate::llm::parse::sanitize_raw_snippet(payload),
            }),
        }
    }
}

#[async_trait]
impl ChatProvider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderReply, TransportError> {
        let started = Instant::now();
        let messages = vec![
            ChatMessage {
                role: Role::System,
                content: STRICT_SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: Role::User,
                content: request.prompt.clone(),
            },
        ];
        let payload = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "temperature": 0,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(request.call_timeout)
            .json(&payload)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()));
        }
        let body: Value = response.json().await.map_err(Self::classify)?;
        let content = Self::extract_content(&body)?;

        let usage = body.get("usage").cloned().unwrap_or(Value::Null);
        Ok(ProviderReply {
            raw: Value::String(content),
            usage: UsageMeta {
                provider: self.name().to_string(),
                model: request.model.clone(),
                prompt_tokens: usage
                    .get("prompt_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                completion_tokens: usage
                    .get("completion_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                latency_ms: started.elapsed().as_millis() as u64,
            },
        })
    }
}

/// Deterministic in-process provider selected when `env=test`.
///
/// Selection prompts are answered by keyword-matching the player input
/// against the visible choices carried in the prompt context; narration
/// prompts get a fixed schema-valid reply. Failure toggles let tests drive
/// the retry and error paths.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    pub generate_calls: AtomicU32,
    pub fail_generate: AtomicBool,
    pub invalid_generate_once: AtomicBool,
}

const SELECTION_KEYWORDS: [&str; 5] = ["study", "work", "rest", "date", "gift"];
const NOISE_MARKERS: [&str; 2] = ["nonsense", "???"];

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn prompt_context(prompt: &str) -> Option<Value> {
        let raw = prompt.split("Context: ").nth(1)?.trim();
        serde_json::from_str(raw).ok()
    }

    fn answer_selection(prompt: &str) -> Value {
        let context = Self::prompt_context(prompt).unwrap_or(Value::Null);
        let player_input = context
            .get("player_input")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();
        let visible = context
            .get("visible_choices")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let noisy = NOISE_MARKERS.iter().any(|m| player_input.contains(m));
        let mut selected: Option<String> = None;
        if !noisy {
            // Keyword pass first, then a plain display-text containment pass.
            'keywords: for keyword in SELECTION_KEYWORDS {
                if !player_input.contains(keyword) {
                    continue;
                }
                for choice in &visible {
                    let text = choice
                        .get("display_text")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_lowercase();
                    if text.contains(keyword) {
                        selected = choice
                            .get("choice_id")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        break 'keywords;
                    }
                }
            }
            if selected.is_none() {
                for choice in &visible {
                    let text = choice
                        .get("display_text")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_lowercase();
                    if !text.is_empty() && player_input.contains(&text) {
                        selected = choice
                            .get("choice_id")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        break;
                    }
                }
            }
        }

        match selected {
            Some(choice_id) => serde_json::json!({
                "choice_id": choice_id,
                "use_fallback": false,
                "confidence": 0.8,
                "intent_id": null,
                "notes": "scripted_selector_match",
            }),
            None => serde_json::json!({
                "choice_id": null,
                "use_fallback": true,
                "confidence": 0.0,
                "intent_id": null,
                "notes": "scripted_selector_no_match",
            }),
        }
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderReply, TransportError> {
        let started = Instant::now();
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_generate.load(Ordering::SeqCst) {
            return Err(TransportError::Network("scripted generate failure".into()));
        }

        let prompt_lower = request.prompt.to_lowercase();
        let raw = if self.invalid_generate_once.swap(false, Ordering::SeqCst) {
            serde_json::json!({"narrative": "bad schema"})
        } else if prompt_lower.contains("story selection task") {
            Self::answer_selection(&request.prompt)
        } else {
            serde_json::json!({
                "narrative_text": "You follow through, and the moment settles around your decision. A small shift in the evening air hints at what comes next.",
            })
        };

        Ok(ProviderReply {
            raw,
            usage: UsageMeta {
                provider: self.name().to_string(),
                model: request.model.clone(),
                prompt_tokens: (request.prompt.len() / 4).max(1) as u64,
                completion_tokens: 64,
                latency_ms: started.elapsed().as_millis() as u64,
            },
        })
    }
}
