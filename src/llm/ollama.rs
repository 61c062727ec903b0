use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, GenerationOptions};
use crate::error::{LlamaDeskError, Result};
use crate::llm::request::{ChatReply, ChatRequest};

const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_MODEL: &str = "phi3.5:latest";

/// Chat backend talking to a local or remote Ollama instance.
///
/// Uses the Ollama HTTP API (`POST /api/chat`, `GET /api/tags`).
///
/// Configuration priority (highest -> lowest):
///   1. Environment variables (`OLLAMA_HOST`, `OLLAMA_MODEL`)
///   2. Top-level `model` / `ollama_host` in `config.toml`
///   3. Built-in defaults
pub struct OllamaEngine {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    think: bool,
    options: &'a GenerationOptions,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    message: Option<WireReplyMessage>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct WireReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

impl OllamaEngine {
    pub fn new(config: &Config) -> Result<Self> {
        let base_url = std::env::var("OLLAMA_HOST")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| {
                if config.ollama_host.is_empty() {
                    None
                } else {
                    Some(config.ollama_host.clone())
                }
            })
            .unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string());

        let model = std::env::var("OLLAMA_MODEL")
            .ok()
            .filter(|m| !m.is_empty())
            .or_else(|| {
                if config.model.is_empty() {
                    None
                } else {
                    Some(config.model.clone())
                }
            })
            .unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string());

        let engine = Self::with_endpoint(&base_url, &model, config.timeout_secs)?;

        info!(
            model = %engine.model,
            base_url = %engine.base_url,
            timeout_secs = config.timeout_secs,
            "Ollama engine initialized"
        );

        Ok(engine)
    }

    /// Build an engine for an explicit endpoint, ignoring the environment.
    pub fn with_endpoint(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self> {
        let mut builder = Client::builder();
        if timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(timeout_secs));
        }
        let client = builder
            .build()
            .map_err(|e| LlamaDeskError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    /// The model this engine was configured with.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LlamaDeskError::Llm(format!("Ollama request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(LlamaDeskError::Llm(format!(
                "Ollama API returned {status} for /api/tags"
            )));
        }

        let tags: TagsResponse = resp.json().await.map_err(|e| {
            LlamaDeskError::Llm(format!("failed to parse Ollama model list: {e}"))
        })?;

        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatReply> {
        let url = format!("{}/api/chat", self.base_url);
        let body = wire_request(request);

        debug!(
            model = %request.model,
            messages = body.messages.len(),
            num_predict = request.options.num_predict,
            "invoking Ollama API"
        );

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlamaDeskError::Llm(format!("Ollama request failed: {e}")))?;

        let status = resp.status();

        if !status.is_success() {
            let error_text = api_error_message(&resp.text().await.unwrap_or_default());
            warn!(status = %status, error = %error_text, "Ollama API error");
            return Err(LlamaDeskError::Llm(format!(
                "Ollama API returned {status}: {error_text}"
            )));
        }

        let chat_resp: WireResponse = resp.json().await.map_err(|e| {
            LlamaDeskError::Llm(format!("failed to parse Ollama response: {e}"))
        })?;

        if let (Some(eval_count), Some(eval_duration)) =
            (chat_resp.eval_count, chat_resp.eval_duration)
        {
            let tok_per_sec = if eval_duration > 0 {
                (eval_count as f64 / eval_duration as f64) * 1_000_000_000.0
            } else {
                0.0
            };
            debug!(
                eval_tokens = eval_count,
                prompt_tokens = chat_resp.prompt_eval_count.unwrap_or(0),
                tok_per_sec = format!("{tok_per_sec:.1}"),
                "Ollama usage"
            );
        }

        let content = chat_resp.message.and_then(|m| m.content);

        info!(
            response_len = content.as_deref().map_or(0, str::len),
            model = %request.model,
            "Ollama response received"
        );

        Ok(ChatReply { content })
    }
}

/// Ollama reports failures as `{"error": "..."}`; fall back to the raw body.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// System prompt first, then the conversation in order.
fn wire_request(request: &ChatRequest) -> WireRequest<'_> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    messages.push(WireMessage {
        role: "system",
        content: &request.system_prompt,
    });
    messages.extend(request.messages.iter().map(|m| WireMessage {
        role: m.role.as_str(),
        content: &m.content,
    }));

    WireRequest {
        model: &request.model,
        messages,
        stream: false,
        think: false,
        options: &request.options,
    }
}
