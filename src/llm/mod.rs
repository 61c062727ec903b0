pub mod ollama;
pub mod prompts;
pub mod request;

pub use ollama::OllamaEngine;
pub use request::{ChatReply, ChatRequest};

use crate::error::Result;

// -- Backend trait ----------------------------------------------------------

/// Capability every chat model backend provides.
#[async_trait::async_trait]
pub trait ModelBackend: Send + Sync {
    /// Human-readable name of this backend (e.g. "Ollama API").
    fn name(&self) -> &str;

    /// List the models the backend can serve.
    ///
    /// Cheap enough to double as the server health probe.
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Run one non-streaming chat completion.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatReply>;
}

#[async_trait::async_trait]
impl ModelBackend for OllamaEngine {
    fn name(&self) -> &str {
        "Ollama API"
    }
    async fn list_models(&self) -> Result<Vec<String>> {
        self.list_models().await
    }
    async fn chat(&self, request: &ChatRequest) -> Result<ChatReply> {
        self.chat(request).await
    }
}
