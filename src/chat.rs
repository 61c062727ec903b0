//! Chat turn orchestration.
//!
//! `ChatSession` owns the conversation and the loaded document context and
//! turns one user prompt into one backend call. `SharedChat` hands the
//! session to background tasks one turn at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, GenerationOptions};
use crate::error::{LlamaDeskError, Result};
use crate::llm::{prompts, ChatRequest, ModelBackend};
use crate::memory::{ContextHolder, ConversationHistory, Message};

/// A completed turn as shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub text: String,
    pub elapsed: Duration,
}

pub struct ChatSession {
    backend: Arc<dyn ModelBackend>,
    model: String,
    system_prompt: String,
    options: GenerationOptions,
    history: ConversationHistory,
    context: ContextHolder,
}

impl ChatSession {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            system_prompt: system_prompt.into(),
            options,
            history: ConversationHistory::new(),
            context: ContextHolder::new(),
        }
    }

    /// Session using the prompt and generation options from `config`.
    pub fn from_config(backend: Arc<dyn ModelBackend>, model: &str, config: &Config) -> Self {
        Self::new(
            backend,
            model,
            config.system_prompt.clone(),
            config.generation.clone(),
        )
    }

    /// Send one prompt and record the reply.
    ///
    /// The composed prompt (with any context stuffed in) is what lands in
    /// history. On backend failure the user message stays and no assistant
    /// message is added.
    pub async fn send(&mut self, user_text: &str) -> Result<ChatResponse> {
        let started = Instant::now();

        let first_turn = self.history.is_empty();
        let final_prompt = prompts::compose_prompt(self.context.get(), user_text);
        self.history.add_user_message(final_prompt);

        let request = self.build_request();
        debug!(
            model = %self.model,
            messages = request.messages.len(),
            context_loaded = self.context.is_loaded(),
            first_turn,
            "sending chat request"
        );

        let reply = match self.backend.chat(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(model = %self.model, backend = self.backend.name(), error = %e, "chat request failed");
                return Err(LlamaDeskError::Backend {
                    model: self.model.clone(),
                    source: Box::new(e),
                });
            }
        };

        let text = reply.into_text();
        self.history.add_assistant_message(text.clone());

        let elapsed = started.elapsed();
        info!(
            model = %self.model,
            reply_len = text.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            history = self.history.len(),
            "chat turn completed"
        );

        Ok(ChatResponse { text, elapsed })
    }

    fn build_request(&self) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            messages: self
                .history
                .iter()
                .map(|m| Message::new(m.role.for_backend(), m.content.clone()))
                .collect(),
            options: self.options.clone(),
        }
    }

    /// Replace the reference text stuffed into subsequent prompts.
    pub fn set_context(&mut self, text: impl Into<String>) {
        let text = text.into();
        info!(chars = text.chars().count(), "context replaced");
        self.context.set(text);
    }

    pub fn context(&self) -> Option<&str> {
        self.context.get()
    }

    pub fn context_loaded(&self) -> bool {
        self.context.is_loaded()
    }

    /// Forget the conversation and any loaded document context.
    pub fn clear_history(&mut self) {
        self.history.clear();
        self.context.clear();
        info!("history and context cleared");
    }

    /// Snapshot of the conversation.
    pub fn history(&self) -> Vec<Message> {
        self.history.messages()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Cloneable handle allowing at most one chat turn in flight.
#[derive(Clone)]
pub struct SharedChat {
    inner: Arc<Mutex<ChatSession>>,
}

impl SharedChat {
    pub fn new(session: ChatSession) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Run `send` on a background task.
    ///
    /// Fails with `Busy` while a previous turn still holds the session.
    pub fn spawn_send(&self, user_text: String) -> Result<JoinHandle<Result<ChatResponse>>> {
        let mut session = self
            .inner
            .clone()
            .try_lock_owned()
            .map_err(|_| LlamaDeskError::Busy)?;

        Ok(tokio::spawn(async move { session.send(&user_text).await }))
    }

    /// Run a closure against the session between turns.
    pub fn with_session<T>(&self, f: impl FnOnce(&mut ChatSession) -> T) -> Result<T> {
        let mut session = self.inner.try_lock().map_err(|_| LlamaDeskError::Busy)?;
        Ok(f(&mut session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatReply;
    use crate::memory::Role;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend answering from a script and recording every request.
    struct ScriptedBackend {
        replies: StdMutex<Vec<Result<ChatReply>>>,
        requests: StdMutex<Vec<ChatRequest>>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<ChatReply>>) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(replies),
                requests: StdMutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn always(text: &str) -> Arc<Self> {
            Self::new((0..16).map(|_| Ok(ChatReply::text(text))).collect())
        }

        fn last_request(&self) -> ChatRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl ModelBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn list_models(&self) -> Result<Vec<String>> {
            Ok(vec!["test-model".into()])
        }
        async fn chat(&self, request: &ChatRequest) -> Result<ChatReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                Ok(ChatReply::default())
            } else {
                replies.remove(0)
            }
        }
    }

    fn session(backend: Arc<ScriptedBackend>) -> ChatSession {
        ChatSession::new(backend, "test-model", "be brief", GenerationOptions::default())
    }

    #[tokio::test]
    async fn first_turn_records_both_messages() {
        let backend = ScriptedBackend::always("hello");
        let mut chat = session(backend);

        let response = chat.send("hi").await.unwrap();
        assert_eq!(response.text, "hello");
        assert_eq!(
            chat.history(),
            vec![
                Message::new(Role::User, "hi"),
                Message::new(Role::Assistant, "hello"),
            ]
        );
    }

    #[tokio::test]
    async fn history_grows_by_two_per_turn() {
        let backend = ScriptedBackend::always("Mock response");
        let mut chat = session(backend.clone());

        chat.send("First message").await.unwrap();
        chat.send("Second message").await.unwrap();
        assert_eq!(chat.history_len(), 4);

        let request = backend.last_request();
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[2].content, "Second message");
    }

    #[tokio::test]
    async fn stores_raw_prompt_without_context() {
        let mut chat = session(ScriptedBackend::always("ok"));
        chat.send("X").await.unwrap();

        let user: Vec<_> = chat.history().into_iter().filter(|m| m.role == Role::User).collect();
        assert_eq!(user, vec![Message::new(Role::User, "X")]);
    }

    #[tokio::test]
    async fn stores_composed_prompt_with_context() {
        let backend = ScriptedBackend::always("ok");
        let mut chat = session(backend.clone());
        chat.set_context("C");
        chat.send("X").await.unwrap();

        let history = chat.history();
        assert_eq!(history[0], Message::new(Role::User, "Context:\nC\n\nUser Question:\nX"));
        assert_eq!(
            backend.last_request().messages[0].content,
            "Context:\nC\n\nUser Question:\nX"
        );
    }

    #[tokio::test]
    async fn blank_context_is_not_stuffed() {
        let mut chat = session(ScriptedBackend::always("ok"));
        chat.set_context("");
        chat.send("X").await.unwrap();
        assert_eq!(chat.history()[0].content, "X");
    }

    #[tokio::test]
    async fn request_carries_model_prompt_and_options() {
        let backend = ScriptedBackend::always("ok");
        let mut chat = session(backend.clone());
        chat.send("hi").await.unwrap();

        let request = backend.last_request();
        assert_eq!(request.model, "test-model");
        assert_eq!(request.system_prompt, "be brief");
        assert_eq!(request.options, GenerationOptions::default());
    }

    #[tokio::test]
    async fn missing_reply_becomes_empty_string() {
        let backend = ScriptedBackend::new(vec![Ok(ChatReply { content: None })]);
        let mut chat = session(backend);

        let response = chat.send("").await.unwrap();
        assert_eq!(response.text, "");
        assert_eq!(chat.history()[1], Message::new(Role::Assistant, ""));
    }

    #[tokio::test]
    async fn backend_failure_keeps_user_message_only() {
        let backend = ScriptedBackend::new(vec![Err(LlamaDeskError::Llm("connection refused".into()))]);
        let mut chat = session(backend);

        let err = chat.send("hi").await.unwrap_err();
        match err {
            LlamaDeskError::Backend { model, source } => {
                assert_eq!(model, "test-model");
                assert!(source.to_string().contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(chat.history(), vec![Message::new(Role::User, "hi")]);
    }

    #[tokio::test]
    async fn retry_after_failure_replays_unanswered_prompt() {
        let backend = ScriptedBackend::new(vec![
            Err(LlamaDeskError::Llm("timeout".into())),
            Ok(ChatReply::text("finally")),
        ]);
        let mut chat = session(backend.clone());

        assert!(chat.send("hi").await.is_err());
        chat.send("hi").await.unwrap();

        assert_eq!(chat.history_len(), 3);
        assert_eq!(backend.last_request().messages.len(), 2);
    }

    #[tokio::test]
    async fn clear_history_drops_messages_and_context() {
        let mut chat = session(ScriptedBackend::always("ok"));
        chat.set_context("document text");
        chat.send("hi").await.unwrap();

        chat.clear_history();
        assert_eq!(chat.history_len(), 0);
        assert_eq!(chat.context(), None);

        chat.clear_history();
        assert_eq!(chat.history_len(), 0);
        assert_eq!(chat.context(), None);
    }

    #[tokio::test]
    async fn shared_chat_rejects_concurrent_send() {
        let backend = ScriptedBackend::always("ok");
        let shared = SharedChat::new(session(backend.clone()));

        // Hold the session as an in-flight turn would.
        let guard = shared.inner.clone().try_lock_owned().unwrap();
        assert!(matches!(shared.spawn_send("hi".into()), Err(LlamaDeskError::Busy)));
        assert!(matches!(shared.with_session(|s| s.history_len()), Err(LlamaDeskError::Busy)));
        drop(guard);

        let response = shared.spawn_send("hi".into()).unwrap().await.unwrap().unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(shared.with_session(|s| s.history_len()).unwrap(), 2);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }
}
