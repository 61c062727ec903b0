use crate::config::GenerationOptions;
use crate::memory::Message;

/// Everything a backend needs for one chat call.
///
/// `messages` holds the conversation already mapped to backend roles; the
/// backend sends `system_prompt` ahead of them.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub options: GenerationOptions,
}

/// Reply from a backend. `content` is `None` when the response carried no message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    pub content: Option<String>,
}

impl ChatReply {
    #[cfg(test)]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
        }
    }

    /// Reply text, with a missing message read as empty.
    pub fn into_text(self) -> String {
        self.content.unwrap_or_default()
    }
}
