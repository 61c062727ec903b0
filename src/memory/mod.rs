pub mod context;
pub mod conversation;

pub use context::ContextHolder;
pub use conversation::{ConversationHistory, Message, Role};
