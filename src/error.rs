use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlamaDeskError {
    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The model server could not be spawned or never became healthy.
    #[error("server startup error: {0}")]
    ServerStartup(String),

    /// A chat call failed. The user message stays in history.
    #[error("failed to communicate with model {model}: {source}")]
    Backend {
        model: String,
        #[source]
        source: Box<LlamaDeskError>,
    },

    /// Raised by model backends for transport or protocol failures.
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("document error: {0}")]
    Document(String),

    #[error("a chat request is already in flight")]
    Busy,
}

pub type Result<T> = std::result::Result<T, LlamaDeskError>;
