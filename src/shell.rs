//! Line-oriented terminal front end.
//!
//! Plain lines are chat prompts; `/clear`, `/pdf <path>`, `/status`,
//! `/history`, `/help` and `/quit` are commands. Server startup runs on its own task and
//! reports through a `watch` channel; each prompt runs on a background task
//! via `SharedChat`, so input stays responsive while the model thinks.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::chat::{ChatResponse, SharedChat};
use crate::document;
use crate::error::{LlamaDeskError, Result};
use crate::memory::{Message, Role};
use crate::server::ServerStatus;

const THINKING_TICK: Duration = Duration::from_millis(100);
const TRANSCRIPT_WIDTH: usize = 72;

/// Status line states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellStatus {
    Initializing,
    Checking,
    Starting,
    Waiting,
    Connected,
    Error(String),
    PdfLoaded(String),
}

impl ShellStatus {
    /// Whether prompts may be sent.
    pub fn is_ready(&self) -> bool {
        matches!(self, ShellStatus::Connected | ShellStatus::PdfLoaded(_))
    }
}

impl From<ServerStatus> for ShellStatus {
    fn from(status: ServerStatus) -> Self {
        match status {
            ServerStatus::Checking => ShellStatus::Checking,
            ServerStatus::Starting => ShellStatus::Starting,
            ServerStatus::Waiting => ShellStatus::Waiting,
            ServerStatus::Running | ServerStatus::Connected => ShellStatus::Connected,
        }
    }
}

impl std::fmt::Display for ShellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellStatus::Initializing => f.write_str("Initializing..."),
            ShellStatus::Checking => f.write_str("Checking Ollama..."),
            ShellStatus::Starting => f.write_str("Starting Ollama server..."),
            ShellStatus::Waiting => f.write_str("Waiting for server..."),
            ShellStatus::Connected => f.write_str("Connected"),
            ShellStatus::Error(msg) => write!(f, "Connection failed: {msg}"),
            ShellStatus::PdfLoaded(name) => write!(f, "PDF Loaded: {name}"),
        }
    }
}

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Send(String),
    Clear,
    LoadPdf(PathBuf),
    Status,
    History,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

pub fn parse_line(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Input::Send(trimmed.to_string());
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };

    match name {
        "clear" => Input::Clear,
        "pdf" | "load" if !arg.is_empty() => Input::LoadPdf(PathBuf::from(arg)),
        "status" => Input::Status,
        "history" => Input::History,
        "help" | "?" => Input::Help,
        "quit" | "exit" | "q" => Input::Quit,
        _ => Input::Unknown(trimmed.to_string()),
    }
}

pub struct Shell {
    chat: SharedChat,
    server_status: watch::Receiver<ShellStatus>,
    /// Last status reported by server startup.
    server: ShellStatus,
    loaded_pdf: Option<String>,
    request_timeout_secs: u64,
    pending: Option<JoinHandle<Result<ChatResponse>>>,
    thinking_since: Option<Instant>,
}

impl Shell {
    pub fn new(chat: SharedChat, mut server_status: watch::Receiver<ShellStatus>) -> Self {
        let server = server_status.borrow_and_update().clone();
        Self {
            chat,
            server_status,
            server,
            loaded_pdf: None,
            request_timeout_secs: 0,
            pending: None,
            thinking_since: None,
        }
    }

    /// Request timeout shown by `/status`; 0 means none.
    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    fn connected(&self) -> bool {
        self.server.is_ready()
    }

    fn status(&self) -> ShellStatus {
        displayed_status(&self.server, self.loaded_pdf.as_deref())
    }

    /// Read stdin until `/quit` or end of input.
    pub async fn run(mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut server_open = true;

        let mut ticker = tokio::time::interval(THINKING_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let model = self.chat.with_session(|s| s.model().to_string())?;
        println!("llama-desk - model: {model}");
        println!("Type a message, or /help for commands.");
        self.print_status();

        loop {
            tokio::select! {
                changed = self.server_status.changed(), if server_open => {
                    if changed.is_err() {
                        server_open = false;
                        continue;
                    }
                    let next = self.server_status.borrow_and_update().clone();
                    if next == ShellStatus::Connected && !self.connected() {
                        println!("System: Ready with {model}");
                    }
                    self.server = next;
                    self.print_status();
                }
                Some(joined) = join_pending(&mut self.pending), if self.pending.is_some() => {
                    self.pending = None;
                    self.thinking_since = None;
                    match joined {
                        Ok(Ok(response)) => print_reply(&response),
                        Ok(Err(e)) => println!("\nError: {e}"),
                        Err(e) => {
                            warn!(error = %e, "chat task failed");
                            println!("\nError: chat task failed: {e}");
                        }
                    }
                }
                _ = ticker.tick(), if self.thinking_since.is_some() => {
                    if let Some(since) = self.thinking_since {
                        print!("\r{}", thinking_line(since.elapsed()));
                        let _ = std::io::stdout().flush();
                    }
                }
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        debug!("stdin closed");
                        break;
                    };
                    if !self.handle(parse_line(&line)).await {
                        break;
                    }
                }
            }
        }

        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        Ok(())
    }

    /// Returns false when the shell should exit.
    async fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Empty => {}
            Input::Quit => return false,
            Input::Help => print_help(),
            Input::Unknown(cmd) => println!("Unknown command: {cmd} (try /help)"),
            Input::Status => self.print_summary(),
            Input::History => self.print_history(),
            Input::Send(text) => self.send(text),
            Input::Clear => match self.chat.with_session(|s| s.clear_history()) {
                Ok(()) => {
                    self.loaded_pdf = None;
                    println!("System: Chat cleared");
                    self.print_status();
                }
                Err(e) => println!("Error: {e}"),
            },
            Input::LoadPdf(path) => self.load_pdf(path).await,
        }
        true
    }

    fn send(&mut self, text: String) {
        if !self.connected() {
            println!("System: not connected yet ({})", self.status());
            return;
        }
        match self.chat.spawn_send(text) {
            Ok(handle) => {
                print!("{}", thinking_line(Duration::ZERO));
                let _ = std::io::stdout().flush();
                self.pending = Some(handle);
                self.thinking_since = Some(Instant::now());
            }
            Err(LlamaDeskError::Busy) => println!("System: still waiting for the previous reply"),
            Err(e) => println!("Error: {e}"),
        }
    }

    async fn load_pdf(&mut self, path: PathBuf) {
        let name = document::display_name(&path);
        let extracted = tokio::task::spawn_blocking(move || document::extract_text(&path))
            .await
            .map_err(|e| LlamaDeskError::Document(format!("extraction task failed: {e}")))
            .and_then(|r| r);

        let text = match extracted {
            Ok(text) => text,
            Err(e) => {
                println!("Error: Failed to read PDF: {e}");
                return;
            }
        };

        match self.chat.with_session(|s| s.set_context(text)) {
            Ok(()) => {
                self.loaded_pdf = Some(name.clone());
                println!("System: Context loaded from {name}");
                self.print_status();
            }
            Err(e) => println!("Error: {e}"),
        }
    }

    fn print_status(&self) {
        println!("[{}]", self.status());
    }

    fn print_summary(&self) {
        match self.chat.with_session(|s| {
            (
                s.model().to_string(),
                s.context_loaded(),
                s.context().map_or(0, |c| c.chars().count()),
                s.history_len(),
            )
        }) {
            Ok((model, context_loaded, context_chars, history)) => {
                println!("Model: {model}");
                println!("Status: {}", self.status());
                if self.request_timeout_secs > 0 {
                    println!("Timeout: {}s", self.request_timeout_secs);
                } else {
                    println!("Timeout: none");
                }
                if context_loaded {
                    println!("Context Loaded: true ({context_chars} chars)");
                } else {
                    println!("Context Loaded: false");
                }
                println!("History Size: {history}");
            }
            Err(e) => println!("Error: {e}"),
        }
    }

    fn print_history(&self) {
        match self.chat.with_session(|s| s.history()) {
            Ok(history) if history.is_empty() => println!("System: No messages yet"),
            Ok(history) => {
                for message in &history {
                    println!("{}", transcript_line(message));
                }
            }
            Err(e) => println!("Error: {e}"),
        }
    }
}

/// Status line text: a held PDF is shown once the server is connected.
fn displayed_status(server: &ShellStatus, loaded_pdf: Option<&str>) -> ShellStatus {
    match (server, loaded_pdf) {
        (ShellStatus::Connected, Some(name)) => ShellStatus::PdfLoaded(name.to_string()),
        _ => server.clone(),
    }
}

fn thinking_line(elapsed: Duration) -> String {
    format!("[Thinking... {:.1}s]", elapsed.as_secs_f64())
}

/// One history entry, truncated to a single short line.
fn transcript_line(message: &Message) -> String {
    let label = match message.role {
        Role::User => "You",
        Role::Assistant => "Assistant",
        Role::System => "System",
    };
    let first_line = message.content.lines().next().unwrap_or("");
    let mut line: String = first_line.chars().take(TRANSCRIPT_WIDTH).collect();
    if line.len() < message.content.len() {
        line.push_str("...");
    }
    format!("{label}: {line}")
}

async fn join_pending(
    pending: &mut Option<JoinHandle<Result<ChatResponse>>>,
) -> Option<std::result::Result<Result<ChatResponse>, tokio::task::JoinError>> {
    match pending {
        Some(handle) => Some(handle.await),
        None => None,
    }
}

fn print_reply(response: &ChatResponse) {
    println!(
        "\r{}\n\nAssistant ({:.1}s): {}\n",
        thinking_line(response.elapsed),
        response.elapsed.as_secs_f64(),
        response.text
    );
}

fn print_help() {
    println!(
        "Commands:
    /pdf <path>   Load a PDF as context for following questions
    /clear        Clear the conversation and any loaded context
    /status       Show model, status and history size
    /history      List the conversation so far
    /quit         Exit (stops the server if it was started here)"
    );
}
