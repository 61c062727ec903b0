use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{LlamaDeskError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Model to chat with (e.g. "phi3.5:latest", "llama3.1:8b").
    /// Can be overridden with the `OLLAMA_MODEL` env var.
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of the Ollama HTTP API.
    /// Can be overridden with the `OLLAMA_HOST` env var.
    #[serde(default = "default_ollama_host")]
    pub ollama_host: String,

    /// HTTP request timeout in seconds (0 = no timeout).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Instruction sent as the system message of every chat request.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub generation: GenerationOptions,
}

// -- Server supervision ------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Path to the `ollama` binary (default: "ollama").
    /// Can be overridden with the `OLLAMA_BIN` env var.
    #[serde(default = "default_server_bin")]
    pub bin: String,

    /// Arguments passed to the server binary.
    #[serde(default = "default_server_args")]
    pub args: Vec<String>,

    /// Health probes issued after spawning before giving up.
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,

    /// Delay before each post-spawn health probe, in milliseconds.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// How long a freshly spawned server must stay alive before polling starts.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    /// Seconds to wait after a graceful termination request before killing.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// Kill any same-named process left behind after stopping the server.
    #[serde(default = "default_sweep_lingering")]
    pub sweep_lingering: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bin: default_server_bin(),
            args: default_server_args(),
            probe_attempts: default_probe_attempts(),
            probe_interval_ms: default_probe_interval_ms(),
            startup_grace_ms: default_startup_grace_ms(),
            stop_grace_secs: default_stop_grace_secs(),
            sweep_lingering: default_sweep_lingering(),
        }
    }
}

// -- Generation options ------------------------------------------------------

/// Sampling and context options attached to every chat call.
///
/// Field names match the Ollama `options` object so the record is sent as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
    #[serde(default = "default_num_batch")]
    pub num_batch: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    /// Maximum number of tokens generated per reply.
    #[serde(default = "default_num_predict")]
    pub num_predict: u32,
    #[serde(default = "default_num_keep")]
    pub num_keep: u32,
    #[serde(default = "default_stop")]
    pub stop: Vec<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            num_ctx: default_num_ctx(),
            num_batch: default_num_batch(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            num_predict: default_num_predict(),
            num_keep: default_num_keep(),
            stop: default_stop(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            ollama_host: default_ollama_host(),
            timeout_secs: default_timeout_secs(),
            system_prompt: default_system_prompt(),
            server: ServerConfig::default(),
            generation: GenerationOptions::default(),
        }
    }
}

fn default_model() -> String {
    "phi3.5:latest".to_string()
}
fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_system_prompt() -> String {
    crate::llm::prompts::DEFAULT_SYSTEM_PROMPT.to_string()
}
fn default_server_bin() -> String {
    "ollama".to_string()
}
fn default_server_args() -> Vec<String> {
    vec!["serve".to_string()]
}
fn default_probe_attempts() -> u32 {
    5
}
fn default_probe_interval_ms() -> u64 {
    1000
}
fn default_startup_grace_ms() -> u64 {
    2000
}
fn default_stop_grace_secs() -> u64 {
    3
}
fn default_sweep_lingering() -> bool {
    true
}
fn default_num_ctx() -> u32 {
    16384
}
fn default_num_batch() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.3
}
fn default_top_k() -> u32 {
    40
}
fn default_top_p() -> f32 {
    0.9
}
fn default_repeat_penalty() -> f32 {
    1.1
}
fn default_num_predict() -> u32 {
    512
}
fn default_num_keep() -> u32 {
    16384
}
fn default_stop() -> Vec<String> {
    ["User:", "System:", "Assistant:", "-----"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    /// Load config from the given path, or the default XDG config location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path(),
        };

        let config = if config_path.exists() {
            info!("loading config from {}", config_path.display());
            let contents = std::fs::read_to_string(&config_path).map_err(LlamaDeskError::Io)?;
            toml::from_str(&contents)
                .map_err(|e| LlamaDeskError::Config(format!("parse error: {e}")))?
        } else {
            info!("no config file found, using defaults");
            Config::default()
        };

        Ok(config)
    }

    /// Returns the default config file path: `$XDG_CONFIG_HOME/llama-desk/config.toml`
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("llama-desk")
            .join("config.toml")
    }

    /// Generate the default config file contents.
    pub fn default_config_contents() -> &'static str {
        include_str!("../config.example.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let c = Config::default();
        assert_eq!(c.model, "phi3.5:latest");
        assert_eq!(c.ollama_host, "http://localhost:11434");
        assert_eq!(c.timeout_secs, 120);
        assert!(c.system_prompt.starts_with("You are a helpful AI assistant."));
    }

    #[test]
    fn default_server_config() {
        let s = ServerConfig::default();
        assert_eq!(s.bin, "ollama");
        assert_eq!(s.args, vec!["serve"]);
        assert_eq!(s.probe_attempts, 5);
        assert_eq!(s.probe_interval_ms, 1000);
        assert_eq!(s.startup_grace_ms, 2000);
        assert_eq!(s.stop_grace_secs, 3);
        assert!(s.sweep_lingering);
    }

    #[test]
    fn default_generation_options() {
        let g = GenerationOptions::default();
        assert_eq!(g.num_ctx, 16384);
        assert_eq!(g.num_batch, 2048);
        assert!((g.temperature - 0.3).abs() < 0.001);
        assert_eq!(g.top_k, 40);
        assert!((g.top_p - 0.9).abs() < 0.001);
        assert!((g.repeat_penalty - 1.1).abs() < 0.001);
        assert_eq!(g.num_predict, 512);
        assert_eq!(g.num_keep, 16384);
        assert_eq!(g.stop, vec!["User:", "System:", "Assistant:", "-----"]);
    }

    #[test]
    fn parse_minimal_toml() {
        let c: Config = toml::from_str(r#"model = "llama3.1:8b""#).unwrap();
        assert_eq!(c.model, "llama3.1:8b");
        assert_eq!(c.server.probe_attempts, 5);
        assert_eq!(c.generation, GenerationOptions::default());
    }

    #[test]
    fn parse_server_and_generation_sections() {
        let toml_str = r#"
        [server]
        bin = "/opt/ollama/bin/ollama"
        probe_attempts = 10
        sweep_lingering = false

        [generation]
        temperature = 0.7
        num_predict = 1024
        stop = ["<|end|>"]
        "#;
        let c: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(c.server.bin, "/opt/ollama/bin/ollama");
        assert_eq!(c.server.args, vec!["serve"]);
        assert_eq!(c.server.probe_attempts, 10);
        assert!(!c.server.sweep_lingering);
        assert!((c.generation.temperature - 0.7).abs() < 0.001);
        assert_eq!(c.generation.num_predict, 1024);
        assert_eq!(c.generation.num_ctx, 16384);
        assert_eq!(c.generation.stop, vec!["<|end|>"]);
    }

    #[test]
    fn example_config_parses_to_defaults() {
        let c: Config = toml::from_str(Config::default_config_contents()).unwrap();
        assert_eq!(c.model, Config::default().model);
        assert_eq!(c.server.bin, "ollama");
        assert_eq!(c.generation, GenerationOptions::default());
    }

    #[test]
    fn load_nonexistent_returns_defaults() {
        let c = Config::load(Some(Path::new("/tmp/nonexistent-llama-desk-test.toml"))).unwrap();
        assert_eq!(c.model, "phi3.5:latest");
    }

    #[test]
    fn load_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid %%% toml").unwrap();
        let result = Config::load(Some(&path));
        assert!(matches!(result, Err(LlamaDeskError::Config(_))));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "timeout_secs = 30\n[server]\nargs = [\"serve\", \"--verbose\"]\n").unwrap();
        let c = Config::load(Some(&path)).unwrap();
        assert_eq!(c.timeout_secs, 30);
        assert_eq!(c.server.args, vec!["serve", "--verbose"]);
    }

    #[test]
    fn default_config_path_has_app_name() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("llama-desk"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }
}
