mod chat;
mod config;
mod document;
mod error;
mod llm;
mod memory;
mod server;
mod shell;

use std::path::PathBuf;
use std::sync::Arc;
#[cfg(unix)]
use std::task::Poll;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chat::{ChatSession, SharedChat};
use crate::config::Config;
use crate::llm::{ModelBackend, OllamaEngine};
use crate::server::ServerSupervisor;
use crate::shell::{Shell, ShellStatus};

#[tokio::main]
async fn main() {
    // Load .env file (if present) before anything reads env vars
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    if args.iter().any(|a| a == "--default-config") {
        print!("{}", Config::default_config_contents());
        return;
    }

    // Initialize tracing on stderr so it stays out of the chat transcript
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load config
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load config: {e}");
            return;
        }
    };

    let engine = match OllamaEngine::new(&config) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!("failed to initialize Ollama engine: {e}");
            return;
        }
    };

    // Handle --check
    if args.iter().any(|a| a == "--check") {
        run_checks(&config, &engine).await;
        return;
    }

    info!(
        model = %engine.model(),
        server_bin = %config.server.bin,
        "llama-desk starting"
    );

    let backend: Arc<dyn ModelBackend> = engine.clone();
    let chat = SharedChat::new(ChatSession::from_config(backend, engine.model(), &config));

    // Server supervision runs on its own task; the supervisor is handed back
    // when it finishes so shutdown can stop what it spawned.
    let (status_tx, status_rx) = watch::channel(ShellStatus::Initializing);
    let startup = {
        let mut supervisor = ServerSupervisor::from_config(&config.server);
        let probe = engine.clone();
        tokio::spawn(async move {
            let result = supervisor
                .ensure_running(probe.as_ref(), |s| {
                    status_tx.send_replace(ShellStatus::from(s));
                })
                .await;
            if let Err(e) = result {
                error!("failed to bring up model server: {e}");
                status_tx.send_replace(ShellStatus::Error(e.to_string()));
            }
            supervisor
        })
    };

    let shell = Shell::new(chat, status_rx).with_request_timeout(config.timeout_secs);

    tokio::select! {
        result = shell.run() => {
            if let Err(e) = result {
                error!("shell error: {e}");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping...");
        }
    }

    stop_server(startup).await;

    info!("llama-desk stopped");

    // Stdin is read on a blocking thread that would otherwise hold the
    // runtime open until the next newline.
    std::process::exit(0);
}

/// Stop the server the startup task spawned, if any.
///
/// A finished task hands back its supervisor for a graceful stop. An
/// unfinished one is aborted and the supervisor's `Drop` kills the child.
async fn stop_server(startup: JoinHandle<ServerSupervisor>) {
    if startup.is_finished() {
        match startup.await {
            Ok(mut supervisor) => {
                debug!(state = ?supervisor.state(), pid = ?supervisor.pid(), "stopping model server");
                supervisor.stop().await;
            }
            Err(e) => warn!("server startup task failed: {e}"),
        }
    } else {
        startup.abort();
        let _ = startup.await;
    }
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM, SIGHUP or SIGQUIT.
///
/// A closed terminal sends SIGHUP; without a handler the process would die
/// before the server in its own process group is stopped.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl+c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = termination_signal(&[
        SignalKind::terminate(),
        SignalKind::hangup(),
        SignalKind::quit(),
    ]);

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Register handlers for `kinds` immediately; the returned future resolves
/// when any of them is delivered. Kinds that cannot be registered are skipped.
#[cfg(unix)]
fn termination_signal(kinds: &[SignalKind]) -> impl Future<Output = ()> + use<> {
    let mut listeners = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        match signal(kind) {
            Ok(listener) => listeners.push(listener),
            Err(e) => warn!(signal = kind.as_raw_value(), "failed to listen for signal: {e}"),
        }
    }

    std::future::poll_fn(move |cx| {
        if listeners.iter_mut().any(|l| l.poll_recv(cx).is_ready()) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    })
}

async fn run_checks(config: &Config, engine: &OllamaEngine) {
    info!("running pre-flight checks...");

    info!("config: OK");
    info!("  model: {}", engine.model());
    info!("  ollama_host: {}", config.ollama_host);
    info!("  server_bin: {}", config.server.bin);

    // Check the server binary is reachable
    match tokio::process::Command::new(&config.server.bin)
        .arg("--version")
        .output()
        .await
    {
        Ok(out) if out.status.success() => {
            let ver = String::from_utf8_lossy(&out.stdout);
            info!("server binary: OK ({})", ver.trim());
        }
        Ok(out) => {
            error!("server binary: exited with {}", out.status);
        }
        Err(e) => {
            error!("server binary: NOT FOUND ({}): {e}", config.server.bin);
        }
    }

    match engine.list_models().await {
        Ok(models) => {
            info!("server: OK ({} models)", models.len());
            if models.iter().any(|m| m == engine.model()) {
                info!("  model {} is available", engine.model());
            } else {
                warn!("  model {} is not pulled (available: [{}])", engine.model(), models.join(", "));
            }
        }
        Err(e) => {
            warn!("server: not reachable ({e}); it will be started on launch");
        }
    }
}

fn print_usage() {
    println!(
        "llama-desk — chat with a local Ollama model

USAGE:
    llama-desk [OPTIONS]

OPTIONS:
    --config <PATH>     Path to config file (default: ~/.config/llama-desk/config.toml)
    --default-config    Print default config to stdout and exit
    --check             Validate config and server connectivity, then exit
    -h, --help          Print this help message

ENVIRONMENT:
    OLLAMA_HOST         Ollama API base URL (default: http://localhost:11434)
    OLLAMA_MODEL        Model name (default: phi3.5:latest)
    OLLAMA_BIN          Server binary started when none is running (default: ollama)
    RUST_LOG            Log filter (default: info)

COMMANDS (inside the chat):
    /pdf <path>         Load a PDF as context
    /clear              Clear the conversation and loaded context
    /status             Show model and history details
    /history            List the conversation so far
    /quit               Exit and stop the server if it was started here"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::HealthProbe;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Down on the first check, up once something has been spawned.
    struct UpAfterSpawn(AtomicUsize);

    #[async_trait::async_trait]
    impl HealthProbe for UpAfterSpawn {
        async fn probe(&self) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst) > 0
        }
    }

    fn sleep_server() -> ServerConfig {
        ServerConfig {
            bin: "sleep".into(),
            args: vec!["30".into()],
            probe_attempts: 3,
            probe_interval_ms: 10,
            startup_grace_ms: 0,
            stop_grace_secs: 2,
            sweep_lingering: false,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hangup_stops_spawned_server() {
        let (pid_tx, pid_rx) = tokio::sync::oneshot::channel();
        let startup = tokio::spawn(async move {
            let mut supervisor = ServerSupervisor::new(sleep_server());
            let probe = UpAfterSpawn(AtomicUsize::new(0));
            supervisor.ensure_running(&probe, |_| {}).await.unwrap();
            let _ = pid_tx.send(supervisor.pid());
            supervisor
        });
        let pid = pid_rx.await.unwrap().unwrap() as i32;
        while !startup.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(unsafe { libc::kill(pid, 0) }, 0);

        let hangup = termination_signal(&[SignalKind::hangup()]);
        unsafe {
            libc::raise(libc::SIGHUP);
        }
        tokio::time::timeout(Duration::from_secs(5), hangup)
            .await
            .expect("SIGHUP was not delivered");

        stop_server(startup).await;

        // The child has been reaped, so the pid no longer exists.
        assert_ne!(unsafe { libc::kill(pid, 0) }, 0);
    }

    #[tokio::test]
    async fn stop_server_with_nothing_spawned_is_noop() {
        let startup = tokio::spawn(async { ServerSupervisor::new(sleep_server()) });
        while !startup.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop_server(startup).await;
    }
}
