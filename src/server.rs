use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{LlamaDeskError, Result};
use crate::llm::ModelBackend;

/// Cheap reachability check used to decide whether the server is up.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Any model backend is probed by listing its models.
#[async_trait::async_trait]
impl<T: ModelBackend + ?Sized> HealthProbe for T {
    async fn probe(&self) -> bool {
        match self.list_models().await {
            Ok(models) => {
                debug!(backend = self.name(), models = models.len(), "health probe ok");
                true
            }
            Err(e) => {
                debug!(backend = self.name(), error = %e, "health probe failed");
                false
            }
        }
    }
}

/// Lifecycle of the supervised server as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unknown,
    Probing,
    Starting,
    Running,
    Failed,
}

/// Progress reported to the UI while bringing the server up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Checking,
    Running,
    Starting,
    Waiting,
    Connected,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ServerStatus::Checking => "Checking server...",
            ServerStatus::Running => "Server is running",
            ServerStatus::Starting => "Starting server...",
            ServerStatus::Waiting => "Waiting for server...",
            ServerStatus::Connected => "Server connected",
        };
        f.write_str(text)
    }
}

/// Owns the local model server subprocess.
///
/// `ensure_running` reuses a server that already answers probes and only
/// spawns one otherwise. `stop` tears down what this supervisor spawned.
/// Dropping the supervisor kills the child as a last resort.
pub struct ServerSupervisor {
    config: ServerConfig,
    child: Option<Child>,
    state: ServerState,
}

impl ServerSupervisor {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            child: None,
            state: ServerState::Unknown,
        }
    }

    /// Supervisor for `config`, with the binary overridable via `OLLAMA_BIN`.
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut config = config.clone();
        if let Ok(bin) = std::env::var("OLLAMA_BIN") {
            if !bin.is_empty() {
                config.bin = bin;
            }
        }
        Self::new(config)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// PID of the server this supervisor spawned, if any.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Make sure the server answers probes, starting it if necessary.
    pub async fn ensure_running<F>(&mut self, probe: &dyn HealthProbe, mut on_status: F) -> Result<()>
    where
        F: FnMut(ServerStatus) + Send,
    {
        self.state = ServerState::Probing;
        on_status(ServerStatus::Checking);

        if probe.probe().await {
            self.state = ServerState::Running;
            info!("model server already running");
            on_status(ServerStatus::Running);
            return Ok(());
        }

        self.state = ServerState::Starting;
        on_status(ServerStatus::Starting);
        if let Err(e) = self.start().await {
            self.state = ServerState::Failed;
            return Err(e);
        }

        self.state = ServerState::Probing;
        on_status(ServerStatus::Waiting);

        let attempts = self.config.probe_attempts;
        let interval = Duration::from_millis(self.config.probe_interval_ms);
        for attempt in 1..=attempts {
            tokio::time::sleep(interval).await;
            if probe.probe().await {
                self.state = ServerState::Running;
                info!(attempt, pid = ?self.pid(), "model server connected");
                on_status(ServerStatus::Connected);
                return Ok(());
            }
            debug!(attempt, attempts, "model server not responding yet");
        }

        self.state = ServerState::Failed;
        error!(attempts, bin = %self.config.bin, "model server never became healthy");
        Err(LlamaDeskError::ServerStartup(format!(
            "server started but did not respond within the timeout ({attempts} attempts)"
        )))
    }

    /// Spawn the server and confirm it survives the startup grace period.
    async fn start(&mut self) -> Result<()> {
        let mut cmd = Command::new(&self.config.bin);
        cmd.args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // Own process group so shutdown reaches the server's runner children.
        #[cfg(unix)]
        cmd.process_group(0);

        info!(bin = %self.config.bin, args = ?self.config.args, "starting model server");

        let mut child = cmd.spawn().map_err(|e| {
            error!(bin = %self.config.bin, error = %e, "failed to spawn model server");
            LlamaDeskError::ServerStartup(format!(
                "could not start server process ({}): {e}",
                self.config.bin
            ))
        })?;
        info!(pid = ?child.id(), "model server process spawned");

        if self.config.startup_grace_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.startup_grace_ms)).await;
        }

        match child.try_wait() {
            Ok(None) => {
                self.child = Some(child);
                Ok(())
            }
            Ok(Some(status)) => {
                error!(%status, "model server exited during startup");
                Err(LlamaDeskError::ServerStartup(format!(
                    "could not start server process ({}): exited with {status}",
                    self.config.bin
                )))
            }
            Err(e) => Err(LlamaDeskError::ServerStartup(format!(
                "could not start server process ({}): {e}",
                self.config.bin
            ))),
        }
    }

    /// Stop the spawned server: terminate, wait, then kill.
    ///
    /// No-op when nothing was spawned or it was already stopped.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        self.state = ServerState::Unknown;

        match child.try_wait() {
            Ok(None) => {
                info!(pid = ?child.id(), "stopping model server");
                request_terminate(&mut child);

                let grace = Duration::from_secs(self.config.stop_grace_secs);
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => info!(%status, "model server stopped"),
                    Ok(Err(e)) => warn!(error = %e, "failed to wait for model server"),
                    Err(_) => {
                        warn!(grace_secs = self.config.stop_grace_secs, "model server ignored termination, killing");
                        force_kill(&mut child).await;
                    }
                }
            }
            Ok(Some(status)) => debug!(%status, "model server had already exited"),
            Err(e) => {
                warn!(error = %e, "could not query model server, killing");
                force_kill(&mut child).await;
            }
        }

        if self.config.sweep_lingering {
            sweep_lingering(&self.config.bin).await;
        }
    }
}

impl Drop for ServerSupervisor {
    fn drop(&mut self) {
        if let Some(ref mut child) = self.child {
            // Best-effort kill on drop; can't await here.
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
            let _ = child.start_kill();
        }
    }
}

fn request_terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}

async fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill model server");
    }
}

/// Kill any same-named server left behind (e.g. runners that outlived the parent).
/// Errors are logged and otherwise ignored.
async fn sweep_lingering(bin: &str) {
    let name = Path::new(bin)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| bin.to_string());

    #[cfg(windows)]
    let result = Command::new("taskkill")
        .args(["/F", "/IM", &format!("{name}.exe")])
        .output()
        .await;

    #[cfg(not(windows))]
    let result = Command::new("pkill").args(["-x", &name]).output().await;

    match result {
        Ok(out) => debug!(process = %name, status = %out.status, "lingering process sweep finished"),
        Err(e) => debug!(process = %name, error = %e, "lingering process sweep unavailable"),
    }
}
