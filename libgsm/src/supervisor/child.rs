use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ProcessSupervisor, ReadinessProbe};
use crate::poll::poll_until;

/// How to launch the dedicated server.
#[derive(Debug, Clone)]
pub struct ServerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// stdout and stderr of the server are appended here.
    pub log_file: PathBuf,
}

/// Runs the server as a direct child in its own process group.
///
/// Signals go to the whole group so wrapper scripts and the real server binary see them alike.
pub struct ChildSupervisor {
    command: ServerCommand,
    probe: Arc<dyn ReadinessProbe>,
    child: Mutex<Option<Child>>,
    poll_interval: Duration,
}

impl ChildSupervisor {
    pub fn new(command: ServerCommand, probe: Arc<dyn ReadinessProbe>) -> Self {
        Self {
            command,
            probe,
            child: Mutex::new(None),
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }

    fn open_log(&self) -> Result<fs::File> {
        let path = &self.command.log_file;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open server log {}", path.display()))
    }

    async fn kill_now(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Some(pid) = child.id() {
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    debug!(pid, error = %e, "SIGKILL to process group failed");
                }
            }
            let status = child.wait().await?;
            warn!(%status, "server process killed");
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessSupervisor for ChildSupervisor {
    async fn start(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if child.try_wait()?.is_none() {
                debug!("server process already running");
                return Ok(());
            }
        }

        self.probe.arm().await;
        let stdout = self.open_log()?;
        let stderr = stdout.try_clone()?;
        let child = Command::new(&self.command.program)
            .args(&self.command.args)
            .current_dir(&self.command.working_dir)
            .envs(self.command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn server {}",
                    self.command.program.display()
                )
            })?;

        info!(
            pid = child.id(),
            program = %self.command.program.display(),
            log = %self.command.log_file.display(),
            "server process started"
        );
        *guard = Some(child);
        Ok(())
    }

    async fn stop(&self, signal: Signal, timeout: Duration) -> Result<()> {
        {
            let mut guard = self.child.lock().await;
            let Some(child) = guard.as_mut() else {
                debug!("stop requested but no server process was started");
                return Ok(());
            };
            if let Some(status) = child.try_wait()? {
                info!(%status, "server process already exited");
                *guard = None;
                return Ok(());
            }
            let Some(pid) = child.id() else {
                *guard = None;
                return Ok(());
            };
            info!(pid, %signal, ?timeout, "stopping server process");
            if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
                warn!(pid, %signal, error = %e, "failed to signal server process group");
            }
        }

        let this = self;
        let exited = poll_until(timeout, self.poll_interval, move || async move {
            !this.is_running().await
        })
        .await;
        if exited {
            info!("server process stopped");
            return Ok(());
        }

        warn!(?timeout, "server did not exit within grace period, escalating to SIGKILL");
        self.kill_now().await
    }

    async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!(%status, "server process exited");
                *guard = None;
                false
            }
            Err(e) => {
                warn!(error = %e, "failed to query server process status");
                true
            }
        }
    }

    async fn wait_for_ready(&self, timeout: Duration) -> bool {
        let this = self;
        let settled = poll_until(timeout, self.poll_interval, move || async move {
            if !this.is_running().await {
                return true;
            }
            match this.probe.is_ready().await {
                Ok(ready) => ready,
                Err(e) => {
                    debug!(error = %e, "readiness probe failed");
                    false
                }
            }
        })
        .await;

        if !settled {
            return false;
        }
        if !self.is_running().await {
            warn!("server process exited before becoming ready");
            return false;
        }
        true
    }
}
