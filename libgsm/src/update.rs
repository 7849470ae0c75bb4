use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use regex::Regex;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::LifecycleError;
use crate::hooks::{HookPoint, Hooks};
use crate::idle::IdleDetector;

/// The external tool that synchronises server files (steamcmd or a compatible wrapper).
#[derive(Debug, Clone)]
pub struct RetrievalTool {
    pub program: PathBuf,
    pub app_id: String,
    pub validate: bool,
    pub extra_args: Vec<String>,
}

impl RetrievalTool {
    /// Arguments in steamcmd order; `+quit` must come last.
    pub fn args(&self, install_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "+force_install_dir".to_string(),
            install_dir.display().to_string(),
            "+login".to_string(),
            "anonymous".to_string(),
            "+app_update".to_string(),
            self.app_id.clone(),
        ];
        if self.validate {
            args.push("validate".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push("+quit".to_string());
        args
    }
}

/// Where the server binaries live.
#[derive(Debug, Clone)]
pub struct ServerInstall {
    pub dir: PathBuf,
    /// Executable path relative to `dir`.
    pub binary: PathBuf,
    pub app_id: String,
}

impl ServerInstall {
    pub fn binary_path(&self) -> PathBuf {
        self.dir.join(&self.binary)
    }

    pub fn is_present(&self) -> bool {
        self.binary_path().is_file()
    }

    /// Build id recorded by steamcmd in `steamapps/appmanifest_<app_id>.acf`.
    pub async fn build_id(&self) -> Option<String> {
        let manifest = self
            .dir
            .join("steamapps")
            .join(format!("appmanifest_{}.acf", self.app_id));
        let content = tokio::fs::read_to_string(&manifest).await.ok()?;
        parse_build_id(&content)
    }
}

fn parse_build_id(manifest: &str) -> Option<String> {
    let re = Regex::new(r#""buildid"\s+"(\d+)""#).ok()?;
    re.captures(manifest).map(|c| c[1].to_string())
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateOptions {
    /// Skip the idle gate (startup and manual runs).
    pub force: bool,
    /// Gate on idleness unless forced.
    pub only_if_idle: bool,
    pub timeout: Duration,
}

impl UpdateOptions {
    pub fn forced(timeout: Duration) -> Self {
        Self {
            force: true,
            only_if_idle: false,
            timeout,
        }
    }

    pub fn scheduled(only_if_idle: bool, timeout: Duration) -> Self {
        Self {
            force: false,
            only_if_idle,
            timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Completed,
    /// Players were connected (or idleness could not be established).
    Deferred,
    /// Another update was already running.
    Busy,
    Cancelled,
    TimedOut,
    Failed,
}

/// What one [`UpdateManager::run_update`] call did.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    pub outcome: UpdateOutcome,
    pub started: bool,
    pub timed_out: bool,
    pub exit_status: Option<ExitStatus>,
    /// The installed build id differs from the one before the run.
    pub build_changed: bool,
    pub detail: Option<String>,
}

impl UpdateResult {
    fn not_started(outcome: UpdateOutcome) -> Self {
        Self {
            outcome,
            started: false,
            timed_out: false,
            exit_status: None,
            build_changed: false,
            detail: None,
        }
    }

    fn started(outcome: UpdateOutcome) -> Self {
        Self {
            started: true,
            timed_out: outcome == UpdateOutcome::TimedOut,
            ..Self::not_started(outcome)
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == UpdateOutcome::Completed
    }

    /// The recoverable error this result represents, if it represents one.
    pub fn error(&self, timeout: Duration, program: &Path) -> Option<LifecycleError> {
        match self.outcome {
            UpdateOutcome::TimedOut => Some(LifecycleError::Timeout {
                operation: "update",
                timeout,
            }),
            UpdateOutcome::Failed => Some(LifecycleError::SubprocessFailure {
                command: program.display().to_string(),
                status: self
                    .detail
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            }),
            _ => None,
        }
    }
}

/// Runs the retrieval tool against the server install directory.
///
/// Never removes files itself: a failed or interrupted update leaves whatever the tool left,
/// and an installation that worked before keeps working.
pub struct UpdateManager {
    tool: RetrievalTool,
    install: ServerInstall,
    idle: Arc<IdleDetector>,
    hooks: Arc<Hooks>,
    in_flight: Mutex<()>,
}

impl UpdateManager {
    pub fn new(
        tool: RetrievalTool,
        install: ServerInstall,
        idle: Arc<IdleDetector>,
        hooks: Arc<Hooks>,
    ) -> Self {
        Self {
            tool,
            install,
            idle,
            hooks,
            in_flight: Mutex::new(()),
        }
    }

    pub fn install(&self) -> &ServerInstall {
        &self.install
    }

    pub fn tool(&self) -> &RetrievalTool {
        &self.tool
    }

    pub async fn run_update(
        &self,
        opts: UpdateOptions,
        cancel: &CancellationToken,
    ) -> UpdateResult {
        let Ok(_in_flight) = self.in_flight.try_lock() else {
            warn!("update already in progress, rejecting request");
            return UpdateResult::not_started(UpdateOutcome::Busy);
        };

        if !opts.force && opts.only_if_idle && !self.idle.is_idle().await {
            info!(task = "update", "players connected, deferring update");
            return UpdateResult::not_started(UpdateOutcome::Deferred);
        }

        let before = self.install.build_id().await;
        self.hooks.run(HookPoint::PreUpdateCheck, &[]).await;

        let args = self.tool.args(&self.install.dir);
        info!(
            program = %self.tool.program.display(),
            dir = %self.install.dir.display(),
            force = opts.force,
            timeout = ?opts.timeout,
            "update started"
        );
        let started_at = Instant::now();

        let mut child = match Command::new(&self.tool.program)
            .args(&args)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(program = %self.tool.program.display(), error = %e, "failed to spawn update tool");
                let mut result = UpdateResult::started(UpdateOutcome::Failed);
                result.detail = Some(format!("spawn failed: {e}"));
                return result;
            }
        };
        let pid = child.id();

        let mut result = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => {
                    let mut r = UpdateResult::started(UpdateOutcome::Completed);
                    r.exit_status = Some(status);
                    r
                }
                Ok(status) => {
                    let mut r = UpdateResult::started(UpdateOutcome::Failed);
                    r.exit_status = Some(status);
                    r.detail = Some(status.to_string());
                    r
                }
                Err(e) => {
                    let mut r = UpdateResult::started(UpdateOutcome::Failed);
                    r.detail = Some(format!("wait failed: {e}"));
                    r
                }
            },
            _ = sleep(opts.timeout) => {
                terminate(pid);
                let mut r = UpdateResult::started(UpdateOutcome::TimedOut);
                r.exit_status = child.wait().await.ok();
                r
            }
            _ = cancel.cancelled() => {
                terminate(pid);
                let mut r = UpdateResult::started(UpdateOutcome::Cancelled);
                r.exit_status = child.wait().await.ok();
                r
            }
        };

        if result.is_success() {
            let after = self.install.build_id().await;
            result.build_changed = after.is_some() && after != before;
            debug!(?before, ?after, "installed build");
        }

        let elapsed = started_at.elapsed();
        match result.outcome {
            UpdateOutcome::Completed => info!(
                ?elapsed,
                build_changed = result.build_changed,
                "update finished"
            ),
            UpdateOutcome::Cancelled => info!(?elapsed, "update cancelled"),
            UpdateOutcome::TimedOut => {
                error!(timeout = ?opts.timeout, "update timed out, retrieval tool killed")
            }
            _ => error!(
                ?elapsed,
                detail = result.detail.as_deref().unwrap_or(""),
                "update failed"
            ),
        }

        self.hooks.run(HookPoint::PostUpdateCheck, &[]).await;
        result
    }
}

/// Kill the tool and anything it spawned.
fn terminate(pid: Option<u32>) {
    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %e, "failed to kill update process group");
        }
    }
}
