use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Points in the lifecycle where a user-supplied shell command may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PreUpdateCheck,
    PostUpdateCheck,
    PreBackup,
    PostBackup,
    PreServerRun,
    PostServerRun,
    PreServerShutdown,
    PostServerShutdown,
}

impl HookPoint {
    pub const ALL: [HookPoint; 8] = [
        HookPoint::PreUpdateCheck,
        HookPoint::PostUpdateCheck,
        HookPoint::PreBackup,
        HookPoint::PostBackup,
        HookPoint::PreServerRun,
        HookPoint::PostServerRun,
        HookPoint::PreServerShutdown,
        HookPoint::PostServerShutdown,
    ];

    /// Environment variable the hook command is read from.
    pub fn env_name(&self) -> &'static str {
        match self {
            HookPoint::PreUpdateCheck => "PRE_UPDATE_CHECK_HOOK",
            HookPoint::PostUpdateCheck => "POST_UPDATE_CHECK_HOOK",
            HookPoint::PreBackup => "PRE_BACKUP_HOOK",
            HookPoint::PostBackup => "POST_BACKUP_HOOK",
            HookPoint::PreServerRun => "PRE_SERVER_RUN_HOOK",
            HookPoint::PostServerRun => "POST_SERVER_RUN_HOOK",
            HookPoint::PreServerShutdown => "PRE_SERVER_SHUTDOWN_HOOK",
            HookPoint::PostServerShutdown => "POST_SERVER_SHUTDOWN_HOOK",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.env_name())
    }
}

/// Shell hooks keyed by [`HookPoint`]. Hook failures are logged and never abort the caller.
#[derive(Debug, Clone)]
pub struct Hooks {
    commands: HashMap<HookPoint, String>,
    timeout: Duration,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            commands: HashMap::new(),
            timeout: Duration::from_secs(300),
        }
    }
}

impl Hooks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            commands: HashMap::new(),
            timeout,
        }
    }

    pub fn with(mut self, point: HookPoint, command: impl Into<String>) -> Self {
        let command = command.into();
        if !command.trim().is_empty() {
            self.commands.insert(point, command);
        }
        self
    }

    pub fn is_set(&self, point: HookPoint) -> bool {
        self.commands.contains_key(&point)
    }

    /// Run the hook for `point`, if any.
    ///
    /// Each `(name, value)` pair is exported to the hook's environment and `@name@` occurrences
    /// in the command text are replaced with `value`.
    pub async fn run(&self, point: HookPoint, vars: &[(&str, &str)]) {
        let Some(template) = self.commands.get(&point) else {
            return;
        };
        let mut command = template.clone();
        for (name, value) in vars {
            command = command.replace(&format!("@{name}@"), value);
        }

        info!(hook = %point, %command, "running hook");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        for (name, value) in vars {
            cmd.env(name, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(hook = %point, error = %e, "failed to run hook");
                return;
            }
        };
        let pid = child.id();
        match timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => warn!(hook = %point, %status, "hook exited unsuccessfully"),
            Ok(Err(e)) => warn!(hook = %point, error = %e, "failed to wait for hook"),
            Err(_) => {
                kill_group(pid);
                let _ = child.wait().await;
                warn!(hook = %point, timeout = ?self.timeout, "hook timed out and was killed");
            }
        }
    }
}

/// The hook runs in its own process group; take down whatever it started.
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %e, "failed to kill hook process group");
        }
    }
}
