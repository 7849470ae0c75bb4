use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Pid file of the running daemon; removed again on drop.
#[derive(Debug)]
pub(crate) struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim `path` for this process. Fails if another live daemon already owns it.
    pub(crate) fn create(path: &Path) -> Result<Self> {
        if let Some(pid) = read_live(path) {
            bail!(
                "another gsm daemon (pid {pid}) is already running, see {}",
                path.display()
            );
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write pid file {}", path.display()))?;
        debug!(path = %path.display(), "wrote pid file");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove pid file");
            }
        }
    }
}

/// Pid recorded in `path`, if that process is still alive.
pub(crate) fn read_live(path: &Path) -> Option<Pid> {
    let content = fs::read_to_string(path).ok()?;
    let pid: i32 = content.trim().parse().ok()?;
    if pid <= 0 {
        return None;
    }
    let pid = Pid::from_raw(pid);
    // Signal 0 only checks that the process exists.
    kill(pid, None).ok().map(|_| pid)
}
