pub mod archive;
pub mod dirlock;
pub mod record;
pub mod retention;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{LifecycleError, Result};
use crate::hooks::{HookPoint, Hooks};
use crate::idle::IdleDetector;

pub use archive::WriteOutcome;
pub use dirlock::DirLock;
pub use record::{ArchiveName, BackupRecord, list_records};
pub use retention::{RetentionPolicy, SweepReport};

#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Where archives are written and retained.
    pub directory: PathBuf,
    /// The directory snapshotted into each archive.
    pub world_dir: PathBuf,
    pub world_name: String,
    pub compress: bool,
    pub retention: RetentionPolicy,
}

impl BackupConfig {
    /// The file whose presence proves there is a world worth backing up.
    pub fn world_file(&self) -> PathBuf {
        self.world_dir.join(format!("{}.db", self.world_name))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackupOptions {
    pub force: bool,
    pub only_if_idle: bool,
}

impl BackupOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            only_if_idle: false,
        }
    }

    pub fn scheduled(only_if_idle: bool) -> Self {
        Self {
            force: false,
            only_if_idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Created(BackupRecord),
    Deferred,
    Cancelled,
}

/// Creates world archives and enforces retention on the backup directory.
///
/// Within a process backups are serialized by an in-memory lock; across processes sharing the
/// directory by a [`DirLock`].
pub struct BackupManager {
    config: BackupConfig,
    idle: Arc<IdleDetector>,
    hooks: Arc<Hooks>,
    clock: Arc<dyn Clock>,
    serial: Mutex<()>,
    /// Held by the blocking archive writer for as long as it reads world files.
    writer: Arc<Mutex<()>>,
}

/// What the blocking half of [`BackupManager::create`] produced.
struct Snapshot {
    name: ArchiveName,
    dest: PathBuf,
    outcome: WriteOutcome,
}

impl BackupManager {
    pub fn new(config: BackupConfig, idle: Arc<IdleDetector>, hooks: Arc<Hooks>) -> Self {
        Self {
            config,
            idle,
            hooks,
            clock: Arc::new(SystemClock),
            serial: Mutex::new(()),
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Take one backup, then sweep the directory.
    ///
    /// Backups are serialized: a second caller waits for the first to finish. The sweep runs
    /// after every attempt that got past the idle gate, including ones that found no world.
    pub async fn run_backup(
        &self,
        opts: BackupOptions,
        cancel: &CancellationToken,
    ) -> Result<BackupOutcome> {
        let _serial = tokio::select! {
            guard = self.serial.lock() => guard,
            _ = cancel.cancelled() => return Ok(BackupOutcome::Cancelled),
        };

        if !opts.force && opts.only_if_idle && !self.idle.is_idle().await {
            info!(task = "backup", "players connected, deferring backup");
            return Ok(BackupOutcome::Deferred);
        }

        let result = self.create(cancel).await;
        if !matches!(result, Ok(BackupOutcome::Cancelled)) {
            if let Err(e) = self.sweep_now().await {
                warn!(error = %e, "retention sweep failed");
            }
        }
        result
    }

    async fn create(&self, cancel: &CancellationToken) -> Result<BackupOutcome> {
        let world_file = self.config.world_file();
        if !tokio::fs::try_exists(&world_file).await.unwrap_or(false) {
            warn!(path = %world_file.display(), "no world data, skipping backup");
            return Err(LifecycleError::NoWorldData(world_file));
        }

        tokio::fs::create_dir_all(&self.config.directory).await?;
        self.hooks.run(HookPoint::PreBackup, &[]).await;

        let created_at = self.clock.now().trunc_subsecs(0);
        let directory = self.config.directory.clone();
        let source = self.config.world_dir.clone();
        let world = self.config.world_name.clone();
        let compress = self.config.compress;
        let token = cancel.clone();
        info!(source = %source.display(), "creating backup");
        // The writer guard moves onto the blocking thread, so it outlives an aborted task.
        let writer = self.writer.clone().lock_owned().await;
        let written = tokio::task::spawn_blocking(move || {
            let _writer = writer;
            snapshot(&directory, &source, &world, created_at, compress, &token)
        })
        .await
        .map_err(|e| LifecycleError::Archive(format!("archive task failed: {e}")))??;

        let Some(Snapshot { name, dest, outcome }) = written else {
            info!("backup cancelled while waiting for the backup directory");
            return Ok(BackupOutcome::Cancelled);
        };
        let size_bytes = match outcome {
            WriteOutcome::Written(size) => size,
            WriteOutcome::Cancelled => {
                info!(backup = %name.id(), "backup cancelled, partial archive discarded");
                return Ok(BackupOutcome::Cancelled);
            }
        };

        let record = BackupRecord {
            id: name.id(),
            path: dest,
            created_at,
            size_bytes,
            seq: name.seq,
            world_name: name.world_name,
            compressed: name.compressed,
        };
        info!(
            backup = %record.id,
            path = %record.path.display(),
            size_bytes,
            "backup created"
        );

        let path = record.path.display().to_string();
        self.hooks
            .run(HookPoint::PostBackup, &[("BACKUP_FILE", path.as_str())])
            .await;
        Ok(BackupOutcome::Created(record))
    }

    /// Apply the retention policy without taking a backup.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let _serial = self.serial.lock().await;
        self.sweep_now().await
    }

    async fn sweep_now(&self) -> Result<SweepReport> {
        let directory = self.config.directory.clone();
        let world = self.config.world_name.clone();
        let policy = self.config.retention;
        let now = self.clock.now();
        let report = tokio::task::spawn_blocking(move || -> Result<SweepReport> {
            let _lock = if directory.is_dir() {
                DirLock::acquire(&directory, &CancellationToken::new())?
            } else {
                None
            };
            Ok(retention::sweep(&directory, &world, policy, now)?)
        })
        .await
        .map_err(|e| LifecycleError::Archive(format!("sweep task failed: {e}")))??;
        debug!(
            evicted = report.evicted.len(),
            failures = report.failures.len(),
            kept = report.kept,
            "retention sweep done"
        );
        Ok(report)
    }

    /// Remove partial archives left behind by a crash.
    ///
    /// Skipped while another process holds the backup directory, since its partial archive is
    /// still being written.
    pub async fn recover(&self) -> Result<usize> {
        let _serial = self.serial.lock().await;
        let directory = self.config.directory.clone();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            if !directory.is_dir() {
                return Ok(0);
            }
            let Some(_lock) = DirLock::try_acquire(&directory)? else {
                warn!(dir = %directory.display(), "backup directory busy, skipping partial cleanup");
                return Ok(0);
            };
            Ok(remove_partials(&directory)?)
        })
        .await
        .map_err(|e| LifecycleError::Archive(format!("recover task failed: {e}")))?
    }

    /// Wait until no archive writer is reading the world files.
    ///
    /// An aborted backup task leaves its blocking writer running until the writer notices
    /// cancellation; callers about to let the server save call this first.
    pub async fn wait_idle(&self) {
        let _writer = self.writer.lock().await;
    }

    /// Archives of the configured world, oldest first.
    pub async fn list(&self) -> Result<Vec<BackupRecord>> {
        let directory = self.config.directory.clone();
        let world = self.config.world_name.clone();
        let records = tokio::task::spawn_blocking(move || list_records(&directory))
            .await
            .map_err(|e| LifecycleError::Archive(format!("listing task failed: {e}")))??;
        Ok(records.into_iter().filter(|r| r.world_name == world).collect())
    }
}

/// Allocate the next free archive name and write it, all under the directory lock.
///
/// `Ok(None)` when cancelled before the lock was ours.
fn snapshot(
    directory: &Path,
    source: &Path,
    world: &str,
    created_at: DateTime<Utc>,
    compress: bool,
    cancel: &CancellationToken,
) -> Result<Option<Snapshot>> {
    let Some(_lock) = DirLock::acquire(directory, cancel)? else {
        return Ok(None);
    };
    let existing = list_records(directory)?;
    let mut seq = record::next_seq(&existing, world, created_at);
    loop {
        let name = ArchiveName::new(world, created_at, seq, compress);
        let dest = directory.join(name.file_name());
        // A stale partial from a crashed run also claims its name.
        if dest.exists() || archive::partial_path(&dest).exists() {
            seq += 1;
            continue;
        }
        debug!(backup = %name.id(), "archive name allocated");
        let outcome = archive::write_archive(source, &dest, compress, cancel)?;
        return Ok(Some(Snapshot {
            name,
            dest,
            outcome,
        }));
    }
}

fn remove_partials(dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') && name.ends_with(".partial") {
            fs::remove_file(entry.path())?;
            info!(path = %entry.path().display(), "removed stale partial archive");
            removed += 1;
        }
    }
    Ok(removed)
}
