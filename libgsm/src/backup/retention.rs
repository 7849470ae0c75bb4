use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::record::{BackupRecord, list_records};
use crate::error::LifecycleError;

/// How many archives to keep. A bound of 0 means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
    pub max_count: usize,
}

impl RetentionPolicy {
    pub fn is_unlimited(&self) -> bool {
        self.max_age_days == 0 && self.max_count == 0
    }
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub evicted: Vec<BackupRecord>,
    /// Records that were eligible but could not be deleted. They stay listed and are retried on
    /// the next sweep.
    pub failures: Vec<LifecycleError>,
    pub kept: usize,
}

/// Evict archives of `world` in `dir` that violate `policy`.
///
/// Age violators go first, then the oldest surplus above `max_count`. Counting is done against
/// what is actually left on disk, so a failed deletion never causes a newer archive to be
/// removed in its place.
pub fn sweep(
    dir: &Path,
    world: &str,
    policy: RetentionPolicy,
    now: DateTime<Utc>,
) -> io::Result<SweepReport> {
    let mut records: Vec<BackupRecord> = list_records(dir)?
        .into_iter()
        .filter(|r| r.world_name == world)
        .collect();
    let mut report = SweepReport::default();
    if policy.is_unlimited() {
        report.kept = records.len();
        return Ok(report);
    }

    let mut remaining = Vec::with_capacity(records.len());
    if policy.max_age_days > 0 {
        let cutoff = now - Duration::days(i64::from(policy.max_age_days));
        for record in records.drain(..) {
            if record.created_at < cutoff {
                evict(record, "max_age", &mut report, &mut remaining);
            } else {
                remaining.push(record);
            }
        }
    } else {
        remaining = records;
    }

    // `remaining` is oldest first; anything that failed to delete is still in it.
    if policy.max_count > 0 && remaining.len() > policy.max_count {
        let mut surplus = remaining.len() - policy.max_count;
        let mut kept = Vec::with_capacity(remaining.len());
        for record in remaining.drain(..) {
            if surplus > 0 {
                surplus -= 1;
                evict(record, "max_count", &mut report, &mut kept);
            } else {
                kept.push(record);
            }
        }
        remaining = kept;
    }

    report.kept = remaining.len();
    Ok(report)
}

fn evict(
    record: BackupRecord,
    reason: &'static str,
    report: &mut SweepReport,
    remaining: &mut Vec<BackupRecord>,
) {
    match fs::remove_file(&record.path) {
        Ok(()) => {
            info!(
                backup = %record.id,
                created_at = %record.created_at,
                reason,
                "evicted backup"
            );
            report.evicted.push(record);
        }
        // Someone else already removed it.
        Err(e) if e.kind() == io::ErrorKind::NotFound => report.evicted.push(record),
        Err(source) => {
            let err = LifecycleError::RetentionIo {
                path: record.path.clone(),
                source,
            };
            warn!(backup = %record.id, error = %err, "backup eviction failed, will retry");
            report.failures.push(err);
            remaining.push(record);
        }
    }
}
