use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

static ARCHIVE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<world>.+)-(?P<date>\d{8})-(?P<time>\d{6})(?:-(?P<seq>\d+))?\.tar(?P<gz>\.gz)?$")
        .expect("archive name pattern is valid")
});

/// One archive in the backup directory. The file is the record: there is no index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub id: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub world_name: String,
    /// Disambiguates archives created within the same second.
    pub seq: u32,
    pub compressed: bool,
}

impl Ord for BackupRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then(self.seq.cmp(&other.seq))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for BackupRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The fields encoded in an archive file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    pub world_name: String,
    pub created_at: DateTime<Utc>,
    pub seq: u32,
    pub compressed: bool,
}

impl ArchiveName {
    pub fn new(world_name: &str, created_at: DateTime<Utc>, seq: u32, compressed: bool) -> Self {
        Self {
            world_name: world_name.to_string(),
            created_at,
            seq,
            compressed,
        }
    }

    /// `<world>-<YYYYMMDD>-<HHMMSS>[-<seq>]`, the file name without extension.
    pub fn id(&self) -> String {
        let stamp = self.created_at.format(TIMESTAMP_FORMAT);
        if self.seq == 0 {
            format!("{}-{stamp}", self.world_name)
        } else {
            format!("{}-{stamp}-{}", self.world_name, self.seq)
        }
    }

    pub fn file_name(&self) -> String {
        let ext = if self.compressed { "tar.gz" } else { "tar" };
        format!("{}.{ext}", self.id())
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = ARCHIVE_NAME.captures(file_name)?;
        let stamp = format!("{}-{}", &caps["date"], &caps["time"]);
        let naive = NaiveDateTime::parse_from_str(&stamp, TIMESTAMP_FORMAT).ok()?;
        let seq = match caps.name("seq") {
            Some(m) => m.as_str().parse().ok()?,
            None => 0,
        };
        Some(Self {
            world_name: caps["world"].to_string(),
            created_at: Utc.from_utc_datetime(&naive),
            seq,
            compressed: caps.name("gz").is_some(),
        })
    }
}

/// All archives in `dir`, oldest first. A missing directory has no records.
///
/// Hidden files (in-progress `.partial` writes among them) and names that do not parse are
/// ignored.
pub fn list_records(dir: &Path) -> io::Result<Vec<BackupRecord>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }
        let Some(name) = ArchiveName::parse(file_name) else {
            debug!(file = file_name, "ignoring unrecognised file in backup directory");
            continue;
        };
        let metadata = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            // Removed between listing and stat.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        records.push(BackupRecord {
            id: name.id(),
            path: entry.path(),
            created_at: name.created_at,
            size_bytes: metadata.len(),
            world_name: name.world_name,
            seq: name.seq,
            compressed: name.compressed,
        });
    }
    records.sort();
    Ok(records)
}

/// Sequence number for a new archive of `world` stamped `created_at`, given the existing records.
pub fn next_seq(records: &[BackupRecord], world: &str, created_at: DateTime<Utc>) -> u32 {
    records
        .iter()
        .filter(|r| r.world_name == world && r.created_at == created_at)
        .map(|r| r.seq + 1)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_archive_name_format() {
        let name = ArchiveName::new("Dedicated", at("2024-03-05T07:08:09Z"), 0, true);
        assert_eq!(name.file_name(), "Dedicated-20240305-070809.tar.gz");
        let name = ArchiveName::new("My-World", at("2024-03-05T07:08:09Z"), 2, false);
        assert_eq!(name.file_name(), "My-World-20240305-070809-2.tar");
    }

    #[test]
    fn test_parse_archive_name() {
        let parsed = ArchiveName::parse("My-World-20240305-070809-2.tar").unwrap();
        assert_eq!(parsed.world_name, "My-World");
        assert_eq!(parsed.created_at, at("2024-03-05T07:08:09Z"));
        assert_eq!(parsed.seq, 2);
        assert!(!parsed.compressed);

        assert!(ArchiveName::parse("Dedicated-20240305-070809.tar.gz").unwrap().compressed);
        assert!(ArchiveName::parse("Dedicated-20241305-070809.tar.gz").is_none());
        assert!(ArchiveName::parse("Dedicated.db").is_none());
        assert!(ArchiveName::parse("Dedicated-20240305-070809.zip").is_none());
    }

    #[test]
    fn test_list_records_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        for name in [
            "W-20240102-000000.tar.gz",
            "W-20240101-000000-1.tar.gz",
            "W-20240101-000000.tar.gz",
            ".W-20240103-000000.tar.gz.partial",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let ids: Vec<_> = list_records(dir.path())
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(
            ids,
            vec!["W-20240101-000000", "W-20240101-000000-1", "W-20240102-000000"]
        );
        assert!(list_records(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_next_seq() {
        let dir = tempdir().unwrap();
        let t = at("2024-01-01T00:00:00Z");
        assert_eq!(next_seq(&[], "W", t), 0);
        fs::write(dir.path().join("W-20240101-000000.tar"), b"x").unwrap();
        fs::write(dir.path().join("W-20240101-000000-1.tar.gz"), b"x").unwrap();
        fs::write(dir.path().join("Other-20240101-000000-7.tar"), b"x").unwrap();
        let records = list_records(dir.path()).unwrap();
        assert_eq!(next_seq(&records, "W", t), 2);
    }
}
