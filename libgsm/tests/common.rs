use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libgsm::backup::RetentionPolicy;
use libgsm::clock::Clock;
use libgsm::{BackupConfig, IdleDetector, IdleSource};

/// Player count controlled by the test.
#[derive(Default)]
pub struct Players(AtomicU32);

impl Players {
    #[allow(dead_code)]
    pub fn set(&self, n: u32) {
        self.0.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdleSource for Players {
    async fn player_count(&self) -> anyhow::Result<u32> {
        Ok(self.0.load(Ordering::SeqCst))
    }

    fn describe(&self) -> String {
        "test".to_string()
    }
}

#[allow(dead_code)]
pub fn idle_detector(players: Arc<Players>) -> Arc<IdleDetector> {
    Arc::new(IdleDetector::new(players, Duration::from_millis(200)))
}

/// Wall clock the test can move.
pub struct ManualClock(Mutex<DateTime<Utc>>);

#[allow(dead_code)]
impl ManualClock {
    pub fn at(rfc3339: &str) -> Arc<Self> {
        Arc::new(Self(Mutex::new(
            DateTime::parse_from_rfc3339(rfc3339)
                .unwrap()
                .with_timezone(&Utc),
        )))
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Write an executable `sh` script.
#[allow(dead_code)]
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A `worlds_local` directory holding world `name`.
#[allow(dead_code)]
pub fn world(root: &Path, name: &str) -> PathBuf {
    let dir = root.join("worlds_local");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{name}.db")), vec![7u8; 4096]).unwrap();
    fs::write(dir.join(format!("{name}.fwl")), b"meta").unwrap();
    dir
}

#[allow(dead_code)]
pub fn backup_config(root: &Path, retention: RetentionPolicy) -> BackupConfig {
    BackupConfig {
        directory: root.join("backups"),
        world_dir: root.join("worlds_local"),
        world_name: "Dedicated".to_string(),
        compress: true,
        retention,
    }
}
