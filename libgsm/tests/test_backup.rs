mod common;

use std::fs;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use common::{ManualClock, Players, backup_config, idle_detector, world};
use libgsm::backup::dirlock::LOCK_FILE;
use libgsm::backup::{RetentionPolicy, list_records};
use libgsm::{
    BackupManager, BackupOptions, BackupOutcome, HookPoint, Hooks, LifecycleError,
};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn manager(
    root: &std::path::Path,
    retention: RetentionPolicy,
    players: Arc<Players>,
    clock: Arc<ManualClock>,
) -> BackupManager {
    BackupManager::new(
        backup_config(root, retention),
        idle_detector(players),
        Arc::new(Hooks::default()),
    )
    .with_clock(clock)
}

/// Directory entries other than the lock file.
fn entries(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|name| name != LOCK_FILE)
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn created(outcome: BackupOutcome) -> libgsm::BackupRecord {
    match outcome {
        BackupOutcome::Created(record) => record,
        other => panic!("expected a backup, got {other:?}"),
    }
}

#[tokio::test]
async fn test_count_retention_keeps_newest() {
    let dir = tempdir().unwrap();
    world(dir.path(), "Dedicated");
    let clock = ManualClock::at("2024-05-01T10:00:00Z");
    let retention = RetentionPolicy {
        max_age_days: 0,
        max_count: 3,
    };
    let backups = manager(dir.path(), retention, Arc::default(), clock.clone());
    let cancel = CancellationToken::new();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let record = created(backups.run_backup(BackupOptions::forced(), &cancel).await.unwrap());
        ids.push(record.id);
        clock.advance(ChronoDuration::hours(1));
    }

    let kept: Vec<_> = backups.list().await.unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(kept, ids[2..].to_vec());
}

#[tokio::test]
async fn test_age_retention() {
    let dir = tempdir().unwrap();
    world(dir.path(), "Dedicated");
    let clock = ManualClock::at("2024-05-01T10:00:00Z");
    let retention = RetentionPolicy {
        max_age_days: 3,
        max_count: 0,
    };
    let backups = manager(dir.path(), retention, Arc::default(), clock.clone());
    let cancel = CancellationToken::new();

    let old = created(backups.run_backup(BackupOptions::forced(), &cancel).await.unwrap());
    clock.advance(ChronoDuration::days(2));
    let recent = created(backups.run_backup(BackupOptions::forced(), &cancel).await.unwrap());
    clock.advance(ChronoDuration::days(2));
    let newest = created(backups.run_backup(BackupOptions::forced(), &cancel).await.unwrap());

    assert!(!old.path.exists());
    let kept: Vec<_> = backups.list().await.unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(kept, vec![recent.id, newest.id]);
}

#[tokio::test]
async fn test_same_second_backups_are_distinct() {
    let dir = tempdir().unwrap();
    world(dir.path(), "Dedicated");
    let clock = ManualClock::at("2024-05-01T10:00:00.250Z");
    let backups = manager(
        dir.path(),
        RetentionPolicy::default(),
        Arc::default(),
        clock,
    );
    let cancel = CancellationToken::new();

    let first = created(backups.run_backup(BackupOptions::forced(), &cancel).await.unwrap());
    let second = created(backups.run_backup(BackupOptions::forced(), &cancel).await.unwrap());

    assert_eq!(first.id, "Dedicated-20240501-100000");
    assert_eq!(second.id, "Dedicated-20240501-100000-1");
    assert!(first.path.is_file());
    assert!(second.path.is_file());
    assert!(first < second);
}

#[tokio::test]
async fn test_missing_world_still_sweeps() {
    let dir = tempdir().unwrap();
    world(dir.path(), "Dedicated");
    let clock = ManualClock::at("2024-05-01T10:00:00Z");
    let retention = RetentionPolicy {
        max_age_days: 1,
        max_count: 0,
    };
    let backups = manager(dir.path(), retention, Arc::default(), clock.clone());
    let cancel = CancellationToken::new();
    let old = created(backups.run_backup(BackupOptions::forced(), &cancel).await.unwrap());

    fs::remove_dir_all(dir.path().join("worlds_local")).unwrap();
    clock.advance(ChronoDuration::days(5));

    let err = backups
        .run_backup(BackupOptions::forced(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::NoWorldData(_)));
    assert!(!old.path.exists());
    assert!(backups.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_idle_gate() {
    let dir = tempdir().unwrap();
    world(dir.path(), "Dedicated");
    let players = Arc::new(Players::default());
    players.set(2);
    let backups = manager(
        dir.path(),
        RetentionPolicy::default(),
        players.clone(),
        ManualClock::at("2024-05-01T10:00:00Z"),
    );
    let cancel = CancellationToken::new();

    let outcome = backups
        .run_backup(BackupOptions::scheduled(true), &cancel)
        .await
        .unwrap();
    assert_eq!(outcome, BackupOutcome::Deferred);
    assert!(backups.list().await.unwrap().is_empty());

    // Gate disabled for this entry.
    created(
        backups
            .run_backup(BackupOptions::scheduled(false), &cancel)
            .await
            .unwrap(),
    );
    created(backups.run_backup(BackupOptions::forced(), &cancel).await.unwrap());

    players.set(0);
    created(
        backups
            .run_backup(BackupOptions::scheduled(true), &cancel)
            .await
            .unwrap(),
    );
    assert_eq!(backups.list().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_cancelled_backup_leaves_nothing() {
    let dir = tempdir().unwrap();
    world(dir.path(), "Dedicated");
    let backups = manager(
        dir.path(),
        RetentionPolicy::default(),
        Arc::default(),
        ManualClock::at("2024-05-01T10:00:00Z"),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = backups
        .run_backup(BackupOptions::forced(), &cancel)
        .await
        .unwrap();
    assert_eq!(outcome, BackupOutcome::Cancelled);
    assert!(entries(&dir.path().join("backups")).is_empty());
}

#[tokio::test]
async fn test_recover_removes_partials() {
    let dir = tempdir().unwrap();
    let backup_dir = dir.path().join("backups");
    fs::create_dir_all(&backup_dir).unwrap();
    fs::write(backup_dir.join(".Dedicated-20240501-100000.tar.gz.partial"), b"x").unwrap();
    fs::write(backup_dir.join("Dedicated-20240501-090000.tar.gz"), b"x").unwrap();

    let backups = manager(
        dir.path(),
        RetentionPolicy::default(),
        Arc::default(),
        ManualClock::at("2024-05-01T10:00:00Z"),
    );
    assert_eq!(backups.recover().await.unwrap(), 1);
    assert_eq!(list_records(&backup_dir).unwrap().len(), 1);
    assert_eq!(entries(&backup_dir), vec!["Dedicated-20240501-090000.tar.gz"]);
}

#[tokio::test]
async fn test_post_backup_hook_gets_file() {
    let dir = tempdir().unwrap();
    world(dir.path(), "Dedicated");
    let marker = dir.path().join("hook.out");
    let hooks = Hooks::default().with(
        HookPoint::PostBackup,
        format!("echo @BACKUP_FILE@ > {}", marker.display()),
    );
    let backups = BackupManager::new(
        backup_config(dir.path(), RetentionPolicy::default()),
        idle_detector(Arc::default()),
        Arc::new(hooks),
    )
    .with_clock(ManualClock::at("2024-05-01T10:00:00Z"));

    let record = created(
        backups
            .run_backup(BackupOptions::forced(), &CancellationToken::new())
            .await
            .unwrap(),
    );
    let written = fs::read_to_string(&marker).unwrap();
    assert_eq!(written.trim(), record.path.display().to_string());
}

#[tokio::test]
async fn test_managers_sharing_a_directory_never_collide() {
    let dir = tempdir().unwrap();
    let worlds = world(dir.path(), "Dedicated");
    fs::write(worlds.join("Dedicated.db"), vec![3u8; 16 * 1024 * 1024]).unwrap();
    let clock = ManualClock::at("2024-05-01T10:00:00Z");
    // One stands in for the daemon, the other for a standalone CLI run.
    let daemon = manager(dir.path(), RetentionPolicy::default(), Arc::default(), clock.clone());
    let cli = manager(dir.path(), RetentionPolicy::default(), Arc::default(), clock);
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        daemon.run_backup(BackupOptions::forced(), &cancel),
        cli.run_backup(BackupOptions::forced(), &cancel),
    );
    let mut ids = vec![created(a.unwrap()).id, created(b.unwrap()).id];
    ids.sort();
    assert_eq!(
        ids,
        vec!["Dedicated-20240501-100000", "Dedicated-20240501-100000-1"]
    );
    assert_eq!(
        entries(&dir.path().join("backups")),
        vec![
            "Dedicated-20240501-100000-1.tar.gz",
            "Dedicated-20240501-100000.tar.gz",
        ]
    );
}

#[tokio::test]
async fn test_aborted_backup_writer_is_awaited() {
    let dir = tempdir().unwrap();
    let worlds = world(dir.path(), "Dedicated");
    fs::write(worlds.join("Dedicated.db"), vec![5u8; 32 * 1024 * 1024]).unwrap();
    let backups = Arc::new(manager(
        dir.path(),
        RetentionPolicy::default(),
        Arc::default(),
        ManualClock::at("2024-05-01T10:00:00Z"),
    ));
    let cancel = CancellationToken::new();

    let task = {
        let backups = backups.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { backups.run_backup(BackupOptions::forced(), &cancel).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    cancel.cancel();
    task.abort();
    let _ = task.await;

    backups.wait_idle().await;
    let left = entries(&dir.path().join("backups"));
    assert!(left.iter().all(|name| !name.ends_with(".partial")), "{left:?}");
    assert!(left.len() <= 1);
}
