use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

fn gsm(backups: &Path, worlds: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_gsm"));
    cmd.env_clear()
        .env("BACKUPS_DIRECTORY", backups)
        .env("WORLDS_DIRECTORY", worlds)
        .env("WORLD_NAME", "Dedicated")
        .env("PID_FILE", backups.join("gsm.pid"))
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_forced_backup_then_list() {
    let dir = tempdir().unwrap();
    let backups = dir.path().join("backups");
    let worlds = dir.path().join("worlds_local");
    fs::create_dir_all(&worlds).unwrap();
    fs::write(worlds.join("Dedicated.db"), b"world").unwrap();
    fs::write(worlds.join("Dedicated.fwl"), b"meta").unwrap();

    let out = gsm(&backups, &worlds)
        .args(["backup", "--force"])
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let printed = String::from_utf8_lossy(&out.stdout);
    assert!(printed.trim().ends_with(".tar.gz"));
    assert!(Path::new(printed.trim()).is_file());

    let out = gsm(&backups, &worlds)
        .args(["list-backups", "--json"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let listed: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let records = listed.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["world_name"], "Dedicated");
}

#[test]
fn test_backup_without_world_fails() {
    let dir = tempdir().unwrap();
    let backups = dir.path().join("backups");
    let worlds = dir.path().join("worlds_local");

    let out = gsm(&backups, &worlds)
        .args(["backup", "--force"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("no world data"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = tempdir().unwrap();
    let out = gsm(dir.path(), dir.path())
        .env("BACKUPS_CRON", "not a cron")
        .arg("list-backups")
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("BACKUPS_CRON"));
}

#[test]
fn test_run_refuses_without_pid_file() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, b"").unwrap();

    let out = gsm(&dir.path().join("backups"), &dir.path().join("worlds_local"))
        .env("PID_FILE", blocker.join("gsm.pid"))
        .arg("run")
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("pid file"));
}
