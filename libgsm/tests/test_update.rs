mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Players, idle_detector, script};
use libgsm::{
    Hooks, LifecycleError, RetrievalTool, ServerInstall, UpdateManager, UpdateOptions,
    UpdateOutcome,
};
use libgsm::poll::poll_until;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const APP_ID: &str = "896660";

/// A fake steamcmd: records that it ran, then runs `body`. `$2` is the install dir.
fn tool(dir: &Path, body: &str) -> RetrievalTool {
    let ran = dir.join("tool.ran");
    let program = script(
        dir,
        "steamcmd.sh",
        &format!("echo \"$@\" > {}\n{body}", ran.display()),
    );
    RetrievalTool {
        program,
        app_id: APP_ID.to_string(),
        validate: false,
        extra_args: Vec::new(),
    }
}

fn install(dir: &Path) -> ServerInstall {
    let server = dir.join("server");
    fs::create_dir_all(&server).unwrap();
    ServerInstall {
        dir: server,
        binary: PathBuf::from("valheim_server.x86_64"),
        app_id: APP_ID.to_string(),
    }
}

fn manager(tool: RetrievalTool, install: ServerInstall, players: Arc<Players>) -> UpdateManager {
    UpdateManager::new(
        tool,
        install,
        idle_detector(players),
        Arc::new(Hooks::default()),
    )
}

const INSTALL_BUILD: &str = r#"mkdir -p "$2/steamapps"
touch "$2/valheim_server.x86_64"
printf '"AppState"\n{\n\t"buildid"\t\t"%s"\n}\n' "$BUILD" > "$2/steamapps/appmanifest_896660.acf""#;

#[tokio::test]
async fn test_update_installs_and_detects_new_build() {
    let dir = tempdir().unwrap();
    let build_file = dir.path().join("build");
    fs::write(&build_file, "100").unwrap();
    let body = format!("BUILD=$(cat {})\n{INSTALL_BUILD}", build_file.display());
    let updates = manager(tool(dir.path(), &body), install(dir.path()), Arc::default());
    let cancel = CancellationToken::new();
    let opts = UpdateOptions::forced(Duration::from_secs(10));

    let first = updates.run_update(opts, &cancel).await;
    assert_eq!(first.outcome, UpdateOutcome::Completed);
    assert!(first.started);
    assert!(first.build_changed);
    assert!(updates.install().is_present());
    assert_eq!(updates.install().build_id().await.as_deref(), Some("100"));

    let unchanged = updates.run_update(opts, &cancel).await;
    assert!(unchanged.is_success());
    assert!(!unchanged.build_changed);

    fs::write(&build_file, "101").unwrap();
    let changed = updates.run_update(opts, &cancel).await;
    assert!(changed.build_changed);

    let args = fs::read_to_string(dir.path().join("tool.ran")).unwrap();
    assert!(args.starts_with("+force_install_dir"));
    assert!(args.trim_end().ends_with("+app_update 896660 +quit"));
}

#[tokio::test]
async fn test_update_timeout_keeps_install() {
    let dir = tempdir().unwrap();
    let install = install(dir.path());
    fs::write(install.binary_path(), b"old build").unwrap();
    let updates = manager(tool(dir.path(), "sleep 30"), install, Arc::default());
    let timeout = Duration::from_millis(300);

    let started = Instant::now();
    let result = updates
        .run_update(UpdateOptions::forced(timeout), &CancellationToken::new())
        .await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.outcome, UpdateOutcome::TimedOut);
    assert!(result.started);
    assert!(result.timed_out);
    assert!(matches!(
        result.error(timeout, &updates.tool().program),
        Some(LifecycleError::Timeout { .. })
    ));
    assert_eq!(
        fs::read(updates.install().binary_path()).unwrap(),
        b"old build"
    );
}

#[tokio::test]
async fn test_update_failure_is_reported() {
    let dir = tempdir().unwrap();
    let updates = manager(tool(dir.path(), "exit 3"), install(dir.path()), Arc::default());
    let timeout = Duration::from_secs(10);

    let result = updates
        .run_update(UpdateOptions::forced(timeout), &CancellationToken::new())
        .await;
    assert_eq!(result.outcome, UpdateOutcome::Failed);
    assert_eq!(result.exit_status.and_then(|s| s.code()), Some(3));
    assert!(matches!(
        result.error(timeout, &updates.tool().program),
        Some(LifecycleError::SubprocessFailure { .. })
    ));
}

#[tokio::test]
async fn test_missing_tool_is_a_failure() {
    let dir = tempdir().unwrap();
    let mut tool = tool(dir.path(), "");
    tool.program = dir.path().join("does-not-exist");
    let updates = manager(tool, install(dir.path()), Arc::default());

    let result = updates
        .run_update(
            UpdateOptions::forced(Duration::from_secs(5)),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(result.outcome, UpdateOutcome::Failed);
    assert!(result.exit_status.is_none());
}

#[tokio::test]
async fn test_deferred_while_players_connected() {
    let dir = tempdir().unwrap();
    let players = Arc::new(Players::default());
    players.set(3);
    let updates = manager(tool(dir.path(), ""), install(dir.path()), players.clone());
    let cancel = CancellationToken::new();
    let timeout = Duration::from_secs(5);

    let result = updates
        .run_update(UpdateOptions::scheduled(true, timeout), &cancel)
        .await;
    assert_eq!(result.outcome, UpdateOutcome::Deferred);
    assert!(!result.started);
    assert!(!dir.path().join("tool.ran").exists());

    // The startup run is never gated.
    let result = updates.run_update(UpdateOptions::forced(timeout), &cancel).await;
    assert!(result.is_success());
}

#[tokio::test]
async fn test_concurrent_update_is_busy() {
    let dir = tempdir().unwrap();
    let updates = Arc::new(manager(
        tool(dir.path(), "sleep 2"),
        install(dir.path()),
        Arc::default(),
    ));
    let cancel = CancellationToken::new();
    let opts = UpdateOptions::forced(Duration::from_secs(10));

    let first = {
        let updates = updates.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { updates.run_update(opts, &cancel).await })
    };
    let ran = dir.path().join("tool.ran");
    assert!(
        poll_until(Duration::from_secs(5), Duration::from_millis(20), || {
            let ran = ran.clone();
            async move { ran.exists() }
        })
        .await
    );

    let second = updates.run_update(opts, &cancel).await;
    assert_eq!(second.outcome, UpdateOutcome::Busy);
    assert!(!second.started);

    cancel.cancel();
    assert_eq!(first.await.unwrap().outcome, UpdateOutcome::Cancelled);
}

#[tokio::test]
async fn test_cancel_kills_tool() {
    let dir = tempdir().unwrap();
    let updates = manager(tool(dir.path(), "sleep 30"), install(dir.path()), Arc::default());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = updates
        .run_update(UpdateOptions::forced(Duration::from_secs(60)), &cancel)
        .await;
    assert_eq!(result.outcome, UpdateOutcome::Cancelled);
    assert!(result.error(Duration::from_secs(60), &updates.tool().program).is_none());
    assert!(started.elapsed() < Duration::from_secs(5));
}
