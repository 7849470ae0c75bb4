use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Local};
use libgsm::supervisor::{LogMarkerProbe, QueryProbe, ReadinessProbe};
use libgsm::{
    A2sQuery, BackupManager, BackupOptions, BackupOutcome, ChildSupervisor, Control, IdleDetector,
    Orchestrator, UpdateManager, UpdateOptions, UpdateOutcome,
};
use nix::sys::signal::{Signal, kill};
use tabwriter::TabWriter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::pidfile::{self, PidFile};
use crate::signals;

struct Components {
    idle: Arc<IdleDetector>,
    updates: Arc<UpdateManager>,
    backups: Arc<BackupManager>,
}

fn components(settings: &Settings) -> Components {
    let hooks = Arc::new(settings.hooks.clone());
    let idle = Arc::new(IdleDetector::new(
        Arc::new(A2sQuery::new(settings.query_addr)),
        settings.idle_timeout,
    ));
    let updates = Arc::new(UpdateManager::new(
        settings.tool.clone(),
        settings.install.clone(),
        idle.clone(),
        hooks.clone(),
    ));
    let backups = Arc::new(BackupManager::new(
        settings.backup.clone(),
        idle.clone(),
        hooks,
    ));
    Components {
        idle,
        updates,
        backups,
    }
}

/// Run the daemon until terminated.
pub(crate) async fn run(settings: Settings) -> Result<()> {
    // Manual triggers reach the daemon through this file.
    let _pid_file = PidFile::create(&settings.pid_file)
        .context("cannot run without a pid file for manual triggers to find")?;

    let Components {
        updates, backups, ..
    } = components(&settings);
    let probe: Arc<dyn ReadinessProbe> = match &settings.ready_marker {
        Some(marker) => Arc::new(LogMarkerProbe::new(&settings.server.log_file, marker)),
        None => Arc::new(QueryProbe::new(
            A2sQuery::new(settings.query_addr),
            settings.idle_timeout,
        )),
    };
    let supervisor = Arc::new(ChildSupervisor::new(settings.server.clone(), probe));

    let (tx, rx) = mpsc::channel(16);
    let listener = signals::spawn_listener(tx)?;

    let orchestrator = Orchestrator::new(settings.orchestrator, supervisor, updates, backups)
        .with_schedule(settings.schedule.clone())
        .with_hooks(Arc::new(settings.hooks.clone()));
    let result = orchestrator.run(rx).await;
    listener.abort();
    result.context("lifecycle orchestrator failed")
}

/// Forward `signal` to a live daemon. Returns whether one was found.
fn forward(settings: &Settings, signal: Signal) -> Result<bool> {
    let Some(pid) = pidfile::read_live(&settings.pid_file) else {
        return Ok(false);
    };
    kill(pid, signal).with_context(|| format!("failed to signal gsm daemon (pid {pid})"))?;
    info!(%pid, %signal, "request forwarded to running daemon");
    Ok(true)
}

/// Cancels `token` on Ctrl+C so standalone runs clean up after themselves.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            token.cancel();
        }
    });
}

pub(crate) async fn backup(settings: Settings, force: bool) -> Result<()> {
    let parts = components(&settings);
    if !force && !settings.backups_enabled {
        bail!("backups are disabled (BACKUPS_ENABLED=false); use --force to back up anyway");
    }
    if !force && settings.backups_if_idle && !parts.idle.is_idle().await {
        println!("players connected, backup deferred");
        return Ok(());
    }
    if forward(&settings, Signal::SIGUSR1)? {
        return Ok(());
    }

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    // The idle gate, if any, was evaluated above.
    match parts.backups.run_backup(BackupOptions::forced(), &cancel).await? {
        BackupOutcome::Created(record) => {
            println!("{}", record.path.display());
            Ok(())
        }
        BackupOutcome::Deferred => Ok(()),
        BackupOutcome::Cancelled => bail!("backup cancelled"),
    }
}

pub(crate) async fn update(settings: Settings, force: bool) -> Result<()> {
    let parts = components(&settings);
    if !force && settings.update_if_idle && !parts.idle.is_idle().await {
        println!("players connected, update deferred");
        return Ok(());
    }
    if forward(&settings, Signal::SIGUSR2)? {
        return Ok(());
    }

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    let timeout = settings.orchestrator.update_timeout;
    let result = parts
        .updates
        .run_update(UpdateOptions::forced(timeout), &cancel)
        .await;
    if let Some(e) = result.error(timeout, &settings.tool.program) {
        return Err(anyhow!(e));
    }
    match result.outcome {
        UpdateOutcome::Cancelled => bail!("update cancelled"),
        UpdateOutcome::Busy => bail!("another update is in progress"),
        _ => {
            if result.build_changed {
                println!("new build installed");
            }
            Ok(())
        }
    }
}

pub(crate) async fn list_backups(settings: Settings, json: bool) -> Result<()> {
    let records = components(&settings).backups.list().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    let mut tab_writer = TabWriter::new(io::stdout());
    writeln!(&mut tab_writer, "ID\tSIZE\tCREATED\tPATH")?;
    for record in &records {
        let created: DateTime<Local> = DateTime::from(record.created_at);
        writeln!(
            &mut tab_writer,
            "{}\t{}\t{}\t{}",
            record.id,
            record.size_bytes,
            created.to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
            record.path.display()
        )?;
    }
    tab_writer.flush()?;
    Ok(())
}
