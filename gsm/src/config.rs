use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, bail};
use libgsm::backup::RetentionPolicy;
use libgsm::{
    BackupConfig, HookPoint, Hooks, OrchestratorConfig, RetrievalTool, ScheduleEntry,
    ServerCommand, ServerInstall, TaskKind,
};
use nix::sys::signal::Signal;

use crate::cli::Config;

/// Steam game id the dedicated server expects in its environment.
const GAME_APP_ID: &str = "892970";

/// Validated, typed view of the command line and environment.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) orchestrator: OrchestratorConfig,
    pub(crate) tool: RetrievalTool,
    pub(crate) install: ServerInstall,
    pub(crate) backup: BackupConfig,
    pub(crate) server: ServerCommand,
    pub(crate) schedule: Vec<ScheduleEntry>,
    pub(crate) hooks: Hooks,
    pub(crate) query_addr: SocketAddr,
    pub(crate) idle_timeout: Duration,
    /// `None` selects the query probe.
    pub(crate) ready_marker: Option<String>,
    pub(crate) update_if_idle: bool,
    pub(crate) backups_enabled: bool,
    pub(crate) backups_if_idle: bool,
    pub(crate) pid_file: PathBuf,
}

pub(crate) fn parse_signal(raw: &str) -> Result<Signal> {
    let upper = raw.trim().to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| anyhow::anyhow!("unknown signal `{raw}`"))
}

/// Check every setting and report all problems at once.
pub(crate) fn validate_config(config: &Config) -> Result<Settings> {
    let mut validation_errors = Vec::new();

    if config.world_name.is_empty() || config.world_name.contains('/') {
        validation_errors.push(format!(
            "WORLD_NAME `{}` must be a non-empty file name",
            config.world_name
        ));
    }
    if config.steam_app_id.is_empty() || !config.steam_app_id.chars().all(|c| c.is_ascii_digit()) {
        validation_errors.push(format!(
            "STEAM_APP_ID `{}` must be numeric",
            config.steam_app_id
        ));
    }
    if config.server_port == u16::MAX {
        validation_errors.push("SERVER_PORT must leave room for the query port".to_string());
    }
    for (name, value) in [
        ("UPDATE_TIMEOUT", config.update_timeout),
        ("STARTUP_TIMEOUT", config.startup_timeout),
        ("STOP_TIMEOUT", config.stop_timeout),
        ("IDLE_QUERY_TIMEOUT", config.idle_query_timeout),
        ("HOOK_TIMEOUT", config.hook_timeout),
    ] {
        if value == 0 {
            validation_errors.push(format!("{name} must be greater than 0"));
        }
    }

    let stop_signal = match parse_signal(&config.stop_signal) {
        Ok(signal) => Some(signal),
        Err(e) => {
            validation_errors.push(format!("STOP_SIGNAL: {e}"));
            None
        }
    };

    let mut schedule = Vec::new();
    if !config.update_cron.trim().is_empty() {
        match ScheduleEntry::new(TaskKind::Update, &config.update_cron, config.update_if_idle) {
            Ok(entry) => schedule.push(entry),
            Err(e) => validation_errors.push(format!("UPDATE_CRON: {e}")),
        }
    }
    if config.backups_enabled {
        if config.backups_cron.trim().is_empty() {
            validation_errors.push("BACKUPS_CRON must be set when BACKUPS_ENABLED".to_string());
        } else {
            match ScheduleEntry::new(TaskKind::Backup, &config.backups_cron, config.backups_if_idle)
            {
                Ok(entry) => schedule.push(entry),
                Err(e) => validation_errors.push(format!("BACKUPS_CRON: {e}")),
            }
        }
    }

    if !validation_errors.is_empty() {
        bail!("invalid configuration:\n{}", validation_errors.join("\n"));
    }
    let Some(stop_signal) = stop_signal else {
        bail!("invalid configuration: STOP_SIGNAL");
    };

    let mut hooks = Hooks::new(Duration::from_secs(config.hook_timeout));
    for point in HookPoint::ALL {
        if let Ok(command) = std::env::var(point.env_name()) {
            hooks = hooks.with(point, command);
        }
    }

    let query_addr = config.server_query_addr.unwrap_or_else(|| {
        SocketAddr::from((Ipv4Addr::LOCALHOST, config.server_port + 1))
    });
    let marker = config.ready_log_marker.trim();

    Ok(Settings {
        orchestrator: OrchestratorConfig {
            update_on_start: config.update_on_start,
            update_timeout: Duration::from_secs(config.update_timeout),
            startup_timeout: Duration::from_secs(config.startup_timeout),
            stop_signal,
            stop_timeout: Duration::from_secs(config.stop_timeout),
            task_grace: Duration::from_secs(config.task_grace),
            health_interval: (config.supervisor_check_interval > 0)
                .then(|| Duration::from_secs(config.supervisor_check_interval)),
            restart_on_update: config.update_restart,
        },
        tool: RetrievalTool {
            program: config.steamcmd_path.clone(),
            app_id: config.steam_app_id.clone(),
            validate: config.update_validate,
            extra_args: split_args(&config.steamcmd_args),
        },
        install: ServerInstall {
            dir: config.server_directory.clone(),
            binary: config.server_binary.clone(),
            app_id: config.steam_app_id.clone(),
        },
        backup: BackupConfig {
            directory: config.backups_directory.clone(),
            world_dir: config.worlds_directory.clone(),
            world_name: config.world_name.clone(),
            compress: config.backups_zip,
            retention: RetentionPolicy {
                max_age_days: config.backups_max_age,
                max_count: config.backups_max_count,
            },
        },
        server: server_command(config),
        schedule,
        hooks,
        query_addr,
        idle_timeout: Duration::from_secs(config.idle_query_timeout),
        ready_marker: (!marker.is_empty()).then(|| marker.to_string()),
        update_if_idle: config.update_if_idle,
        backups_enabled: config.backups_enabled,
        backups_if_idle: config.backups_if_idle,
        pid_file: config.pid_file.clone(),
    })
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Dedicated server command line. The save directory is the parent of the worlds directory.
fn server_command(config: &Config) -> ServerCommand {
    let savedir = config
        .worlds_directory
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| config.worlds_directory.clone());

    let mut args = vec![
        "-nographics".to_string(),
        "-batchmode".to_string(),
        "-name".to_string(),
        config.server_name.clone(),
        "-port".to_string(),
        config.server_port.to_string(),
        "-world".to_string(),
        config.world_name.clone(),
        "-public".to_string(),
        if config.server_public { "1" } else { "0" }.to_string(),
        "-savedir".to_string(),
        savedir.display().to_string(),
    ];
    if !config.server_pass.is_empty() {
        args.push("-password".to_string());
        args.push(config.server_pass.clone());
    }
    args.extend(split_args(&config.server_args));

    let library_path = match std::env::var("LD_LIBRARY_PATH") {
        Ok(existing) if !existing.is_empty() => format!(
            "{}/linux64:{existing}",
            config.server_directory.display()
        ),
        _ => format!("{}/linux64", config.server_directory.display()),
    };

    ServerCommand {
        program: config.server_directory.join(&config.server_binary),
        args,
        working_dir: config.server_directory.clone(),
        env: vec![
            ("SteamAppId".to_string(), GAME_APP_ID.to_string()),
            ("LD_LIBRARY_PATH".to_string(), library_path),
        ],
        log_file: config.server_log.clone(),
    }
}
