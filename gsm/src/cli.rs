use std::net::SocketAddr;
use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "gsm", version, about = "Game server lifecycle manager", long_about = None)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) config: Config,

    #[command(subcommand)]
    pub(crate) command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub(crate) enum Commands {
    #[command(about = "Update, start and supervise the server until terminated (default)")]
    Run,
    #[command(about = "Take a backup now, through the running daemon when there is one")]
    Backup {
        /// Ignore BACKUPS_ENABLED and the idle gate
        #[arg(long)]
        force: bool,
    },
    #[command(about = "Update the server files now, through the running daemon when there is one")]
    Update {
        /// Ignore the idle gate
        #[arg(long)]
        force: bool,
    },
    #[command(about = "List the backups of the configured world")]
    ListBackups {
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct Config {
    /// Update the server files before starting it
    #[arg(long, env = "UPDATE_ON_START", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub(crate) update_on_start: bool,

    /// Update deadline in seconds
    #[arg(long, env = "UPDATE_TIMEOUT", default_value_t = 1800)]
    pub(crate) update_timeout: u64,

    /// Update schedule; empty disables scheduled updates
    #[arg(long, env = "UPDATE_CRON", default_value = "*/15 * * * *")]
    pub(crate) update_cron: String,

    /// Only run scheduled updates while nobody is connected
    #[arg(long, env = "UPDATE_IF_IDLE", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub(crate) update_if_idle: bool,

    /// Restart the server after an update installed a new build
    #[arg(long, env = "UPDATE_RESTART", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub(crate) update_restart: bool,

    /// Ask steamcmd to validate installed files
    #[arg(long, env = "UPDATE_VALIDATE", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub(crate) update_validate: bool,

    #[arg(long, env = "STEAMCMD_PATH", default_value = "/opt/steamcmd/steamcmd.sh")]
    pub(crate) steamcmd_path: PathBuf,

    #[arg(long, env = "STEAM_APP_ID", default_value = "896660")]
    pub(crate) steam_app_id: String,

    /// Extra arguments passed to steamcmd before +quit
    #[arg(long, env = "STEAMCMD_ARGS", default_value = "", allow_hyphen_values = true)]
    pub(crate) steamcmd_args: String,

    #[arg(long, env = "BACKUPS_ENABLED", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub(crate) backups_enabled: bool,

    #[arg(long, env = "BACKUPS_CRON", default_value = "5 * * * *")]
    pub(crate) backups_cron: String,

    #[arg(long, env = "BACKUPS_IF_IDLE", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub(crate) backups_if_idle: bool,

    #[arg(long, env = "BACKUPS_DIRECTORY", default_value = "/config/backups")]
    pub(crate) backups_directory: PathBuf,

    /// Delete backups older than this many days; 0 keeps them forever
    #[arg(long, env = "BACKUPS_MAX_AGE", default_value_t = 3)]
    pub(crate) backups_max_age: u32,

    /// Keep at most this many backups; 0 means no limit
    #[arg(long, env = "BACKUPS_MAX_COUNT", default_value_t = 0)]
    pub(crate) backups_max_count: usize,

    #[arg(long, env = "BACKUPS_ZIP", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub(crate) backups_zip: bool,

    #[arg(long, env = "WORLDS_DIRECTORY", default_value = "/config/worlds_local")]
    pub(crate) worlds_directory: PathBuf,

    #[arg(long, env = "WORLD_NAME", default_value = "Dedicated")]
    pub(crate) world_name: String,

    #[arg(long, env = "SERVER_DIRECTORY", default_value = "/opt/valheim/server")]
    pub(crate) server_directory: PathBuf,

    /// Server executable, relative to SERVER_DIRECTORY
    #[arg(long, env = "SERVER_BINARY", default_value = "valheim_server.x86_64")]
    pub(crate) server_binary: PathBuf,

    #[arg(long, env = "SERVER_NAME", default_value = "My Server")]
    pub(crate) server_name: String,

    #[arg(long, env = "SERVER_PORT", default_value_t = 2456)]
    pub(crate) server_port: u16,

    #[arg(long, env = "SERVER_PASS", default_value = "", hide_env_values = true)]
    pub(crate) server_pass: String,

    #[arg(long, env = "SERVER_PUBLIC", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub(crate) server_public: bool,

    /// Extra arguments appended to the server command line
    #[arg(long, env = "SERVER_ARGS", default_value = "", allow_hyphen_values = true)]
    pub(crate) server_args: String,

    #[arg(long, env = "SERVER_LOG", default_value = "/config/server.log")]
    pub(crate) server_log: PathBuf,

    /// A2S query address; defaults to 127.0.0.1 on SERVER_PORT + 1
    #[arg(long, env = "SERVER_QUERY_ADDR")]
    pub(crate) server_query_addr: Option<SocketAddr>,

    /// Log line that means the server is ready; empty switches to the query probe
    #[arg(long, env = "READY_LOG_MARKER", default_value = "Game server connected")]
    pub(crate) ready_log_marker: String,

    #[arg(long, env = "STARTUP_TIMEOUT", default_value_t = 300)]
    pub(crate) startup_timeout: u64,

    #[arg(long, env = "STOP_SIGNAL", default_value = "SIGINT")]
    pub(crate) stop_signal: String,

    #[arg(long, env = "STOP_TIMEOUT", default_value_t = 30)]
    pub(crate) stop_timeout: u64,

    /// Seconds in-flight tasks get to finish once shutdown starts
    #[arg(long, env = "TASK_GRACE", default_value_t = 30)]
    pub(crate) task_grace: u64,

    #[arg(long, env = "IDLE_QUERY_TIMEOUT", default_value_t = 3)]
    pub(crate) idle_query_timeout: u64,

    /// Seconds between crash checks; 0 disables them
    #[arg(long, env = "SUPERVISOR_CHECK_INTERVAL", default_value_t = 10)]
    pub(crate) supervisor_check_interval: u64,

    #[arg(long, env = "HOOK_TIMEOUT", default_value_t = 300)]
    pub(crate) hook_timeout: u64,

    #[arg(long, env = "PID_FILE", default_value = "/var/run/gsm.pid")]
    pub(crate) pid_file: PathBuf,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub(crate) log_format: LogFormat,
}
