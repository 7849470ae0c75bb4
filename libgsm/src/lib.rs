pub mod backup;
pub mod clock;
pub mod error;
pub mod hooks;
pub mod idle;
pub mod lock;
pub mod orchestrator;
pub mod poll;
pub mod schedule;
pub mod state;
pub mod supervisor;
pub mod update;

// re-export selected public API
pub use backup::{BackupConfig, BackupManager, BackupOptions, BackupOutcome, BackupRecord};
pub use error::{LifecycleError, Result};
pub use hooks::{HookPoint, Hooks};
pub use idle::{A2sQuery, IdleDetector, IdleSource};
pub use orchestrator::{Control, Orchestrator, OrchestratorConfig};
pub use schedule::{CronSchedule, ScheduleEntry, TaskKind};
pub use state::LifecycleState;
pub use supervisor::{ChildSupervisor, ProcessSupervisor, ServerCommand};
pub use update::{RetrievalTool, ServerInstall, UpdateManager, UpdateOptions, UpdateOutcome};
