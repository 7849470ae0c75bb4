pub mod scheduler;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Interval, MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupManager, BackupOptions, BackupOutcome};
use crate::clock::{Clock, SystemClock};
use crate::error::{LifecycleError, Result};
use crate::hooks::{HookPoint, Hooks};
use crate::lock::WorkLock;
use crate::schedule::{ScheduleEntry, TaskKind};
use crate::state::{LifecycleState, StateMachine};
use crate::supervisor::ProcessSupervisor;
use crate::update::{UpdateManager, UpdateOptions, UpdateOutcome};

pub use scheduler::Scheduler;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub update_on_start: bool,
    pub update_timeout: Duration,
    /// Bound on the ready-wait after a start. Expiry is logged, not fatal.
    pub startup_timeout: Duration,
    pub stop_signal: Signal,
    pub stop_timeout: Duration,
    /// How long in-flight tasks get to wind down once shutdown begins.
    pub task_grace: Duration,
    /// Crash check period while running; `None` disables it.
    pub health_interval: Option<Duration>,
    /// Restart the server after an update installed a new build.
    pub restart_on_update: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            update_on_start: true,
            update_timeout: Duration::from_secs(1800),
            startup_timeout: Duration::from_secs(300),
            stop_signal: Signal::SIGINT,
            stop_timeout: Duration::from_secs(30),
            task_grace: Duration::from_secs(30),
            health_interval: Some(Duration::from_secs(10)),
            restart_on_update: true,
        }
    }
}

/// Requests delivered to a running orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Shutdown,
    /// `force` bypasses the idle gate.
    Backup { force: bool },
    Update { force: bool },
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Scheduled { only_if_idle: bool },
    Manual { force: bool },
}

#[derive(Debug, Clone, Copy)]
enum Finished {
    Task(TaskKind),
    Restart,
}

/// Sequences startup, periodic work and shutdown of one game server.
pub struct Orchestrator {
    config: OrchestratorConfig,
    state: Arc<StateMachine>,
    supervisor: Arc<dyn ProcessSupervisor>,
    updates: Arc<UpdateManager>,
    backups: Arc<BackupManager>,
    hooks: Arc<Hooks>,
    schedule: Vec<ScheduleEntry>,
    clock: Arc<dyn Clock>,
    work: WorkLock,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        supervisor: Arc<dyn ProcessSupervisor>,
        updates: Arc<UpdateManager>,
        backups: Arc<BackupManager>,
    ) -> Self {
        Self {
            config,
            state: Arc::new(StateMachine::new()),
            supervisor,
            updates,
            backups,
            hooks: Arc::new(Hooks::default()),
            schedule: Vec::new(),
            clock: Arc::new(SystemClock),
            work: WorkLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_schedule(mut self, schedule: Vec<ScheduleEntry>) -> Self {
        self.schedule = schedule;
        self
    }

    /// Hooks run around server start and stop.
    pub fn with_hooks(mut self, hooks: Arc<Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// The lock every task takes before touching server or world files.
    pub fn work_lock(&self) -> WorkLock {
        self.work.clone()
    }

    fn worker(&self) -> Worker {
        Worker {
            config: self.config,
            supervisor: self.supervisor.clone(),
            updates: self.updates.clone(),
            backups: self.backups.clone(),
            hooks: self.hooks.clone(),
            work: self.work.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Drive the server until a [`Control::Shutdown`] arrives or `control` closes.
    ///
    /// Returns an error only for [`LifecycleError::Fatal`] conditions; everything else is
    /// logged and survived.
    pub async fn run(self, mut control: mpsc::Receiver<Control>) -> Result<()> {
        if let Err(e) = self.backups.recover().await {
            warn!(error = %e, "failed to clean up partial backups");
        }

        self.state.transition(LifecycleState::Updating)?;
        let worker = self.worker();
        let mut shutdown_requested = false;
        // Manual requests that arrive before the server is up run once it is.
        let mut deferred = Vec::new();

        let updated = if self.config.update_on_start {
            let update = self.updates.run_update(
                UpdateOptions::forced(self.config.update_timeout),
                &self.cancel,
            );
            tokio::pin!(update);
            let result = loop {
                tokio::select! {
                    result = &mut update => break result,
                    msg = control.recv(), if !shutdown_requested => match msg {
                        Some(Control::Shutdown) | None => {
                            info!("termination requested during startup update");
                            shutdown_requested = true;
                            self.cancel.cancel();
                        }
                        Some(other) => defer(&mut deferred, other),
                    },
                }
            };
            if let Some(e) = result.error(self.config.update_timeout, &self.updates.tool().program)
            {
                error!(error = %e, "startup update failed");
            }
            result.outcome == UpdateOutcome::Completed
        } else {
            info!("startup update disabled");
            false
        };

        if shutdown_requested {
            self.shutdown(JoinSet::new()).await;
            return Ok(());
        }

        let install = self.updates.install();
        if !updated && !install.is_present() {
            let msg = format!(
                "no server binary at {} and no successful update",
                install.binary_path().display()
            );
            error!("{msg}");
            self.state.transition(LifecycleState::Stopped)?;
            return Err(LifecycleError::Fatal(msg));
        }

        self.state.transition(LifecycleState::Starting)?;
        self.hooks.run(HookPoint::PreServerRun, &[]).await;
        if let Err(e) = self.supervisor.start().await {
            error!(error = format!("{e:#}"), "failed to start server");
            self.shutdown(JoinSet::new()).await;
            return Err(LifecycleError::Fatal(format!("server failed to start: {e:#}")));
        }

        let ready = until_shutdown(
            &mut control,
            &mut deferred,
            self.supervisor.wait_for_ready(self.config.startup_timeout),
        )
        .await;
        match ready {
            None => {
                self.shutdown(JoinSet::new()).await;
                return Ok(());
            }
            Some(true) => info!("server is ready"),
            Some(false) => warn!(
                timeout = ?self.config.startup_timeout,
                "server did not report ready in time, continuing"
            ),
        }
        self.hooks.run(HookPoint::PostServerRun, &[]).await;
        self.state.transition(LifecycleState::Running)?;

        let tasks = self.steady_state(&worker, &mut control, deferred).await;
        self.shutdown(tasks).await;
        Ok(())
    }

    async fn steady_state(
        &self,
        worker: &Worker,
        control: &mut mpsc::Receiver<Control>,
        deferred: Vec<Control>,
    ) -> JoinSet<Finished> {
        let mut scheduler = Scheduler::new(self.schedule.clone(), self.clock.clone());
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<TaskKind, usize> = HashMap::new();
        for request in deferred {
            info!(?request, "running request received during startup");
            dispatch_manual(&mut tasks, &mut in_flight, worker, request);
        }
        let mut restarting = false;
        let mut health = self.config.health_interval.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                msg = control.recv() => match msg {
                    Some(Control::Shutdown) | None => break,
                    Some(request) => dispatch_manual(&mut tasks, &mut in_flight, worker, request),
                },
                due = scheduler.next_due() => {
                    for entry in due {
                        if in_flight.get(&entry.kind).copied().unwrap_or(0) > 0 {
                            info!(task = %entry.kind, "previous run still in flight, skipping");
                            continue;
                        }
                        let trigger = Trigger::Scheduled { only_if_idle: entry.only_if_idle };
                        spawn_task(&mut tasks, &mut in_flight, worker, entry.kind, trigger);
                    }
                }
                _ = tick(&mut health) => {
                    if restarting || self.supervisor.is_running().await {
                        continue;
                    }
                    let Some(guard) = self.work.try_acquire() else {
                        debug!("server not running but work is in progress, checking later");
                        continue;
                    };
                    // Work may have finished between the check and the lock.
                    if self.supervisor.is_running().await {
                        continue;
                    }
                    restarting = true;
                    let worker = worker.clone();
                    tasks.spawn(async move {
                        let _guard = guard;
                        warn!("server exited unexpectedly, restarting");
                        worker.start_server().await;
                        Finished::Restart
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok(Finished::Task(kind)) => {
                        if let Some(n) = in_flight.get_mut(&kind) {
                            *n = n.saturating_sub(1);
                        }
                    }
                    Ok(Finished::Restart) => restarting = false,
                    Err(e) => {
                        error!(error = %e, "background task panicked");
                        // The panicked task's kind is unknown; recount from scratch.
                        in_flight.clear();
                        restarting = false;
                    }
                },
            }
        }
        tasks
    }

    async fn shutdown(&self, mut tasks: JoinSet<Finished>) {
        if let Err(e) = self.state.transition(LifecycleState::ShuttingDown) {
            warn!(error = %e, "unexpected state at shutdown");
        }
        self.cancel.cancel();

        if !tasks.is_empty() {
            info!(count = tasks.len(), grace = ?self.config.task_grace, "waiting for in-flight tasks");
            let drained = timeout(self.config.task_grace, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("in-flight tasks did not finish in time, aborting them");
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
        }
        // An aborted backup's archive thread may still be reading the world.
        self.backups.wait_idle().await;

        // Nothing else may touch the world files while the server saves.
        let _guard = self.work.acquire(&CancellationToken::new()).await;
        self.hooks.run(HookPoint::PreServerShutdown, &[]).await;
        if let Err(e) = self
            .supervisor
            .stop(self.config.stop_signal, self.config.stop_timeout)
            .await
        {
            error!(error = format!("{e:#}"), "failed to stop server cleanly");
        }
        self.hooks.run(HookPoint::PostServerShutdown, &[]).await;

        if let Err(e) = self.state.transition(LifecycleState::Stopped) {
            warn!(error = %e, "unexpected state at shutdown");
        }
    }
}

/// Per-task handle on the shared components.
#[derive(Clone)]
struct Worker {
    config: OrchestratorConfig,
    supervisor: Arc<dyn ProcessSupervisor>,
    updates: Arc<UpdateManager>,
    backups: Arc<BackupManager>,
    hooks: Arc<Hooks>,
    work: WorkLock,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, kind: TaskKind, trigger: Trigger) {
        let Some(_guard) = self.work.acquire(&self.cancel).await else {
            debug!(task = %kind, "cancelled while waiting for the work lock");
            return;
        };
        match kind {
            TaskKind::Update => self.update(trigger).await,
            TaskKind::Backup => self.backup(trigger).await,
        }
    }

    async fn update(&self, trigger: Trigger) {
        let timeout = self.config.update_timeout;
        let opts = match trigger {
            Trigger::Manual { force: true } => UpdateOptions::forced(timeout),
            Trigger::Manual { force: false } => UpdateOptions::scheduled(true, timeout),
            Trigger::Scheduled { only_if_idle } => UpdateOptions::scheduled(only_if_idle, timeout),
        };
        let result = self.updates.run_update(opts, &self.cancel).await;
        if let Some(e) = result.error(timeout, &self.updates.tool().program) {
            error!(task = "update", error = %e, "task failed");
            return;
        }
        if result.build_changed && self.config.restart_on_update && !self.cancel.is_cancelled() {
            info!("new server build installed, restarting server");
            self.stop_server().await;
            self.start_server().await;
        }
    }

    async fn backup(&self, trigger: Trigger) {
        let opts = match trigger {
            Trigger::Manual { force: true } => BackupOptions::forced(),
            Trigger::Manual { force: false } => BackupOptions::scheduled(true),
            Trigger::Scheduled { only_if_idle } => BackupOptions::scheduled(only_if_idle),
        };
        match self.backups.run_backup(opts, &self.cancel).await {
            Ok(BackupOutcome::Deferred) => debug!(task = "backup", "deferred until idle"),
            Ok(_) => {}
            Err(e) => error!(task = "backup", error = %e, "task failed"),
        }
    }

    async fn stop_server(&self) {
        self.hooks.run(HookPoint::PreServerShutdown, &[]).await;
        if let Err(e) = self
            .supervisor
            .stop(self.config.stop_signal, self.config.stop_timeout)
            .await
        {
            error!(error = format!("{e:#}"), "failed to stop server");
        }
        self.hooks.run(HookPoint::PostServerShutdown, &[]).await;
    }

    async fn start_server(&self) {
        self.hooks.run(HookPoint::PreServerRun, &[]).await;
        if let Err(e) = self.supervisor.start().await {
            error!(error = format!("{e:#}"), "failed to start server");
            return;
        }
        let ready = tokio::select! {
            ready = self.supervisor.wait_for_ready(self.config.startup_timeout) => ready,
            _ = self.cancel.cancelled() => return,
        };
        if !ready {
            warn!(timeout = ?self.config.startup_timeout, "server did not report ready in time");
        }
        self.hooks.run(HookPoint::PostServerRun, &[]).await;
    }
}

fn dispatch_manual(
    tasks: &mut JoinSet<Finished>,
    in_flight: &mut HashMap<TaskKind, usize>,
    worker: &Worker,
    request: Control,
) {
    let (kind, force) = match request {
        Control::Backup { force } => (TaskKind::Backup, force),
        Control::Update { force } => (TaskKind::Update, force),
        Control::Shutdown => return,
    };
    info!(task = %kind, force, "manual request");
    spawn_task(tasks, in_flight, worker, kind, Trigger::Manual { force });
}

fn defer(deferred: &mut Vec<Control>, request: Control) {
    if deferred.contains(&request) {
        debug!(?request, "same request already queued");
        return;
    }
    warn!(?request, "server not running yet, request queued until startup completes");
    deferred.push(request);
}

fn spawn_task(
    tasks: &mut JoinSet<Finished>,
    in_flight: &mut HashMap<TaskKind, usize>,
    worker: &Worker,
    kind: TaskKind,
    trigger: Trigger,
) {
    *in_flight.entry(kind).or_default() += 1;
    debug!(task = %kind, ?trigger, "dispatching task");
    let worker = worker.clone();
    tasks.spawn(async move {
        worker.run(kind, trigger).await;
        Finished::Task(kind)
    });
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Await `fut`, giving up early if shutdown is requested on `control`.
async fn until_shutdown<F: Future>(
    control: &mut mpsc::Receiver<Control>,
    deferred: &mut Vec<Control>,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            msg = control.recv() => match msg {
                Some(Control::Shutdown) | None => return None,
                Some(other) => defer(deferred, other),
            },
        }
    }
}
