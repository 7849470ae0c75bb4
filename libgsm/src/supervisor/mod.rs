pub mod child;
pub mod readiness;

use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;

pub use child::{ChildSupervisor, ServerCommand};
pub use readiness::{LogMarkerProbe, QueryProbe, ReadinessProbe};

/// Control surface over the managed server process.
///
/// The orchestrator only talks to the server through this trait, so tests can swap in a fake
/// and the concrete process handling stays in one place.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Spawn the server. Starting an already running server is a no-op.
    async fn start(&self) -> anyhow::Result<()>;

    /// Deliver `signal`, wait up to `timeout` for the process to exit, then kill it.
    async fn stop(&self, signal: Signal, timeout: Duration) -> anyhow::Result<()>;

    async fn is_running(&self) -> bool;

    /// Wait until the server reports it is accepting players. `false` on timeout.
    async fn wait_for_ready(&self, timeout: Duration) -> bool;
}
