//! Execution unit runtimes.
//!
//! The engine drives units through the narrow [`RuntimeAdapter`] interface:
//! start with a mount and environment, wait with a timeout, stop forcibly.
//! Two adapters ship with the crate: [`ProcessRuntime`] runs the runnable as a
//! local child process, [`DockerRuntime`] runs it as a container through the
//! docker CLI.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::types::{CapsuleName, SessionId};

pub mod docker;
pub mod process;

pub use docker::DockerRuntime;
pub use process::ProcessRuntime;

/// Everything a runtime needs to launch one unit.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub session_id: SessionId,
    pub capsule: CapsuleName,
    pub runnable: String,
    pub args: Vec<String>,
    /// Host path of the session root, mounted at the unit's I/O directory.
    pub mount_source: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Runtime-specific reference to a started unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHandle {
    pub id: String,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Exited { code: i32 },
    TimedOut,
    Abnormal(String),
}

#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Path at which the unit sees its session root.
    fn io_dir(&self, mount_source: &Path) -> String;

    async fn start(&self, spec: LaunchSpec) -> anyhow::Result<UnitHandle>;

    /// Block until the unit terminates or `timeout` elapses. A timed out unit
    /// is still running and must be stopped by the caller.
    async fn wait(&self, unit: &UnitHandle, timeout: Duration) -> anyhow::Result<Termination>;

    /// Forcibly stop the unit and release everything the runtime holds for it.
    async fn stop(&self, unit: &UnitHandle) -> anyhow::Result<()>;

    /// Captured output of a terminated unit, if the runtime keeps any.
    async fn logs(&self, _unit: &UnitHandle) -> Option<String> {
        None
    }

    /// Release runtime resources of a unit that terminated on its own.
    async fn cleanup(&self, _unit: &UnitHandle) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Stops its unit when dropped while still armed, so a cancelled or
/// panicking execution never leaks a running unit.
pub struct UnitGuard {
    runtime: Arc<dyn RuntimeAdapter>,
    unit: UnitHandle,
    armed: bool,
}

impl UnitGuard {
    pub fn new(runtime: Arc<dyn RuntimeAdapter>, unit: UnitHandle) -> Self {
        Self {
            runtime,
            unit,
            armed: true,
        }
    }

    pub fn unit(&self) -> &UnitHandle {
        &self.unit
    }

    /// The unit terminated on its own; clean up after it.
    pub async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.runtime.cleanup(&self.unit).await {
            warn!(unit = %self.unit.id, "Runtime cleanup failed: {:#}", e);
        }
    }

    pub async fn stop(mut self) {
        self.armed = false;
        if let Err(e) = self.runtime.stop(&self.unit).await {
            warn!(unit = %self.unit.id, "Failed to stop unit: {:#}", e);
        }
    }
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let runtime = self.runtime.clone();
        let unit = self.unit.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = runtime.stop(&unit).await {
                        warn!(unit = %unit.id, "Failed to stop abandoned unit: {:#}", e);
                    }
                });
            }
            Err(_) => warn!(unit = %unit.id, "Unit abandoned outside a runtime; not stopped"),
        }
    }
}
