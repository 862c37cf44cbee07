//! Local child-process runtime.
//!
//! The runnable is spawned with the session root as its working directory and
//! `CAPSULE_IO_DIR` pointing at it. Output lines are forwarded to tracing and
//! the last few are kept for failure reports.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{LaunchSpec, RuntimeAdapter, Termination, UnitHandle};

const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type Tail = Arc<Mutex<VecDeque<String>>>;

struct ProcessUnit {
    child: Option<Child>,
    tail: Tail,
    readers: Vec<JoinHandle<()>>,
}

pub struct ProcessRuntime {
    log_tail_lines: usize,
    units: Mutex<HashMap<String, ProcessUnit>>,
}

impl ProcessRuntime {
    pub fn new(log_tail_lines: usize) -> Self {
        Self {
            log_tail_lines,
            units: Mutex::new(HashMap::new()),
        }
    }

    fn units(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProcessUnit>> {
        self.units.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn forward<R>(&self, stream: R, label: &'static str, unit_id: String, tail: Tail) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let cap = self.log_tail_lines;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(unit = %unit_id, stream = label, "{}", line);
                if cap == 0 {
                    continue;
                }
                let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                if tail.len() == cap {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        })
    }
}

#[async_trait]
impl RuntimeAdapter for ProcessRuntime {
    fn name(&self) -> &'static str {
        "process"
    }

    fn io_dir(&self, mount_source: &Path) -> String {
        mount_source.display().to_string()
    }

    async fn start(&self, spec: LaunchSpec) -> anyhow::Result<UnitHandle> {
        let mut child = Command::new(&spec.runnable)
            .args(&spec.args)
            .current_dir(&spec.mount_source)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning '{}'", spec.runnable))?;

        let id = match child.id() {
            Some(pid) => format!("pid-{}", pid),
            None => format!("exited-{}", spec.session_id.short()),
        };

        let tail: Tail = Arc::default();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.forward(stdout, "stdout", id.clone(), tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.forward(stderr, "stderr", id.clone(), tail.clone()));
        }

        info!(unit = %id, capsule = %spec.capsule, session = %spec.session_id, "Started process unit");
        self.units().insert(
            id.clone(),
            ProcessUnit {
                child: Some(child),
                tail,
                readers,
            },
        );

        Ok(UnitHandle {
            id,
            session_id: spec.session_id,
        })
    }

    async fn wait(&self, unit: &UnitHandle, timeout: Duration) -> anyhow::Result<Termination> {
        let mut child = self
            .units()
            .get_mut(&unit.id)
            .and_then(|u| u.child.take())
            .ok_or_else(|| anyhow!("unknown or already awaited unit {}", unit.id))?;

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status.with_context(|| format!("waiting for {}", unit.id))?;
                let readers = self
                    .units()
                    .get_mut(&unit.id)
                    .map(|u| std::mem::take(&mut u.readers))
                    .unwrap_or_default();
                for reader in readers {
                    let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await;
                }
                Ok(termination(status))
            }
            Err(_) => {
                // Hand the child back so `stop` can kill it.
                if let Some(u) = self.units().get_mut(&unit.id) {
                    u.child = Some(child);
                }
                Ok(Termination::TimedOut)
            }
        }
    }

    async fn stop(&self, unit: &UnitHandle) -> anyhow::Result<()> {
        let removed = self.units().remove(&unit.id);
        let Some(mut entry) = removed else {
            return Ok(());
        };
        for reader in entry.readers.drain(..) {
            reader.abort();
        }
        if let Some(mut child) = entry.child.take() {
            child.kill().await.with_context(|| format!("killing {}", unit.id))?;
            info!(unit = %unit.id, "Stopped process unit");
        }
        Ok(())
    }

    async fn logs(&self, unit: &UnitHandle) -> Option<String> {
        let units = self.units();
        let tail = units.get(&unit.id)?.tail.lock().unwrap_or_else(|p| p.into_inner());
        if tail.is_empty() {
            return None;
        }
        Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
    }

    async fn cleanup(&self, unit: &UnitHandle) -> anyhow::Result<()> {
        self.units().remove(&unit.id);
        Ok(())
    }
}

fn termination(status: ExitStatus) -> Termination {
    if let Some(code) = status.code() {
        return Termination::Exited { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Termination::Abnormal(format!("terminated by signal {}", signal));
        }
    }
    Termination::Abnormal(format!("terminated without exit code ({})", status))
}
