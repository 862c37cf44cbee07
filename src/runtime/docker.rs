//! Container runtime backed by the docker CLI.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{LaunchSpec, RuntimeAdapter, Termination, UnitHandle};
use crate::config::RuntimeConfig;

pub struct DockerRuntime {
    binary: String,
    mount_point: String,
    network: Option<String>,
    stop_grace: Duration,
    log_tail_lines: usize,
}

impl DockerRuntime {
    pub fn new(config: &RuntimeConfig, log_tail_lines: usize) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            mount_point: config.mount_point.clone(),
            network: config.network.clone(),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
            log_tail_lines,
        }
    }

    fn container_name(spec: &LaunchSpec) -> String {
        format!("capsule-{}", spec.session_id.short())
    }

    fn run_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            Self::container_name(spec),
            "--add-host".to_string(),
            "host.docker.internal:host-gateway".to_string(),
            "-v".to_string(),
            format!("{}:{}", spec.mount_source.display(), self.mount_point),
        ];
        if let Some(network) = &self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.runnable.clone());
        args.extend(spec.args.iter().cloned());
        args
    }

    /// Run a docker subcommand, returning trimmed stdout.
    async fn docker<I, S>(&self, args: I) -> anyhow::Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("running '{}'", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("{} failed: {}", self.binary, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl RuntimeAdapter for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn io_dir(&self, _mount_source: &Path) -> String {
        self.mount_point.clone()
    }

    async fn start(&self, spec: LaunchSpec) -> anyhow::Result<UnitHandle> {
        let args = self.run_args(&spec);
        debug!(session = %spec.session_id, "docker {}", args.join(" "));
        let id = self
            .docker(&args)
            .await
            .with_context(|| format!("starting container for '{}'", spec.capsule))?;
        info!(
            container = %id,
            capsule = %spec.capsule,
            session = %spec.session_id,
            "Started container"
        );
        Ok(UnitHandle {
            id,
            session_id: spec.session_id,
        })
    }

    async fn wait(&self, unit: &UnitHandle, timeout: Duration) -> anyhow::Result<Termination> {
        match tokio::time::timeout(timeout, self.docker(["wait", unit.id.as_str()])).await {
            Err(_) => Ok(Termination::TimedOut),
            Ok(Err(e)) => Ok(Termination::Abnormal(format!("{:#}", e))),
            Ok(Ok(status)) => {
                let code = status
                    .lines()
                    .last()
                    .and_then(|l| l.trim().parse::<i32>().ok())
                    .ok_or_else(|| anyhow!("unexpected 'docker wait' output: {}", status))?;
                Ok(Termination::Exited { code })
            }
        }
    }

    async fn stop(&self, unit: &UnitHandle) -> anyhow::Result<()> {
        let grace = self.stop_grace.as_secs().to_string();
        if let Err(e) = self.docker(["stop", "-t", grace.as_str(), unit.id.as_str()]).await {
            debug!(container = %unit.id, "docker stop failed, forcing removal: {:#}", e);
        }
        self.docker(["rm", "-f", unit.id.as_str()]).await?;
        info!(container = %unit.id, "Stopped container");
        Ok(())
    }

    async fn logs(&self, unit: &UnitHandle) -> Option<String> {
        let tail = self.log_tail_lines.to_string();
        let output = Command::new(&self.binary)
            .args(["logs", "--tail", tail.as_str(), unit.id.as_str()])
            .output()
            .await
            .ok()?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let text = text.trim().to_string();
        (!text.is_empty()).then_some(text)
    }

    async fn cleanup(&self, unit: &UnitHandle) -> anyhow::Result<()> {
        self.docker(["rm", "-f", unit.id.as_str()]).await?;
        Ok(())
    }
}
