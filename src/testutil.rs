//! In-process runtime for tests.
//!
//! Units are async closures keyed by runnable name. They run against the real
//! session directories and can issue handoffs through the router, so the full
//! lifecycle runs without docker or child processes.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::engine::{ENV_IO_DIR, ENV_SESSION_ID};
use crate::error::OrchestratorResult;
use crate::handoff::{HandoffOutcome, HandoffRequest, HandoffRouter};
use crate::runtime::{LaunchSpec, RuntimeAdapter, Termination, UnitHandle};
use crate::types::SessionId;
use crate::volume::{INPUT_DOCUMENT, OUTPUT_DOCUMENT};

type BoxFuture = Pin<Box<dyn Future<Output = i32> + Send>>;
type Behavior = Arc<dyn Fn(UnitContext) -> BoxFuture + Send + Sync>;

/// What a scripted unit sees: its session and a way to call back.
#[derive(Clone)]
pub(crate) struct UnitContext {
    pub session_id: SessionId,
    pub io_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    router: Option<HandoffRouter>,
}

impl UnitContext {
    pub fn input_dir(&self) -> PathBuf {
        self.io_dir.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.io_dir.join("output")
    }

    pub fn outgoing_dir(&self) -> PathBuf {
        self.io_dir.join("handoff").join("outgoing")
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.io_dir.join("handoff").join("incoming")
    }

    pub async fn input(&self) -> Value {
        let raw = tokio::fs::read(self.input_dir().join(INPUT_DOCUMENT))
            .await
            .unwrap();
        serde_json::from_slice(&raw).unwrap()
    }

    pub async fn write_output(&self, value: Value) {
        tokio::fs::write(
            self.output_dir().join(OUTPUT_DOCUMENT),
            serde_json::to_vec(&value).unwrap(),
        )
        .await
        .unwrap();
    }

    pub async fn write_file(&self, dir: &Path, name: &str, bytes: &[u8]) {
        tokio::fs::write(dir.join(name), bytes).await.unwrap();
    }

    pub async fn handoff(&self, target: &str, args: Value) -> OrchestratorResult<HandoffOutcome> {
        let router = self.router.as_ref().unwrap();
        let request = HandoffRequest {
            target: target.into(),
            args: args.as_object().cloned().unwrap_or_default(),
        };
        router.handle(&self.session_id, request).await
    }
}

pub(crate) struct ScriptedRuntime {
    behaviors: HashMap<String, Behavior>,
    units: Mutex<HashMap<String, JoinHandle<i32>>>,
    router: OnceLock<HandoffRouter>,
    next_id: AtomicUsize,
    roots: Mutex<Vec<PathBuf>>,
    stopped: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            units: Mutex::new(HashMap::new()),
            router: OnceLock::new(),
            next_id: AtomicUsize::new(0),
            roots: Mutex::new(Vec::new()),
            stopped: AtomicUsize::new(0),
        }
    }

    pub fn with<F, Fut>(mut self, runnable: &str, behavior: F) -> Self
    where
        F: Fn(UnitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = i32> + Send + 'static,
    {
        self.behaviors.insert(
            runnable.to_string(),
            Arc::new(move |ctx| Box::pin(behavior(ctx)) as BoxFuture),
        );
        self
    }

    pub fn set_router(&self, router: HandoffRouter) {
        let _ = self.router.set(router);
    }

    /// Number of units started so far.
    pub fn started(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Session roots of every unit started, in start order.
    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuntimeAdapter for ScriptedRuntime {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn io_dir(&self, mount_source: &Path) -> String {
        mount_source.display().to_string()
    }

    async fn start(&self, spec: LaunchSpec) -> anyhow::Result<UnitHandle> {
        let behavior = self
            .behaviors
            .get(&spec.runnable)
            .cloned()
            .ok_or_else(|| anyhow!("no scripted behavior for '{}'", spec.runnable))?;

        let ctx = UnitContext {
            session_id: SessionId::new(spec.env[ENV_SESSION_ID].clone()),
            io_dir: PathBuf::from(&spec.env[ENV_IO_DIR]),
            env: spec.env.clone(),
            router: self.router.get().cloned(),
        };
        let id = format!("scripted-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.roots.lock().unwrap().push(spec.mount_source.clone());
        self.units
            .lock()
            .unwrap()
            .insert(id.clone(), tokio::spawn(behavior(ctx)));

        Ok(UnitHandle {
            id,
            session_id: spec.session_id,
        })
    }

    async fn wait(&self, unit: &UnitHandle, timeout: Duration) -> anyhow::Result<Termination> {
        let mut handle = self
            .units
            .lock()
            .unwrap()
            .remove(&unit.id)
            .ok_or_else(|| anyhow!("unknown unit {}", unit.id))?;

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(code)) => Ok(Termination::Exited { code }),
            Ok(Err(e)) if e.is_panic() => Ok(Termination::Abnormal("unit panicked".into())),
            Ok(Err(e)) => Ok(Termination::Abnormal(e.to_string())),
            Err(_) => {
                self.units.lock().unwrap().insert(unit.id.clone(), handle);
                Ok(Termination::TimedOut)
            }
        }
    }

    async fn stop(&self, unit: &UnitHandle) -> anyhow::Result<()> {
        if let Some(handle) = self.units.lock().unwrap().remove(&unit.id) {
            handle.abort();
        }
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn logs(&self, unit: &UnitHandle) -> Option<String> {
        Some(format!("scripted unit {} failed", unit.id))
    }
}
