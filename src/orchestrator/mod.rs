//! Core orchestrator: wires the registry, volumes, runtime, execution engine,
//! handoff router and workflow engine together behind one facade.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::{OrchestratorConfig, RuntimeKind};
use crate::engine::{
    CapsuleOutput, EngineSettings, ExecutionEngine, ExecutionRequest, OutputSink, RunOptions,
};
use crate::error::OrchestratorResult;
use crate::handoff::{HandoffOutcome, HandoffRequest, HandoffRouter};
use crate::registry::CapsuleRegistry;
use crate::runtime::{DockerRuntime, ProcessRuntime, RuntimeAdapter};
use crate::schema::JsonObject;
use crate::tracker::StateTracker;
use crate::types::SessionId;
use crate::volume::VolumeManager;
use crate::workflow::{WorkflowDefinition, WorkflowEngine, WorkflowRunResult};

mod integration_tests;

pub struct Orchestrator {
    config: OrchestratorConfig,
    volumes: VolumeManager,
    tracker: StateTracker,
    engine: ExecutionEngine,
    router: HandoffRouter,
    workflows: WorkflowEngine,
}

impl Orchestrator {
    /// Build an orchestrator with the runtime selected in the config.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let runtime: Arc<dyn RuntimeAdapter> = match config.runtime.kind {
            RuntimeKind::Process => Arc::new(ProcessRuntime::new(config.execution.log_tail_lines)),
            RuntimeKind::Docker => Arc::new(DockerRuntime::new(
                &config.runtime,
                config.execution.log_tail_lines,
            )),
        };
        Self::with_runtime(config, runtime)
    }

    pub fn with_runtime(config: OrchestratorConfig, runtime: Arc<dyn RuntimeAdapter>) -> Result<Self> {
        let registry = Arc::new(CapsuleRegistry::from_config(&config)?);
        let volumes = VolumeManager::from_config(&config.volumes);
        let tracker = StateTracker::new();

        let settings = EngineSettings {
            default_timeout: config.execution.timeout(),
            orchestrator_url: config.orchestrator_url(),
            env: config.env.clone(),
        };
        info!(
            runtime = runtime.name(),
            volumes = %volumes.base_path().display(),
            orchestrator_url = %settings.orchestrator_url,
            "Orchestrator configured"
        );

        let engine = ExecutionEngine::new(
            registry,
            volumes.clone(),
            runtime,
            tracker.clone(),
            settings,
        );
        let router = HandoffRouter::new(engine.clone(), config.handoff.collision_policy);
        let workflows = WorkflowEngine::new(engine.clone(), config.workflow.deadline());

        Ok(Self {
            config,
            volumes,
            tracker,
            engine,
            router,
            workflows,
        })
    }

    /// Remove session directories left over from a previous process.
    pub async fn initialize(&self) -> usize {
        self.volumes.sweep().await
    }

    /// Run a capsule as a top-level request.
    pub async fn execute(&self, request: ExecutionRequest) -> OrchestratorResult<CapsuleOutput> {
        let sink = match &self.config.volumes.results_dir {
            Some(dir) => OutputSink::PerSession(dir.clone()),
            None => OutputSink::Discard,
        };
        self.engine
            .run_with(
                request,
                RunOptions {
                    parent: None,
                    sink,
                },
            )
            .await
    }

    pub async fn handoff(
        &self,
        caller: &SessionId,
        request: HandoffRequest,
    ) -> OrchestratorResult<HandoffOutcome> {
        self.router.handle(caller, request).await
    }

    pub async fn run_workflow(
        &self,
        definition: &WorkflowDefinition,
        input: JsonObject,
    ) -> OrchestratorResult<WorkflowRunResult> {
        self.workflows.run(definition, input).await
    }

    pub fn registry(&self) -> &CapsuleRegistry {
        self.engine.registry()
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn router(&self) -> &HandoffRouter {
        &self.router
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Number of sessions whose units are currently running.
    pub fn live_sessions(&self) -> usize {
        self.engine.sessions().len()
    }

    /// Sweep whatever sessions are still on disk. Called on shutdown.
    pub async fn shutdown(&self) {
        let live = self.live_sessions();
        let removed = self.volumes.sweep().await;
        info!(live, removed, "Orchestrator shut down");
    }
}
