//! Single-capsule execution lifecycle.
//!
//! `run` validates the request, allocates a fresh volume session, stages the
//! input, drives the runtime adapter, checks the output contract and tears
//! the session down on every exit path. A running unit may re-enter the engine
//! through the handoff router; that nested run happens on the caller's HTTP
//! task and never blocks this one's wait.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::CollisionPolicy;
use crate::error::{FailureReason, OrchestratorError, OrchestratorResult};
use crate::registry::{CapsuleDefinition, CapsuleRegistry};
use crate::runtime::{LaunchSpec, RuntimeAdapter, Termination, UnitGuard};
use crate::schema::JsonObject;
use crate::sessions::SessionTable;
use crate::tracker::StateTracker;
use crate::types::{CapsuleName, FileName, SessionId};
use crate::volume::{self, SessionPaths, VolumeManager, VolumeSession};

pub const ENV_SESSION_ID: &str = "CAPSULE_SESSION_ID";
pub const ENV_IO_DIR: &str = "CAPSULE_IO_DIR";
pub const ENV_ORCHESTRATOR_URL: &str = "ORCHESTRATOR_URL";

/// A request to run one capsule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub capsule: CapsuleName,
    #[serde(default)]
    pub input: JsonObject,
    /// Files to stage into the input region, keyed by the name the unit sees.
    #[serde(default)]
    pub files: BTreeMap<FileName, PathBuf>,
    /// Upper bound on the unit timeout, applied on top of the capsule's own.
    #[serde(skip)]
    pub timeout_cap: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(capsule: impl Into<CapsuleName>, input: JsonObject) -> Self {
        Self {
            capsule: capsule.into(),
            input,
            files: BTreeMap::new(),
            timeout_cap: None,
        }
    }

    pub fn with_file(mut self, name: FileName, path: impl Into<PathBuf>) -> Self {
        self.files.insert(name, path.into());
        self
    }
}

/// Where a run's output files go before its session is torn down.
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    /// Output files die with the session.
    #[default]
    Discard,
    /// Copy into this directory, replacing existing files.
    Directory(PathBuf),
    /// Copy into `<dir>/<session id>`.
    PerSession(PathBuf),
    /// Copy into a handoff caller's incoming region.
    Incoming {
        caller: SessionId,
        dir: PathBuf,
        policy: CollisionPolicy,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Session that triggered this run through a handoff.
    pub parent: Option<SessionId>,
    pub sink: OutputSink,
}

/// Validated output of a successful run.
#[derive(Debug, Clone)]
pub struct CapsuleOutput {
    pub session_id: SessionId,
    pub payload: JsonObject,
    pub files: Vec<FileName>,
    /// Where the output files were exported, if anywhere.
    pub exported_to: Option<PathBuf>,
}

/// Wire form of a run's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Option<JsonObject>,
    #[serde(default)]
    pub files: Vec<FileName>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

impl From<OrchestratorResult<CapsuleOutput>> for ExecutionResult {
    fn from(result: OrchestratorResult<CapsuleOutput>) -> Self {
        match result {
            Ok(out) => Self {
                success: true,
                output: Some(out.payload),
                files: out.files,
                error: None,
                session_id: Some(out.session_id),
                output_dir: out.exported_to,
            },
            Err(e) => Self {
                success: false,
                output: None,
                files: Vec::new(),
                error: Some(e.to_string()),
                session_id: None,
                output_dir: None,
            },
        }
    }
}

/// Values every unit receives.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_timeout: Duration,
    pub orchestrator_url: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct ExecutionEngine {
    registry: Arc<CapsuleRegistry>,
    volumes: VolumeManager,
    runtime: Arc<dyn RuntimeAdapter>,
    sessions: SessionTable,
    tracker: StateTracker,
    settings: Arc<EngineSettings>,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<CapsuleRegistry>,
        volumes: VolumeManager,
        runtime: Arc<dyn RuntimeAdapter>,
        tracker: StateTracker,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            volumes,
            runtime,
            sessions: SessionTable::new(),
            tracker,
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &CapsuleRegistry {
        &self.registry
    }

    pub fn volumes(&self) -> &VolumeManager {
        &self.volumes
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub async fn run(&self, request: ExecutionRequest) -> OrchestratorResult<CapsuleOutput> {
        self.run_with(request, RunOptions::default()).await
    }

    pub async fn run_with(
        &self,
        request: ExecutionRequest,
        options: RunOptions,
    ) -> OrchestratorResult<CapsuleOutput> {
        let capsule = self.registry.get(request.capsule.as_str())?;
        validate_request(capsule, &request).await?;

        let session_id = SessionId::generate();
        let session = self.volumes.create_session(&session_id).await?;
        self.tracker
            .execution_started(&session_id, &capsule.name, options.parent.as_ref());
        info!(
            capsule = %capsule.name,
            session = %session_id,
            parent = ?options.parent.as_ref().map(SessionId::as_str),
            "Executing capsule"
        );

        let result = self.drive(capsule, &request, &session, &options.sink).await;
        self.tracker.execution_finished(&session_id, result.is_ok());

        match &result {
            Ok(out) => info!(
                capsule = %capsule.name,
                session = %session_id,
                files = out.files.len(),
                "Capsule completed"
            ),
            Err(e) => error!(capsule = %capsule.name, session = %session_id, "Capsule failed: {}", e),
        }

        if let Err(e) = session.close().await {
            warn!(session = %session_id, "Session teardown failed: {}", e);
        }
        result
    }

    async fn drive(
        &self,
        capsule: &CapsuleDefinition,
        request: &ExecutionRequest,
        session: &VolumeSession,
        sink: &OutputSink,
    ) -> OrchestratorResult<CapsuleOutput> {
        let paths = session.paths();

        self.volumes.stage_files(&request.files, &paths.input).await?;
        let document = serde_json::to_vec_pretty(&request.input)
            .map_err(|e| OrchestratorError::Runtime(format!("serializing input: {}", e)))?;
        tokio::fs::write(paths.input_document(), document)
            .await
            .map_err(|e| OrchestratorError::io("writing input document", e))?;
        debug!(session = %session.id(), files = request.files.len(), "Input staged");

        let timeout = capsule.timeout.unwrap_or(self.settings.default_timeout);
        let timeout = request.timeout_cap.map_or(timeout, |cap| cap.min(timeout));

        // Registered before launch so a handoff issued right after start resolves.
        let _registration =
            self.sessions
                .register(session.id().clone(), capsule.name.clone(), paths.clone());

        let spec = LaunchSpec {
            session_id: session.id().clone(),
            capsule: capsule.name.clone(),
            runnable: capsule.runnable.clone(),
            args: capsule.args.clone(),
            mount_source: paths.root.clone(),
            env: self.unit_env(capsule, session),
        };
        let unit = self.runtime.start(spec).await.map_err(|e| OrchestratorError::ExecutionFailure {
            capsule: capsule.name.clone(),
            reason: FailureReason::LaunchFailed(format!("{:#}", e)),
        })?;
        self.tracker.unit_started(session.id(), &unit.id);
        let guard = UnitGuard::new(self.runtime.clone(), unit);

        let termination = self.runtime.wait(guard.unit(), timeout).await;
        let failure = |reason| OrchestratorError::ExecutionFailure {
            capsule: capsule.name.clone(),
            reason,
        };
        match termination {
            Ok(Termination::Exited { code: 0 }) => guard.release().await,
            Ok(Termination::Exited { code }) => {
                let logs = self.runtime.logs(guard.unit()).await;
                guard.release().await;
                return Err(failure(FailureReason::NonZeroExit { code, logs }));
            }
            Ok(Termination::TimedOut) => {
                warn!(capsule = %capsule.name, session = %session.id(), "Unit timed out after {:?}", timeout);
                guard.stop().await;
                return Err(failure(FailureReason::Timeout { after: timeout }));
            }
            Ok(Termination::Abnormal(msg)) => {
                guard.stop().await;
                return Err(failure(FailureReason::Abnormal(msg)));
            }
            Err(e) => {
                guard.stop().await;
                return Err(failure(FailureReason::Abnormal(format!("{:#}", e))));
            }
        }

        let (payload, files) = collect_output(capsule, paths).await?;
        let exported_to = self.export(session, sink, &files).await?;

        Ok(CapsuleOutput {
            session_id: session.id().clone(),
            payload,
            files,
            exported_to,
        })
    }

    fn unit_env(&self, capsule: &CapsuleDefinition, session: &VolumeSession) -> BTreeMap<String, String> {
        let mut env = self.settings.env.clone();
        env.extend(capsule.env.clone());
        env.insert(ENV_SESSION_ID.to_string(), session.id().to_string());
        env.insert(
            ENV_IO_DIR.to_string(),
            self.runtime.io_dir(session.root()),
        );
        env.insert(
            ENV_ORCHESTRATOR_URL.to_string(),
            self.settings.orchestrator_url.clone(),
        );
        env
    }

    async fn export(
        &self,
        session: &VolumeSession,
        sink: &OutputSink,
        files: &[FileName],
    ) -> OrchestratorResult<Option<PathBuf>> {
        let output = &session.paths().output;
        let dir = match sink {
            OutputSink::Discard => return Ok(None),
            OutputSink::Directory(dir) => dir.clone(),
            OutputSink::PerSession(base) => base.join(session.id().as_str()),
            OutputSink::Incoming {
                caller,
                dir,
                policy,
            } => {
                if *policy == CollisionPolicy::Reject {
                    if let Some(name) = volume::first_existing(dir, files).await {
                        return Err(OrchestratorError::HandoffCollision {
                            session: caller.clone(),
                            name: name.into_inner(),
                        });
                    }
                }
                dir.clone()
            }
        };
        self.volumes.export_files(files, output, &dir).await?;
        debug!(session = %session.id(), dir = %dir.display(), "Exported {} output file(s)", files.len());
        Ok(Some(dir))
    }
}

/// Checks performed before any session is allocated.
async fn validate_request(
    capsule: &CapsuleDefinition,
    request: &ExecutionRequest,
) -> OrchestratorResult<()> {
    let input = Value::Object(request.input.clone());
    capsule
        .input_schema
        .validate(&input)
        .map_err(|v| OrchestratorError::schema(v.path, v.reason))?;

    for file_ref in capsule.input_schema.file_refs(&input) {
        let name = FileName::parse(file_ref.value.as_str()).map_err(|_| {
            OrchestratorError::schema(
                &file_ref.path,
                format!("file reference '{}' must be a bare file name", file_ref.value),
            )
        })?;
        if !request.files.contains_key(&name) {
            return Err(OrchestratorError::schema(
                file_ref.path,
                format!("file '{}' was not supplied", name),
            ));
        }
    }

    for (name, src) in &request.files {
        if !volume::is_regular_file(src).await {
            return Err(OrchestratorError::io(
                format!("staging input file '{}'", name),
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} is not a regular file", src.display()),
                ),
            ));
        }
    }
    Ok(())
}

/// Read the output document and enforce the output contract.
async fn collect_output(
    capsule: &CapsuleDefinition,
    paths: &SessionPaths,
) -> OrchestratorResult<(JsonObject, Vec<FileName>)> {
    let violation = |reason: String| OrchestratorError::OutputContractViolation {
        capsule: capsule.name.clone(),
        reason,
    };

    let raw = match tokio::fs::read(paths.output_document()).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(violation(format!("{} was not written", volume::OUTPUT_DOCUMENT)));
        }
        Err(e) => return Err(OrchestratorError::io("reading output document", e)),
    };
    let payload: Value = serde_json::from_slice(&raw)
        .map_err(|e| violation(format!("{} is not valid JSON: {}", volume::OUTPUT_DOCUMENT, e)))?;

    for file_ref in capsule.output_schema.file_refs(&payload) {
        let name = FileName::parse(file_ref.value.as_str()).map_err(|_| {
            violation(format!(
                "{} references '{}', which is not a bare file name",
                file_ref.path, file_ref.value
            ))
        })?;
        if !volume::is_regular_file(&paths.output.join(&name)).await {
            return Err(violation(format!(
                "declared output file '{}' ({}) is missing from the output region",
                name, file_ref.path
            )));
        }
    }

    capsule
        .output_schema
        .validate(&payload)
        .map_err(|v| violation(format!("schema violation at {}", v)))?;

    let Value::Object(payload) = payload else {
        return Err(violation(format!(
            "{} must contain a JSON object",
            volume::OUTPUT_DOCUMENT
        )));
    };

    let files = volume::list_files(&paths.output).await?;
    Ok((payload, files))
}
