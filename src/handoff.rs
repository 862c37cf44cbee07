//! Nested capsule calls.
//!
//! A running unit asks the orchestrator to run another capsule and blocks on
//! the answer. The router checks the caller's allow-list, stages the files the
//! caller offered in `handoff/outgoing`, runs the target through the same
//! execution engine (which may recurse), and copies the target's output files
//! into the caller's `handoff/incoming` before the target's session goes away.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::CollisionPolicy;
use crate::engine::{ExecutionEngine, ExecutionRequest, OutputSink, RunOptions};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::registry::CapsuleDefinition;
use crate::schema::JsonObject;
use crate::sessions::ActiveSession;
use crate::types::{CapsuleName, FileName, SessionId};
use crate::volume;

/// `{"target": "<capsule>", "args": {...}}` as sent by a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub target: CapsuleName,
    #[serde(default)]
    pub args: JsonObject,
}

/// Result of a successful handoff as seen by the caller.
#[derive(Debug, Clone)]
pub struct HandoffOutcome {
    /// Session the target ran in (already torn down).
    pub session_id: SessionId,
    pub output: JsonObject,
    /// Names now present in the caller's `handoff/incoming`.
    pub files: Vec<FileName>,
}

/// Wire response returned to the calling unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffResponse {
    pub success: bool,
    pub output: Option<JsonObject>,
    #[serde(default)]
    pub files: Vec<FileName>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl From<OrchestratorResult<HandoffOutcome>> for HandoffResponse {
    fn from(result: OrchestratorResult<HandoffOutcome>) -> Self {
        match result {
            Ok(outcome) => Self {
                success: true,
                output: Some(outcome.output),
                files: outcome.files,
                error: None,
                session_id: Some(outcome.session_id),
            },
            Err(e) => Self {
                success: false,
                output: None,
                files: Vec::new(),
                error: Some(e.to_string()),
                session_id: None,
            },
        }
    }
}

#[derive(Clone)]
pub struct HandoffRouter {
    engine: ExecutionEngine,
    collision_policy: CollisionPolicy,
}

impl HandoffRouter {
    pub fn new(engine: ExecutionEngine, collision_policy: CollisionPolicy) -> Self {
        Self {
            engine,
            collision_policy,
        }
    }

    /// Handle a handoff from the unit running in session `caller`.
    pub async fn handle(
        &self,
        caller: &SessionId,
        request: HandoffRequest,
    ) -> OrchestratorResult<HandoffOutcome> {
        let session = self.engine.sessions().get(caller)?;
        let target = request.target.clone();
        info!(session = %caller, caller = %session.capsule, target = %target, "Handoff requested");

        let result = self.route(caller, &session, request).await;

        self.engine.tracker().handoff(
            caller,
            &session.capsule,
            &target,
            result.as_ref().ok().map(|o| &o.session_id),
            result.is_ok(),
        );
        match &result {
            Ok(outcome) => info!(
                session = %caller,
                target = %target,
                files = outcome.files.len(),
                "Handoff completed"
            ),
            Err(e) => warn!(session = %caller, target = %target, "Handoff failed: {}", e),
        }
        result
    }

    async fn route(
        &self,
        caller: &SessionId,
        session: &ActiveSession,
        request: HandoffRequest,
    ) -> OrchestratorResult<HandoffOutcome> {
        let registry = self.engine.registry();
        let caller_def = registry.get(session.capsule.as_str())?;
        let denied = |reason: &str| OrchestratorError::HandoffDenied {
            caller: session.capsule.clone(),
            target: request.target.clone(),
            reason: reason.to_string(),
        };
        let target_def = registry
            .get(request.target.as_str())
            .map_err(|_| denied("target capsule is not registered"))?;
        if !caller_def.can_call(&target_def.name) {
            return Err(denied("target is not in the caller's callable list"));
        }

        let _ticket = self.engine.sessions().begin_handoff(caller, &target_def.name)?;

        let files = resolve_files(caller, session, target_def, &request.args).await?;
        debug!(session = %caller, files = files.len(), "Handoff files resolved");

        let exec = ExecutionRequest {
            capsule: target_def.name.clone(),
            input: request.args,
            files,
            timeout_cap: None,
        };
        let options = RunOptions {
            parent: Some(caller.clone()),
            sink: OutputSink::Incoming {
                caller: caller.clone(),
                dir: session.paths.incoming.clone(),
                policy: self.collision_policy,
            },
        };

        let output = self.engine.run_with(exec, options).await?;
        Ok(HandoffOutcome {
            session_id: output.session_id,
            output: output.payload,
            files: output.files,
        })
    }
}

/// Map every file-valued arg to its path in the caller's outgoing region.
///
/// Fields the target declares as files must name an existing outgoing file.
/// Undeclared top-level string args that happen to name an outgoing file are
/// staged as well.
async fn resolve_files(
    caller: &SessionId,
    session: &ActiveSession,
    target: &CapsuleDefinition,
    args: &JsonObject,
) -> OrchestratorResult<BTreeMap<FileName, PathBuf>> {
    let outgoing = &session.paths.outgoing;
    let mut files = BTreeMap::new();

    for file_ref in target.input_schema.file_refs(&Value::Object(args.clone())) {
        let name = FileName::parse(file_ref.value)?;
        let path = outgoing.join(&name);
        if !volume::is_regular_file(&path).await {
            return Err(OrchestratorError::MissingHandoffFile {
                session: caller.clone(),
                name: name.into_inner(),
            });
        }
        files.insert(name, path);
    }

    for value in args.values() {
        let Value::String(candidate) = value else {
            continue;
        };
        let Ok(name) = FileName::parse(candidate.as_str()) else {
            continue;
        };
        if files.contains_key(&name) {
            continue;
        }
        let path = outgoing.join(&name);
        if volume::is_regular_file(&path).await {
            files.insert(name, path);
        }
    }

    Ok(files)
}
