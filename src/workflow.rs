//! Linear workflows.
//!
//! A workflow is an ordered list of capsule executions. Each step's output
//! becomes the next step's input, optionally reshaped first by a translator
//! capsule. The first failing step ends the run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::engine::{CapsuleOutput, ExecutionEngine, ExecutionRequest, OutputSink, RunOptions};
use crate::error::{FailureReason, OrchestratorError, OrchestratorResult};
use crate::registry::CapsuleRegistry;
use crate::schema::JsonObject;
use crate::tracker::WorkflowState;
use crate::types::{CapsuleName, FileName, WorkflowRunId};
use crate::utils::{extract_json_path, overlay_fields};
use crate::volume::ScratchDir;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub capsule: CapsuleName,
    #[serde(default)]
    pub translator: Option<CapsuleName>,
    #[serde(default)]
    pub translator_instructions: Option<TranslatorInstructions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorInstructions {
    pub target_capsule: CapsuleName,
    /// Target field to source field; `None` omits the target field.
    #[serde(default)]
    pub mapping: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl WorkflowDefinition {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read workflow {}: {}", path.display(), e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Reject malformed definitions before anything runs.
    pub fn validate(&self, registry: &CapsuleRegistry) -> OrchestratorResult<()> {
        let invalid = |msg: String| Err(OrchestratorError::WorkflowValidation(msg));

        if self.steps.is_empty() {
            return invalid("workflow has no steps".to_string());
        }

        for (i, step) in self.steps.iter().enumerate() {
            if !registry.contains(step.capsule.as_str()) {
                return invalid(format!("Step {} references unknown capsule '{}'", i, step.capsule));
            }
            let Some(translator) = &step.translator else {
                continue;
            };
            if !registry.contains(translator.as_str()) {
                return invalid(format!(
                    "Step {} references unknown translator '{}'",
                    i, translator
                ));
            }
            match &step.translator_instructions {
                None => return invalid(format!("Step {} has translator but no translator_instructions", i)),
                Some(instr) if instr.target_capsule != step.capsule => {
                    return invalid(format!(
                        "Step {} translator_instructions target '{}' does not match capsule '{}'",
                        i, instr.target_capsule, step.capsule
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Apply a field mapping to `source`.
///
/// Returns the copied fields and the target fields the mapping omits. A
/// source field absent from `source` copies nothing.
pub fn apply_mapping(
    source: &JsonObject,
    mapping: &BTreeMap<String, Option<String>>,
) -> (JsonObject, BTreeSet<String>) {
    let source = Value::Object(source.clone());
    let mut mapped = JsonObject::new();
    let mut omitted = BTreeSet::new();

    for (target, from) in mapping {
        match from {
            None => {
                omitted.insert(target.clone());
            }
            Some(from) => {
                if let Some(value) = extract_json_path(&source, from) {
                    mapped.insert(target.clone(), value.clone());
                }
            }
        }
    }
    (mapped, omitted)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub capsule: CapsuleName,
    pub success: bool,
    pub output: Option<JsonObject>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileName>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunResult {
    pub success: bool,
    pub final_output: Option<JsonObject>,
    pub steps_executed: usize,
    pub error: Option<String>,
    pub step_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<WorkflowRunId>,
}

impl WorkflowRunResult {
    /// Result for a definition rejected before any step ran.
    pub fn rejected(error: &OrchestratorError) -> Self {
        Self {
            success: false,
            final_output: None,
            steps_executed: 0,
            error: Some(error.to_string()),
            step_results: Vec::new(),
            run_id: None,
        }
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    engine: ExecutionEngine,
    deadline: Option<Duration>,
}

impl WorkflowEngine {
    pub fn new(engine: ExecutionEngine, deadline: Option<Duration>) -> Self {
        Self { engine, deadline }
    }

    /// Run a workflow. Only definition errors are returned as `Err`; step
    /// failures are reported in the result.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        input: JsonObject,
    ) -> OrchestratorResult<WorkflowRunResult> {
        definition.validate(self.engine.registry())?;

        let run_id = WorkflowRunId::generate();
        let tracker = self.engine.tracker();
        tracker.workflow_started(&run_id, definition.name.as_deref(), definition.steps.len());
        info!(
            run = %run_id,
            workflow = definition.name.as_deref().unwrap_or("<unnamed>"),
            steps = definition.steps.len(),
            "Workflow started"
        );

        let scratch = match self.engine.volumes().create_scratch(&run_id).await {
            Ok(scratch) => scratch,
            Err(e) => {
                tracker.workflow_state(&run_id, WorkflowState::Failed { step: 0 });
                return Err(e);
            }
        };
        let deadline = self.deadline.map(|d| Instant::now() + d);

        let mut payload = input;
        let mut files: BTreeMap<FileName, PathBuf> = BTreeMap::new();
        let mut step_results = Vec::with_capacity(definition.steps.len());
        let mut final_output = None;
        let mut error = None;

        for (i, step) in definition.steps.iter().enumerate() {
            tracker.workflow_state(&run_id, WorkflowState::Running { step: i });

            match self.run_step(i, step, &payload, &files, &scratch, deadline).await {
                Ok(out) => {
                    let step_dir = out.exported_to.clone().unwrap_or_default();
                    files = out
                        .files
                        .iter()
                        .map(|name| (name.clone(), step_dir.join(name)))
                        .collect();
                    payload = out.payload;
                    step_results.push(StepResult {
                        step_index: i,
                        capsule: step.capsule.clone(),
                        success: true,
                        output: Some(payload.clone()),
                        error: None,
                        files: out.files,
                    });
                    final_output = Some(payload.clone());
                }
                Err(e) => {
                    let message = format!("Step {} ({}) failed: {}", i, step.capsule, e);
                    warn!(run = %run_id, "{}", message);
                    step_results.push(StepResult {
                        step_index: i,
                        capsule: step.capsule.clone(),
                        success: false,
                        output: None,
                        error: Some(e.to_string()),
                        files: Vec::new(),
                    });
                    tracker.workflow_state(&run_id, WorkflowState::Failed { step: i });
                    error = Some(message);
                    break;
                }
            }
        }

        if error.is_none() {
            tracker.workflow_state(&run_id, WorkflowState::Completed);
        }
        if let Err(e) = scratch.close().await {
            warn!(run = %run_id, "Failed to remove workflow scratch: {}", e);
        }

        let result = WorkflowRunResult {
            success: error.is_none(),
            final_output,
            steps_executed: step_results.len(),
            error,
            step_results,
            run_id: Some(run_id),
        };
        info!(
            success = result.success,
            steps_executed = result.steps_executed,
            "Workflow finished"
        );
        Ok(result)
    }

    async fn run_step(
        &self,
        index: usize,
        step: &WorkflowStep,
        payload: &JsonObject,
        files: &BTreeMap<FileName, PathBuf>,
        scratch: &ScratchDir,
        deadline: Option<Instant>,
    ) -> OrchestratorResult<CapsuleOutput> {
        let input = match (&step.translator, &step.translator_instructions) {
            (Some(translator), Some(instructions)) => {
                self.translate(translator, instructions, payload, deadline).await?
            }
            _ => payload.clone(),
        };

        let request = ExecutionRequest {
            capsule: step.capsule.clone(),
            input,
            files: files.clone(),
            timeout_cap: remaining(&step.capsule, deadline)?,
        };
        let options = RunOptions {
            parent: None,
            sink: OutputSink::Directory(scratch.path().join(format!("step-{}", index))),
        };
        self.engine.run_with(request, options).await
    }

    /// Run the translator, then apply the mapping on top of its output.
    async fn translate(
        &self,
        translator: &CapsuleName,
        instructions: &TranslatorInstructions,
        payload: &JsonObject,
        deadline: Option<Instant>,
    ) -> OrchestratorResult<JsonObject> {
        let mapping: JsonObject = instructions
            .mapping
            .iter()
            .map(|(target, from)| (target.clone(), from.clone().map_or(Value::Null, Value::String)))
            .collect();
        let mut translator_input = JsonObject::new();
        translator_input.insert("source_output".into(), Value::Object(payload.clone()));
        translator_input.insert(
            "target_capsule".into(),
            Value::String(instructions.target_capsule.to_string()),
        );
        translator_input.insert("mapping".into(), Value::Object(mapping));
        translator_input.insert(
            "instructions".into(),
            instructions
                .instructions
                .clone()
                .map_or(Value::Null, Value::String),
        );

        let request = ExecutionRequest {
            capsule: translator.clone(),
            input: translator_input,
            files: BTreeMap::new(),
            timeout_cap: remaining(translator, deadline)?,
        };
        let output = self.engine.run(request).await.map_err(|e| {
            OrchestratorError::TranslationFailure {
                translator: translator.clone(),
                target: instructions.target_capsule.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(merge_translation(output.payload, payload, &instructions.mapping))
    }
}

/// Apply the mapping on top of the translator's output. Null mappings drop
/// the field; mapped source values, nulls included, replace the translator's.
pub fn merge_translation(
    mut translated: JsonObject,
    source: &JsonObject,
    mapping: &BTreeMap<String, Option<String>>,
) -> JsonObject {
    let (mapped, omitted) = apply_mapping(source, mapping);
    for field in &omitted {
        translated.remove(field);
    }
    overlay_fields(&mut translated, mapped);
    translated
}

/// Time left before the workflow deadline, or a timeout failure if none is.
fn remaining(
    capsule: &CapsuleName,
    deadline: Option<Instant>,
) -> OrchestratorResult<Option<Duration>> {
    let Some(deadline) = deadline else {
        return Ok(None);
    };
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(OrchestratorError::ExecutionFailure {
            capsule: capsule.clone(),
            reason: FailureReason::Timeout { after: Duration::ZERO },
        });
    }
    Ok(Some(left))
}
