//! End-to-end tests of the execution, handoff and workflow paths.
//!
//! Units are scripted closures running against real session directories in a
//! temp dir, so every lifecycle guarantee is checked on the filesystem.

#![cfg(test)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;

use super::Orchestrator;
use crate::config::OrchestratorConfig;
use crate::engine::ExecutionRequest;
use crate::error::{FailureReason, OrchestratorError};
use crate::schema::JsonObject;
use crate::testutil::{ScriptedRuntime, UnitContext};
use crate::types::FileName;
use crate::workflow::WorkflowDefinition;

fn capsules() -> Value {
    let text_input = json!({
        "type": "object",
        "required": ["text"],
        "properties": {"text": {"type": "string"}}
    });
    json!({
        "echo": {"runnable": "echo"},
        "producer": {"runnable": "producer"},
        "upper": {
            "runnable": "upper",
            "schema": {
                "input": text_input,
                "output": {"type": "object", "required": ["text"]}
            }
        },
        "web-context": {"runnable": "web-context"},
        "translator": {"runnable": "translator"},
        "recorder": {"runnable": "recorder"},
        "crash": {"runnable": "crash"},
        "sleeper": {"runnable": "sleeper", "timeout_secs": 1},
        "slow": {"runnable": "sleeper"},
        "liar": {
            "runnable": "liar",
            "schema": {"output": {
                "type": "object",
                "properties": {"report": {"type": "string", "format": "file"}}
            }}
        },
        "silent": {"runnable": "silent"},
        "ghost": {"runnable": "not-scripted"},
        "parent": {"runnable": "parent", "callable": ["child"]},
        "child": {
            "runnable": "child",
            "schema": {
                "input": {
                    "type": "object",
                    "required": ["file"],
                    "properties": {"file": {"type": "string", "format": "file"}}
                },
                "output": {
                    "type": "object",
                    "required": ["result"],
                    "properties": {"result": {"type": "string", "format": "file"}}
                }
            }
        },
        "file-maker": {"runnable": "file-maker"},
        "file-reader": {
            "runnable": "file-reader",
            "schema": {"input": {
                "type": "object",
                "required": ["document"],
                "properties": {"document": {"type": "string", "format": "file"}}
            }}
        },
        "inspector": {"runnable": "inspector"}
    })
}

fn payload() -> Vec<u8> {
    (0..=255u8).cycle().take(4096).collect()
}

async fn handoff_roundtrip(ctx: &UnitContext) -> Value {
    ctx.write_file(&ctx.outgoing_dir(), "data.bin", &payload()).await;
    let outcome = ctx
        .handoff("child", json!({"file": "data.bin"}))
        .await
        .unwrap();
    let returned = tokio::fs::read(ctx.incoming_dir().join("result.bin"))
        .await
        .unwrap();
    let mut expected = payload();
    expected.reverse();
    json!({
        "ok": returned == expected,
        "files": outcome.files,
        "child_session": outcome.session_id,
        "child_output": outcome.output,
    })
}

fn runtime() -> ScriptedRuntime {
    ScriptedRuntime::new()
        .with("echo", |ctx: UnitContext| async move {
            let input = ctx.input().await;
            ctx.write_output(json!({"echo": input})).await;
            0
        })
        .with("producer", |ctx: UnitContext| async move {
            ctx.write_output(json!({"text": "hello"})).await;
            0
        })
        .with("upper", |ctx: UnitContext| async move {
            let input = ctx.input().await;
            let text = input["text"].as_str().unwrap_or_default().to_uppercase();
            ctx.write_output(json!({"text": text})).await;
            0
        })
        .with("web-context", |ctx: UnitContext| async move {
            ctx.write_output(json!({
                "final_summary": "S",
                "visited_urls": ["https://a.example", "https://b.example"]
            }))
            .await;
            0
        })
        .with("translator", |ctx: UnitContext| async move {
            let input = ctx.input().await;
            let well_formed = input["target_capsule"] == "recorder"
                && input["mapping"]["text"] == "final_summary"
                && input["source_output"]["final_summary"] == "S";
            if !well_formed {
                return 1;
            }
            ctx.write_output(json!({"text": "a paraphrase of S"})).await;
            0
        })
        .with("recorder", |ctx: UnitContext| async move {
            let input = ctx.input().await;
            ctx.write_output(json!({"received": input})).await;
            0
        })
        .with("crash", |_ctx: UnitContext| async move { 2 })
        .with("sleeper", |_ctx: UnitContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            0
        })
        .with("liar", |ctx: UnitContext| async move {
            ctx.write_output(json!({"report": "report.pdf"})).await;
            0
        })
        .with("silent", |_ctx: UnitContext| async move { 0 })
        .with("file-maker", |ctx: UnitContext| async move {
            ctx.write_file(&ctx.output_dir(), "doc.txt", b"document body")
                .await;
            ctx.write_output(json!({"document": "doc.txt"})).await;
            0
        })
        .with("file-reader", |ctx: UnitContext| async move {
            let input = ctx.input().await;
            let name = input["document"].as_str().unwrap().to_string();
            let content = tokio::fs::read_to_string(ctx.input_dir().join(name))
                .await
                .unwrap();
            ctx.write_output(json!({"content": content})).await;
            0
        })
        .with("inspector", |ctx: UnitContext| async move {
            let input_entries = std::fs::read_dir(ctx.input_dir()).unwrap().count();
            let marker = format!("marker-{}", ctx.session_id);
            ctx.write_file(&ctx.output_dir(), &marker, b"x").await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            let output_entries = std::fs::read_dir(ctx.output_dir()).unwrap().count();
            ctx.write_output(json!({
                "input_entries": input_entries,
                "output_entries": output_entries,
            }))
            .await;
            0
        })
        .with("child", |ctx: UnitContext| async move {
            let input = ctx.input().await;
            let name = input["file"].as_str().unwrap().to_string();
            let mut bytes = tokio::fs::read(ctx.input_dir().join(name)).await.unwrap();
            bytes.reverse();
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.write_file(&ctx.output_dir(), "result.bin", &bytes).await;
            ctx.write_output(json!({"result": "result.bin", "size": bytes.len()}))
                .await;
            0
        })
        .with("parent", |ctx: UnitContext| async move {
            let input = ctx.input().await;
            let output = match input["mode"].as_str().unwrap_or_default() {
                "roundtrip" => handoff_roundtrip(&ctx).await,
                "missing" => {
                    let err = ctx
                        .handoff("child", json!({"file": "nope.bin"}))
                        .await
                        .unwrap_err();
                    json!({"missing": matches!(err, OrchestratorError::MissingHandoffFile { .. })})
                }
                #[cfg(unix)]
                "linked" => {
                    let host_file = input["host_file"].as_str().unwrap().to_string();
                    std::os::unix::fs::symlink(host_file, ctx.outgoing_dir().join("leak.bin"))
                        .unwrap();
                    let err = ctx
                        .handoff("child", json!({"file": "leak.bin"}))
                        .await
                        .unwrap_err();
                    json!({"missing": matches!(err, OrchestratorError::MissingHandoffFile { .. })})
                }
                "denied" => {
                    let not_allowed = ctx.handoff("upper", json!({"text": "x"})).await;
                    let unregistered = ctx.handoff("nobody", json!({})).await;
                    json!({
                        "denied": matches!(not_allowed, Err(OrchestratorError::HandoffDenied { .. }))
                            && matches!(unregistered, Err(OrchestratorError::HandoffDenied { .. }))
                    })
                }
                "collision" => {
                    ctx.write_file(&ctx.outgoing_dir(), "data.bin", b"abc").await;
                    let first = ctx.handoff("child", json!({"file": "data.bin"})).await;
                    let second = ctx.handoff("child", json!({"file": "data.bin"})).await;
                    json!({
                        "first": first.is_ok(),
                        "second_collision": matches!(second, Err(OrchestratorError::HandoffCollision { .. })),
                    })
                }
                "concurrent" => {
                    ctx.write_file(&ctx.outgoing_dir(), "data.bin", b"abc").await;
                    let (a, b) = tokio::join!(
                        ctx.handoff("child", json!({"file": "data.bin"})),
                        ctx.handoff("child", json!({"file": "data.bin"})),
                    );
                    let in_flight = [&a, &b]
                        .iter()
                        .filter(|r| matches!(r, Err(OrchestratorError::HandoffInFlight(_))))
                        .count();
                    let ok = [&a, &b].iter().filter(|r| r.is_ok()).count();
                    json!({"in_flight": in_flight, "ok": ok})
                }
                other => panic!("unknown mode {other}"),
            };
            ctx.write_output(output).await;
            0
        })
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    runtime: Arc<ScriptedRuntime>,
    tmp: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(json!({}))
    }

    fn with_config(extra: Value) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut raw = json!({
            "volumes": {"base_path": "volumes", "verify_digest": true},
            "capsules": capsules(),
        });
        for (key, value) in extra.as_object().unwrap() {
            raw[key] = value.clone();
        }
        let config = OrchestratorConfig::from_json_str(&raw.to_string(), tmp.path()).unwrap();
        let runtime = Arc::new(runtime());
        let orchestrator = Orchestrator::with_runtime(config, runtime.clone()).unwrap();
        runtime.set_router(orchestrator.router().clone());
        Self {
            orchestrator: Arc::new(orchestrator),
            runtime,
            tmp,
        }
    }

    fn volumes(&self) -> PathBuf {
        self.tmp.path().join("volumes")
    }

    /// Entries left under the volume base path.
    fn leftovers(&self) -> usize {
        std::fs::read_dir(self.volumes())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    async fn execute(&self, capsule: &str, input: Value) -> crate::error::OrchestratorResult<JsonObject> {
        self.orchestrator
            .execute(ExecutionRequest::new(capsule, object(input)))
            .await
            .map(|out| out.payload)
    }
}

fn object(value: Value) -> JsonObject {
    value.as_object().cloned().unwrap()
}

fn workflow(raw: Value) -> WorkflowDefinition {
    serde_json::from_value(raw).unwrap()
}

#[tokio::test]
async fn test_execute_success_tears_down_session() {
    let h = Harness::new();
    let output = h.execute("upper", json!({"text": "hi"})).await.unwrap();
    assert_eq!(Value::Object(output), json!({"text": "HI"}));
    assert_eq!(h.runtime.started(), 1);
    assert_eq!(h.leftovers(), 0);
    assert!(!h.runtime.roots()[0].exists());
    assert_eq!(h.orchestrator.live_sessions(), 0);
}

#[tokio::test]
async fn test_missing_required_field_is_rejected_before_staging() {
    let h = Harness::new();
    let err = h.execute("upper", json!({"lang": "en"})).await.unwrap_err();
    match err {
        OrchestratorError::SchemaViolation { path, reason } => {
            assert_eq!(path, "$.text");
            assert_eq!(reason, "missing required field");
        }
        other => panic!("expected schema violation, got {other}"),
    }
    assert_eq!(h.runtime.started(), 0);
    assert!(!h.volumes().exists());
}

#[tokio::test]
async fn test_unknown_capsule() {
    let h = Harness::new();
    let err = h.execute("nope", json!({})).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownCapsule(_)));
    assert!(!h.volumes().exists());
}

#[tokio::test]
async fn test_non_zero_exit_reports_logs_and_tears_down() {
    let h = Harness::new();
    let err = h.execute("crash", json!({})).await.unwrap_err();
    match &err {
        OrchestratorError::ExecutionFailure {
            reason: FailureReason::NonZeroExit { code, logs },
            ..
        } => {
            assert_eq!(*code, 2);
            assert!(logs.is_some());
        }
        other => panic!("expected non-zero exit, got {other}"),
    }
    assert_eq!(h.leftovers(), 0);
}

#[tokio::test]
async fn test_timeout_stops_unit_and_tears_down() {
    let h = Harness::new();
    let err = h.execute("sleeper", json!({})).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::ExecutionFailure {
            reason: FailureReason::Timeout { .. },
            ..
        }
    ));
    assert_eq!(h.runtime.stopped(), 1);
    assert_eq!(h.leftovers(), 0);
}

#[tokio::test]
async fn test_launch_failure() {
    let h = Harness::new();
    let err = h.execute("ghost", json!({})).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::ExecutionFailure {
            reason: FailureReason::LaunchFailed(_),
            ..
        }
    ));
    assert_eq!(h.leftovers(), 0);
}

#[tokio::test]
async fn test_output_contract_violations() {
    let h = Harness::new();

    let err = h.execute("liar", json!({})).await.unwrap_err();
    assert!(
        matches!(&err, OrchestratorError::OutputContractViolation { reason, .. } if reason.contains("report.pdf")),
        "{err}"
    );

    let err = h.execute("silent", json!({})).await.unwrap_err();
    assert!(
        matches!(&err, OrchestratorError::OutputContractViolation { reason, .. } if reason.contains("output.json")),
        "{err}"
    );
    assert_eq!(h.leftovers(), 0);
}

#[tokio::test]
async fn test_input_files_are_staged_by_name() {
    let h = Harness::new();
    let src = h.tmp.path().join("local-doc.txt");
    std::fs::write(&src, "from disk").unwrap();

    let request = ExecutionRequest::new("file-reader", object(json!({"document": "doc.txt"})))
        .with_file(FileName::parse("doc.txt").unwrap(), &src);
    let out = h.orchestrator.execute(request).await.unwrap();
    assert_eq!(out.payload["content"], "from disk");

    // Declared file fields must be backed by a supplied file.
    let err = h
        .execute("file-reader", json!({"document": "other.txt"}))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::SchemaViolation { ref path, .. } if path == "$.document"));
}

#[tokio::test]
async fn test_repeated_runs_get_independent_sessions() {
    let h = Harness::new();
    let first = h
        .orchestrator
        .execute(ExecutionRequest::new("inspector", JsonObject::new()))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .execute(ExecutionRequest::new("inspector", JsonObject::new()))
        .await
        .unwrap();

    assert_ne!(first.session_id, second.session_id);
    // Only input.json, and only this run's marker.
    assert_eq!(second.payload["input_entries"], 1);
    assert_eq!(second.payload["output_entries"], 1);
    assert_eq!(second.files.len(), 1);
}

#[tokio::test]
async fn test_concurrent_runs_of_same_capsule_are_isolated() {
    let h = Harness::new();
    let (a, b) = tokio::join!(
        h.orchestrator
            .execute(ExecutionRequest::new("inspector", JsonObject::new())),
        h.orchestrator
            .execute(ExecutionRequest::new("inspector", JsonObject::new())),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.session_id, b.session_id);
    assert_eq!(a.payload["output_entries"], 1);
    assert_eq!(b.payload["output_entries"], 1);

    let roots = h.runtime.roots();
    assert_eq!(roots.len(), 2);
    assert_ne!(roots[0], roots[1]);
    assert_eq!(h.leftovers(), 0);
}

#[tokio::test]
async fn test_results_dir_receives_output_files() {
    let h = Harness::with_config(json!({"volumes": {
        "base_path": "volumes",
        "results_dir": "results"
    }}));
    let out = h
        .orchestrator
        .execute(ExecutionRequest::new("file-maker", JsonObject::new()))
        .await
        .unwrap();
    let dir = out.exported_to.unwrap();
    assert_eq!(dir, h.tmp.path().join("results").join(out.session_id.as_str()));
    assert_eq!(std::fs::read(dir.join("doc.txt")).unwrap(), b"document body");
    assert_eq!(h.leftovers(), 0);
}

#[tokio::test]
async fn test_handoff_files_are_byte_identical_both_ways() {
    let h = Harness::new();
    let output = h.execute("parent", json!({"mode": "roundtrip"})).await.unwrap();

    assert_eq!(output["ok"], true);
    assert_eq!(output["files"], json!(["result.bin"]));
    assert_eq!(output["child_output"]["size"], 4096);
    assert_eq!(h.runtime.started(), 2);
    for root in h.runtime.roots() {
        assert!(!root.exists());
    }
    assert_eq!(h.leftovers(), 0);

    let snapshot = h.orchestrator.tracker().snapshot();
    assert_eq!(snapshot.edges.len(), 1);
    assert!(snapshot.edges[0].success);
    assert_eq!(snapshot.edges[0].target_capsule.as_str(), "child");
    let child = snapshot
        .nodes
        .iter()
        .find(|n| n.capsule.as_str() == "child")
        .unwrap();
    assert!(child.parent_session_id.is_some());
}

#[tokio::test]
async fn test_handoff_outside_allow_list_is_denied_without_a_session() {
    let h = Harness::new();
    let output = h.execute("parent", json!({"mode": "denied"})).await.unwrap();
    assert_eq!(output["denied"], true);
    assert_eq!(h.runtime.started(), 1);
}

#[tokio::test]
async fn test_handoff_missing_outgoing_file() {
    let h = Harness::new();
    let output = h.execute("parent", json!({"mode": "missing"})).await.unwrap();
    assert_eq!(output["missing"], true);
    assert_eq!(h.runtime.started(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_handoff_does_not_follow_outgoing_links() {
    let h = Harness::new();
    let host_file = h.tmp.path().join("host-secret.bin");
    std::fs::write(&host_file, b"host only").unwrap();

    let output = h
        .execute(
            "parent",
            json!({"mode": "linked", "host_file": host_file.to_string_lossy()}),
        )
        .await
        .unwrap();
    assert_eq!(output["missing"], true);
    assert_eq!(h.runtime.started(), 1);
}

#[tokio::test]
async fn test_handoff_collision_is_rejected_by_default() {
    let h = Harness::new();
    let output = h.execute("parent", json!({"mode": "collision"})).await.unwrap();
    assert_eq!(output["first"], true);
    assert_eq!(output["second_collision"], true);
}

#[tokio::test]
async fn test_handoff_collision_overwrite_policy() {
    let h = Harness::with_config(json!({"handoff": {"collision_policy": "overwrite"}}));
    let output = h.execute("parent", json!({"mode": "collision"})).await.unwrap();
    assert_eq!(output["first"], true);
    assert_eq!(output["second_collision"], false);
}

#[tokio::test]
async fn test_one_outstanding_handoff_per_session() {
    let h = Harness::new();
    let output = h.execute("parent", json!({"mode": "concurrent"})).await.unwrap();
    assert_eq!(output["in_flight"], 1);
    assert_eq!(output["ok"], 1);
}

#[tokio::test]
async fn test_handoff_from_unknown_session() {
    let h = Harness::new();
    let err = h
        .orchestrator
        .handoff(
            &crate::types::SessionId::generate(),
            serde_json::from_value(json!({"target": "child"})).unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownSession(_)));
}

#[tokio::test]
async fn test_workflow_without_translator() {
    let h = Harness::new();
    let def = workflow(json!({"name": "a", "steps": [{"capsule": "producer"}, {"capsule": "upper"}]}));
    let result = h.orchestrator.run_workflow(&def, JsonObject::new()).await.unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.steps_executed, 2);
    assert_eq!(result.final_output, Some(object(json!({"text": "HELLO"}))));
    assert_eq!(result.step_results.len(), 2);
    assert!(result.step_results.iter().all(|s| s.success));
    assert_eq!(h.leftovers(), 0);
}

#[tokio::test]
async fn test_workflow_translator_mapping_is_applied_verbatim() {
    let h = Harness::new();
    let def = workflow(json!({"steps": [
        {"capsule": "web-context"},
        {
            "capsule": "recorder",
            "translator": "translator",
            "translator_instructions": {
                "target_capsule": "recorder",
                "mapping": {"text": "final_summary"},
                "instructions": "Pass the summary on"
            }
        }
    ]}));
    let result = h.orchestrator.run_workflow(&def, JsonObject::new()).await.unwrap();

    assert!(result.success, "{:?}", result.error);
    let final_output = result.final_output.unwrap();
    assert_eq!(final_output["received"], json!({"text": "S"}));
    // web-context, translator, recorder
    assert_eq!(h.runtime.started(), 3);
}

#[tokio::test]
async fn test_workflow_translator_failure_stops_the_step() {
    let h = Harness::new();
    let def = workflow(json!({"steps": [
        {"capsule": "producer"},
        {
            "capsule": "recorder",
            "translator": "translator",
            "translator_instructions": {"target_capsule": "recorder"}
        }
    ]}));
    let result = h.orchestrator.run_workflow(&def, JsonObject::new()).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.steps_executed, 2);
    let error = result.error.unwrap();
    assert!(error.starts_with("Step 1 (recorder) failed: Translator 'translator'"), "{error}");
    // producer and translator only; the recorder never ran.
    assert_eq!(h.runtime.started(), 2);
}

#[tokio::test]
async fn test_workflow_stops_at_failing_step() {
    let h = Harness::new();
    let def = workflow(json!({"steps": [
        {"capsule": "producer"},
        {"capsule": "crash"},
        {"capsule": "echo"}
    ]}));
    let result = h.orchestrator.run_workflow(&def, JsonObject::new()).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.steps_executed, 2);
    assert_eq!(result.step_results.len(), 2);
    let last = result.step_results.last().unwrap();
    assert!(!last.success);
    assert_eq!(last.step_index, 1);
    assert!(result.error.unwrap().starts_with("Step 1 (crash) failed:"));
    assert_eq!(result.final_output, Some(object(json!({"text": "hello"}))));
    assert_eq!(h.runtime.started(), 2);
    assert_eq!(h.leftovers(), 0);
}

#[tokio::test]
async fn test_workflow_carries_files_between_steps() {
    let h = Harness::new();
    let def = workflow(json!({"steps": [{"capsule": "file-maker"}, {"capsule": "file-reader"}]}));
    let result = h.orchestrator.run_workflow(&def, JsonObject::new()).await.unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.final_output.unwrap()["content"], "document body");
    assert_eq!(result.step_results[0].files.len(), 1);
    assert_eq!(h.leftovers(), 0);
}

#[tokio::test]
async fn test_invalid_workflow_runs_nothing() {
    let h = Harness::new();
    let def = workflow(json!({"steps": [{"capsule": "producer"}, {"capsule": "missing"}]}));
    let err = h
        .orchestrator
        .run_workflow(&def, JsonObject::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::WorkflowValidation(_)));
    assert_eq!(h.runtime.started(), 0);
}

#[tokio::test]
async fn test_workflow_deadline_bounds_steps() {
    let h = Harness::with_config(json!({"workflow": {"deadline_secs": 1}}));
    let def = workflow(json!({"steps": [{"capsule": "slow"}, {"capsule": "echo"}]}));
    let started = std::time::Instant::now();
    let result = h.orchestrator.run_workflow(&def, JsonObject::new()).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.steps_executed, 1);
    assert!(result.error.unwrap().contains("timeout"));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_initialize_sweeps_leftovers() {
    let h = Harness::new();
    std::fs::create_dir_all(h.volumes().join("stale-session/input")).unwrap();
    assert_eq!(h.orchestrator.initialize().await, 1);
    assert_eq!(h.leftovers(), 0);
}
