// Core modules
mod config;
mod engine;
mod error;
mod handoff;
mod registry;
mod schema;
mod sessions;
mod tracker;
mod types;
mod utils;
mod volume;
mod workflow;

pub mod api;
pub mod client;
pub mod runtime;

mod orchestrator;

#[cfg(test)]
mod testutil;

// Re-export key types and functions
pub use client::OrchestratorClient;
pub use config::{
    CapsuleConfig, CollisionPolicy, OrchestratorConfig, RuntimeKind, SchemaSource,
    resolve_config_path,
};
pub use engine::{
    CapsuleOutput, ENV_IO_DIR, ENV_ORCHESTRATOR_URL, ENV_SESSION_ID, ExecutionRequest,
    ExecutionResult,
};
pub use error::{FailureReason, OrchestratorError, OrchestratorResult};
pub use handoff::{HandoffOutcome, HandoffRequest, HandoffResponse};
pub use orchestrator::Orchestrator;
pub use registry::{CapsuleDefinition, CapsuleRegistry, CapsuleSummary};
pub use schema::{JsonObject, Schema};
pub use tracker::{StateSnapshot, StateTracker};
pub use types::{CapsuleName, FileName, SessionId, WorkflowRunId};
pub use workflow::{
    StepResult, TranslatorInstructions, WorkflowDefinition, WorkflowRunResult, WorkflowStep,
};
