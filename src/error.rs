//! Error taxonomy shared by the execution engine, the handoff router and the
//! workflow engine.
//!
//! Validation errors are raised before any session or execution unit exists;
//! execution errors are raised after a unit ran, with the owning session
//! already torn down by the time the caller sees them.

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;

use crate::types::{CapsuleName, SessionId};

/// Why an execution unit did not terminate normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The unit exceeded its timeout and was stopped.
    Timeout { after: Duration },
    /// The unit exited with a non-zero status. `logs` holds the captured tail.
    NonZeroExit { code: i32, logs: Option<String> },
    /// The unit crashed, was killed by a signal, or the runtime lost track of it.
    Abnormal(String),
    /// The runtime could not start the unit.
    LaunchFailed(String),
}

impl FailureReason {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { after } => write!(f, "timeout after {}s", after.as_secs()),
            Self::NonZeroExit { code, logs } => {
                write!(f, "exited with code {}", code)?;
                if let Some(logs) = logs.as_deref().filter(|l| !l.trim().is_empty()) {
                    write!(f, "\n\nlogs:\n{}", logs)?;
                }
                Ok(())
            }
            Self::Abnormal(msg) => write!(f, "abnormal termination: {}", msg),
            Self::LaunchFailed(msg) => write!(f, "failed to launch: {}", msg),
        }
    }
}

/// Errors surfaced by the orchestrator core.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Capsule '{0}' not found in registry")]
    UnknownCapsule(CapsuleName),

    #[error("Schema violation at {path}: {reason}")]
    SchemaViolation { path: String, reason: String },

    #[error("Handoff file '{name}' not found in handoff/outgoing of session {session}")]
    MissingHandoffFile { session: SessionId, name: String },

    #[error("Handoff from '{caller}' to '{target}' denied: {reason}")]
    HandoffDenied {
        caller: CapsuleName,
        target: CapsuleName,
        reason: String,
    },

    #[error("Session {0} already has a handoff in flight")]
    HandoffInFlight(SessionId),

    #[error("Session {0} is not running")]
    UnknownSession(SessionId),

    #[error("File '{name}' already exists in handoff/incoming of session {session}")]
    HandoffCollision { session: SessionId, name: String },

    #[error("Execution of '{capsule}' failed: {reason}")]
    ExecutionFailure {
        capsule: CapsuleName,
        reason: FailureReason,
    },

    #[error("Output contract violated by '{capsule}': {reason}")]
    OutputContractViolation { capsule: CapsuleName, reason: String },

    #[error("Invalid workflow: {0}")]
    WorkflowValidation(String),

    #[error("Translator '{translator}' failed to prepare input for '{target}': {reason}")]
    TranslationFailure {
        translator: CapsuleName,
        target: CapsuleName,
        reason: String,
    },

    #[error("Invalid file name '{0}': file references must be bare names")]
    InvalidFileName(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn schema(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaViolation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors detected before any session or unit was allocated.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownCapsule(_)
                | Self::SchemaViolation { .. }
                | Self::HandoffDenied { .. }
                | Self::MissingHandoffFile { .. }
                | Self::HandoffInFlight(_)
                | Self::UnknownSession(_)
                | Self::WorkflowValidation(_)
                | Self::InvalidFileName(_)
        )
    }

    /// HTTP status used when this error terminates a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownCapsule(_) | Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::SchemaViolation { .. }
            | Self::MissingHandoffFile { .. }
            | Self::InvalidFileName(_)
            | Self::WorkflowValidation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::HandoffDenied { .. } => StatusCode::FORBIDDEN,
            Self::HandoffInFlight(_) | Self::HandoffCollision { .. } => StatusCode::CONFLICT,
            Self::ExecutionFailure { reason, .. } if reason.is_timeout() => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::ExecutionFailure { .. }
            | Self::OutputContractViolation { .. }
            | Self::TranslationFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::Registry(_) | Self::Io { .. } | Self::Runtime(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
