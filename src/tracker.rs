//! Observability state: live executions, handoff edges and workflow runs.
//!
//! Rendered as a node/edge snapshot by `GET /state`. Finished executions stay
//! visible for [`FINISHED_VISIBILITY`], handoff edges for [`EDGE_VISIBILITY`]
//! unless they touch a visible execution.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::debug;

use crate::types::{CapsuleName, SessionId, WorkflowRunId};

pub const FINISHED_VISIBILITY: TimeDelta = TimeDelta::seconds(30);
pub const EDGE_VISIBILITY: TimeDelta = TimeDelta::seconds(60);
pub const MAX_HANDOFF_HISTORY: usize = 1000;
const MAX_WORKFLOW_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionNode {
    pub session_id: SessionId,
    pub capsule: CapsuleName,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandoffEdge {
    pub from: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<SessionId>,
    pub caller_capsule: CapsuleName,
    pub target_capsule: CapsuleName,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

/// Workflow run state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum WorkflowState {
    Pending,
    Running { step: usize },
    Failed { step: usize },
    Completed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Completed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRecord {
    pub run_id: WorkflowRunId,
    pub name: Option<String>,
    pub steps: usize,
    #[serde(flatten)]
    pub state: WorkflowState,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub nodes: Vec<ExecutionNode>,
    pub edges: Vec<HandoffEdge>,
    pub workflows: Vec<WorkflowRecord>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    executions: HashMap<SessionId, ExecutionNode>,
    handoffs: VecDeque<HandoffEdge>,
    workflows: VecDeque<WorkflowRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct StateTracker {
    inner: Arc<Mutex<Inner>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn execution_started(
        &self,
        session_id: &SessionId,
        capsule: &CapsuleName,
        parent: Option<&SessionId>,
    ) {
        let node = ExecutionNode {
            session_id: session_id.clone(),
            capsule: capsule.clone(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            unit_id: None,
            parent_session_id: parent.cloned(),
        };
        self.lock().executions.insert(session_id.clone(), node);
        debug!(session = %session_id, capsule = %capsule, "Tracking execution");
    }

    pub fn unit_started(&self, session_id: &SessionId, unit_id: &str) {
        if let Some(node) = self.lock().executions.get_mut(session_id) {
            node.unit_id = Some(unit_id.to_string());
        }
    }

    pub fn execution_finished(&self, session_id: &SessionId, success: bool) {
        let now = Utc::now();
        let mut inner = self.lock();
        if let Some(node) = inner.executions.get_mut(session_id) {
            node.status = if success {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            };
            node.finished_at = Some(now);
        }
        // Finished executions are only kept while they are still rendered.
        inner.executions.retain(|_, n| match n.finished_at {
            Some(at) => now - at < FINISHED_VISIBILITY,
            None => true,
        });
    }

    pub fn handoff(
        &self,
        caller: &SessionId,
        caller_capsule: &CapsuleName,
        target_capsule: &CapsuleName,
        target_session: Option<&SessionId>,
        success: bool,
    ) {
        let mut inner = self.lock();
        inner.handoffs.push_back(HandoffEdge {
            from: caller.clone(),
            to: target_session.cloned(),
            caller_capsule: caller_capsule.clone(),
            target_capsule: target_capsule.clone(),
            timestamp: Utc::now(),
            success,
        });
        while inner.handoffs.len() > MAX_HANDOFF_HISTORY {
            inner.handoffs.pop_front();
        }
    }

    pub fn workflow_started(&self, run_id: &WorkflowRunId, name: Option<&str>, steps: usize) {
        let mut inner = self.lock();
        inner.workflows.push_back(WorkflowRecord {
            run_id: run_id.clone(),
            name: name.map(str::to_string),
            steps,
            state: WorkflowState::Pending,
            started_at: Utc::now(),
        });
        while inner.workflows.len() > MAX_WORKFLOW_HISTORY {
            inner.workflows.pop_front();
        }
    }

    /// Advance a workflow run. Terminal states are never left.
    pub fn workflow_state(&self, run_id: &WorkflowRunId, state: WorkflowState) {
        let mut inner = self.lock();
        if let Some(record) = inner.workflows.iter_mut().find(|r| &r.run_id == run_id) {
            if !record.state.is_terminal() {
                record.state = state;
            }
        }
    }

    pub fn workflow(&self, run_id: &WorkflowRunId) -> Option<WorkflowRecord> {
        self.lock()
            .workflows
            .iter()
            .find(|r| &r.run_id == run_id)
            .cloned()
    }

    pub fn capsule_of(&self, session_id: &SessionId) -> Option<CapsuleName> {
        self.lock()
            .executions
            .get(session_id)
            .map(|n| n.capsule.clone())
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> StateSnapshot {
        let inner = self.lock();

        let mut nodes: Vec<ExecutionNode> = inner
            .executions
            .values()
            .filter(|n| match n.finished_at {
                None => true,
                Some(at) => now - at < FINISHED_VISIBILITY,
            })
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.started_at);

        let visible = |id: &SessionId| nodes.iter().any(|n| &n.session_id == id);
        let edges = inner
            .handoffs
            .iter()
            .filter(|e| {
                visible(&e.from)
                    || e.to.as_ref().is_some_and(|to| visible(to))
                    || now - e.timestamp < EDGE_VISIBILITY
            })
            .cloned()
            .collect();

        StateSnapshot {
            edges,
            nodes,
            workflows: inner.workflows.iter().cloned().collect(),
            timestamp: now,
        }
    }
}
