//! Table of live sessions.
//!
//! A session is registered when its unit is about to start and removed when
//! the owning execution returns. Handoff calls resolve the caller's regions
//! through this table, and each entry carries an explicit handoff state so a
//! session can have at most one handoff outstanding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{CapsuleName, SessionId};
use crate::volume::SessionPaths;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffState {
    Idle,
    InFlight { target: CapsuleName, since: Instant },
}

/// Snapshot of a live session.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub capsule: CapsuleName,
    pub paths: SessionPaths,
    pub handoff: HandoffState,
}

#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<HashMap<SessionId, ActiveSession>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, ActiveSession>> {
        // A poisoned table still holds consistent entries; every mutation is a
        // single insert or remove.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a live session. The entry is removed when the returned guard
    /// is dropped.
    pub fn register(
        &self,
        id: SessionId,
        capsule: CapsuleName,
        paths: SessionPaths,
    ) -> SessionRegistration {
        self.lock().insert(
            id.clone(),
            ActiveSession {
                capsule,
                paths,
                handoff: HandoffState::Idle,
            },
        );
        SessionRegistration {
            table: self.clone(),
            id,
        }
    }

    pub fn get(&self, id: &SessionId) -> OrchestratorResult<ActiveSession> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownSession(id.clone()))
    }

    /// Move a session from `Idle` to `InFlight`. Fails if the session is
    /// unknown or already has a handoff outstanding.
    pub fn begin_handoff(
        &self,
        id: &SessionId,
        target: &CapsuleName,
    ) -> OrchestratorResult<HandoffTicket> {
        let mut table = self.lock();
        let session = table
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::UnknownSession(id.clone()))?;
        if let HandoffState::InFlight { .. } = session.handoff {
            return Err(OrchestratorError::HandoffInFlight(id.clone()));
        }
        session.handoff = HandoffState::InFlight {
            target: target.clone(),
            since: Instant::now(),
        };
        Ok(HandoffTicket {
            table: self.clone(),
            id: id.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.lock().keys().cloned().collect()
    }
}

/// Keeps a session registered while alive.
#[derive(Debug)]
pub struct SessionRegistration {
    table: SessionTable,
    id: SessionId,
}

impl Drop for SessionRegistration {
    fn drop(&mut self) {
        self.table.lock().remove(&self.id);
    }
}

/// Marks a handoff as outstanding; returns the session to `Idle` when dropped.
#[derive(Debug)]
pub struct HandoffTicket {
    table: SessionTable,
    id: SessionId,
}

impl Drop for HandoffTicket {
    fn drop(&mut self) {
        if let Some(session) = self.table.lock().get_mut(&self.id) {
            session.handoff = HandoffState::Idle;
        }
    }
}
