//! Static capsule catalog.
//!
//! Loaded once at startup from the orchestrator config and shared read-only
//! afterwards. Each capsule's handoff allow-list is an explicit adjacency set,
//! so a topology naming an unregistered capsule is rejected at load time
//! instead of at the first handoff.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{CapsuleConfig, OrchestratorConfig, SchemaSource};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::schema::{Schema, SchemaDocument};
use crate::types::CapsuleName;

/// Immutable description of one registered capsule.
#[derive(Debug, Clone)]
pub struct CapsuleDefinition {
    pub name: CapsuleName,
    /// Image reference or executable, interpreted by the runtime adapter.
    pub runnable: String,
    pub args: Vec<String>,
    pub description: Option<String>,
    pub input_schema: Schema,
    pub output_schema: Schema,
    /// The schema document as declared, served to translator capsules.
    pub schema_document: SchemaDocument,
    /// Capsules this one may hand off to.
    pub callable: BTreeSet<CapsuleName>,
    pub timeout: Option<Duration>,
    pub env: BTreeMap<String, String>,
}

impl CapsuleDefinition {
    pub fn from_config(name: &str, cfg: &CapsuleConfig) -> OrchestratorResult<Self> {
        if cfg.runnable.trim().is_empty() {
            return Err(OrchestratorError::Registry(format!(
                "capsule '{}' has an empty runnable reference",
                name
            )));
        }

        let schema_document = match &cfg.schema {
            SchemaSource::Inline(doc) => doc.clone(),
            SchemaSource::Path(path) => {
                let raw = fs::read_to_string(path).map_err(|e| {
                    OrchestratorError::Registry(format!(
                        "capsule '{}': cannot read schema {}: {}",
                        name,
                        path.display(),
                        e
                    ))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    OrchestratorError::Registry(format!(
                        "capsule '{}': invalid schema {}: {}",
                        name,
                        path.display(),
                        e
                    ))
                })?
            }
        };

        let parse = |side: &str, value: Option<&serde_json::Value>| match value {
            None => {
                debug!("Capsule '{}' declares no {} schema, accepting any", name, side);
                Ok(Schema::any())
            }
            Some(v) => Schema::from_json(v).map_err(|e| {
                OrchestratorError::Registry(format!("capsule '{}' {} schema: {}", name, side, e))
            }),
        };

        Ok(Self {
            name: CapsuleName::new(name),
            runnable: cfg.runnable.clone(),
            args: cfg.args.clone(),
            description: cfg.description.clone(),
            input_schema: parse("input", schema_document.input.as_ref())?,
            output_schema: parse("output", schema_document.output.as_ref())?,
            schema_document,
            callable: cfg.callable.iter().map(CapsuleName::new).collect(),
            timeout: cfg.timeout_secs.map(Duration::from_secs),
            env: cfg.env.clone(),
        })
    }

    pub fn can_call(&self, target: &CapsuleName) -> bool {
        self.callable.contains(target)
    }
}

/// Summary row for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapsuleSummary {
    pub name: CapsuleName,
    pub runnable: String,
    pub description: Option<String>,
    pub callable: Vec<CapsuleName>,
}

/// Read-only catalog of capsules keyed by name.
#[derive(Debug, Clone, Default)]
pub struct CapsuleRegistry {
    capsules: BTreeMap<CapsuleName, CapsuleDefinition>,
}

impl CapsuleRegistry {
    pub fn from_config(config: &OrchestratorConfig) -> OrchestratorResult<Self> {
        let definitions = config
            .capsules
            .iter()
            .map(|(name, cfg)| CapsuleDefinition::from_config(name, cfg))
            .collect::<OrchestratorResult<Vec<_>>>()?;
        let registry = Self::from_definitions(definitions)?;
        info!("Loaded {} capsule(s) into registry", registry.len());
        Ok(registry)
    }

    /// Build a registry, rejecting duplicate names and dangling allow-list
    /// entries.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = CapsuleDefinition>,
    ) -> OrchestratorResult<Self> {
        let mut capsules = BTreeMap::new();
        for def in definitions {
            if capsules.contains_key(&def.name) {
                return Err(OrchestratorError::Registry(format!(
                    "capsule '{}' is registered twice",
                    def.name
                )));
            }
            capsules.insert(def.name.clone(), def);
        }

        for def in capsules.values() {
            if let Some(missing) = def.callable.iter().find(|c| !capsules.contains_key(*c)) {
                return Err(OrchestratorError::Registry(format!(
                    "capsule '{}' lists unregistered capsule '{}' as callable",
                    def.name, missing
                )));
            }
        }

        Ok(Self { capsules })
    }

    pub fn get(&self, name: &str) -> OrchestratorResult<&CapsuleDefinition> {
        self.capsules
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownCapsule(CapsuleName::new(name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capsules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.capsules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capsules.is_empty()
    }

    pub fn list(&self) -> Vec<CapsuleSummary> {
        self.capsules
            .values()
            .map(|def| CapsuleSummary {
                name: def.name.clone(),
                runnable: def.runnable.clone(),
                description: def.description.clone(),
                callable: def.callable.iter().cloned().collect(),
            })
            .collect()
    }
}
