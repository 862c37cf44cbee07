//! Typed HTTP client for a running orchestrator.
//!
//! Used by the CLI and by capsules written in Rust that want to issue
//! handoffs from inside their unit.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::engine::{ENV_ORCHESTRATOR_URL, ENV_SESSION_ID, ExecutionRequest, ExecutionResult};
use crate::handoff::{HandoffRequest, HandoffResponse};
use crate::registry::CapsuleSummary;
use crate::schema::JsonObject;
use crate::types::SessionId;
use crate::workflow::{WorkflowDefinition, WorkflowRunResult};

#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    base: Url,
    http: reqwest::Client,
}

impl OrchestratorClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base =
            Url::parse(base_url).with_context(|| format!("invalid orchestrator url {}", base_url))?;
        // Url::join drops the last segment unless the path ends with a slash.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        // Capsule runs can take as long as their timeout, so no request deadline.
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { base, http })
    }

    /// Client for code running inside a unit, configured from its environment.
    pub fn from_unit_env() -> Result<(Self, SessionId)> {
        let url = std::env::var(ENV_ORCHESTRATOR_URL)
            .with_context(|| format!("{} is not set", ENV_ORCHESTRATOR_URL))?;
        let session = std::env::var(ENV_SESSION_ID)
            .with_context(|| format!("{} is not set", ENV_SESSION_ID))?;
        Ok((Self::new(&url)?, SessionId::new(session)))
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("invalid endpoint {}", path))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.http.get(self.endpoint(path)?).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("GET {} returned {}: {}", path, status, body));
        }
        Ok(response.json().await?)
    }

    /// POST and decode the body. Failure statuses still carry a result
    /// document, so the body is decoded whatever the status.
    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .http
            .post(self.endpoint(path)?)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).with_context(|| {
            format!(
                "POST {} returned {}: {}",
                path,
                status,
                String::from_utf8_lossy(&bytes)
            )
        })
    }

    pub async fn health(&self) -> Result<Value> {
        self.get("health").await
    }

    pub async fn capsules(&self) -> Result<Vec<CapsuleSummary>> {
        let mut listing: Value = self.get("capsules").await?;
        let capsules = listing
            .get_mut("capsules")
            .map(Value::take)
            .ok_or_else(|| anyhow!("capsule listing has no 'capsules' field"))?;
        Ok(serde_json::from_value(capsules)?)
    }

    pub async fn schema(&self, capsule: &str) -> Result<Value> {
        self.get(&format!("capsules/{}/schema", capsule)).await
    }

    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        self.post("execute", request).await
    }

    pub async fn handoff(
        &self,
        session_id: &SessionId,
        request: &HandoffRequest,
    ) -> Result<HandoffResponse> {
        let body = serde_json::json!({
            "session_id": session_id,
            "target": request.target,
            "args": request.args,
        });
        self.post("handoff", &body).await
    }

    pub async fn run_workflow(
        &self,
        workflow: &WorkflowDefinition,
        input: &JsonObject,
    ) -> Result<WorkflowRunResult> {
        let body = serde_json::json!({
            "workflow": workflow,
            "input": input,
        });
        self.post("workflows/run", &body).await
    }

    pub async fn state(&self) -> Result<Value> {
        self.get("state").await
    }
}
