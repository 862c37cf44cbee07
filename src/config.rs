use serde::Deserialize;
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::schema::SchemaDocument;

pub const CONFIG_ENV_VAR: &str = "ORCHESTRATOR_CONFIG";
const DEFAULT_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub volumes: VolumeConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Environment passed to every execution unit.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub capsules: BTreeMap<String, CapsuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// URL units use to reach the handoff endpoint.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: None,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeConfig {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    /// When set, top-level executions export their output files to
    /// `<results_dir>/<session id>/` before teardown.
    #[serde(default)]
    pub results_dir: Option<PathBuf>,
    /// Compare SHA-256 digests in addition to sizes after each copy.
    #[serde(default)]
    pub verify_digest: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            results_dir: None,
            verify_digest: false,
        }
    }
}

fn default_base_path() -> PathBuf {
    PathBuf::from("./volumes")
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Process,
    Docker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub kind: RuntimeKind,
    /// Where the session root appears inside the unit.
    #[serde(default = "default_mount_point")]
    pub mount_point: String,
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::default(),
            mount_point: default_mount_point(),
            docker_binary: default_docker_binary(),
            network: None,
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

fn default_mount_point() -> String {
    "/io".to_string()
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_stop_grace_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_log_tail_lines() -> usize {
    100
}

/// What to do when a handoff result file already exists in the caller's
/// incoming region.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    #[default]
    Reject,
    Overwrite,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandoffConfig {
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowConfig {
    /// Aggregate deadline for a whole workflow run. `None` means the run is
    /// bounded only by its steps' own timeouts.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl WorkflowConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

/// Schema either inline or as a path to a `schema.json` file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SchemaSource {
    Path(PathBuf),
    Inline(SchemaDocument),
}

impl Default for SchemaSource {
    fn default() -> Self {
        Self::Inline(SchemaDocument::default())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapsuleConfig {
    /// Image reference (docker) or executable (process).
    pub runnable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schema: SchemaSource,
    /// Capsules this one may hand off to.
    #[serde(default)]
    pub callable: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            volumes: VolumeConfig::default(),
            runtime: RuntimeConfig::default(),
            execution: ExecutionConfig::default(),
            handoff: HandoffConfig::default(),
            workflow: WorkflowConfig::default(),
            env: BTreeMap::new(),
            capsules: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from an explicit path, or resolve one the usual way.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => resolve_config_path()?,
        };
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_json_str(&raw, &base_dir)
    }

    /// Parse a config document. Relative paths are resolved against `base_dir`.
    pub fn from_json_str(raw: &str, base_dir: &Path) -> anyhow::Result<Self> {
        let cfg: OrchestratorConfig = serde_json::from_str(raw)?;
        Ok(cfg.expand().normalize_paths(base_dir))
    }

    fn expand(mut self) -> Self {
        for val in self.env.values_mut() {
            *val = expand_env_vars(val);
        }
        if let Some(url) = self.server.public_url.as_mut() {
            *url = expand_env_vars(url);
        }
        self.capsules = self
            .capsules
            .into_iter()
            .map(|(name, cfg)| (name, expand_capsule(cfg)))
            .collect();
        self
    }

    fn normalize_paths(mut self, base_dir: &Path) -> Self {
        self.volumes.base_path = absolutize(base_dir, &self.volumes.base_path);
        if let Some(dir) = self.volumes.results_dir.as_mut() {
            *dir = absolutize(base_dir, dir);
        }
        for capsule in self.capsules.values_mut() {
            if let SchemaSource::Path(p) = &mut capsule.schema {
                *p = absolutize(base_dir, p);
            }
        }
        self
    }

    /// URL injected into units as `ORCHESTRATOR_URL`.
    pub fn orchestrator_url(&self) -> String {
        if let Some(url) = &self.server.public_url {
            return url.trim_end_matches('/').to_string();
        }

        let (host, port) = match self.server.bind.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => (self.server.bind.as_str(), "8000"),
        };

        // Containers reach the host through the docker gateway name; local
        // processes use loopback.
        let host = match (host, self.runtime.kind) {
            ("0.0.0.0", RuntimeKind::Docker) => "host.docker.internal",
            ("0.0.0.0", RuntimeKind::Process) => "127.0.0.1",
            (h, _) => h,
        };

        format!("http://{}:{}", host, port)
    }
}

pub fn resolve_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(p) = env::var(CONFIG_ENV_VAR) {
        return Ok(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg)
            .join("capsule-orchestrator")
            .join("orchestrator.json");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = PathBuf::from("orchestrator.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow::anyhow!(
        "Could not find orchestrator.json (set {} or create ./orchestrator.json)",
        CONFIG_ENV_VAR
    ))
}

fn absolutize(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_capsule(cfg: CapsuleConfig) -> CapsuleConfig {
    let mut cfg = cfg;

    cfg.runnable = expand_env_vars(&cfg.runnable);
    cfg.args = cfg.args.into_iter().map(|a| expand_env_vars(&a)).collect();
    for val in cfg.env.values_mut() {
        *val = expand_env_vars(val);
    }

    cfg
}
