//! Per-execution volume sessions.
//!
//! Every execution gets a fresh directory tree under the configured base path:
//!
//! ```text
//! <base>/<session id>/
//!     input/              input.json + staged input files
//!     output/             output.json + output files written by the unit
//!     handoff/outgoing/   files the unit offers to a handoff target
//!     handoff/incoming/   files returned by handoff targets
//! ```
//!
//! The tree is owned by a [`VolumeSession`] value and removed when that value
//! is closed or dropped, so teardown happens on every exit path. Files only
//! leave a session through [`VolumeManager::copy_verified`].

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::VolumeConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{FileName, SessionId, WorkflowRunId};

pub const INPUT_DOCUMENT: &str = "input.json";
pub const OUTPUT_DOCUMENT: &str = "output.json";

const WORKFLOW_SCRATCH_PREFIX: &str = "workflow-";

/// The four region paths of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub root: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub outgoing: PathBuf,
    pub incoming: PathBuf,
}

impl SessionPaths {
    fn under(root: PathBuf) -> Self {
        Self {
            input: root.join("input"),
            output: root.join("output"),
            outgoing: root.join("handoff").join("outgoing"),
            incoming: root.join("handoff").join("incoming"),
            root,
        }
    }

    pub fn input_document(&self) -> PathBuf {
        self.input.join(INPUT_DOCUMENT)
    }

    pub fn output_document(&self) -> PathBuf {
        self.output.join(OUTPUT_DOCUMENT)
    }

    fn regions(&self) -> [&Path; 4] {
        [&self.input, &self.output, &self.outgoing, &self.incoming]
    }
}

/// Removes a directory tree when dropped unless it was already closed.
#[derive(Debug)]
struct DirGuard {
    path: PathBuf,
    armed: bool,
}

impl DirGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    async fn close(&mut self) -> OrchestratorResult<()> {
        self.armed = false;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OrchestratorError::io(
                format!("removing {}", self.path.display()),
                e,
            )),
        }
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Removed {} on drop", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}

/// An isolated, single-use set of regions bound to one execution.
#[derive(Debug)]
pub struct VolumeSession {
    id: SessionId,
    paths: SessionPaths,
    guard: DirGuard,
}

impl VolumeSession {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    /// Tear the session down now and report failures instead of only
    /// logging them.
    pub async fn close(mut self) -> OrchestratorResult<()> {
        self.guard.close().await?;
        debug!(session = %self.id, "Session volume removed");
        Ok(())
    }
}

/// A temporary directory outside any session, used to carry files between
/// workflow steps.
#[derive(Debug)]
pub struct ScratchDir {
    guard: DirGuard,
}

impl ScratchDir {
    pub fn path(&self) -> &Path {
        &self.guard.path
    }

    pub async fn close(mut self) -> OrchestratorResult<()> {
        self.guard.close().await
    }
}

#[derive(Debug, Clone)]
pub struct VolumeManager {
    base_path: PathBuf,
    verify_digest: bool,
}

impl VolumeManager {
    pub fn new(base_path: impl Into<PathBuf>, verify_digest: bool) -> Self {
        Self {
            base_path: base_path.into(),
            verify_digest,
        }
    }

    pub fn from_config(config: &VolumeConfig) -> Self {
        Self::new(config.base_path.clone(), config.verify_digest)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Where the session with `id` lives (whether or not it exists).
    pub fn session_paths(&self, id: &SessionId) -> SessionPaths {
        SessionPaths::under(self.base_path.join(id.as_str()))
    }

    /// Create a fresh session tree. Fails if the root already exists, so two
    /// executions can never share a volume.
    pub async fn create_session(&self, id: &SessionId) -> OrchestratorResult<VolumeSession> {
        tokio::fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| OrchestratorError::io(format!("creating {}", self.base_path.display()), e))?;

        let paths = self.session_paths(id);
        tokio::fs::create_dir(&paths.root)
            .await
            .map_err(|e| OrchestratorError::io(format!("creating session {}", id), e))?;

        // From here on the guard owns the tree, including on the error paths below.
        let session = VolumeSession {
            id: id.clone(),
            guard: DirGuard::new(paths.root.clone()),
            paths,
        };

        for region in session.paths.regions() {
            tokio::fs::create_dir_all(region)
                .await
                .map_err(|e| OrchestratorError::io(format!("creating {}", region.display()), e))?;
            open_permissions(region).await?;
        }

        debug!(session = %id, root = %session.paths.root.display(), "Session volume created");
        Ok(session)
    }

    /// Create `<base>/workflow-<run id>`.
    pub async fn create_scratch(&self, run: &WorkflowRunId) -> OrchestratorResult<ScratchDir> {
        let path = self
            .base_path
            .join(format!("{}{}", WORKFLOW_SCRATCH_PREFIX, run));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| OrchestratorError::io(format!("creating {}", path.display()), e))?;
        Ok(ScratchDir {
            guard: DirGuard::new(path),
        })
    }

    /// Copy a file and confirm the destination matches the source in size
    /// (and digest when enabled). Returns the number of bytes copied.
    pub async fn copy_verified(&self, src: &Path, dst: &Path) -> OrchestratorResult<u64> {
        let context = || format!("copying {} to {}", src.display(), dst.display());

        // Links are not followed: a unit could otherwise point a region entry
        // at any host path.
        let source_meta = tokio::fs::symlink_metadata(src)
            .await
            .map_err(|e| OrchestratorError::io(context(), e))?;
        if !source_meta.file_type().is_file() {
            return Err(OrchestratorError::io(
                context(),
                io::Error::new(io::ErrorKind::InvalidInput, "source is not a regular file"),
            ));
        }
        if let Ok(existing) = tokio::fs::symlink_metadata(dst).await {
            if existing.file_type().is_symlink() {
                tokio::fs::remove_file(dst)
                    .await
                    .map_err(|e| OrchestratorError::io(context(), e))?;
            }
        }

        tokio::fs::copy(src, dst)
            .await
            .map_err(|e| OrchestratorError::io(context(), e))?;

        let copied = tokio::fs::metadata(dst)
            .await
            .map_err(|e| OrchestratorError::io(context(), e))?
            .len();
        if copied != source_meta.len() {
            return Err(OrchestratorError::io(
                context(),
                io::Error::other(format!(
                    "size mismatch after copy: expected {} bytes, found {}",
                    source_meta.len(),
                    copied
                )),
            ));
        }

        if self.verify_digest {
            let (a, b) = tokio::try_join!(file_digest(src), file_digest(dst))
                .map_err(|e| OrchestratorError::io(context(), e))?;
            if a != b {
                return Err(OrchestratorError::io(
                    context(),
                    io::Error::other("digest mismatch after copy"),
                ));
            }
        }

        debug!("Copied {} bytes {} -> {}", copied, src.display(), dst.display());
        Ok(copied)
    }

    /// Stage externally supplied files into `dir` under their given names.
    pub async fn stage_files(
        &self,
        files: &BTreeMap<FileName, PathBuf>,
        dir: &Path,
    ) -> OrchestratorResult<()> {
        for (name, src) in files {
            self.copy_verified(src, &dir.join(name)).await?;
        }
        Ok(())
    }

    /// Copy the named files from `src_dir` to `dst_dir`, replacing existing
    /// destination files.
    pub async fn export_files(
        &self,
        names: &[FileName],
        src_dir: &Path,
        dst_dir: &Path,
    ) -> OrchestratorResult<()> {
        tokio::fs::create_dir_all(dst_dir)
            .await
            .map_err(|e| OrchestratorError::io(format!("creating {}", dst_dir.display()), e))?;
        for name in names {
            self.copy_verified(&src_dir.join(name), &dst_dir.join(name)).await?;
        }
        Ok(())
    }

    /// Remove every leftover session and scratch directory under the base
    /// path. Returns how many entries were removed.
    pub async fn sweep(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("Cannot sweep {}: {}", self.base_path.display(), e);
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error while sweeping {}: {}", self.base_path.display(), e);
                    break;
                }
            };
            let path = entry.path();
            let result = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => tokio::fs::remove_dir_all(&path).await,
                Ok(_) => tokio::fs::remove_file(&path).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            info!("Swept {} leftover volume entries from {}", removed, self.base_path.display());
        }
        removed
    }
}

/// Regular files in `dir`, excluding the output document, sorted by name.
pub async fn list_files(dir: &Path) -> OrchestratorResult<Vec<FileName>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| OrchestratorError::io(format!("listing {}", dir.display()), e))?;

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| OrchestratorError::io(format!("listing {}", dir.display()), e))?
    {
        let is_file = entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false);
        if !is_file {
            debug!("Ignoring non-file entry {}", entry.path().display());
            continue;
        }
        let Ok(raw) = entry.file_name().into_string() else {
            warn!("Ignoring non UTF-8 file name in {}", dir.display());
            continue;
        };
        if raw == OUTPUT_DOCUMENT {
            continue;
        }
        names.push(FileName::parse(raw)?);
    }
    names.sort();
    Ok(names)
}

/// First of `names` that already has an entry of any kind in `dir`.
pub async fn first_existing(dir: &Path, names: &[FileName]) -> Option<FileName> {
    for name in names {
        if tokio::fs::symlink_metadata(dir.join(name)).await.is_ok() {
            return Some(name.clone());
        }
    }
    None
}

/// True when `path` is a regular file. Symlinks are not followed.
pub async fn is_regular_file(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path)
        .await
        .map(|m| m.file_type().is_file())
        .unwrap_or(false)
}

async fn file_digest(path: &Path) -> io::Result<Vec<u8>> {
    let bytes = tokio::fs::read(path).await?;
    Ok(Sha256::digest(&bytes).to_vec())
}

#[cfg(unix)]
async fn open_permissions(dir: &Path) -> OrchestratorResult<()> {
    use std::os::unix::fs::PermissionsExt;
    // Container users rarely match the host uid.
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))
        .await
        .map_err(|e| OrchestratorError::io(format!("setting permissions on {}", dir.display()), e))
}

#[cfg(not(unix))]
async fn open_permissions(_dir: &Path) -> OrchestratorResult<()> {
    Ok(())
}
