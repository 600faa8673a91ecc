//! Runtime provisioning backends.
//!
//! A single [`RuntimeBackend`] is selected at process start from
//! configuration; call sites never branch on the variant. The container
//! backend builds a namespace/chroot sandbox, the process backend runs
//! plain subprocesses confined to the workspace directory.

pub mod container;
pub mod process;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::{BackendKind, Config};
use crate::error::{Error, Result};
use crate::pty::ShellProcess;

/// Dependency manifest recognized at the workspace root.
pub const MANIFEST_FILE: &str = "requirements.txt";

/// Isolation strength a backend provides. Surfaced through the API so the
/// weaker variant is never mistaken for a real sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Mount (and optionally network) namespaces, chroot, non-root user.
    Namespaces,
    /// Shares the host's process and filesystem namespaces.
    SharedHost,
}

/// Opaque reference to a provisioned environment.
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    /// Public id, used to address terminal streams.
    pub id: String,
    pub workspace_id: Uuid,
    /// Backend-private attach point (sandbox root or workspace root).
    pub attach_dir: PathBuf,
}

/// Parameters for an interactive shell inside a runtime.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
}

impl ShellSpec {
    pub fn new(shell: String) -> Self {
        Self {
            shell,
            cols: 80,
            rows: 24,
        }
    }
}

/// The capability set every runtime variant implements: create an isolated
/// environment, attach an interactive shell to it, and tear it down.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    fn isolation(&self) -> Isolation;

    /// Creates the isolated environment for a workspace and returns its
    /// handle. Never retried automatically on failure.
    async fn provision(&self, workspace_id: Uuid, root: PathBuf) -> Result<RuntimeHandle>;

    /// Installs dependencies declared in the workspace manifest. Failures
    /// are reported but leave the extracted files usable.
    async fn install_dependencies(&self, workspace_id: Uuid, root: PathBuf) -> Result<()>;

    /// Attaches an interactive shell inside the environment.
    async fn exec_interactive(
        &self,
        handle: &RuntimeHandle,
        spec: &ShellSpec,
    ) -> Result<ShellProcess>;

    /// Applies new pty dimensions to an attached shell.
    fn resize(&self, shell: &ShellProcess, cols: u16, rows: u16) -> Result<()> {
        shell.resize(cols, rows).map_err(Error::from)
    }

    /// Tears the environment down. Idempotent: destroying a handle that
    /// was never provisioned, or twice, is a no-op.
    async fn destroy(&self, handle: &RuntimeHandle);
}

/// Builds the backend selected by the configuration.
pub fn backend_for(config: &Arc<Config>) -> Arc<dyn RuntimeBackend> {
    match config.backend {
        BackendKind::Container => Arc::new(container::ContainerBackend::new(config.clone())),
        BackendKind::Process => Arc::new(process::ProcessBackend::new(config.clone())),
    }
}

pub fn has_manifest(root: &Path) -> bool {
    root.join(MANIFEST_FILE).is_file()
}

/// Creates the per-workspace virtualenv if it does not exist yet.
pub(crate) fn ensure_venv(python: &str, root: &Path) -> Result<PathBuf> {
    let venv = root.join(".venv");
    if venv.join("bin").join("python").exists() {
        return Ok(venv);
    }
    let output = Command::new(python)
        .arg("-m")
        .arg("venv")
        .arg(&venv)
        .output()
        .map_err(|e| Error::Provision(format!("spawn {python}: {e}")))?;
    if !output.status.success() {
        return Err(Error::Provision(format!(
            "venv creation failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    debug!(venv = %venv.display(), "virtualenv created");
    Ok(venv)
}

/// Installs the manifest's dependencies into the workspace virtualenv.
pub(crate) fn pip_install(python: &str, root: &Path) -> Result<()> {
    let venv = ensure_venv(python, root).map_err(|e| match e {
        Error::Provision(msg) => Error::DependencyInstall(msg),
        other => other,
    })?;
    let pip = venv.join("bin").join("pip");
    let output = Command::new(&pip)
        .arg("install")
        .arg("-r")
        .arg(root.join(MANIFEST_FILE))
        .current_dir(root)
        .output()
        .map_err(|e| Error::DependencyInstall(format!("spawn pip: {e}")))?;
    if !output.status.success() {
        return Err(Error::DependencyInstall(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}
