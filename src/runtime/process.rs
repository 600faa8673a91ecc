//! Subprocess backend: no container, just a per-workspace virtualenv.
//!
//! Shells run directly on the host with their working directory confined
//! to the workspace root. This shares the host's process and filesystem
//! namespaces with the server itself; the weaker isolation is advertised
//! through [`Isolation::SharedHost`] and logged at provision time rather
//! than hidden.

use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pty::{self, ShellProcess, SpawnOptions};
use crate::runtime::{self, Isolation, RuntimeBackend, RuntimeHandle, ShellSpec};

pub struct ProcessBackend {
    config: Arc<Config>,
}

impl ProcessBackend {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RuntimeBackend for ProcessBackend {
    fn isolation(&self) -> Isolation {
        Isolation::SharedHost
    }

    async fn provision(&self, workspace_id: Uuid, root: PathBuf) -> Result<RuntimeHandle> {
        if !root.is_dir() {
            return Err(Error::Provision(format!(
                "workspace root {} does not exist",
                root.display()
            )));
        }

        let python = self.config.python.clone();
        let setup_root = root.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            runtime::ensure_venv(&python, &setup_root)?;
            if runtime::has_manifest(&setup_root) {
                if let Err(err) = runtime::pip_install(&python, &setup_root) {
                    warn!(workspace = %workspace_id, %err, "dependency install failed");
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Provision(format!("provision task: {e}")))??;

        info!(
            workspace = %workspace_id,
            "subprocess runtime provisioned; shares host process and filesystem namespaces"
        );
        Ok(RuntimeHandle {
            id: format!("local-{workspace_id}"),
            workspace_id,
            attach_dir: root,
        })
    }

    async fn install_dependencies(&self, workspace_id: Uuid, root: PathBuf) -> Result<()> {
        let python = self.config.python.clone();
        tokio::task::spawn_blocking(move || runtime::pip_install(&python, &root))
            .await
            .map_err(|e| Error::DependencyInstall(format!("install task: {e}")))??;
        debug!(workspace = %workspace_id, "dependencies installed");
        Ok(())
    }

    async fn exec_interactive(
        &self,
        handle: &RuntimeHandle,
        spec: &ShellSpec,
    ) -> Result<ShellProcess> {
        let root = handle.attach_dir.clone();
        if !root.is_dir() {
            return Err(Error::Provision(format!(
                "runtime {} is not provisioned",
                handle.id
            )));
        }

        let mut path_var: OsString = root.join(".venv").join("bin").into_os_string();
        if let Some(host_path) = env::var_os("PATH") {
            path_var.push(":");
            path_var.push(host_path);
        }

        let opts = SpawnOptions {
            program: spec.shell.clone(),
            args: vec!["-i".to_string()],
            env: vec![
                ("TERM".into(), "xterm-256color".into()),
                ("PS1".into(), "\\w $ ".into()),
                ("PATH".into(), path_var),
                ("PYTHONUNBUFFERED".into(), "1".into()),
            ],
            inherit_env: true,
            cwd: Some(root),
            cols: spec.cols,
            rows: spec.rows,
        };

        tokio::task::spawn_blocking(move || pty::spawn(opts, None))
            .await
            .map_err(|e| Error::Provision(format!("exec task: {e}")))?
    }

    async fn destroy(&self, handle: &RuntimeHandle) {
        // Nothing host-global to reclaim: the virtualenv lives inside the
        // workspace root and goes away with it.
        debug!(runtime = %handle.id, "subprocess runtime released");
    }
}
