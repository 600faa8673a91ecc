//! Workspace registry and lifecycle state machine.
//!
//! The store is the single source of truth for workspace state. It is purely
//! in-memory: the registry is lost on process restart and only the workspace
//! directories under the data dir survive. That is a documented limitation,
//! not an accident.
//!
//! Reads are served concurrently; mutations are serialized per workspace by
//! each entry's `op_lock`, so unrelated workspaces proceed fully in parallel
//! while no two lifecycle operations on the same workspace overlap.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::runtime::RuntimeHandle;

/// Lifecycle states of a workspace.
///
/// `Deleted` is terminal; a deleted workspace is removed from the registry
/// and all later lookups fail with not-found. `Error` is recoverable: a new
/// upload or start attempt may be made from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceState {
    Created,
    Uploading,
    Installing,
    Starting,
    Ready,
    Error,
    Deleted,
}

impl std::fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Uploading => "uploading",
            Self::Installing => "installing",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Deleted => "deleted",
        };
        write!(f, "{name}")
    }
}

impl WorkspaceState {
    /// Whether a transition from `self` to `to` is allowed.
    ///
    /// Transitions are monotonic along the upload/start path; `Error` is
    /// reachable from every non-terminal state and retryable; `Deleted` is
    /// reachable from every non-terminal state and terminal.
    pub fn can_transition(self, to: WorkspaceState) -> bool {
        use WorkspaceState::*;
        if self == Deleted {
            return false;
        }
        match (self, to) {
            (_, Error) | (_, Deleted) => true,
            (Created | Error, Uploading) => true,
            (Uploading, Installing) => true,
            // Success without a manifest, or a rejected archive that left
            // the previous files untouched.
            (Uploading, Created) => true,
            (Installing, Created) => true,
            (Created | Error, Starting) => true,
            (Starting, Ready) => true,
            _ => false,
        }
    }
}

/// Mutable per-workspace metadata, guarded by the entry's meta lock.
#[derive(Debug)]
struct Meta {
    state: WorkspaceState,
    error_detail: Option<String>,
    runtime: Option<RuntimeHandle>,
}

/// One registered workspace.
///
/// The root path is fixed at creation and never changes. Lifecycle
/// operations take `op_lock` for their whole duration; `cancel` flips once
/// when the workspace is deleted so in-flight operations can bail out.
#[derive(Debug)]
pub struct WorkspaceEntry {
    pub id: Uuid,
    pub root: PathBuf,
    meta: RwLock<Meta>,
    pub op_lock: Mutex<()>,
    cancel: watch::Sender<bool>,
}

/// Read-only snapshot served by status and list endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceStatus {
    pub id: Uuid,
    pub state: WorkspaceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
}

impl WorkspaceEntry {
    pub async fn state(&self) -> WorkspaceState {
        self.meta.read().await.state
    }

    pub async fn runtime(&self) -> Option<RuntimeHandle> {
        self.meta.read().await.runtime.clone()
    }

    pub async fn status(&self) -> WorkspaceStatus {
        let meta = self.meta.read().await;
        WorkspaceStatus {
            id: self.id,
            state: meta.state,
            error_detail: meta.error_detail.clone(),
            runtime_id: meta.runtime.as_ref().map(|h| h.id.clone()),
        }
    }

    /// Moves the workspace to `to`, enforcing the transition graph.
    /// Leaving `Error` clears the recorded detail.
    pub async fn transition(&self, to: WorkspaceState) -> Result<()> {
        let mut meta = self.meta.write().await;
        if !meta.state.can_transition(to) {
            return Err(Error::InvalidState {
                state: meta.state.to_string(),
            });
        }
        if to != WorkspaceState::Error {
            meta.error_detail = None;
        }
        meta.state = to;
        Ok(())
    }

    /// Records a failure cause and enters the `Error` state.
    pub async fn fail(&self, detail: String) {
        let mut meta = self.meta.write().await;
        if meta.state != WorkspaceState::Deleted {
            meta.state = WorkspaceState::Error;
            meta.error_detail = Some(detail);
        }
    }

    /// Subscribes to the deletion signal. The receiver fires at most once.
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn signal_cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// In-memory workspace registry.
///
/// Passed explicitly to collaborators; there is no ambient global state.
pub struct WorkspaceStore {
    base_dir: PathBuf,
    entries: RwLock<HashMap<Uuid, Arc<WorkspaceEntry>>>,
    // Reverse index so terminal streams can address by the runtime id
    // returned from start.
    runtimes: RwLock<HashMap<String, Uuid>>,
}

impl WorkspaceStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            entries: RwLock::new(HashMap::new()),
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a new workspace with a fresh private root directory.
    pub async fn create(&self) -> Result<Arc<WorkspaceEntry>> {
        let id = Uuid::new_v4();
        let root = self.base_dir.join(id.to_string()).join("workspace");
        fs::create_dir_all(&root)?;

        let (cancel, _) = watch::channel(false);
        let entry = Arc::new(WorkspaceEntry {
            id,
            root,
            meta: RwLock::new(Meta {
                state: WorkspaceState::Created,
                error_detail: None,
                runtime: None,
            }),
            op_lock: Mutex::new(()),
            cancel,
        });

        self.entries.write().await.insert(id, entry.clone());
        info!(workspace = %id, "created workspace");
        Ok(entry)
    }

    pub async fn get(&self, id: Uuid) -> Result<Arc<WorkspaceEntry>> {
        self.entries
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("workspace {id}")))
    }

    /// Looks a workspace up by the runtime id returned from start.
    pub async fn resolve_runtime(&self, runtime_id: &str) -> Result<Arc<WorkspaceEntry>> {
        let id = self
            .runtimes
            .read()
            .await
            .get(runtime_id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("runtime {runtime_id}")))?;
        self.get(id).await
    }

    /// Records a provisioned runtime handle for a workspace.
    pub async fn bind_runtime(&self, entry: &WorkspaceEntry, handle: RuntimeHandle) {
        self.runtimes
            .write()
            .await
            .insert(handle.id.clone(), entry.id);
        entry.meta.write().await.runtime = Some(handle);
    }

    /// Unregisters a workspace and signals cancellation to any in-flight
    /// operation. Subsequent lookups fail with not-found. The caller is
    /// responsible for tearing down the runtime and the directories.
    pub async fn remove(&self, id: Uuid) -> Result<Arc<WorkspaceEntry>> {
        let entry = self
            .entries
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("workspace {id}")))?;
        if let Some(handle) = entry.runtime().await {
            self.runtimes.write().await.remove(&handle.id);
        }
        entry.signal_cancel();
        Ok(entry)
    }

    pub async fn list(&self) -> Vec<WorkspaceStatus> {
        let entries = self.entries.read().await;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries.values() {
            out.push(entry.status().await);
        }
        out.sort_by_key(|s| s.id);
        out
    }

    /// Private parent directory of a workspace root (staging, sandbox).
    pub fn project_dir(&self, id: Uuid) -> PathBuf {
        self.base_dir.join(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, WorkspaceStore) {
        let dir = TempDir::new().unwrap();
        let store = WorkspaceStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[tokio::test]
    async fn create_makes_root_and_registers() {
        let (_dir, store) = store();
        let entry = store.create().await.unwrap();
        assert!(entry.root.is_dir());
        assert_eq!(entry.state().await, WorkspaceState::Created);
        assert!(store.get(entry.id).await.is_ok());
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let (_dir, store) = store();
        let err = store.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn remove_makes_lookups_fail_and_signals_cancel() {
        let (_dir, store) = store();
        let entry = store.create().await.unwrap();
        let mut cancel = entry.cancelled();
        assert!(!entry.is_cancelled());

        let removed = store.remove(entry.id).await.unwrap();
        assert_eq!(removed.id, entry.id);
        assert!(entry.is_cancelled());
        cancel.changed().await.unwrap();
        assert!(matches!(
            store.get(entry.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn transition_graph_is_enforced() {
        use WorkspaceState::*;
        let allowed = [
            (Created, Uploading),
            (Uploading, Installing),
            (Uploading, Created),
            (Installing, Created),
            (Created, Starting),
            (Starting, Ready),
            (Error, Uploading),
            (Error, Starting),
            (Ready, Error),
            (Starting, Deleted),
        ];
        for (from, to) in allowed {
            assert!(from.can_transition(to), "{from} -> {to} should be legal");
        }

        let forbidden = [
            (Created, Ready),
            (Ready, Starting),
            (Ready, Uploading),
            (Installing, Starting),
            (Deleted, Created),
            (Deleted, Error),
            (Deleted, Deleted),
            (Uploading, Ready),
        ];
        for (from, to) in forbidden {
            assert!(!from.can_transition(to), "{from} -> {to} should be illegal");
        }
    }

    #[tokio::test]
    async fn illegal_transition_is_invalid_state() {
        let (_dir, store) = store();
        let entry = store.create().await.unwrap();
        entry.transition(WorkspaceState::Starting).await.unwrap();
        entry.transition(WorkspaceState::Ready).await.unwrap();

        // A ready workspace may not be started again.
        let err = entry.transition(WorkspaceState::Starting).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(entry.state().await, WorkspaceState::Ready);
    }

    #[tokio::test]
    async fn fail_records_detail_and_recovery_clears_it() {
        let (_dir, store) = store();
        let entry = store.create().await.unwrap();
        entry.fail("mount tmpfs: permission denied".into()).await;
        assert_eq!(entry.state().await, WorkspaceState::Error);
        assert!(entry.status().await.error_detail.is_some());

        entry.transition(WorkspaceState::Starting).await.unwrap();
        assert!(entry.status().await.error_detail.is_none());
    }

    #[tokio::test]
    async fn runtime_binding_is_resolvable_until_removal() {
        let (_dir, store) = store();
        let entry = store.create().await.unwrap();
        let handle = RuntimeHandle {
            id: format!("local-{}", entry.id),
            workspace_id: entry.id,
            attach_dir: entry.root.clone(),
        };
        store.bind_runtime(&entry, handle.clone()).await;

        let resolved = store.resolve_runtime(&handle.id).await.unwrap();
        assert_eq!(resolved.id, entry.id);

        store.remove(entry.id).await.unwrap();
        assert!(store.resolve_runtime(&handle.id).await.is_err());
    }
}
