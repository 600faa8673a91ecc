//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::runtime::RuntimeBackend;
use crate::store::WorkspaceStore;
use crate::terminal::SessionRegistry;

/// Everything the HTTP layer needs, built once at startup and passed to
/// collaborators explicitly.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<WorkspaceStore>,
    pub sessions: Arc<SessionRegistry>,
    pub backend: Arc<dyn RuntimeBackend>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(WorkspaceStore::new(config.data_dir.clone()));
        let backend = crate::runtime::backend_for(&config);
        Self {
            config,
            store,
            sessions: Arc::new(SessionRegistry::new()),
            backend,
        }
    }
}
