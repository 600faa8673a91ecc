//! HTTP server implementation using Axum.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio::task;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive;
use crate::error::Error;
use crate::files::{self, FileNode};
use crate::runtime::{self, Isolation, ShellSpec};
use crate::state::AppState;
use crate::store::{WorkspaceState, WorkspaceStatus};
use crate::terminal;

/// Upload size cap. Plenty for project archives, small enough to keep a
/// hostile upload from exhausting memory.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

// Response types
#[derive(Serialize)]
struct CreateWorkspaceResponse {
    workspace_id: Uuid,
}

#[derive(Serialize)]
struct UploadResponse {
    files: Vec<FileNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    install_error: Option<String>,
}

#[derive(Serialize)]
struct StartResponse {
    runtime_id: String,
    isolation: Isolation,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: WorkspaceStatus,
    isolation: Isolation,
}

#[derive(Serialize)]
struct WriteResponse {
    status: &'static str,
    path: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::PathEscape { .. } | Error::InvalidArchive(_) => StatusCode::BAD_REQUEST,
            Error::InvalidState { .. } => StatusCode::CONFLICT,
            Error::Provision(_) => StatusCode::BAD_GATEWAY,
            Error::DependencyInstall(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": self.kind(),
            "detail": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        // Workspace lifecycle
        .route("/api/workspaces", post(create_workspace))
        .route("/api/workspaces", get(list_workspaces))
        .route("/api/workspaces/:id/upload", post(upload_archive))
        .route("/api/workspaces/:id/start", post(start_workspace))
        .route("/api/workspaces/:id/status", get(workspace_status))
        .route("/api/workspaces/:id", delete(delete_workspace))
        // Files
        .route("/api/workspaces/:id/files", get(list_files))
        .route("/api/workspaces/:id/files/*path", get(read_file))
        .route("/api/workspaces/:id/files/*path", put(write_file))
        // Terminal stream
        .route("/ws/terminal/:runtime_id", get(terminal_stream))
        // Health check
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn health() -> &'static str {
    "OK"
}

async fn create_workspace(
    State(state): State<AppState>,
) -> Result<Json<CreateWorkspaceResponse>, Error> {
    let entry = state.store.create().await?;
    Ok(Json(CreateWorkspaceResponse {
        workspace_id: entry.id,
    }))
}

async fn list_workspaces(State(state): State<AppState>) -> Json<Vec<WorkspaceStatus>> {
    Json(state.store.list().await)
}

async fn workspace_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusResponse>, Error> {
    let entry = state.store.get(id).await?;
    Ok(Json(StatusResponse {
        status: entry.status().await,
        isolation: state.backend.isolation(),
    }))
}

async fn upload_archive(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<UploadResponse>, Error> {
    let entry = state.store.get(id).await?;
    let _guard = match entry.op_lock.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
            return Err(Error::InvalidState {
                state: entry.state().await.to_string(),
            });
        }
    };

    let mut cancel = entry.cancelled();
    if *cancel.borrow() {
        return Err(Error::NotFound(format!("workspace {id}")));
    }

    entry.transition(WorkspaceState::Uploading).await?;
    let root = entry.root.clone();
    let extracted = tokio::select! {
        res = task::spawn_blocking(move || archive::extract(&root, &body)) => {
            res.map_err(|e| Error::InvalidArchive(format!("extract task: {e}")))?
        }
        _ = cancel.changed() => {
            return Err(Error::NotFound(format!("workspace {id}")));
        }
    };
    if let Err(err) = extracted {
        // The root is untouched; the workspace stays usable.
        let _ = entry.transition(WorkspaceState::Created).await;
        return Err(err);
    }

    let install_error = if runtime::has_manifest(&entry.root) {
        entry.transition(WorkspaceState::Installing).await?;
        let root = entry.root.clone();
        tokio::select! {
            res = state.backend.install_dependencies(id, root) => {
                res.err().map(|e| {
                    warn!(workspace = %id, %e, "dependency install failed");
                    e.to_string()
                })
            }
            _ = cancel.changed() => {
                return Err(Error::NotFound(format!("workspace {id}")));
            }
        }
    } else {
        None
    };

    entry.transition(WorkspaceState::Created).await?;
    let files = files::list_tree(&entry.root)?;
    Ok(Json(UploadResponse {
        files,
        install_error,
    }))
}

async fn start_workspace(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StartResponse>, Error> {
    let entry = state.store.get(id).await?;
    let _guard = match entry.op_lock.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
            return Err(Error::InvalidState {
                state: entry.state().await.to_string(),
            });
        }
    };

    // A second start never creates a second runtime.
    if let Some(handle) = entry.runtime().await {
        if entry.state().await == WorkspaceState::Ready {
            return Ok(Json(StartResponse {
                runtime_id: handle.id,
                isolation: state.backend.isolation(),
            }));
        }
    }

    let mut cancel = entry.cancelled();
    if *cancel.borrow() {
        return Err(Error::NotFound(format!("workspace {id}")));
    }

    entry.transition(WorkspaceState::Starting).await?;
    let backend = state.backend.clone();
    let root = entry.root.clone();
    let mut provisioning = tokio::spawn(async move { backend.provision(id, root).await });

    let provisioned = tokio::select! {
        res = &mut provisioning => {
            res.map_err(|e| Error::Provision(format!("provision task: {e}")))?
        }
        _ = cancel.changed() => {
            // The workspace is gone; reclaim whatever provisioning still
            // produces in the background.
            let backend = state.backend.clone();
            tokio::spawn(async move {
                if let Ok(Ok(handle)) = provisioning.await {
                    backend.destroy(&handle).await;
                }
            });
            return Err(Error::NotFound(format!("workspace {id}")));
        }
    };

    match provisioned {
        Ok(handle) => {
            state.store.bind_runtime(&entry, handle.clone()).await;
            entry.transition(WorkspaceState::Ready).await?;
            info!(workspace = %id, runtime = %handle.id, "workspace started");
            Ok(Json(StartResponse {
                runtime_id: handle.id,
                isolation: state.backend.isolation(),
            }))
        }
        Err(err) => {
            entry.fail(err.to_string()).await;
            Err(err)
        }
    }
}

async fn delete_workspace(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Error> {
    let entry = state.store.remove(id).await?;

    let closed = state.sessions.close_for_workspace(id).await;
    if closed > 0 {
        info!(workspace = %id, sessions = closed, "terminal sessions signalled");
    }

    // Wait for any in-flight lifecycle operation to observe the cancel.
    let _guard = entry.op_lock.lock().await;
    let _ = entry.transition(WorkspaceState::Deleted).await;

    if let Some(handle) = entry.runtime().await {
        state.backend.destroy(&handle).await;
    }

    let project_dir = state.store.project_dir(id);
    task::spawn_blocking(move || {
        let _ = std::fs::remove_dir_all(&project_dir);
    })
    .await
    .ok();

    info!(workspace = %id, "workspace deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_files(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<FileNode>>, Error> {
    let entry = state.store.get(id).await?;
    let root = entry.root.clone();
    task::spawn_blocking(move || files::list_tree(&root))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
        .map(Json)
}

async fn read_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(Uuid, String)>,
) -> Result<Vec<u8>, Error> {
    let entry = state.store.get(id).await?;
    let root = entry.root.clone();
    task::spawn_blocking(move || files::read(&root, &path))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

async fn write_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(Uuid, String)>,
    body: Bytes,
) -> Result<Json<WriteResponse>, Error> {
    let entry = state.store.get(id).await?;
    let root = entry.root.clone();
    let rel = path.clone();
    task::spawn_blocking(move || files::write(&root, &rel, &body))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;
    Ok(Json(WriteResponse {
        status: "saved",
        path,
    }))
}

async fn terminal_stream(
    State(state): State<AppState>,
    Path(runtime_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, Error> {
    let entry = state.store.resolve_runtime(&runtime_id).await?;
    if entry.state().await != WorkspaceState::Ready {
        return Err(Error::InvalidState {
            state: entry.state().await.to_string(),
        });
    }
    let handle = entry.runtime().await.ok_or_else(|| Error::InvalidState {
        state: "starting".to_string(),
    })?;

    let spec = ShellSpec::new(state.config.shell.clone());
    Ok(ws.on_upgrade(move |socket| {
        terminal::serve_session(
            socket,
            entry,
            handle,
            state.backend.clone(),
            state.sessions.clone(),
            spec,
        )
    }))
}
