//! Terminal bridge: full-duplex relay between a websocket and an
//! interactive shell on a pty.
//!
//! Bytes pass through untouched in both directions; the single interpreted
//! message is a JSON resize frame, which is applied to the pty and never
//! forwarded as shell input. Each direction runs independently so a slow
//! reader on one side never stalls the other beyond a bounded buffer.
//!
//! A new stream attach always creates a new session; there is no
//! resumption or replay.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pty::ShellProcess;
use crate::runtime::{RuntimeBackend, RuntimeHandle, ShellSpec};
use crate::store::WorkspaceEntry;

/// Chunks buffered per relay direction before backpressure kicks in.
const RELAY_BUFFER: usize = 64;

/// Why a session ended. Logged, and reflected in how the stream closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ClientGone,
    ShellExited,
    WorkspaceDeleted,
}

/// Live terminal sessions, keyed by session id.
///
/// Deleting a workspace signals every session attached to it; each bridge
/// then kills its shell and unregisters itself.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<Uuid, SessionHandle>>,
}

struct SessionHandle {
    workspace_id: Uuid,
    shutdown: watch::Sender<bool>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, workspace_id: Uuid) -> (Uuid, watch::Receiver<bool>) {
        let id = Uuid::new_v4();
        let (shutdown, rx) = watch::channel(false);
        self.inner.write().await.insert(
            id,
            SessionHandle {
                workspace_id,
                shutdown,
            },
        );
        (id, rx)
    }

    pub async fn unregister(&self, id: Uuid) {
        self.inner.write().await.remove(&id);
    }

    /// Signals shutdown to every session of a workspace. Returns how many
    /// sessions were told to stop.
    pub async fn close_for_workspace(&self, workspace_id: Uuid) -> usize {
        let sessions = self.inner.read().await;
        let mut count = 0;
        for handle in sessions.values() {
            if handle.workspace_id == workspace_id {
                let _ = handle.shutdown.send(true);
                count += 1;
            }
        }
        count
    }

    pub async fn active(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[derive(Deserialize)]
struct ResizeFrame {
    #[serde(rename = "type")]
    kind: String,
    cols: u16,
    rows: u16,
}

/// Parses the one structured control message of the stream protocol.
/// Anything else is raw shell input.
fn parse_resize(text: &str) -> Option<(u16, u16)> {
    match serde_json::from_str::<ResizeFrame>(text) {
        Ok(frame) if frame.kind == "resize" => Some((frame.cols, frame.rows)),
        _ => None,
    }
}

/// Runs one terminal session to completion.
///
/// Owns the shell process and the websocket; both are released before this
/// returns, whichever side ends the session.
pub async fn serve_session(
    socket: WebSocket,
    entry: Arc<WorkspaceEntry>,
    handle: RuntimeHandle,
    backend: Arc<dyn RuntimeBackend>,
    sessions: Arc<SessionRegistry>,
    spec: ShellSpec,
) {
    let mut socket = socket;
    let mut shell = match backend.exec_interactive(&handle, &spec).await {
        Ok(shell) => shell,
        Err(err) => {
            warn!(workspace = %entry.id, %err, "failed to attach shell");
            let _ = socket
                .send(Message::Text(format!("Error: {err}\r\n")))
                .await;
            let _ = socket.close().await;
            return;
        }
    };

    let (session_id, mut shutdown) = sessions.register(entry.id).await;
    info!(
        session = %session_id,
        workspace = %entry.id,
        pid = shell.pid(),
        "terminal session opened"
    );

    let reason = relay(socket, &mut shell, &*backend, &mut shutdown).await;

    info!(session = %session_id, workspace = %entry.id, ?reason, "terminal session closing");
    let _ = task::spawn_blocking(move || shell.terminate()).await;
    sessions.unregister(session_id).await;
}

/// The two relay directions, joined by an explicit teardown signal.
async fn relay(
    socket: WebSocket,
    shell: &mut ShellProcess,
    backend: &dyn RuntimeBackend,
    shutdown: &mut watch::Receiver<bool>,
) -> CloseReason {
    // Shell output -> client. A blocking thread drains the pty into a
    // bounded channel; the pump task forwards chunks in arrival order.
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(RELAY_BUFFER);
    let reader = match shell.clone_reader() {
        Ok(reader) => reader,
        Err(_) => return CloseReason::ShellExited,
    };
    task::spawn_blocking(move || {
        let mut reader = reader;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                // EIO means every slave handle is gone: same as EOF.
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Client input -> shell, written by a second blocking thread.
    let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(RELAY_BUFFER);
    let writer = match shell.clone_writer() {
        Ok(writer) => writer,
        Err(_) => return CloseReason::ShellExited,
    };
    task::spawn_blocking(move || {
        let mut writer = writer;
        while let Some(chunk) = in_rx.blocking_recv() {
            if writer.write_all(&chunk).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut pump = tokio::spawn(async move {
        while let Some(chunk) = out_rx.recv().await {
            if ws_tx.send(Message::Binary(chunk)).await.is_err() {
                return CloseReason::ClientGone;
            }
        }
        // Distinguishable end-of-process signal, not a silent drop.
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: Cow::from("process exited"),
            })))
            .await;
        CloseReason::ShellExited
    });

    let reason = loop {
        tokio::select! {
            res = &mut pump => {
                break res.unwrap_or(CloseReason::ClientGone);
            }
            _ = shutdown.changed() => {
                break CloseReason::WorkspaceDeleted;
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some((cols, rows)) = parse_resize(&text) {
                        debug!(cols, rows, "pty resize");
                        if let Err(err) = backend.resize(shell, cols, rows) {
                            warn!(%err, "resize failed");
                        }
                    } else if in_tx.send(text.into_bytes()).await.is_err() {
                        break CloseReason::ShellExited;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if in_tx.send(data).await.is_err() {
                        break CloseReason::ShellExited;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break CloseReason::ClientGone,
                Some(Err(_)) => break CloseReason::ClientGone,
                Some(Ok(_)) => {}
            },
        }
    };

    if !pump.is_finished() {
        pump.abort();
    }
    reason
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_frame_is_recognized() {
        assert_eq!(
            parse_resize(r#"{"type":"resize","cols":120,"rows":40}"#),
            Some((120, 40))
        );
    }

    #[test]
    fn non_resize_input_is_passed_through() {
        // Plain keystrokes, malformed JSON and other frame types are all
        // shell input, never control messages.
        assert_eq!(parse_resize("ls -la\r"), None);
        assert_eq!(parse_resize(r#"{"type":"ping"}"#), None);
        assert_eq!(parse_resize(r#"{"cols":10,"rows":10}"#), None);
        assert_eq!(parse_resize(r#"{"type":"resize","cols":"x"}"#), None);
    }

    #[tokio::test]
    async fn close_for_workspace_signals_only_matching_sessions() {
        let registry = SessionRegistry::new();
        let ws_a = Uuid::new_v4();
        let ws_b = Uuid::new_v4();

        let (_id_a, mut rx_a) = registry.register(ws_a).await;
        let (_id_b, rx_b) = registry.register(ws_b).await;

        let closed = registry.close_for_workspace(ws_a).await;
        assert_eq!(closed, 1);
        rx_a.changed().await.unwrap();
        assert!(!*rx_b.borrow());
    }

    #[tokio::test]
    async fn unregister_drops_the_session() {
        let registry = SessionRegistry::new();
        let (id, _rx) = registry.register(Uuid::new_v4()).await;
        assert_eq!(registry.active().await, 1);
        registry.unregister(id).await;
        assert_eq!(registry.active().await, 0);
    }
}
