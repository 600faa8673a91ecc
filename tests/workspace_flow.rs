//! End-to-end workspace lifecycle tests against the library API.
//!
//! These cover the flows that need neither root privileges nor a network:
//! archive upload and listing, zip-slip rejection, the state machine around
//! start/delete, and terminal session teardown on workspace deletion.

use std::io::{Cursor, Write};

use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use workbench::archive;
use workbench::error::Error;
use workbench::files::{self, NodeKind};
use workbench::runtime::RuntimeHandle;
use workbench::store::{WorkspaceState, WorkspaceStore};
use workbench::terminal::SessionRegistry;

fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer
            .start_file(name.to_string(), SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[tokio::test]
async fn upload_then_list_then_edit_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = WorkspaceStore::new(dir.path().to_path_buf());
    let entry = store.create().await.unwrap();

    let bytes = make_zip(&[
        ("main.py", b"import requests\nprint('ok')\n".as_slice()),
        ("requirements.txt", b"requests\n"),
    ]);

    entry.transition(WorkspaceState::Uploading).await.unwrap();
    archive::extract(&entry.root, &bytes).unwrap();
    entry.transition(WorkspaceState::Installing).await.unwrap();
    entry.transition(WorkspaceState::Created).await.unwrap();

    let tree = files::list_tree(&entry.root).unwrap();
    let names: Vec<&str> = tree.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, ["main.py", "requirements.txt"]);
    assert!(tree.iter().all(|n| n.kind == NodeKind::File));

    // Whole-file replacement, then read back exactly what was written.
    let edited = b"print('edited')\n";
    files::write(&entry.root, "main.py", edited).unwrap();
    assert_eq!(files::read(&entry.root, "main.py").unwrap(), edited);
}

#[tokio::test]
async fn hostile_archive_leaves_workspace_untouched() {
    let dir = TempDir::new().unwrap();
    let store = WorkspaceStore::new(dir.path().to_path_buf());
    let entry = store.create().await.unwrap();

    // Seed one legitimate file.
    files::write(&entry.root, "existing.txt", b"safe").unwrap();

    let bytes = make_zip(&[
        ("innocent.txt", b"hello".as_slice()),
        ("../../etc/passwd", b"root::0:0::/:/bin/sh"),
    ]);
    let err = archive::extract(&entry.root, &bytes).unwrap_err();
    assert!(matches!(
        err,
        Error::PathEscape { .. } | Error::InvalidArchive(_)
    ));

    // Listing shows the tree unaffected: no entry from the bad archive.
    let tree = files::list_tree(&entry.root).unwrap();
    let names: Vec<&str> = tree.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, ["existing.txt"]);

    // And nothing escaped above the workspace.
    assert!(!dir.path().join("etc").exists());
    assert!(!dir.path().parent().unwrap().join("etc/passwd").exists());
}

#[tokio::test]
async fn start_is_single_shot_per_workspace() {
    let dir = TempDir::new().unwrap();
    let store = WorkspaceStore::new(dir.path().to_path_buf());
    let entry = store.create().await.unwrap();

    entry.transition(WorkspaceState::Starting).await.unwrap();
    let handle = RuntimeHandle {
        id: format!("local-{}", entry.id),
        workspace_id: entry.id,
        attach_dir: entry.root.clone(),
    };
    store.bind_runtime(&entry, handle.clone()).await;
    entry.transition(WorkspaceState::Ready).await.unwrap();

    // The state machine refuses a second start; the bound handle stays.
    assert!(entry.transition(WorkspaceState::Starting).await.is_err());
    let bound = entry.runtime().await.unwrap();
    assert_eq!(bound.id, handle.id);
}

#[tokio::test]
async fn error_state_is_retryable() {
    let dir = TempDir::new().unwrap();
    let store = WorkspaceStore::new(dir.path().to_path_buf());
    let entry = store.create().await.unwrap();

    entry.transition(WorkspaceState::Starting).await.unwrap();
    entry.fail("runtime backend unreachable".into()).await;
    let status = entry.status().await;
    assert_eq!(status.state, WorkspaceState::Error);
    assert_eq!(
        status.error_detail.as_deref(),
        Some("runtime backend unreachable")
    );

    // Caller-initiated retry from the error state.
    entry.transition(WorkspaceState::Starting).await.unwrap();
    entry.transition(WorkspaceState::Ready).await.unwrap();
}

#[tokio::test]
async fn delete_signals_attached_sessions_and_cancels_operations() {
    let dir = TempDir::new().unwrap();
    let store = WorkspaceStore::new(dir.path().to_path_buf());
    let sessions = SessionRegistry::new();

    let victim = store.create().await.unwrap();
    let bystander = store.create().await.unwrap();

    let (_victim_session, mut victim_rx) = sessions.register(victim.id).await;
    let (_other_session, other_rx) = sessions.register(bystander.id).await;
    let mut op_cancel = victim.cancelled();

    let removed = store.remove(victim.id).await.unwrap();
    let signalled = sessions.close_for_workspace(victim.id).await;

    // In-flight operations and attached sessions both observe teardown;
    // the unrelated workspace is untouched.
    assert_eq!(signalled, 1);
    op_cancel.changed().await.unwrap();
    victim_rx.changed().await.unwrap();
    assert!(!*other_rx.borrow());
    assert!(store.get(bystander.id).await.is_ok());
    assert!(matches!(
        store.get(removed.id).await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn two_workspaces_do_not_share_files() {
    let dir = TempDir::new().unwrap();
    let store = WorkspaceStore::new(dir.path().to_path_buf());
    let a = store.create().await.unwrap();
    let b = store.create().await.unwrap();

    archive::extract(&a.root, &make_zip(&[("a.txt", b"from a".as_slice())])).unwrap();
    archive::extract(&b.root, &make_zip(&[("b.txt", b"from b".as_slice())])).unwrap();

    let names_a: Vec<String> = files::list_tree(&a.root)
        .unwrap()
        .into_iter()
        .map(|n| n.name)
        .collect();
    let names_b: Vec<String> = files::list_tree(&b.root)
        .unwrap()
        .into_iter()
        .map(|n| n.name)
        .collect();
    assert_eq!(names_a, ["a.txt"]);
    assert_eq!(names_b, ["b.txt"]);
}
