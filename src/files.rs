//! Path-sanitizing file access scoped to a workspace root.
//!
//! Every relative path is resolved against the root and the result must
//! stay inside it. Traversal segments, absolute paths and symlinks pointing
//! out of the tree all fail closed with [`Error::PathEscape`].

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Listing recursion stops past this depth.
pub const MAX_TREE_DEPTH: usize = 32;

/// Node kind in a workspace file tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Directory,
    File,
}

/// One entry of a workspace file tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileNode {
    pub name: String,
    /// Path relative to the workspace root, `/`-separated.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

/// Resolves `rel` against `root`, rejecting anything that would land
/// outside the root's subtree.
///
/// Lexical screening first (absolute paths, `..` and prefix components),
/// then the deepest existing ancestor of the candidate is canonicalized and
/// must remain a descendant of the canonicalized root, which catches
/// symlinks pointing out of the tree. Components that do not exist yet
/// cannot be symlinks and need no further check.
pub fn resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    let escape = || Error::PathEscape {
        path: rel.to_string(),
    };

    let requested = Path::new(rel);
    if requested.is_absolute() {
        return Err(escape());
    }

    let mut clean = PathBuf::new();
    for component in requested.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escape());
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(escape());
    }

    let candidate = root.join(&clean);
    let canonical_root = root.canonicalize()?;

    let mut probe = candidate.as_path();
    let resolved = loop {
        match probe.canonicalize() {
            Ok(path) => break path,
            Err(_) => match probe.parent() {
                Some(parent) => probe = parent,
                None => break canonical_root.clone(),
            },
        }
    };
    // The resolved prefix must stay inside the root; the not-yet-existing
    // suffix is covered by the lexical screening above.
    if !resolved.starts_with(&canonical_root) {
        return Err(escape());
    }

    Ok(candidate)
}

/// Reads a workspace file in full.
pub fn read(root: &Path, rel: &str) -> Result<Vec<u8>> {
    let path = resolve(root, rel)?;
    if !path.is_file() {
        return Err(Error::NotFound(format!("file {rel}")));
    }
    Ok(fs::read(path)?)
}

/// Replaces a workspace file in full, creating parent directories as
/// needed. No partial or patch semantics.
pub fn write(root: &Path, rel: &str, content: &[u8]) -> Result<()> {
    let path = resolve(root, rel)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

/// Produces the workspace file tree.
///
/// Ordering is deterministic: directories before files, each group sorted
/// lexicographically by name. Dot-prefixed entries are omitted. Symlinks
/// are listed as files and never followed.
pub fn list_tree(root: &Path) -> Result<Vec<FileNode>> {
    walk(root, "", 0)
}

fn walk(dir: &Path, rel: &str, depth: usize) -> Result<Vec<FileNode>> {
    if depth >= MAX_TREE_DEPTH {
        warn!(dir = %dir.display(), "listing truncated at depth limit");
        return Ok(Vec::new());
    }

    let mut dirs: Vec<(String, PathBuf)> = Vec::new();
    let mut files: Vec<String> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        // file_type() does not follow symlinks.
        if entry.file_type()?.is_dir() {
            dirs.push((name, entry.path()));
        } else {
            files.push(name);
        }
    }
    dirs.sort_by(|a, b| a.0.cmp(&b.0));
    files.sort();

    let join = |name: &str| {
        if rel.is_empty() {
            name.to_string()
        } else {
            format!("{rel}/{name}")
        }
    };

    let mut nodes = Vec::with_capacity(dirs.len() + files.len());
    for (name, path) in dirs {
        let child_rel = join(&name);
        let children = walk(&path, &child_rel, depth + 1)?;
        nodes.push(FileNode {
            name,
            path: child_rel,
            kind: NodeKind::Directory,
            children: Some(children),
        });
    }
    for name in files {
        nodes.push(FileNode {
            path: join(&name),
            name,
            kind: NodeKind::File,
            children: None,
        });
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolve_accepts_plain_relative_paths() {
        let dir = TempDir::new().unwrap();
        let path = resolve(dir.path(), "src/main.py").unwrap();
        assert_eq!(path, dir.path().join("src/main.py"));
        // `.` segments are harmless.
        assert!(resolve(dir.path(), "./a/b.txt").is_ok());
    }

    #[test]
    fn resolve_rejects_traversal_and_absolute_paths() {
        let dir = TempDir::new().unwrap();
        for rel in [
            "../etc/passwd",
            "a/../../x",
            "..",
            "/etc/passwd",
            "a/b/../../../z",
            "",
        ] {
            let err = resolve(dir.path(), rel).unwrap_err();
            assert!(
                matches!(err, Error::PathEscape { .. }),
                "{rel:?} must be rejected"
            );
        }
    }

    #[test]
    fn resolve_rejects_symlink_escape() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let err = resolve(dir.path(), "link/secret").unwrap_err();
        assert!(matches!(err, Error::PathEscape { .. }));
        // The symlink itself resolves outside too.
        assert!(resolve(dir.path(), "link").is_err());
    }

    #[test]
    fn resolve_allows_symlink_inside_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();
        assert!(resolve(dir.path(), "alias/file.txt").is_ok());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let content = b"print('hello')\n\x00\xffbinary tail";
        write(dir.path(), "pkg/main.py", content).unwrap();
        assert_eq!(read(dir.path(), "pkg/main.py").unwrap(), content);
    }

    #[test]
    fn read_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = read(dir.path(), "missing.txt").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn write_refuses_escape_without_touching_disk() {
        let dir = TempDir::new().unwrap();
        let err = write(dir.path(), "../evil.txt", b"x").unwrap_err();
        assert!(matches!(err, Error::PathEscape { .. }));
        assert!(!dir.path().parent().unwrap().join("evil.txt").exists());
    }

    #[test]
    fn list_orders_directories_before_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("zeta.txt"), b"").unwrap();
        std::fs::write(dir.path().join("alpha.txt"), b"").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.py"), b"").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join(".hidden"), b"").unwrap();

        let tree = list_tree(dir.path()).unwrap();
        let names: Vec<&str> = tree.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["docs", "src", "alpha.txt", "zeta.txt"]);

        let src = &tree[1];
        assert_eq!(src.kind, NodeKind::Directory);
        let children = src.children.as_ref().unwrap();
        assert_eq!(children[0].path, "src/lib.py");
        assert_eq!(children[0].kind, NodeKind::File);
    }

    #[test]
    fn list_depth_is_bounded() {
        let dir = TempDir::new().unwrap();
        let mut path = dir.path().to_path_buf();
        for i in 0..(MAX_TREE_DEPTH + 4) {
            path = path.join(format!("d{i}"));
        }
        std::fs::create_dir_all(&path).unwrap();

        let tree = list_tree(dir.path()).unwrap();
        let mut depth = 0;
        let mut level = &tree;
        while let Some(first) = level.first() {
            depth += 1;
            match &first.children {
                Some(children) => level = children,
                None => break,
            }
        }
        assert!(depth <= MAX_TREE_DEPTH);
    }
}
