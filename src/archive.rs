//! Zip extraction into a workspace root.
//!
//! Extraction is all-or-nothing with respect to unsafe archives: every
//! entry path is vetted before a single byte is written, and the files are
//! unpacked into a staging directory that is only promoted into the root
//! once the whole archive extracted cleanly.

use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::Path;

use tracing::{debug, info};
use uuid::Uuid;
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::files;

/// Extracts `bytes` (a zip archive) into `root`.
///
/// Rejects the whole archive with [`Error::PathEscape`] if any entry would
/// land outside `root` (zip-slip), and with [`Error::InvalidArchive`] if
/// the archive itself is malformed. On rejection nothing is written.
pub fn extract(root: &Path, bytes: &[u8]) -> Result<()> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| Error::InvalidArchive(e.to_string()))?;

    // Vet every entry before touching the filesystem.
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| Error::InvalidArchive(e.to_string()))?;
        let name = entry.name().to_string();
        if entry.enclosed_name().is_none() {
            return Err(Error::PathEscape { path: name });
        }
        let rel = name.trim_end_matches('/');
        if !rel.is_empty() {
            files::resolve(root, rel)?;
        }
    }

    // Unpack next to the root, then promote. A failure mid-extraction
    // leaves the root untouched.
    let parent = root
        .parent()
        .ok_or_else(|| Error::InvalidArchive("workspace root has no parent".to_string()))?;
    let staging = parent.join(format!(".incoming-{}", Uuid::new_v4()));
    fs::create_dir_all(&staging)?;

    let unpacked = unpack(&mut archive, &staging);
    if let Err(err) = unpacked {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }

    promote(&staging, root)?;
    let _ = fs::remove_dir_all(&staging);
    info!(root = %root.display(), entries = archive.len(), "archive extracted");
    Ok(())
}

fn unpack(archive: &mut ZipArchive<Cursor<&[u8]>>, staging: &Path) -> Result<()> {
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| Error::InvalidArchive(e.to_string()))?;
        let Some(rel) = entry.enclosed_name() else {
            return Err(Error::PathEscape {
                path: entry.name().to_string(),
            });
        };
        let target = staging.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

/// Moves the extracted entries into the root, replacing same-named
/// entries. The root directory itself keeps its inode so bind mounts into
/// a provisioned runtime stay valid.
fn promote(staging: &Path, root: &Path) -> Result<()> {
    for entry in fs::read_dir(staging)? {
        let entry = entry?;
        let target = root.join(entry.file_name());
        if target.exists() {
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            } else {
                fs::remove_file(&target)?;
            }
        }
        fs::rename(entry.path(), &target)?;
        debug!(target = %target.display(), "promoted archive entry");
    }
    Ok(())
}
