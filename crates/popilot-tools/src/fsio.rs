// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Content hashing and atomic file replacement.
//!
//! Every write goes through a dot-prefixed temp file in the *same directory*
//! as the target so the final rename stays on one filesystem and is atomic on
//! POSIX.  A failed write never leaves a partially written target: either the
//! rename happened or the file is unchanged.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// SHA256 of raw bytes as a 64-char lowercase hex string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Join a possibly-relative path onto the workspace root.
/// Absolute paths are used as-is; an empty path is an error.
pub fn resolve_path(workspace: &Path, path: &str) -> io::Result<PathBuf> {
    if path.trim().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty file path",
        ));
    }
    let p = Path::new(path);
    if p.is_absolute() {
        Ok(p.to_path_buf())
    } else {
        Ok(workspace.join(p))
    }
}

/// Unique same-directory temp path: `.<basename>.<8-hex>.tmp`.
fn temp_path_for(target: &Path) -> PathBuf {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let base = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tag = uuid::Uuid::new_v4().simple().to_string();
    dir.join(format!(".{base}.{}.tmp", &tag[..8]))
}

/// Atomically replace `target` with `bytes`.
///
/// On any failure the temp file is unlinked and the target is untouched.
pub async fn atomic_write(target: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = temp_path_for(target);
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// One file in a multi-file transaction.
pub struct FileWrite {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    /// Pre-transaction content, used to restore already-renamed targets when
    /// a later rename fails.  `None` for files that did not exist.
    pub original: Option<Vec<u8>>,
}

/// Two-phase multi-file commit.
///
/// Phase 1 writes every temp file; any failure aborts with all temps removed
/// and no target touched.  Phase 2 renames temps over targets in order; when
/// a rename fails, targets renamed earlier are restored from their recorded
/// `original` content (best effort) and the error is propagated.
pub async fn atomic_write_many(writes: &[FileWrite]) -> io::Result<()> {
    // Phase 1: all temps.
    let mut temps: Vec<PathBuf> = Vec::with_capacity(writes.len());
    for w in writes {
        let tmp = temp_path_for(&w.path);
        if let Err(e) = tokio::fs::write(&tmp, &w.bytes).await {
            for t in &temps {
                let _ = tokio::fs::remove_file(t).await;
            }
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        temps.push(tmp);
    }

    // Phase 2: all renames.
    for (i, (w, tmp)) in writes.iter().zip(temps.iter()).enumerate() {
        if let Err(e) = tokio::fs::rename(tmp, &w.path).await {
            // Roll back the targets already replaced.
            for done in &writes[..i] {
                match &done.original {
                    Some(bytes) => {
                        let _ = tokio::fs::write(&done.path, bytes).await;
                    }
                    None => {
                        let _ = tokio::fs::remove_file(&done.path).await;
                    }
                }
            }
            for t in &temps[i..] {
                let _ = tokio::fs::remove_file(t).await;
            }
            return Err(e);
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_input() {
        // Well-known digest of the empty input.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn resolve_relative_joins_workspace() {
        let p = resolve_path(Path::new("/ws"), "src/a.rs").unwrap();
        assert_eq!(p, PathBuf::from("/ws/src/a.rs"));
    }

    #[test]
    fn resolve_absolute_is_used_as_is() {
        let p = resolve_path(Path::new("/ws"), "/etc/hosts").unwrap();
        assert_eq!(p, PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn resolve_empty_path_is_error() {
        assert!(resolve_path(Path::new("/ws"), "  ").is_err());
    }

    #[test]
    fn temp_path_is_dot_prefixed_sibling() {
        let tmp = temp_path_for(Path::new("/ws/src/main.rs"));
        assert_eq!(tmp.parent(), Some(Path::new("/ws/src")));
        let name = tmp.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".main.rs."));
        assert!(name.ends_with(".tmp"));
    }

    #[tokio::test]
    async fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f.txt");
        std::fs::write(&target, "old").unwrap();
        atomic_write(&target, b"new").await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "new");
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f.txt");
        atomic_write(&target, b"data").await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn atomic_write_failure_keeps_target_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("no_such_dir").join("f.txt");
        assert!(atomic_write(&target, b"data").await.is_err());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn write_many_commits_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "a0").unwrap();
        let writes = vec![
            FileWrite { path: a.clone(), bytes: b"a1".to_vec(), original: Some(b"a0".to_vec()) },
            FileWrite { path: b.clone(), bytes: b"b1".to_vec(), original: None },
        ];
        atomic_write_many(&writes).await.unwrap();
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "a1");
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "b1");
    }

    #[tokio::test]
    async fn write_many_phase1_failure_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.txt");
        std::fs::write(&good, "orig").unwrap();
        let bad = dir.path().join("missing_dir").join("bad.txt");
        let writes = vec![
            FileWrite { path: good.clone(), bytes: b"changed".to_vec(), original: Some(b"orig".to_vec()) },
            FileWrite { path: bad, bytes: b"x".to_vec(), original: None },
        ];
        assert!(atomic_write_many(&writes).await.is_err());
        assert_eq!(std::fs::read_to_string(&good).unwrap(), "orig");
    }

    #[tokio::test]
    async fn write_many_phase2_failure_restores_earlier_targets() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.txt");
        std::fs::write(&first, "orig").unwrap();
        // Second target's parent exists at phase 1 (temp lands in dir) but the
        // rename fails because the target path itself is a directory.
        let second = dir.path().join("second_is_dir");
        std::fs::create_dir_all(second.join("child")).unwrap();
        let writes = vec![
            FileWrite { path: first.clone(), bytes: b"changed".to_vec(), original: Some(b"orig".to_vec()) },
            FileWrite { path: second, bytes: b"x".to_vec(), original: None },
        ];
        assert!(atomic_write_many(&writes).await.is_err());
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "orig");
    }
}
