// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::fsio::resolve_path;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Directories never descended into by `tree` and the fuzzy finder.
pub const SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "target",
    "build",
    "dist",
    "out",
    ".cache",
    "__pycache__",
    ".venv",
    ".idea",
    ".vscode",
];

const DEFAULT_TREE_DEPTH: u64 = 3;

pub fn is_skipped_dir(name: &str) -> bool {
    SKIP_DIRS.contains(&name)
}

/// Sorted, directories-first listing of one directory level.
fn list_level(dir: &Path) -> std::io::Result<Vec<(String, bool)>> {
    let mut entries: Vec<(String, bool)> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| {
            let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
            (e.file_name().to_string_lossy().to_string(), is_dir)
        })
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Ok(entries)
}

pub struct ListDirectoryTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the entries of one directory, directories first.\n\
         Args:\n\
           path — directory to list (default: workspace root)\n\
         Directories are suffixed with '/'."
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let rel = call.arg_str("path").unwrap_or(".");
        let dir = match resolve_path(&self.workspace, rel) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(call, format!("bad path: {e}")),
        };
        debug!(path = %dir.display(), "list_directory tool");

        match list_level(&dir) {
            Ok(entries) if entries.is_empty() => ToolOutput::ok(call, "(empty directory)"),
            Ok(entries) => {
                let text = entries
                    .iter()
                    .map(|(name, is_dir)| {
                        if *is_dir {
                            format!("{name}/")
                        } else {
                            name.clone()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                ToolOutput::ok(call, text)
            }
            Err(e) => ToolOutput::err(call, format!("list error: {e}: {rel}")),
        }
    }
}

pub struct TreeTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for TreeTool {
    fn name(&self) -> &str {
        "tree"
    }

    fn description(&self) -> &str {
        "Recursive directory tree, directories first.\n\
         Args:\n\
           path  — root of the tree (default: workspace root)\n\
           depth — maximum depth (default: 3)\n\
         Skips dependency/build/cache directories (node_modules, .git,\n\
         target, dist, ...)."
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let rel = call.arg_str("path").unwrap_or(".");
        let depth = call.arg_u64("depth").unwrap_or(DEFAULT_TREE_DEPTH).max(1) as usize;
        let dir = match resolve_path(&self.workspace, rel) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(call, format!("bad path: {e}")),
        };
        debug!(path = %dir.display(), depth, "tree tool");

        let mut out = String::new();
        if let Err(e) = render_tree(&dir, depth, "", &mut out) {
            return ToolOutput::err(call, format!("tree error: {e}: {rel}"));
        }
        if out.is_empty() {
            ToolOutput::ok(call, "(empty directory)")
        } else {
            ToolOutput::ok(call, out.trim_end().to_string())
        }
    }
}

fn render_tree(dir: &Path, depth: usize, indent: &str, out: &mut String) -> std::io::Result<()> {
    if depth == 0 {
        return Ok(());
    }
    for (name, is_dir) in list_level(dir)? {
        if is_dir && is_skipped_dir(&name) {
            continue;
        }
        if is_dir {
            out.push_str(&format!("{indent}{name}/\n"));
            // Unreadable subdirectories are skipped rather than failing the
            // whole tree.
            let _ = render_tree(&dir.join(&name), depth - 1, &format!("{indent}  "), out);
        } else {
            out.push_str(&format!("{indent}{name}\n"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall::new(name, args, "")
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/sub")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
        std::fs::write(dir.path().join("zz.txt"), "").unwrap();
        std::fs::write(dir.path().join("aa.txt"), "").unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "").unwrap();
        std::fs::write(dir.path().join("src/sub/mod.rs"), "").unwrap();
        dir
    }

    #[tokio::test]
    async fn list_is_sorted_dirs_first() {
        let dir = fixture();
        let tool = ListDirectoryTool {
            workspace: dir.path().to_path_buf(),
        };
        let out = tool.execute(&call("list_directory", json!({}))).await;
        assert!(!out.is_error, "{}", out.content);
        let lines: Vec<&str> = out.content.lines().collect();
        assert_eq!(lines, vec!["node_modules/", "src/", "aa.txt", "zz.txt"]);
    }

    #[tokio::test]
    async fn list_missing_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ListDirectoryTool {
            workspace: dir.path().to_path_buf(),
        };
        let out = tool
            .execute(&call("list_directory", json!({"path": "nope"})))
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn tree_recurses_and_skips_blocklist() {
        let dir = fixture();
        let tool = TreeTool {
            workspace: dir.path().to_path_buf(),
        };
        let out = tool.execute(&call("tree", json!({}))).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("src/"));
        assert!(out.content.contains("main.rs"));
        assert!(out.content.contains("mod.rs"));
        assert!(!out.content.contains("node_modules"));
    }

    #[tokio::test]
    async fn tree_depth_limits_recursion() {
        let dir = fixture();
        let tool = TreeTool {
            workspace: dir.path().to_path_buf(),
        };
        let out = tool.execute(&call("tree", json!({"depth": "1"}))).await;
        assert!(out.content.contains("src/"));
        assert!(!out.content.contains("main.rs"));
    }

    #[test]
    fn skip_list_covers_common_dirs() {
        assert!(is_skipped_dir(".git"));
        assert!(is_skipped_dir("node_modules"));
        assert!(is_skipped_dir("target"));
        assert!(!is_skipped_dir("src"));
    }
}
