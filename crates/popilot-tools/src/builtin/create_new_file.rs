// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use tracing::debug;

use crate::fsio::{atomic_write, resolve_path, sha256_hex};
use crate::tool::{Tool, ToolCall, ToolOutput};

pub struct CreateNewFileTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for CreateNewFileTool {
    fn name(&self) -> &str {
        "create_new_file"
    }

    fn description(&self) -> &str {
        "Create a new file with the given content.\n\
         Args:\n\
           file_path — path for the new file (parent directories are created)\n\
           content   — full file content\n\
         Refuses to overwrite an existing file; use file.applyTextEdits to\n\
         change existing files."
    }

    fn destructive(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let file_path = match call.arg_str("file_path").or_else(|| call.arg_str("filepath")) {
            Some(p) if !p.trim().is_empty() => p.to_string(),
            _ => return ToolOutput::err(call, "missing 'file_path' argument"),
        };
        let content = call.arg_str("content").unwrap_or("").to_string();

        let path = match resolve_path(&self.workspace, &file_path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(call, format!("bad path: {e}")),
        };
        debug!(path = %path.display(), "create_new_file tool");

        if path.exists() {
            return ToolOutput::err(
                call,
                format!("file already exists: {file_path} (use file.applyTextEdits to modify it)"),
            );
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return ToolOutput::err(call, format!("mkdir failed: {e}"));
                }
            }
        }
        if let Err(e) = atomic_write(&path, content.as_bytes()).await {
            return ToolOutput::err(call, format!("write failed: {e}"));
        }

        let result = json!({
            "file_path": file_path,
            "sha256": sha256_hex(content.as_bytes()),
            "bytes": content.len(),
        });
        ToolOutput::ok(call, result.to_string())
    }
}
