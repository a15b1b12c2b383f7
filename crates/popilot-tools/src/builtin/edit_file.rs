// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use tracing::debug;

use crate::fsio::{atomic_write, resolve_path, sha256_hex};
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Anchored single-replacement editor: swaps one exact occurrence of
/// `old_text` for `new_text`.  The simple companion to `file.applyTextEdits`
/// for small fixes where line numbers are not known.
pub struct EditFileTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace one exact text occurrence in a file.\n\
         Args:\n\
           file_path — file to edit\n\
           old_text  — text to find; must occur exactly once\n\
           new_text  — replacement text\n\
         Fails when old_text is missing or ambiguous (include more\n\
         surrounding context to disambiguate).  For multi-hunk or\n\
         line-range edits use file.applyTextEdits."
    }

    fn destructive(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let file_path = match call.arg_str("file_path").or_else(|| call.arg_str("filepath")) {
            Some(p) if !p.trim().is_empty() => p.to_string(),
            _ => return ToolOutput::err(call, "missing 'file_path' argument"),
        };
        let old_text = match call.arg_str("old_text") {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return ToolOutput::err(call, "missing 'old_text' argument"),
        };
        let new_text = call.arg_str("new_text").unwrap_or("").to_string();

        let path = match resolve_path(&self.workspace, &file_path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(call, format!("bad path: {e}")),
        };
        debug!(path = %path.display(), "edit_file tool");

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(call, format!("read error: {e}: {file_path}")),
        };

        let occurrences = content.matches(&old_text).count();
        match occurrences {
            0 => {
                return ToolOutput::err(
                    call,
                    format!("old_text not found in {file_path}; re-read the file and retry"),
                )
            }
            1 => {}
            n => {
                return ToolOutput::err(
                    call,
                    format!(
                        "old_text occurs {n} times in {file_path}; \
                         include more surrounding context so it matches exactly once"
                    ),
                )
            }
        }

        let new_content = content.replacen(&old_text, &new_text, 1);
        if let Err(e) = atomic_write(&path, new_content.as_bytes()).await {
            return ToolOutput::err(call, format!("write failed: {e}"));
        }

        let result = json!({
            "file_path": file_path,
            "new_sha256": sha256_hex(new_content.as_bytes()),
            "replaced": 1,
        });
        ToolOutput::ok(call, result.to_string())
    }
}
