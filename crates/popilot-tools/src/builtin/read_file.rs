// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::debug;

use popilot_model::FileAttachment;

use crate::fsio::{resolve_path, sha256_hex};
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Above this serialized size the content is lifted into a side-band
/// attachment and only metadata + a short preview go into the result text.
pub const FILE_ATTACHMENT_THRESHOLD: usize = 2000;

const PREVIEW_CHARS: usize = 200;

/// Result record for `file.read`.  The SHA256 is always reported so a
/// subsequent `file.applyTextEdits` can supply it as its precondition.
#[derive(Debug, Serialize)]
struct FileReadResult<'a> {
    sha256: &'a str,
    total_lines: usize,
    range_start: usize,
    range_end: usize,
    file_path: &'a str,
    content: &'a str,
}

pub struct ReadFileTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "file.read"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file.\n\
         Args:\n\
           filepath   — path relative to the workspace root (or absolute)\n\
           start_line — optional 1-indexed first line of the range\n\
           end_line   — optional 1-indexed last line (inclusive)\n\
         Returns JSON with sha256, total_lines, range and content.  Keep the\n\
         sha256: file.applyTextEdits requires it as expected_sha256.\n\
         Large contents are delivered as an attached file with a preview."
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let filepath = match call.arg_str("filepath").or_else(|| call.arg_str("file_path")) {
            Some(p) if !p.trim().is_empty() => p.to_string(),
            _ => return ToolOutput::err(call, "missing 'filepath' argument"),
        };
        let path = match resolve_path(&self.workspace, &filepath) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(call, format!("bad path: {e}")),
        };

        debug!(path = %path.display(), "file.read tool");

        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(call, format!("read error: {e}: {filepath}")),
        };
        let sha256 = sha256_hex(&bytes);
        let content = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => {
                return ToolOutput::err(call, format!("not UTF-8 text: {filepath}"));
            }
        };

        // Keep a final empty element when the file ends with a terminator so
        // the line count matches what editors display.
        let lines: Vec<&str> = content.split('\n').collect();
        let total_lines = if content.is_empty() { 0 } else { lines.len() };

        let start = call.arg_u64("start_line").unwrap_or(1).max(1) as usize;
        let end = call
            .arg_u64("end_line")
            .map(|e| e as usize)
            .unwrap_or(total_lines)
            .min(total_lines.max(1));
        let start = start.min(total_lines.max(1));
        let end = end.max(start);

        let range_content = if total_lines == 0 {
            String::new()
        } else {
            lines[start - 1..end].join("\n")
        };

        let result = FileReadResult {
            sha256: &sha256,
            total_lines,
            range_start: start,
            range_end: end,
            file_path: &filepath,
            content: &range_content,
        };
        let serialized = serde_json::to_string(&result)
            .unwrap_or_else(|_| format!("{{\"sha256\":\"{sha256}\"}}"));

        if serialized.len() >= FILE_ATTACHMENT_THRESHOLD {
            let preview: String = range_content.chars().take(PREVIEW_CHARS).collect();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| filepath.clone());
            let meta = json!({
                "sha256": sha256,
                "total_lines": total_lines,
                "range_start": start,
                "range_end": end,
                "file_path": filepath,
                "attached": true,
                "preview": preview,
            });
            let attachment = FileAttachment::new(name, range_content, "text/plain");
            return ToolOutput::ok(call, meta.to_string()).with_attachment(attachment);
        }

        ToolOutput::ok(call, serialized)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
