// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use tracing::debug;

use crate::fsio::{resolve_path, sha256_hex};
use crate::tool::{Tool, ToolCall, ToolOutput};

const DEFAULT_CONTEXT_LINES: u64 = 2;
const MAX_CONTEXT_LINES: u64 = 10;
const DEFAULT_MAX_MATCHES: u64 = 50;
const MAX_MAX_MATCHES: u64 = 200;

pub struct SearchFileTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for SearchFileTool {
    fn name(&self) -> &str {
        "file.search"
    }

    fn description(&self) -> &str {
        "Search one file with a regular expression.\n\
         Args:\n\
           filepath      — file to search\n\
           pattern       — regex pattern\n\
           flags         — optional, default 'g' (g = all matches, i = ignore case)\n\
           context_lines — optional, 0-10, default 2\n\
           max_matches   — optional, 1-200, default 50\n\
         Returns JSON with per-match line/column/context, a truncated flag and\n\
         the file's current sha256."
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let filepath = match call.arg_str("filepath").or_else(|| call.arg_str("file_path")) {
            Some(p) if !p.trim().is_empty() => p.to_string(),
            _ => return ToolOutput::err(call, "missing 'filepath' argument"),
        };
        let pattern = match call.arg_str("pattern") {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => return ToolOutput::err(call, "missing 'pattern' argument"),
        };
        let flags = call.arg_str("flags").unwrap_or("g");
        let context_lines = call
            .arg_u64("context_lines")
            .unwrap_or(DEFAULT_CONTEXT_LINES)
            .min(MAX_CONTEXT_LINES) as usize;
        let max_matches = call
            .arg_u64("max_matches")
            .unwrap_or(DEFAULT_MAX_MATCHES)
            .clamp(1, MAX_MAX_MATCHES) as usize;

        let global = flags.contains('g');
        let regex_src = if flags.contains('i') {
            format!("(?i){pattern}")
        } else {
            pattern.clone()
        };
        let re = match regex::Regex::new(&regex_src) {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(call, format!("invalid pattern: {e}")),
        };

        let path = match resolve_path(&self.workspace, &filepath) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(call, format!("bad path: {e}")),
        };
        debug!(path = %path.display(), pattern = %pattern, "file.search tool");

        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(call, format!("read error: {e}: {filepath}")),
        };
        let sha256 = sha256_hex(&bytes);
        let content = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = content.lines().collect();

        let mut matches = Vec::new();
        let mut truncated = false;
        'scan: for (idx, line) in lines.iter().enumerate() {
            for m in re.find_iter(line) {
                if matches.len() >= max_matches {
                    truncated = true;
                    break 'scan;
                }
                let before: Vec<&str> = lines[idx.saturating_sub(context_lines)..idx].to_vec();
                let after_end = (idx + 1 + context_lines).min(lines.len());
                let after: Vec<&str> = lines[idx + 1..after_end].to_vec();
                matches.push(json!({
                    "line_number": idx + 1,
                    "column": m.start(),
                    "match_text": m.as_str(),
                    "line": line,
                    "context_before": before,
                    "context_after": after,
                }));
                if !global {
                    break 'scan;
                }
            }
        }

        let result = json!({
            "file_path": filepath,
            "sha256": sha256,
            "match_count": matches.len(),
            "truncated": truncated,
            "matches": matches,
        });
        ToolOutput::ok(call, result.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall::new("file.search", args, "")
    }

    fn tool(dir: &std::path::Path) -> SearchFileTool {
        SearchFileTool {
            workspace: dir.to_path_buf(),
        }
    }

    fn write(dir: &std::path::Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[tokio::test]
    async fn finds_matches_with_position_and_context() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "f.rs", "fn a() {}\nfn bee() {}\nfn c() {}\n");
        let out = tool(dir.path())
            .execute(&call(json!({"filepath": "f.rs", "pattern": "fn b\\w+"})))
            .await;
        assert!(!out.is_error, "{}", out.content);
        let v: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(v["match_count"].as_u64(), Some(1));
        let m = &v["matches"][0];
        assert_eq!(m["line_number"].as_u64(), Some(2));
        assert_eq!(m["column"].as_u64(), Some(0));
        assert_eq!(m["match_text"].as_str(), Some("fn bee"));
        assert_eq!(m["context_before"][0].as_str(), Some("fn a() {}"));
        assert_eq!(m["context_after"][0].as_str(), Some("fn c() {}"));
    }

    #[tokio::test]
    async fn column_is_zero_indexed() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "f.txt", "abc def\n");
        let out = tool(dir.path())
            .execute(&call(json!({"filepath": "f.txt", "pattern": "def"})))
            .await;
        let v: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(v["matches"][0]["column"].as_u64(), Some(4));
    }

    #[tokio::test]
    async fn case_insensitive_flag() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "f.txt", "Hello\nworld\n");
        let out = tool(dir.path())
            .execute(&call(json!({"filepath": "f.txt", "pattern": "hello", "flags": "gi"})))
            .await;
        let v: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(v["match_count"].as_u64(), Some(1));
    }

    #[tokio::test]
    async fn non_global_stops_after_first_match() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "f.txt", "x\nx\nx\n");
        let out = tool(dir.path())
            .execute(&call(json!({"filepath": "f.txt", "pattern": "x", "flags": ""})))
            .await;
        let v: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(v["match_count"].as_u64(), Some(1));
    }

    #[tokio::test]
    async fn max_matches_sets_truncated_flag() {
        let dir = tempfile::tempdir().unwrap();
        let body = "m\n".repeat(20);
        write(dir.path(), "f.txt", &body);
        let out = tool(dir.path())
            .execute(&call(json!({"filepath": "f.txt", "pattern": "m", "max_matches": "5"})))
            .await;
        let v: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(v["match_count"].as_u64(), Some(5));
        assert_eq!(v["truncated"].as_bool(), Some(true));
    }

    #[tokio::test]
    async fn reports_current_sha256() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "f.txt", "data\n");
        let out = tool(dir.path())
            .execute(&call(json!({"filepath": "f.txt", "pattern": "data"})))
            .await;
        let v: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(
            v["sha256"].as_str().unwrap(),
            crate::fsio::sha256_hex(b"data\n")
        );
    }

    #[tokio::test]
    async fn invalid_regex_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "f.txt", "x\n");
        let out = tool(dir.path())
            .execute(&call(json!({"filepath": "f.txt", "pattern": "(unclosed"})))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("invalid pattern"));
    }
}
