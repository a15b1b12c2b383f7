// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::debug;

use popilot_config::EditLimits;

use crate::edits::{unified_diff, validate_and_apply, EditError, TextEdit};
use crate::fsio::{atomic_write, resolve_path, sha256_hex};
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Atomic multi-hunk file editor.
///
/// Preconditions run in a fixed order so the first failure carries the most
/// specific error code; nothing is written unless every guard passes.  The
/// SHA256 precondition is computed over the *raw, unnormalized* bytes, both
/// before and after.
pub struct ApplyTextEditsTool {
    pub workspace: PathBuf,
    pub limits: EditLimits,
}

impl ApplyTextEditsTool {
    fn fail(call: &ToolCall, e: &EditError) -> ToolOutput {
        ToolOutput::err_code(call, e.code(), &e.to_string(), e.recovery())
    }
}

#[async_trait]
impl Tool for ApplyTextEditsTool {
    fn name(&self) -> &str {
        "file.applyTextEdits"
    }

    fn description(&self) -> &str {
        "Apply a set of line-range edits to one file, atomically.\n\
         Args:\n\
           file_path       — file to edit\n\
           expected_sha256 — sha256 reported by the last file.read; the edit\n\
                             is refused when the file changed since\n\
           edits           — JSON array of edits; each edit has:\n\
                               start_line (1-indexed), end_line (inclusive,\n\
                               replace only), new_text, optional anchor\n\
                               {expected_text, strict}, optional mode\n\
                               ('insert' | 'replace')\n\
                             Without an explicit mode, end_line selects\n\
                             replace; otherwise the edit inserts BEFORE\n\
                             start_line.  Edits must not overlap.\n\
           dry_run         — optional; validate and preview without writing\n\
           create_backup   — optional; copy the original to <path>.bak first\n\
         Returns the new sha256, a unified diff preview and edit statistics.\n\
         On error, follow the recovery line (usually: re-read and retry)."
    }

    fn destructive(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let file_path = match call.arg_str("file_path").or_else(|| call.arg_str("filepath")) {
            Some(p) if !p.trim().is_empty() => p.to_string(),
            _ => return ToolOutput::err(call, "missing 'file_path' argument"),
        };
        let expected_sha256 = match call.arg_str("expected_sha256") {
            Some(s) => s.trim().to_ascii_lowercase(),
            None => return ToolOutput::err(call, "missing 'expected_sha256' argument"),
        };
        let edits = match parse_edits_arg(call.args.get("edits")) {
            Ok(e) => e,
            Err(e) => return Self::fail(call, &e),
        };
        let dry_run = call.arg_bool("dry_run").unwrap_or(false);
        let create_backup = call.arg_bool("create_backup").unwrap_or(false);

        let path = match resolve_path(&self.workspace, &file_path) {
            Ok(p) => p,
            Err(e) => {
                return Self::fail(
                    call,
                    &EditError::InvalidArgs {
                        detail: e.to_string(),
                    },
                )
            }
        };

        debug!(path = %path.display(), edits = edits.len(), dry_run, "file.applyTextEdits tool");

        // 1. File must exist.
        if !path.is_file() {
            return Self::fail(call, &EditError::FileNotFound { path: file_path });
        }

        // 2. SHA256 precondition over raw bytes.
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => {
                return Self::fail(call, &EditError::ReadError { detail: e.to_string() })
            }
        };
        let actual_sha = sha256_hex(&bytes);
        if actual_sha != expected_sha256 {
            return Self::fail(
                call,
                &EditError::Sha256Mismatch {
                    expected: expected_sha256,
                    actual: actual_sha,
                },
            );
        }
        let content = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => {
                return Self::fail(call, &EditError::ReadError { detail: e.to_string() })
            }
        };

        // EOL detection: any CRLF makes the whole file CRLF.  The trailing
        // terminator is recorded and reattached on join.
        let eol = if content.contains("\r\n") { "\r\n" } else { "\n" };
        let (body, had_trailing_eol) = match content.strip_suffix(eol) {
            Some(b) => (b, true),
            None => match content.strip_suffix('\n') {
                Some(b) => (b, true),
                None => (content.as_str(), false),
            },
        };
        let old_lines: Vec<String> = if body.is_empty() && !had_trailing_eol {
            Vec::new()
        } else {
            body.split(eol).map(str::to_string).collect()
        };

        // 3–4. Validate and apply in memory.
        let outcome = match validate_and_apply(&old_lines, &edits, &self.limits) {
            Ok(o) => o,
            Err(e) => return Self::fail(call, &e),
        };

        // Result guards: nothing has been written yet, so failing here is a
        // free rollback.
        let mut new_content = outcome.lines.join(eol);
        if had_trailing_eol && !new_content.is_empty() {
            new_content.push_str(eol);
        }
        if self.limits.require_non_empty && new_content.trim().is_empty() {
            return Self::fail(call, &EditError::EmptyResult);
        }
        let old_len = content.len();
        if old_len > 100 {
            let delta = new_content.len().abs_diff(old_len);
            let ratio = delta as f64 / old_len as f64;
            if ratio > self.limits.max_change_ratio {
                return Self::fail(
                    call,
                    &EditError::MaxChangeRatioExceeded {
                        ratio,
                        max: self.limits.max_change_ratio,
                    },
                );
            }
        }

        // 5. New hash + preview.
        let new_sha256 = sha256_hex(new_content.as_bytes());
        let (diff, added, removed) = unified_diff(&old_lines, &outcome.lines, &file_path);

        let report = |written: bool| -> Value {
            json!({
                "file_path": &file_path,
                "new_sha256": &new_sha256,
                "dry_run": !written,
                "edits_applied": edits.len(),
                "lines_added": added,
                "lines_removed": removed,
                "replaced_lines": outcome.replaced_lines,
                "warnings": &outcome.warnings,
                "diff": &diff,
            })
        };

        if dry_run {
            return ToolOutput::ok(call, report(false).to_string());
        }

        // Commit: optional backup, then same-directory temp + rename.
        if create_backup {
            let backup = path.with_extension(format!(
                "{}bak",
                path.extension()
                    .map(|e| format!("{}.", e.to_string_lossy()))
                    .unwrap_or_default()
            ));
            if let Err(e) = tokio::fs::copy(&path, &backup).await {
                return Self::fail(
                    call,
                    &EditError::AtomicWriteFailed {
                        detail: format!("backup failed: {e}"),
                    },
                );
            }
        }
        if let Err(e) = atomic_write(&path, new_content.as_bytes()).await {
            return Self::fail(
                call,
                &EditError::AtomicWriteFailed { detail: e.to_string() },
            );
        }

        ToolOutput::ok(call, report(true).to_string())
    }
}

/// The `edits` argument arrives either pre-parsed (JSON array) or as the raw
/// string the wire parser could not decode — which is an argument error with
/// a stable code, not a crash.
fn parse_edits_arg(value: Option<&Value>) -> Result<Vec<TextEdit>, EditError> {
    let value = value.ok_or_else(|| EditError::InvalidArgs {
        detail: "missing 'edits' argument".into(),
    })?;
    let parsed: Result<Vec<TextEdit>, _> = match value {
        Value::Array(_) => serde_json::from_value(value.clone()),
        Value::String(s) => serde_json::from_str(s),
        _ => {
            return Err(EditError::InvalidArgs {
                detail: "'edits' must be a JSON array".into(),
            })
        }
    };
    parsed.map_err(|e| EditError::InvalidArgs {
        detail: format!("'edits' did not parse as a TextEdit array: {e}"),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
