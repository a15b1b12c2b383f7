// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Range-based multi-hunk text edits: validation, in-memory application and
//! unified-diff previews.
//!
//! All line numbers are 1-indexed.  Edits are validated as a set (sorted,
//! non-overlapping, bounded) and applied in reverse so earlier indices stay
//! valid.  The caller owns file I/O, SHA256 preconditions and the atomic
//! commit; this module never touches the filesystem.

use serde::{Deserialize, Serialize};
use similar::TextDiff;

use popilot_config::EditLimits;

/// Secondary precondition beyond the whole-file SHA256: the replaced slice
/// must contain (`strict`: equal) the expected text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Anchor {
    pub expected_text: String,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditMode {
    Insert,
    Replace,
}

/// One hunk.  Mode resolution: explicit wins; else Replace iff `end_line`
/// is present; else Insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextEdit {
    pub start_line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    pub new_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<Anchor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<EditMode>,
}

impl TextEdit {
    pub fn replace(start_line: u32, end_line: u32, new_text: impl Into<String>) -> Self {
        Self {
            start_line,
            end_line: Some(end_line),
            new_text: new_text.into(),
            anchor: None,
            mode: None,
        }
    }

    pub fn insert(start_line: u32, new_text: impl Into<String>) -> Self {
        Self {
            start_line,
            end_line: None,
            new_text: new_text.into(),
            anchor: None,
            mode: None,
        }
    }

    pub fn resolved_mode(&self) -> EditMode {
        match self.mode {
            Some(m) => m,
            None if self.end_line.is_some() => EditMode::Replace,
            None => EditMode::Insert,
        }
    }

    /// Effective last line for the overlap rule: `end_line ?? start_line`.
    fn effective_end(&self) -> u32 {
        self.end_line.unwrap_or(self.start_line)
    }
}

/// Pre-flight and post-edit guard failures, in the `{code, message,
/// recovery}` shape returned to the model.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EditError {
    #[error("file not found: {path}")]
    FileNotFound { path: String },
    #[error("file content changed: expected sha256 {expected}, found {actual}")]
    Sha256Mismatch { expected: String, actual: String },
    #[error("{count} edits exceeds the maximum of {max}")]
    TooManyEdits { count: usize, max: usize },
    #[error("invalid range: {detail}")]
    InvalidRange { detail: String },
    #[error("edits overlap: edit ending at line {first_end} collides with edit starting at line {second_start}")]
    OverlappingEdits { first_end: u32, second_start: u32 },
    #[error("anchor mismatch at lines {start}-{end}: expected text not found")]
    AnchorMismatch { start: u32, end: u32 },
    #[error("a single edit may not replace the whole file")]
    WholeFileEditRejected,
    #[error("{total} replaced lines exceeds the maximum of {max}")]
    MaxReplacedLinesExceeded { total: usize, max: usize },
    #[error("edit result is empty")]
    EmptyResult,
    #[error("change ratio {ratio:.2} exceeds the maximum of {max:.2}")]
    MaxChangeRatioExceeded { ratio: f64, max: f64 },
    #[error("atomic write failed: {detail}")]
    AtomicWriteFailed { detail: String },
    #[error("read failed: {detail}")]
    ReadError { detail: String },
    #[error("invalid arguments: {detail}")]
    InvalidArgs { detail: String },
}

impl EditError {
    pub fn code(&self) -> &'static str {
        match self {
            EditError::FileNotFound { .. } => "FILE_NOT_FOUND",
            EditError::Sha256Mismatch { .. } => "SHA256_MISMATCH",
            EditError::TooManyEdits { .. } => "TOO_MANY_EDITS",
            EditError::InvalidRange { .. } => "INVALID_RANGE",
            EditError::OverlappingEdits { .. } => "OVERLAPPING_EDITS",
            EditError::AnchorMismatch { .. } => "ANCHOR_MISMATCH",
            EditError::WholeFileEditRejected => "WHOLE_FILE_EDIT_REJECTED",
            EditError::MaxReplacedLinesExceeded { .. } => "MAX_REPLACED_LINES_EXCEEDED",
            EditError::EmptyResult => "EMPTY_RESULT",
            EditError::MaxChangeRatioExceeded { .. } => "MAX_CHANGE_RATIO_EXCEEDED",
            EditError::AtomicWriteFailed { .. } => "ATOMIC_WRITE_FAILED",
            EditError::ReadError { .. } => "READ_ERROR",
            EditError::InvalidArgs { .. } => "INVALID_ARGS",
        }
    }

    pub fn recovery(&self) -> &'static str {
        match self {
            EditError::FileNotFound { .. } => {
                "check the path with list_directory or find_files, or use create_new_file"
            }
            EditError::Sha256Mismatch { .. } => {
                "the file changed on disk; re-read it with file.read and retry with the new sha256"
            }
            EditError::TooManyEdits { .. } => "split the change into several smaller calls",
            EditError::InvalidRange { .. } => {
                "re-read the file and use 1-indexed line numbers within the file"
            }
            EditError::OverlappingEdits { .. } => {
                "merge overlapping hunks into one edit or leave a gap between them"
            }
            EditError::AnchorMismatch { .. } => {
                "re-read the file; the anchored text moved or changed"
            }
            EditError::WholeFileEditRejected => {
                "split the rewrite into smaller hunks, or create a new file instead"
            }
            EditError::MaxReplacedLinesExceeded { .. } => {
                "replace fewer lines per call; split the change into several calls"
            }
            EditError::EmptyResult => "an edit may not leave the file empty",
            EditError::MaxChangeRatioExceeded { .. } => {
                "the edit rewrites too much of the file at once; apply it in smaller steps"
            }
            EditError::AtomicWriteFailed { .. } => "check permissions and disk space, then retry",
            EditError::ReadError { .. } => "check that the file is readable UTF-8 text",
            EditError::InvalidArgs { .. } => "fix the argument format and retry",
        }
    }
}

/// The applied result plus the bookkeeping the tool layer reports.
#[derive(Debug)]
pub struct EditOutcome {
    pub lines: Vec<String>,
    pub warnings: Vec<String>,
    /// Total lines removed by REPLACE edits (post-clamp).
    pub replaced_lines: usize,
    pub added_lines: usize,
}

/// Validate `edits` against `lines` and apply them in memory.
///
/// Validation order matches the documented precondition order so the first
/// failure carries the most specific code.
pub fn validate_and_apply(
    lines: &[String],
    edits: &[TextEdit],
    limits: &EditLimits,
) -> Result<EditOutcome, EditError> {
    if edits.is_empty() {
        return Err(EditError::InvalidArgs {
            detail: "edits must contain at least one entry".into(),
        });
    }
    if edits.len() > limits.max_edits {
        return Err(EditError::TooManyEdits {
            count: edits.len(),
            max: limits.max_edits,
        });
    }

    let total_lines = lines.len() as u32;

    // Stable sort by start line; equal starts keep their given order.
    let mut sorted: Vec<TextEdit> = edits.to_vec();
    sorted.sort_by_key(|e| e.start_line);

    let mut warnings = Vec::new();

    // Whole-file guard uses the ORIGINAL end_line, before clamping.
    if limits.reject_single_edit_whole_file && sorted.len() == 1 {
        let e = &sorted[0];
        if e.resolved_mode() == EditMode::Replace
            && e.start_line == 1
            && e.end_line.map(|end| end >= total_lines).unwrap_or(false)
            && total_lines > 0
        {
            return Err(EditError::WholeFileEditRejected);
        }
    }

    // Per-edit bounds, mode coherence, clamping and anchors.
    let mut total_replaced: usize = 0;
    for e in sorted.iter_mut() {
        if e.start_line < 1 {
            return Err(EditError::InvalidRange {
                detail: format!("start_line must be >= 1, got {}", e.start_line),
            });
        }
        if let Some(end) = e.end_line {
            if end < e.start_line {
                return Err(EditError::InvalidRange {
                    detail: format!("end_line {} precedes start_line {}", end, e.start_line),
                });
            }
        }
        match e.resolved_mode() {
            EditMode::Replace => {
                if e.end_line.is_none() {
                    return Err(EditError::InvalidRange {
                        detail: format!(
                            "replace edit at line {} requires end_line",
                            e.start_line
                        ),
                    });
                }
                if e.start_line > total_lines + 1 {
                    return Err(EditError::InvalidRange {
                        detail: format!(
                            "start_line {} beyond end of {}-line file",
                            e.start_line, total_lines
                        ),
                    });
                }
                if let Some(end) = e.end_line {
                    if end > total_lines {
                        warnings.push(format!(
                            "end_line {} clamped to file end ({} lines)",
                            end, total_lines
                        ));
                        e.end_line = Some(total_lines.max(e.start_line.saturating_sub(1)));
                    }
                }
                if let Some(anchor) = &e.anchor {
                    check_anchor(lines, e, anchor)?;
                }
                let end = e.end_line.unwrap_or(e.start_line);
                total_replaced += (end + 1).saturating_sub(e.start_line) as usize;
            }
            EditMode::Insert => {
                if e.start_line > total_lines + 1 {
                    return Err(EditError::InvalidRange {
                        detail: format!(
                            "insert at line {} beyond end of {}-line file",
                            e.start_line, total_lines
                        ),
                    });
                }
            }
        }
    }

    // Overlap rule over adjacent sorted pairs; point-inserts at the same
    // line count as overlapping.
    for pair in sorted.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.effective_end() >= b.start_line {
            return Err(EditError::OverlappingEdits {
                first_end: a.effective_end(),
                second_start: b.start_line,
            });
        }
    }

    if total_replaced > limits.max_total_replaced_lines {
        return Err(EditError::MaxReplacedLinesExceeded {
            total: total_replaced,
            max: limits.max_total_replaced_lines,
        });
    }

    // Apply in reverse so line indices of earlier edits remain valid.
    let mut result: Vec<String> = lines.to_vec();
    let mut added: usize = 0;
    for e in sorted.iter().rev() {
        let new_lines = split_new_text(&e.new_text);
        added += new_lines.len();
        match e.resolved_mode() {
            EditMode::Replace => {
                let start = (e.start_line - 1) as usize;
                let end = e.end_line.unwrap_or(e.start_line) as usize; // exclusive
                let end = end.min(result.len()).max(start);
                result.splice(start..end, new_lines);
            }
            EditMode::Insert => {
                let at = ((e.start_line - 1) as usize).min(result.len());
                result.splice(at..at, new_lines);
            }
        }
    }

    Ok(EditOutcome {
        lines: result,
        warnings,
        replaced_lines: total_replaced,
        added_lines: added,
    })
}

fn check_anchor(lines: &[String], e: &TextEdit, anchor: &Anchor) -> Result<(), EditError> {
    let start = e.start_line;
    let end = e.end_line.unwrap_or(start).min(lines.len() as u32);
    if start > end || start == 0 {
        return Err(EditError::AnchorMismatch { start, end });
    }
    let slice = lines[(start - 1) as usize..end as usize].join("\n");
    let matched = if anchor.strict {
        slice == anchor.expected_text
    } else {
        slice.contains(&anchor.expected_text)
    };
    if matched {
        Ok(())
    } else {
        Err(EditError::AnchorMismatch { start, end })
    }
}

/// Split replacement text into lines.  An empty string contributes no lines
/// (REPLACE with "" deletes).  A single trailing newline is trimmed so an
/// EOL-terminated `new_text` does not inject a spurious blank line.
fn split_new_text(new_text: &str) -> Vec<String> {
    if new_text.is_empty() {
        return vec![];
    }
    let trimmed = new_text.strip_suffix("\r\n").or_else(|| new_text.strip_suffix('\n')).unwrap_or(new_text);
    trimmed.split('\n').map(|l| l.trim_end_matches('\r').to_string()).collect()
}

/// Unified diff between two line sets with 3 lines of context.
/// Returns `(diff_text, added, removed)`.
pub fn unified_diff(old_lines: &[String], new_lines: &[String], path: &str) -> (String, usize, usize) {
    let old = join_for_diff(old_lines);
    let new = join_for_diff(new_lines);
    let diff = TextDiff::from_lines(old.as_str(), new.as_str());

    let mut added = 0usize;
    let mut removed = 0usize;
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Insert => added += 1,
            similar::ChangeTag::Delete => removed += 1,
            similar::ChangeTag::Equal => {}
        }
    }

    let text = diff
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string();
    (text, added, removed)
}

fn join_for_diff(lines: &[String]) -> String {
    let mut s = lines.join("\n");
    if !s.is_empty() {
        s.push('\n');
    }
    s
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
