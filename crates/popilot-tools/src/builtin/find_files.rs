// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::builtin::list_dir::is_skipped_dir;
use crate::tool::{Tool, ToolCall, ToolOutput};

const DEFAULT_RESULTS: usize = 20;
const MAX_RESULTS: usize = 50;

/// Editor-style fuzzy file finder.
///
/// Scoring (higher wins):
///   +1000  exact filename match (dots ignored, case-insensitive)
///   +500   filename starts with the query
///   +200   filename contains the query
///   in-order character match over the relative path otherwise:
///     +10 per consecutive matched pair
///     +5  word-boundary match (start, or after / _ - . space)
///     +5  camel-hump match (uppercase after lowercase)
///     +8  per query char matched inside the filename (filename affinity)
///     −1  per skipped char inside the match span (spread penalty)
///     −2  per path separator (depth penalty)
/// Every query character must appear, in order; otherwise the file does not
/// match at all.
pub struct FindFilesTool {
    pub workspace: PathBuf,
}

#[async_trait]
impl Tool for FindFilesTool {
    fn name(&self) -> &str {
        "find_files"
    }

    fn description(&self) -> &str {
        "Fuzzy-find files by name, like an editor's ctrl-p.\n\
         Args:\n\
           query       — characters to match, in order (e.g. 'apptsx')\n\
           max_results — optional, default 20, capped at 50\n\
         Exact filename matches rank first, then filename prefix/substring\n\
         matches, then scattered matches.  Dependency/build directories are\n\
         skipped."
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let query = match call.arg_str("query") {
            Some(q) if !q.trim().is_empty() => q.trim().to_string(),
            _ => return ToolOutput::err(call, "missing 'query' argument"),
        };
        let max_results = call
            .arg_u64("max_results")
            .unwrap_or(DEFAULT_RESULTS as u64)
            .clamp(1, MAX_RESULTS as u64) as usize;

        debug!(query = %query, "find_files tool");

        let mut scored: Vec<(i64, String)> = Vec::new();
        for entry in WalkDir::new(&self.workspace)
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir()
                    && e.file_name()
                        .to_str()
                        .map(is_skipped_dir)
                        .unwrap_or(false))
            })
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.workspace)
                .unwrap_or(entry.path());
            let rel_str = rel.to_string_lossy().to_string();
            if let Some(score) = score_path(&rel_str, &query) {
                scored.push((score, rel_str));
            }
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(max_results);

        if scored.is_empty() {
            return ToolOutput::ok(call, "(no matches)");
        }
        let text = scored
            .into_iter()
            .map(|(_, p)| p)
            .collect::<Vec<_>>()
            .join("\n");
        ToolOutput::ok(call, text)
    }
}

fn filename_of(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Score one relative path against the query; `None` when the query's
/// characters do not all appear in order.
pub fn score_path(path: &str, query: &str) -> Option<i64> {
    let q: Vec<char> = query.to_lowercase().chars().collect();
    if q.is_empty() {
        return None;
    }
    let path_chars: Vec<char> = path.chars().collect();
    let lower: Vec<char> = path.to_lowercase().chars().collect();

    // In-order subsequence match (greedy), or no match at all.
    let mut positions: Vec<usize> = Vec::with_capacity(q.len());
    let mut at = 0usize;
    for &qc in &q {
        let found = (at..lower.len()).find(|&i| lower[i] == qc)?;
        positions.push(found);
        at = found + 1;
    }

    let filename = filename_of(path);
    let fname_lower = filename.to_lowercase();
    let query_lower: String = q.iter().collect();

    let mut score: i64 = 0;

    // Filename-level matches dominate scattered matches.
    let fname_no_dots: String = fname_lower.chars().filter(|&c| c != '.').collect();
    if fname_lower == query_lower || fname_no_dots == query_lower {
        score += 1000;
    } else if fname_lower.starts_with(&query_lower) {
        score += 500;
    } else if fname_lower.contains(&query_lower) {
        score += 200;
    }

    // Character-level bonuses.
    let fname_start = path.len() - filename.len();
    for (qi, &pos) in positions.iter().enumerate() {
        if qi > 0 && positions[qi - 1] + 1 == pos {
            score += 10;
        }
        let boundary = pos == 0
            || matches!(path_chars[pos - 1], '/' | '\\' | '_' | '-' | '.' | ' ');
        let camel = pos > 0
            && path_chars[pos].is_uppercase()
            && path_chars[pos - 1].is_lowercase();
        if boundary || camel {
            score += 5;
        }
        if pos >= fname_start {
            score += 8;
        }
    }

    // Spread penalty: skipped characters inside the matched span.
    let span = positions[positions.len() - 1] - positions[0] + 1;
    score -= (span - q.len()) as i64;

    // Depth penalty: 2 per path separator.
    let separators = path_chars.iter().filter(|&&c| c == '/' || c == '\\').count();
    score -= 2 * separators as i64;

    Some(score)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
