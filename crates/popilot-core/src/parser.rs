// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-block extraction from a corruption-prone model output stream.
//!
//! The wire grammar is deliberately tolerant.  A block is opened by any of:
//!
//! ```text
//! ```tool            (markdown fence)
//! [CODE]tool         (bracket fence)
//! CODEBLOCK tool     (literal keyword)
//! TOOL_NAME: <name>  (bare form, no fence)
//! ```
//!
//! and contains exactly one `TOOL_NAME: <name>` line plus zero or more
//! argument groups:
//!
//! ```text
//! BEGIN_ARG: <name>
//! <value lines...>
//! END_ARG
//! ```
//!
//! A fenced block closes at its fence; the bare form closes after an
//! `END_ARG` that is not followed by another `BEGIN_ARG`, or at EOF.
//! A block without a `TOOL_NAME` line yields no tool call and its raw text
//! is kept as display output.
//!
//! Note: a user-authored fence that happens to start with `tool` is treated
//! as a tool opener.  This is a known, accepted false positive.

use serde_json::{Map, Value};

use popilot_tools::ToolCall;

/// Streamed bytes kept back while watching for a marker split across chunks.
const TAIL_KEEP: usize = 20;
/// Fail-safe for a block that never closes: past this, the buffer is flushed
/// back out as plain text.
const MAX_BUFFER: usize = 100_000;

const FENCE_OPEN: &str = "```tool";
const BRACKET_OPEN: &str = "[CODE]tool";
const CODEBLOCK_OPEN: &str = "CODEBLOCK tool";
const BARE_OPEN: &str = "TOOL_NAME:";

// ─── Post-hoc extraction ──────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Segment {
    Prose(String),
    Block(String),
}

fn is_closer_line(line: &str) -> bool {
    let t = line.trim();
    t == "```" || t == "[CODE]" || t == "CODEBLOCK"
}

fn opener_of(line: &str) -> Option<&'static str> {
    let t = line.trim_start();
    if t.starts_with(FENCE_OPEN) {
        Some(FENCE_OPEN)
    } else if t.starts_with(BRACKET_OPEN) {
        Some(BRACKET_OPEN)
    } else if t.starts_with(CODEBLOCK_OPEN) {
        Some(CODEBLOCK_OPEN)
    } else if t.starts_with(BARE_OPEN) {
        Some(BARE_OPEN)
    } else {
        None
    }
}

/// Split the full text into prose and tool-block segments.
fn segment(text: &str) -> Vec<Segment> {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut segments = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i];
        match opener_of(line) {
            None => {
                prose.push(line);
                i += 1;
            }
            Some(opener) => {
                if !prose.is_empty() {
                    segments.push(Segment::Prose(prose.join("\n")));
                    prose.clear();
                }
                let mut block: Vec<&str> = vec![line];
                i += 1;
                if opener == BARE_OPEN {
                    // Bare form: consume BEGIN_ARG groups; stop when the line
                    // after an END_ARG is not another BEGIN_ARG.
                    while i < lines.len() && lines[i].trim_start().starts_with("BEGIN_ARG:") {
                        while i < lines.len() {
                            let l = lines[i];
                            block.push(l);
                            i += 1;
                            let t = l.trim();
                            if t == "END_ARG" || t.ends_with(" END_ARG") {
                                break;
                            }
                        }
                    }
                } else {
                    // Fenced form: consume until a closing fence or EOF.
                    while i < lines.len() {
                        let l = lines[i];
                        i += 1;
                        if is_closer_line(l) {
                            break;
                        }
                        block.push(l);
                    }
                }
                segments.push(Segment::Block(block.join("\n")));
            }
        }
    }
    if !prose.is_empty() {
        segments.push(Segment::Prose(prose.join("\n")));
    }
    segments
}

/// Parse one block's inner text into a [`ToolCall`].
///
/// Returns `None` when no `TOOL_NAME:` line is present (malformed block).
pub fn parse_block(raw: &str) -> Option<ToolCall> {
    let lines: Vec<&str> = raw.split('\n').collect();
    let mut name: Option<String> = None;
    let mut args = Map::new();
    let mut i = 0usize;

    while i < lines.len() {
        let t = lines[i].trim();
        if let Some(rest) = t.strip_prefix("TOOL_NAME:") {
            if name.is_none() {
                let candidate = rest.trim();
                if !candidate.is_empty() {
                    name = Some(candidate.to_string());
                }
            }
            i += 1;
        } else if let Some(rest) = t.strip_prefix("BEGIN_ARG:") {
            let arg_name = rest.trim().to_string();
            i += 1;
            let mut value_lines: Vec<&str> = Vec::new();
            while i < lines.len() {
                let l = lines[i];
                let lt = l.trim_end();
                i += 1;
                if lt.trim() == "END_ARG" {
                    break;
                }
                if let Some(stripped) = lt.strip_suffix(" END_ARG") {
                    value_lines.push(stripped);
                    break;
                }
                value_lines.push(l);
            }
            if !arg_name.is_empty() {
                let value = value_lines.join("\n").trim().to_string();
                // The reserved `edits` argument carries a serialized edit
                // sequence; everything else stays plain text.
                let decoded = if arg_name == "edits" {
                    decode_edits_value(&value)
                } else {
                    Value::String(value)
                };
                args.insert(arg_name, decoded);
            }
        } else {
            i += 1;
        }
    }

    let name = name?;
    Some(ToolCall::new(name, Value::Object(args), raw))
}

/// A parse failure keeps the raw string so the executor can answer with a
/// stable error code instead of the parser guessing.
fn decode_edits_value(value: &str) -> Value {
    match serde_json::from_str::<Value>(value) {
        Ok(v @ Value::Array(_)) => v,
        _ => Value::String(value.to_string()),
    }
}

/// Extract every well-formed tool call from the full response text.
pub fn extract_all(text: &str) -> Vec<ToolCall> {
    segment(text)
        .into_iter()
        .filter_map(|s| match s {
            Segment::Block(raw) => parse_block(&raw),
            Segment::Prose(_) => None,
        })
        .collect()
}

/// Drop every well-formed tool block, keeping prose and malformed blocks,
/// then collapse the whitespace the removal leaves behind.
pub fn remove_tool_blocks(text: &str) -> String {
    let kept: Vec<String> = segment(text)
        .into_iter()
        .filter_map(|s| match s {
            Segment::Prose(p) => Some(p),
            Segment::Block(raw) => {
                if parse_block(&raw).is_some() {
                    None
                } else {
                    // Malformed block: the raw text stays visible.
                    Some(raw)
                }
            }
        })
        .collect();
    collapse_blank_runs(kept.join("\n").trim())
}

/// Strip protocol noise from text meant for the user's screen: fence and
/// bracket markers, `TOOL_NAME`/`BEGIN_ARG`/`END_ARG` lines, tool HTML
/// comments, and runs of three or more newlines.
pub fn filter_display(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.split('\n') {
        let t = line.trim();
        if t.starts_with("TOOL_NAME:")
            || t.starts_with("BEGIN_ARG:")
            || t == "END_ARG"
            || t.starts_with(FENCE_OPEN)
            || t.starts_with(BRACKET_OPEN)
            || t.starts_with(CODEBLOCK_OPEN)
            || t == "[CODE]"
            || t == "CODEBLOCK"
            || (t.starts_with("<!-- tool") && t.ends_with("-->"))
        {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    let out = collapse_blank_runs(out.trim_end());
    out
}

fn collapse_blank_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newline_run = 0usize;
    for ch in text.chars() {
        if ch == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                out.push(ch);
            }
        } else {
            newline_run = 0;
            out.push(ch);
        }
    }
    out
}

// ─── Streaming mode ───────────────────────────────────────────────────────────

/// Result of feeding one chunk to the streaming parser.
#[derive(Debug, Default)]
pub struct ChunkResult {
    /// Text safe to show immediately.
    pub emit_output: String,
    /// True while bytes are being withheld inside a possible tool block.
    pub is_buffering: bool,
    /// A block whose closer was seen in this chunk, raw.
    pub completed_block: Option<String>,
}

/// Incremental parser for live display: forwards prose as it arrives and
/// withholds tool-block bytes.  The post-hoc functions above remain the
/// source of truth for execution; this exists so the user never watches a
/// half-streamed tool block scroll by.
#[derive(Debug, Default)]
pub struct ToolBlockParser {
    tail: String,
    block: String,
    in_block: bool,
}

impl ToolBlockParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_chunk(&mut self, chunk: &str) -> ChunkResult {
        let mut result = ChunkResult::default();

        if self.in_block {
            self.block.push_str(chunk);
            self.check_block_end(&mut result);
            return result;
        }

        self.tail.push_str(chunk);

        // Earliest start marker in the pending text?
        if let Some(pos) = find_first_marker(&self.tail) {
            result.emit_output = self.tail[..pos].to_string();
            self.block = self.tail[pos..].to_string();
            self.tail.clear();
            self.in_block = true;
            self.check_block_end(&mut result);
            return result;
        }

        // No marker: flush everything except a short tail that could be the
        // beginning of a marker split across chunks.
        if self.tail.len() > TAIL_KEEP {
            let keep_from = floor_char_boundary(&self.tail, self.tail.len() - TAIL_KEEP);
            result.emit_output = self.tail[..keep_from].to_string();
            self.tail = self.tail[keep_from..].to_string();
        }
        result.is_buffering = !self.tail.is_empty();
        result
    }

    /// Flush at end of stream: any withheld tail is prose; an unterminated
    /// block is returned as a completed block (the post-hoc parser decides
    /// whether it is well-formed).
    pub fn finish(&mut self) -> ChunkResult {
        let mut result = ChunkResult::default();
        if self.in_block {
            result.completed_block = Some(std::mem::take(&mut self.block));
            self.in_block = false;
        } else {
            result.emit_output = std::mem::take(&mut self.tail);
        }
        result
    }

    fn check_block_end(&mut self, result: &mut ChunkResult) {
        // Overflow fail-safe: emit the buffer as plain text and reset.
        if self.block.len() > MAX_BUFFER {
            result.emit_output.push_str(&self.block);
            self.block.clear();
            self.in_block = false;
            result.is_buffering = false;
            return;
        }

        if let Some(end) = find_block_end(&self.block) {
            let raw = self.block[..end].to_string();
            let rest = self.block[end..].to_string();
            self.block.clear();
            self.in_block = false;
            result.completed_block = Some(raw);
            // Whatever followed the closer is ordinary prose again.
            if !rest.is_empty() {
                let follow = self.process_chunk(&rest);
                result.emit_output.push_str(&follow.emit_output);
                result.is_buffering = follow.is_buffering;
                if result.completed_block.is_none() {
                    result.completed_block = follow.completed_block;
                }
            }
        } else {
            result.is_buffering = true;
        }
    }
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn find_first_marker(text: &str) -> Option<usize> {
    [FENCE_OPEN, BRACKET_OPEN, CODEBLOCK_OPEN, BARE_OPEN]
        .iter()
        .filter_map(|m| text.find(m))
        .min()
}

/// Byte offset just past the end of the first complete block in `text`
/// (which starts with a marker), or `None` while the block is unterminated.
fn find_block_end(text: &str) -> Option<usize> {
    let bare = text.starts_with(BARE_OPEN);
    if bare {
        // Closed by an END_ARG line whose successor is not BEGIN_ARG, or by
        // a following fence for the zero-argument form.
        let mut offset = 0usize;
        let mut saw_arg = false;
        for line in text.split_inclusive('\n') {
            let t = line.trim();
            if t.starts_with("BEGIN_ARG:") {
                saw_arg = true;
            }
            if t == "END_ARG" || t.ends_with(" END_ARG") {
                let rest = &text[offset + line.len()..];
                let next = rest.split('\n').next().unwrap_or("");
                if !next.trim_start().starts_with('B') {
                    return Some(offset + line.len());
                }
            }
            if !saw_arg && offset > 0 && (t.starts_with("```") || t.starts_with("[CODE]")) {
                // Zero-argument form: bare TOOL_NAME directly before a fence.
                return Some(offset);
            }
            offset += line.len();
        }
        None
    } else {
        let mut offset = 0usize;
        let mut first = true;
        for line in text.split_inclusive('\n') {
            if !first && is_closer_line(line) {
                return Some(offset + line.len());
            }
            first = false;
            offset += line.len();
        }
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    // ── Post-hoc extraction ───────────────────────────────────────────────────

    #[test]
    fn bracket_block_between_prose() {
        // The literal wire example: prose, a [CODE]tool block, prose.
        let input = "hello\n[CODE]tool\nTOOL_NAME: file.read\nBEGIN_ARG: filepath\nsrc/a.ts\nEND_ARG\n[CODE]\nbye";
        let calls = extract_all(input);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "file.read");
        assert_eq!(calls[0].args["filepath"], Value::String("src/a.ts".into()));

        let cleaned = remove_tool_blocks(input);
        assert_eq!(cleaned, "hello\nbye");
    }

    #[test]
    fn fenced_block_is_extracted() {
        let input = "before\n```tool\nTOOL_NAME: tree\n```\nafter";
        let calls = extract_all(input);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "tree");
        assert_eq!(remove_tool_blocks(input), "before\nafter");
    }

    #[test]
    fn codeblock_keyword_form_is_extracted() {
        let input = "CODEBLOCK tool\nTOOL_NAME: git.status\nCODEBLOCK\ndone";
        let calls = extract_all(input);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "git.status");
    }

    #[test]
    fn bare_tool_name_form_is_extracted() {
        let input = "look:\nTOOL_NAME: list_directory\nBEGIN_ARG: path\nsrc\nEND_ARG\n\nthat is all";
        let calls = extract_all(input);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "list_directory");
        assert_eq!(calls[0].args["path"], Value::String("src".into()));
        let cleaned = remove_tool_blocks(input);
        assert!(cleaned.contains("look:"));
        assert!(cleaned.contains("that is all"));
        assert!(!cleaned.contains("TOOL_NAME"));
    }

    #[test]
    fn multiple_blocks_in_one_response() {
        let input = "\
```tool
TOOL_NAME: file.read
BEGIN_ARG: filepath
a.rs
END_ARG
```
middle
```tool
TOOL_NAME: file.read
BEGIN_ARG: filepath
b.rs
END_ARG
```";
        let calls = extract_all(input);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args["filepath"], Value::String("a.rs".into()));
        assert_eq!(calls[1].args["filepath"], Value::String("b.rs".into()));
        assert_eq!(remove_tool_blocks(input), "middle");
    }

    #[test]
    fn multiline_arg_values_are_preserved() {
        let input = "```tool\nTOOL_NAME: create_new_file\nBEGIN_ARG: file_path\nx.txt\nEND_ARG\nBEGIN_ARG: content\nline one\nline two\nEND_ARG\n```";
        let calls = extract_all(input);
        assert_eq!(
            calls[0].args["content"],
            Value::String("line one\nline two".into())
        );
    }

    #[test]
    fn end_arg_on_value_line_is_tolerated() {
        let input = "```tool\nTOOL_NAME: file.read\nBEGIN_ARG: filepath\nsrc/x.rs END_ARG\n```";
        let calls = extract_all(input);
        assert_eq!(calls[0].args["filepath"], Value::String("src/x.rs".into()));
    }

    #[test]
    fn block_without_tool_name_yields_no_call_and_stays_visible() {
        let input = "before\n```tool\njust some text\n```\nafter";
        assert!(extract_all(input).is_empty());
        let cleaned = remove_tool_blocks(input);
        assert!(cleaned.contains("just some text"));
    }

    #[test]
    fn unterminated_fenced_block_still_parses() {
        // Streams that never emit a clean closer are the reason post-hoc
        // extraction exists.
        let input = "pre\n```tool\nTOOL_NAME: tree\nBEGIN_ARG: depth\n2\nEND_ARG";
        let calls = extract_all(input);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args["depth"], Value::String("2".into()));
    }

    #[test]
    fn edits_arg_is_decoded_to_array() {
        let input = "```tool\nTOOL_NAME: file.applyTextEdits\nBEGIN_ARG: file_path\na.txt\nEND_ARG\nBEGIN_ARG: edits\n[{\"start_line\":1,\"end_line\":1,\"new_text\":\"x\"}]\nEND_ARG\n```";
        let calls = extract_all(input);
        let edits = &calls[0].args["edits"];
        assert!(edits.is_array(), "edits should be decoded: {edits:?}");
        assert_eq!(edits[0]["start_line"], Value::from(1));
    }

    #[test]
    fn malformed_edits_arg_stays_a_string() {
        let input = "```tool\nTOOL_NAME: file.applyTextEdits\nBEGIN_ARG: edits\nnot json [\nEND_ARG\n```";
        let calls = extract_all(input);
        assert!(calls[0].args["edits"].is_string());
    }

    #[test]
    fn raw_block_is_preserved_for_logging() {
        let input = "[CODE]tool\nTOOL_NAME: tree\n[CODE]";
        let calls = extract_all(input);
        assert!(calls[0].raw_block.contains("TOOL_NAME: tree"));
    }

    // ── Property: prose round-trip ────────────────────────────────────────────

    #[test]
    fn prose_survives_block_removal() {
        let p1 = "I will now read the file.";
        let p2 = "Done reading; analysis follows.";
        let input = format!(
            "{p1}\n```tool\nTOOL_NAME: file.read\nBEGIN_ARG: filepath\nf\nEND_ARG\n```\n{p2}"
        );
        let calls = extract_all(&input);
        assert_eq!(calls.len(), 1);
        let cleaned = remove_tool_blocks(&input);
        assert_eq!(cleaned, format!("{p1}\n{p2}"));
    }

    // ── Display filtering ─────────────────────────────────────────────────────

    #[test]
    fn display_filter_strips_protocol_lines() {
        let input = "hello\nTOOL_NAME: x\nBEGIN_ARG: y\nvalue\nEND_ARG\n```\nworld";
        let out = filter_display(input);
        assert!(!out.contains("TOOL_NAME"));
        assert!(!out.contains("BEGIN_ARG"));
        assert!(!out.contains("END_ARG"));
        assert!(out.contains("hello"));
        assert!(out.contains("world"));
    }

    #[test]
    fn display_filter_strips_tool_html_comments() {
        let out = filter_display("a\n<!-- tool call pending -->\nb");
        assert_eq!(out, "a\nb");
    }

    #[test]
    fn display_filter_collapses_newline_runs() {
        let out = filter_display("a\n\n\n\n\nb");
        assert_eq!(out, "a\n\nb");
    }

    // ── Streaming mode ────────────────────────────────────────────────────────

    #[test]
    fn streaming_flushes_prose_keeping_short_tail() {
        let mut p = ToolBlockParser::new();
        let long = "x".repeat(100);
        let r = p.process_chunk(&long);
        assert_eq!(r.emit_output.len(), 80);
        assert!(r.is_buffering);
        let fin = p.finish();
        assert_eq!(fin.emit_output.len(), 20);
    }

    #[test]
    fn streaming_detects_block_split_across_chunks() {
        let mut p = ToolBlockParser::new();
        let r1 = p.process_chunk("prose before ```t");
        assert!(!r1.emit_output.contains("```t"));
        let r2 = p.process_chunk("ool\nTOOL_NAME: tree\n``");
        assert!(r2.completed_block.is_none());
        let r3 = p.process_chunk("`\nafter");
        let block = r3.completed_block.expect("block completed");
        assert!(block.contains("TOOL_NAME: tree"));
        let fin = p.finish();
        assert!(format!("{}{}", r3.emit_output, fin.emit_output).contains("after"));
    }

    #[test]
    fn streaming_bare_form_completes_on_blank_line() {
        let mut p = ToolBlockParser::new();
        let r = p.process_chunk("TOOL_NAME: tree\nBEGIN_ARG: depth\n1\nEND_ARG\n\nmore prose");
        let block = r.completed_block.expect("block completed");
        assert!(block.contains("END_ARG"));
    }

    #[test]
    fn streaming_overflow_flushes_buffer_as_text() {
        let mut p = ToolBlockParser::new();
        let _ = p.process_chunk("```tool\nTOOL_NAME: x\n");
        let huge = "y".repeat(MAX_BUFFER + 10);
        let r = p.process_chunk(&huge);
        assert!(r.completed_block.is_none());
        assert!(r.emit_output.len() > MAX_BUFFER);
        assert!(!r.is_buffering);
    }

    #[test]
    fn streaming_without_markers_is_transparent() {
        let mut p = ToolBlockParser::new();
        let mut collected = String::new();
        for chunk in ["hello ", "plain ", "world"] {
            collected.push_str(&p.process_chunk(chunk).emit_output);
        }
        collected.push_str(&p.finish().emit_output);
        assert_eq!(collected, "hello plain world");
    }
}
