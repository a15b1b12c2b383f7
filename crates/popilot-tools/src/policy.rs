// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Priority-ordered rule evaluation over `(tool, args, mode)`.
//!
//! Rules come from a built-in default set plus TOML files loaded
//! alphabetically from the policy directory; later files get smaller
//! priority offsets, i.e. higher precedence (lower number wins).  User
//! confirmations can be remembered per tool and persisted to
//! `saved-decisions.json` next to the rule files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use popilot_config::AgentMode;

/// Offset added to the built-in rules so any rule file outranks them.
const BUILTIN_PRIORITY_OFFSET: i64 = 100_000;
/// Per-file offset step; the last file alphabetically gets the smallest.
const FILE_PRIORITY_STEP: i64 = 1000;
const DEFAULT_RULE_PRIORITY: i64 = 100;

const SAVED_DECISIONS_FILE: &str = "saved-decisions.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

impl Decision {
    /// Case-insensitive parse used by the TOML loader.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Some(Decision::Allow),
            "deny" => Some(Decision::Deny),
            "ask" => Some(Decision::Ask),
            _ => None,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Allow => write!(f, "allow"),
            Decision::Deny => write!(f, "deny"),
            Decision::Ask => write!(f, "ask"),
        }
    }
}

/// One compiled rule.  Lower `priority` wins.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    /// Tool pattern: exact name, `prefix.*`, or `*suffix`.
    pub tool_pattern: String,
    pub decision: Decision,
    pub priority: i64,
    /// When present, the rule only applies in these modes.
    pub modes: Option<Vec<AgentMode>>,
    /// Regex over the serialized argument object.  When present and NOT
    /// matching, the rule is skipped entirely.
    pub args_pattern: Option<Regex>,
    /// Decision used when `args_pattern` matches (falls back to `decision`).
    pub decision_if_match: Option<Decision>,
    pub description: Option<String>,
}

impl PolicyRule {
    fn new(tool_pattern: &str, decision: Decision, priority: i64) -> Self {
        Self {
            tool_pattern: tool_pattern.to_string(),
            decision,
            priority,
            modes: None,
            args_pattern: None,
            decision_if_match: None,
            description: None,
        }
    }

    fn with_modes(mut self, modes: &[AgentMode]) -> Self {
        self.modes = Some(modes.to_vec());
        self
    }

    fn with_args_pattern(mut self, pattern: &str, decision_if_match: Decision) -> Self {
        self.args_pattern = Regex::new(pattern).ok();
        self.decision_if_match = Some(decision_if_match);
        self
    }
}

/// A remembered user confirmation, keyed by tool name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedDecision {
    pub tool: String,
    pub decision: Decision,
    pub saved_at: DateTime<Utc>,
}

pub struct PolicyEngine {
    /// Sorted ascending by priority.
    rules: Vec<PolicyRule>,
    mode: AgentMode,
    remember_decisions: bool,
    remembered: HashMap<String, Decision>,
    dir: Option<PathBuf>,
}

impl PolicyEngine {
    /// Engine with only the built-in rules.
    pub fn with_defaults(mode: AgentMode) -> Self {
        let mut rules = builtin_rules();
        rules.sort_by_key(|r| r.priority);
        Self {
            rules,
            mode,
            remember_decisions: true,
            remembered: HashMap::new(),
            dir: None,
        }
    }

    /// Built-ins plus every `*.toml` in `dir` (alphabetical) plus previously
    /// saved decisions.  A missing directory is not an error.
    pub fn load(dir: &Path, default_mode: AgentMode) -> anyhow::Result<Self> {
        let mut engine = Self::with_defaults(default_mode);
        engine.dir = Some(dir.to_path_buf());

        let mut files: Vec<PathBuf> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "toml").unwrap_or(false))
                .collect(),
            Err(_) => Vec::new(),
        };
        files.sort();

        let n = files.len() as i64;
        for (i, path) in files.iter().enumerate() {
            let offset = (n - i as i64) * FILE_PRIORITY_STEP;
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let file: RulesFile = toml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            debug!(path = %path.display(), rules = file.rules.len(), "loading policy file");

            if let Some(settings) = file.settings {
                // Later files win on settings.
                if let Some(mode) = settings.mode.as_deref().and_then(AgentMode::parse) {
                    engine.mode = mode;
                }
                if let Some(remember) = settings.remember_decisions {
                    engine.remember_decisions = remember;
                }
            }
            for raw in file.rules {
                match raw.compile(offset) {
                    Ok(rule) => engine.rules.push(rule),
                    Err(e) => warn!(path = %path.display(), "skipping rule: {e}"),
                }
            }
        }
        engine.rules.sort_by_key(|r| r.priority);

        // Saved decisions from earlier sessions.
        let saved_path = dir.join(SAVED_DECISIONS_FILE);
        if let Ok(text) = std::fs::read_to_string(&saved_path) {
            if let Ok(saved) = serde_json::from_str::<Vec<SavedDecision>>(&text) {
                for s in saved {
                    engine.remembered.insert(s.tool, s.decision);
                }
            }
        }

        Ok(engine)
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: AgentMode) {
        self.mode = mode;
    }

    pub fn remember_decisions(&self) -> bool {
        self.remember_decisions
    }

    /// Evaluate one tool call.  Deterministic for identical
    /// `(mode, rules, tool, args)`.
    pub fn evaluate(&self, tool: &str, args: &serde_json::Value) -> Decision {
        let serialized = args.to_string();

        // Yolo consults nothing but deny rules.
        if self.mode == AgentMode::Yolo {
            for rule in &self.rules {
                if !tool_pattern_matches(&rule.tool_pattern, tool) {
                    continue;
                }
                match &rule.args_pattern {
                    Some(re) => {
                        if re.is_match(&serialized)
                            && rule.decision_if_match.unwrap_or(rule.decision) == Decision::Deny
                        {
                            return Decision::Deny;
                        }
                    }
                    None => {
                        if rule.decision == Decision::Deny {
                            return Decision::Deny;
                        }
                    }
                }
            }
            return Decision::Allow;
        }

        if let Some(d) = self.remembered.get(tool) {
            return *d;
        }

        for rule in &self.rules {
            if !tool_pattern_matches(&rule.tool_pattern, tool) {
                continue;
            }
            if let Some(modes) = &rule.modes {
                if !modes.contains(&self.mode) {
                    continue;
                }
            }
            match &rule.args_pattern {
                Some(re) => {
                    if re.is_match(&serialized) {
                        return rule.decision_if_match.unwrap_or(rule.decision);
                    }
                    // Pattern present but not matching: skip this rule.
                }
                None => return rule.decision,
            }
        }
        Decision::Ask
    }

    /// Record a user confirmation for `tool`.  Persists to
    /// `saved-decisions.json` (whole-file atomic rename) when remembering is
    /// enabled and a policy directory is configured.
    pub fn remember(&mut self, tool: &str, decision: Decision) -> anyhow::Result<()> {
        self.remembered.insert(tool.to_string(), decision);
        if !self.remember_decisions {
            return Ok(());
        }
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating policy dir {}", dir.display()))?;

        let mut saved: Vec<SavedDecision> = self
            .remembered
            .iter()
            .map(|(tool, decision)| SavedDecision {
                tool: tool.clone(),
                decision: *decision,
                saved_at: Utc::now(),
            })
            .collect();
        saved.sort_by(|a, b| a.tool.cmp(&b.tool));

        let path = dir.join(SAVED_DECISIONS_FILE);
        let tmp = dir.join(format!(".{SAVED_DECISIONS_FILE}.tmp"));
        let json = serde_json::to_string_pretty(&saved)?;
        std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }
}

/// Exact, `prefix.*`, or `*suffix`.
fn tool_pattern_matches(pattern: &str, tool: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return tool == prefix || tool.starts_with(&format!("{prefix}."));
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return tool.ends_with(suffix);
    }
    pattern == tool
}

/// The default rule set.  Read-only tools run freely; workspace mutations
/// ask (auto-approved for edits in autoEdit mode); obviously destructive
/// shell commands are denied outright.
fn builtin_rules() -> Vec<PolicyRule> {
    let b = BUILTIN_PRIORITY_OFFSET;
    vec![
        PolicyRule::new("run_terminal_command", Decision::Ask, b + 10).with_args_pattern(
            r"rm\s+-rf\s+/|sudo\s|mkfs|:\(\)\{\s*:\|:&\s*\};:|git\s+push\s+--force",
            Decision::Deny,
        ),
        PolicyRule::new("run_terminal_command", Decision::Ask, b + 20),
        PolicyRule::new("git.restore", Decision::Ask, b + 30),
        PolicyRule::new("git.*", Decision::Allow, b + 40),
        PolicyRule::new("file.applyTextEdits", Decision::Allow, b + 50)
            .with_modes(&[AgentMode::AutoEdit]),
        PolicyRule::new("file.applyTextEdits", Decision::Ask, b + 51),
        PolicyRule::new("edit_file", Decision::Allow, b + 52).with_modes(&[AgentMode::AutoEdit]),
        PolicyRule::new("edit_file", Decision::Ask, b + 53),
        PolicyRule::new("create_new_file", Decision::Allow, b + 54)
            .with_modes(&[AgentMode::AutoEdit]),
        PolicyRule::new("create_new_file", Decision::Ask, b + 55),
        PolicyRule::new("file.*", Decision::Allow, b + 60),
        PolicyRule::new("read_file", Decision::Allow, b + 61),
        PolicyRule::new("list_directory", Decision::Allow, b + 62),
        PolicyRule::new("tree", Decision::Allow, b + 63),
        PolicyRule::new("find_files", Decision::Allow, b + 64),
    ]
}

// ─── TOML file format ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RulesFile {
    settings: Option<RawSettings>,
    #[serde(default)]
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    mode: Option<String>,
    remember_decisions: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    tool: String,
    decision: String,
    priority: Option<i64>,
    modes: Option<Vec<String>>,
    args_pattern: Option<String>,
    decision_if_match: Option<String>,
    description: Option<String>,
}

impl RawRule {
    fn compile(self, offset: i64) -> anyhow::Result<PolicyRule> {
        let decision = Decision::parse(&self.decision)
            .with_context(|| format!("unknown decision '{}'", self.decision))?;
        let modes = match self.modes {
            Some(raw) => {
                let mut modes = Vec::with_capacity(raw.len());
                for m in raw {
                    modes.push(
                        AgentMode::parse(&m).with_context(|| format!("unknown mode '{m}'"))?,
                    );
                }
                Some(modes)
            }
            None => None,
        };
        let args_pattern = match self.args_pattern {
            Some(p) => Some(Regex::new(&p).with_context(|| format!("bad args_pattern '{p}'"))?),
            None => None,
        };
        let decision_if_match = match self.decision_if_match {
            Some(d) => Some(
                Decision::parse(&d).with_context(|| format!("unknown decision_if_match '{d}'"))?,
            ),
            None => None,
        };
        Ok(PolicyRule {
            tool_pattern: self.tool,
            decision,
            priority: offset + self.priority.unwrap_or(DEFAULT_RULE_PRIORITY),
            modes,
            args_pattern,
            decision_if_match,
            description: self.description,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    // ── Pattern grammar ───────────────────────────────────────────────────────

    #[test]
    fn exact_pattern_matches_only_itself() {
        assert!(tool_pattern_matches("file.read", "file.read"));
        assert!(!tool_pattern_matches("file.read", "file.search"));
    }

    #[test]
    fn prefix_star_matches_namespace() {
        assert!(tool_pattern_matches("git.*", "git.status"));
        assert!(tool_pattern_matches("git.*", "git"));
        assert!(!tool_pattern_matches("git.*", "github.status"));
    }

    #[test]
    fn star_suffix_matches_endings() {
        assert!(tool_pattern_matches("*_file", "edit_file"));
        assert!(tool_pattern_matches("*_file", "read_file"));
        assert!(!tool_pattern_matches("*_file", "file.read"));
    }

    // ── Built-in defaults ─────────────────────────────────────────────────────

    #[test]
    fn read_only_tools_are_allowed_by_default() {
        let engine = PolicyEngine::with_defaults(AgentMode::Default);
        assert_eq!(engine.evaluate("file.read", &json!({})), Decision::Allow);
        assert_eq!(engine.evaluate("git.status", &json!({})), Decision::Allow);
        assert_eq!(engine.evaluate("tree", &json!({})), Decision::Allow);
    }

    #[test]
    fn edits_ask_in_default_mode() {
        let engine = PolicyEngine::with_defaults(AgentMode::Default);
        assert_eq!(
            engine.evaluate("file.applyTextEdits", &json!({})),
            Decision::Ask
        );
        assert_eq!(engine.evaluate("edit_file", &json!({})), Decision::Ask);
    }

    #[test]
    fn edits_auto_approved_in_auto_edit_mode() {
        let engine = PolicyEngine::with_defaults(AgentMode::AutoEdit);
        assert_eq!(
            engine.evaluate("file.applyTextEdits", &json!({})),
            Decision::Allow
        );
        // Commands still ask.
        assert_eq!(
            engine.evaluate("run_terminal_command", &json!({"command": "ls"})),
            Decision::Ask
        );
    }

    #[test]
    fn dangerous_commands_are_denied() {
        let engine = PolicyEngine::with_defaults(AgentMode::Default);
        assert_eq!(
            engine.evaluate(
                "run_terminal_command",
                &json!({"command": "sudo rm -rf /var"})
            ),
            Decision::Deny
        );
    }

    #[test]
    fn unknown_tool_falls_back_to_ask() {
        let engine = PolicyEngine::with_defaults(AgentMode::Default);
        assert_eq!(engine.evaluate("mystery.tool", &json!({})), Decision::Ask);
    }

    // ── Yolo mode ─────────────────────────────────────────────────────────────

    #[test]
    fn yolo_allows_everything_but_deny_rules() {
        let engine = PolicyEngine::with_defaults(AgentMode::Yolo);
        assert_eq!(
            engine.evaluate("run_terminal_command", &json!({"command": "make"})),
            Decision::Allow
        );
        assert_eq!(
            engine.evaluate("file.applyTextEdits", &json!({})),
            Decision::Allow
        );
        // The deny-if-match rule still bites.
        assert_eq!(
            engine.evaluate("run_terminal_command", &json!({"command": "sudo ls"})),
            Decision::Deny
        );
    }

    // ── Determinism ───────────────────────────────────────────────────────────

    #[test]
    fn evaluation_is_deterministic() {
        let engine = PolicyEngine::with_defaults(AgentMode::Default);
        let args = json!({"command": "cargo test"});
        let first = engine.evaluate("run_terminal_command", &args);
        for _ in 0..10 {
            assert_eq!(engine.evaluate("run_terminal_command", &args), first);
        }
    }

    // ── Remembered decisions ──────────────────────────────────────────────────

    #[test]
    fn remembered_decision_short_circuits_rules() {
        let mut engine = PolicyEngine::with_defaults(AgentMode::Default);
        assert_eq!(
            engine.evaluate("run_terminal_command", &json!({})),
            Decision::Ask
        );
        engine.remember("run_terminal_command", Decision::Allow).unwrap();
        assert_eq!(
            engine.evaluate("run_terminal_command", &json!({})),
            Decision::Allow
        );
    }

    #[test]
    fn remembered_decisions_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = PolicyEngine::load(dir.path(), AgentMode::Default).unwrap();
        engine.remember("edit_file", Decision::Allow).unwrap();
        assert!(dir.path().join("saved-decisions.json").is_file());

        let reloaded = PolicyEngine::load(dir.path(), AgentMode::Default).unwrap();
        assert_eq!(reloaded.evaluate("edit_file", &json!({})), Decision::Allow);
    }

    // ── TOML loading ──────────────────────────────────────────────────────────

    #[test]
    fn rule_files_override_builtins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-site.toml"),
            r#"
[[rules]]
tool = "file.applyTextEdits"
decision = "ALLOW"
description = "trusted workspace"
"#,
        )
        .unwrap();
        let engine = PolicyEngine::load(dir.path(), AgentMode::Default).unwrap();
        assert_eq!(
            engine.evaluate("file.applyTextEdits", &json!({})),
            Decision::Allow
        );
    }

    #[test]
    fn later_files_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-first.toml"),
            "[[rules]]\ntool = \"edit_file\"\ndecision = \"deny\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("20-second.toml"),
            "[[rules]]\ntool = \"edit_file\"\ndecision = \"allow\"\n",
        )
        .unwrap();
        let engine = PolicyEngine::load(dir.path(), AgentMode::Default).unwrap();
        assert_eq!(engine.evaluate("edit_file", &json!({})), Decision::Allow);
    }

    #[test]
    fn settings_are_merged_later_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.toml"),
            "[settings]\nmode = \"yolo\"\nremember_decisions = false\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("b.toml"), "[settings]\nmode = \"autoEdit\"\n").unwrap();
        let engine = PolicyEngine::load(dir.path(), AgentMode::Default).unwrap();
        assert_eq!(engine.mode(), AgentMode::AutoEdit);
        assert!(!engine.remember_decisions());
    }

    #[test]
    fn modes_and_decisions_parse_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("p.toml"),
            r#"
[[rules]]
tool = "run_terminal_command"
decision = "Allow"
modes = ["AUTOEDIT"]
"#,
        )
        .unwrap();
        let engine = PolicyEngine::load(dir.path(), AgentMode::AutoEdit).unwrap();
        assert_eq!(
            engine.evaluate("run_terminal_command", &json!({"command": "ls"})),
            Decision::Allow
        );
    }

    #[test]
    fn args_pattern_mismatch_skips_rule() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("p.toml"),
            r#"
[[rules]]
tool = "run_terminal_command"
decision = "allow"
args_pattern = "cargo (build|test)"
"#,
        )
        .unwrap();
        let engine = PolicyEngine::load(dir.path(), AgentMode::Default).unwrap();
        // Matching args: the file rule wins.
        assert_eq!(
            engine.evaluate("run_terminal_command", &json!({"command": "cargo test"})),
            Decision::Allow
        );
        // Non-matching args: rule skipped, builtin ask applies.
        assert_eq!(
            engine.evaluate("run_terminal_command", &json!({"command": "make"})),
            Decision::Ask
        );
    }

    #[test]
    fn missing_policy_dir_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let engine = PolicyEngine::load(&missing, AgentMode::Default).unwrap();
        assert_eq!(engine.evaluate("file.read", &json!({})), Decision::Allow);
    }
}
