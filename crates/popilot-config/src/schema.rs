// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub transformer: TransformerConfig,
    #[serde(default)]
    pub edits: EditLimits,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Which provider family a model id belongs to.
///
/// The short-form transport routes by family (`/agent/api/aN/{gpt|gemini|claude}`)
/// and the long-form transport fills `llms.model_config` from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Claude,
    Gpt,
    Gemini,
}

impl ModelFamily {
    /// Path segment used by the short-form transport.
    pub fn path_segment(&self) -> &'static str {
        match self {
            ModelFamily::Claude => "claude",
            ModelFamily::Gpt => "gpt",
            ModelFamily::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path_segment())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model id or alias ("claude" | "gpt" | "gemini" | full model name).
    pub name: String,
    /// Provider string sent in `llms.model_config.provider`.
    pub provider: String,
    /// Deployment name sent in `llms.model_config.deployment_name`.
    /// Defaults to the resolved model name when not set.
    pub deployment_name: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "claude".into(),
            provider: "anthropic".into(),
            deployment_name: None,
        }
    }
}

impl ModelConfig {
    /// Resolve a model id or alias to `(family, model_name, provider)`.
    ///
    /// Returns `None` for an unknown alias so the caller can exit with a
    /// usage error instead of sending a request the backend will reject.
    pub fn resolve(id_or_alias: &str) -> Option<(ModelFamily, &'static str, &'static str)> {
        match id_or_alias {
            "claude" => Some((ModelFamily::Claude, "claude-sonnet-4", "anthropic")),
            "gpt" => Some((ModelFamily::Gpt, "gpt-4o", "openai")),
            "gemini" => Some((ModelFamily::Gemini, "gemini-2.0-flash", "google")),
            other => {
                // Full model names are accepted as-is when the family is
                // recognisable from the prefix.
                if other.starts_with("claude") {
                    Some((ModelFamily::Claude, "claude-sonnet-4", "anthropic"))
                } else if other.starts_with("gpt") {
                    Some((ModelFamily::Gpt, "gpt-4o", "openai"))
                } else if other.starts_with("gemini") {
                    Some((ModelFamily::Gemini, "gemini-2.0-flash", "google"))
                } else {
                    None
                }
            }
        }
    }

    pub fn family(&self) -> Option<ModelFamily> {
        Self::resolve(&self.name).map(|(f, _, _)| f)
    }
}

/// Per-user routing fields forwarded in `param_filters` (each as a
/// one-element array on the wire).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub dept_code: String,
    #[serde(default)]
    pub sclpst_code: String,
    #[serde(default)]
    pub email: String,
    pub user_id: Option<String>,
    pub name: Option<String>,
}

fn default_request_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Base URL of the long-form (SSO) chat endpoint.
    #[serde(default)]
    pub base_url: String,
    /// Base URL of the short-form (API-key) agent endpoint.
    #[serde(default)]
    pub agent_base_url: String,
    /// Agent endpoint slot: a1, a2 or a3.
    #[serde(default = "default_agent_slot")]
    pub agent_slot: u8,
    #[serde(default)]
    pub users_id: String,
    #[serde(default)]
    pub chat_rooms_id: String,
    #[serde(default)]
    pub scenarios_id: String,
    #[serde(default)]
    pub user: UserInfo,
    /// Wall-clock timeout for one chat request, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Retries for transient backend parse errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_agent_slot() -> u8 {
    1
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            agent_base_url: String::new(),
            agent_slot: 1,
            users_id: String::new(),
            chat_rooms_id: String::new(),
            scenarios_id: String::new(),
            user: UserInfo::default(),
            request_timeout_secs: 60,
            max_retries: 3,
            retry_delay_ms: 3000,
        }
    }
}

fn default_hard_limit() -> usize {
    60_000
}
fn default_max_text_length() -> usize {
    8_000
}
fn default_max_tool_output() -> usize {
    6_000
}
fn default_keep_recent() -> usize {
    8
}

/// Limits applied by the request transformer when flattening the
/// conversation into a single request text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Hard ceiling on the rendered request text, in characters.
    #[serde(default = "default_hard_limit")]
    pub hard_limit: usize,
    /// Per-message text cap before summarising/trimming.
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    /// Per-tool-result cap.
    #[serde(default = "default_max_tool_output")]
    pub max_tool_output_length: usize,
    /// Number of most recent messages exempt from trimming.
    #[serde(default = "default_keep_recent")]
    pub keep_recent_messages: usize,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            hard_limit: default_hard_limit(),
            max_text_length: default_max_text_length(),
            max_tool_output_length: default_max_tool_output(),
            keep_recent_messages: default_keep_recent(),
        }
    }
}

fn default_max_edits() -> usize {
    50
}
fn default_max_total_replaced_lines() -> usize {
    300
}
fn default_max_change_ratio() -> f64 {
    0.4
}

/// Safety guards for `file.applyTextEdits`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditLimits {
    #[serde(default = "default_max_edits")]
    pub max_edits: usize,
    #[serde(default = "default_max_total_replaced_lines")]
    pub max_total_replaced_lines: usize,
    /// Maximum |new − old| / old length ratio for files over 100 chars.
    #[serde(default = "default_max_change_ratio")]
    pub max_change_ratio: f64,
    /// Reject a single REPLACE edit that spans the whole file.
    #[serde(default = "default_true")]
    pub reject_single_edit_whole_file: bool,
    /// Reject edits whose result is empty or whitespace-only.
    #[serde(default = "default_true")]
    pub require_non_empty: bool,
}

impl Default for EditLimits {
    fn default() -> Self {
        Self {
            max_edits: default_max_edits(),
            max_total_replaced_lines: default_max_total_replaced_lines(),
            max_change_ratio: default_max_change_ratio(),
            reject_single_edit_whole_file: true,
            require_non_empty: true,
        }
    }
}

fn default_retention() -> usize {
    50
}
fn default_debounce_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Keep at most this many sessions on disk (newest by `updated_at`).
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// Delay between an in-memory mutation and the disk write.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// Policy engine settings.  Rule files live in `dir` as TOML; see the
/// policy module in popilot-tools for the rule grammar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy directory override.  Defaults to `<workspace>/.popilot/policy`.
    pub dir: Option<String>,
}

fn default_max_iterations() -> u32 {
    50
}
fn default_max_error_retries() -> u32 {
    3
}
fn default_command_timeout() -> u64 {
    60
}
fn default_ui_throttle_ms() -> u64 {
    50
}

/// The confirmation mode the policy engine evaluates rules against.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum, Default,
)]
#[serde(rename_all = "camelCase")]
pub enum AgentMode {
    /// Ask before every mutating tool.
    #[default]
    Default,
    /// Auto-approve file edits, still ask for commands.
    AutoEdit,
    /// Only deny rules are consulted; everything else runs.
    Yolo,
}

impl AgentMode {
    /// Case-insensitive parse used by the policy TOML loader.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Some(AgentMode::Default),
            "autoedit" => Some(AgentMode::AutoEdit),
            "yolo" => Some(AgentMode::Yolo),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Default => write!(f, "default"),
            AgentMode::AutoEdit => write!(f, "autoEdit"),
            AgentMode::Yolo => write!(f, "yolo"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default confirmation mode when none is specified on the CLI.
    #[serde(default)]
    pub default_mode: AgentMode,
    /// Maximum agentic rounds per user turn.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Retries for transient backend errors detected after accumulation.
    #[serde(default = "default_max_error_retries")]
    pub max_error_retries: u32,
    /// Wall-clock timeout for `run_terminal_command`, in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Display update batching window, in milliseconds.
    #[serde(default = "default_ui_throttle_ms")]
    pub ui_throttle_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_mode: AgentMode::Default,
            max_iterations: default_max_iterations(),
            max_error_retries: default_max_error_retries(),
            command_timeout_secs: default_command_timeout(),
            ui_throttle_ms: default_ui_throttle_ms(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_complete() {
        let c = Config::default();
        assert_eq!(c.agent.max_iterations, 50);
        assert_eq!(c.edits.max_edits, 50);
        assert_eq!(c.edits.max_total_replaced_lines, 300);
        assert_eq!(c.session.retention, 50);
        assert_eq!(c.chat.request_timeout_secs, 60);
    }

    #[test]
    fn alias_claude_resolves() {
        let (family, name, provider) = ModelConfig::resolve("claude").unwrap();
        assert_eq!(family, ModelFamily::Claude);
        assert!(name.starts_with("claude"));
        assert_eq!(provider, "anthropic");
    }

    #[test]
    fn alias_gpt_and_gemini_resolve() {
        assert_eq!(ModelConfig::resolve("gpt").unwrap().0, ModelFamily::Gpt);
        assert_eq!(
            ModelConfig::resolve("gemini").unwrap().0,
            ModelFamily::Gemini
        );
    }

    #[test]
    fn full_model_name_resolves_by_prefix() {
        assert_eq!(
            ModelConfig::resolve("claude-sonnet-4").unwrap().0,
            ModelFamily::Claude
        );
    }

    #[test]
    fn unknown_model_is_rejected() {
        assert!(ModelConfig::resolve("mistral-large").is_none());
    }

    #[test]
    fn mode_parse_is_case_insensitive() {
        assert_eq!(AgentMode::parse("AutoEdit"), Some(AgentMode::AutoEdit));
        assert_eq!(AgentMode::parse("YOLO"), Some(AgentMode::Yolo));
        assert_eq!(AgentMode::parse("default"), Some(AgentMode::Default));
        assert_eq!(AgentMode::parse("nope"), None);
    }

    #[test]
    fn mode_serde_uses_camel_case() {
        let json = serde_json::to_string(&AgentMode::AutoEdit).unwrap();
        assert_eq!(json, "\"autoEdit\"");
    }

    #[test]
    fn family_path_segments() {
        assert_eq!(ModelFamily::Claude.path_segment(), "claude");
        assert_eq!(ModelFamily::Gpt.path_segment(), "gpt");
        assert_eq!(ModelFamily::Gemini.path_segment(), "gemini");
    }
}
