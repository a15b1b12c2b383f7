// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::Parser;
use std::path::PathBuf;

use popilot_config::AgentMode;

#[derive(Parser, Debug)]
#[command(
    name = "popilot",
    about = "An agentic AI coding assistant for the terminal",
    version,
    long_about = None,
)]
pub struct Cli {
    /// Model id or alias: "claude", "gpt", "gemini", or a full model name.
    #[arg(long, short = 'M', default_value = "claude")]
    pub model: String,

    /// Workspace root directory (defaults to the current directory).
    #[arg(long, short = 'd')]
    pub dir: Option<PathBuf>,

    /// Disable ANSI colors in output.
    #[arg(long)]
    pub no_color: bool,

    /// Confirmation mode for tool calls.  When omitted, policy-file
    /// settings (or "default") apply.
    #[arg(long, short = 'm', value_enum)]
    pub mode: Option<AgentMode>,

    /// Explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Hard ceiling on the rendered request text, in characters.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub hard_limit: Option<u64>,

    /// Per-message text cap applied to older history.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_text_length: Option<u64>,

    /// Per-tool-result cap applied to older history.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_tool_output: Option<u64>,

    /// Number of most recent messages exempt from trimming.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub keep_recent: Option<u64>,

    /// Write tracing output to stderr (otherwise logging is off unless
    /// POPILOT_LOG_FILE is set).
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cli = Cli::parse_from(["popilot"]);
        assert_eq!(cli.model, "claude");
        assert!(!cli.no_color);
        assert_eq!(cli.mode, None);
        assert!(cli.hard_limit.is_none());
    }

    #[test]
    fn transformer_flags_parse() {
        let cli = Cli::parse_from([
            "popilot",
            "--hard-limit",
            "40000",
            "--max-text-length",
            "4000",
            "--max-tool-output",
            "3000",
            "--keep-recent",
            "6",
        ]);
        assert_eq!(cli.hard_limit, Some(40000));
        assert_eq!(cli.max_text_length, Some(4000));
        assert_eq!(cli.max_tool_output, Some(3000));
        assert_eq!(cli.keep_recent, Some(6));
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(Cli::try_parse_from(["popilot", "--hard-limit", "0"]).is_err());
        assert!(Cli::try_parse_from(["popilot", "--keep-recent", "0"]).is_err());
    }

    #[test]
    fn mode_flag_parses() {
        let cli = Cli::parse_from(["popilot", "--mode", "yolo"]);
        assert_eq!(cli.mode, Some(AgentMode::Yolo));
    }
}
