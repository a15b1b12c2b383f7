// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolOutput};

const OUTPUT_LIMIT: usize = 100_000;
const GIT_TIMEOUT_SECS: u64 = 30;

/// The read-mostly git subset exposed to the model.  `restore` is the only
/// mutating operation and is the only one marked destructive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitOp {
    Status,
    Diff,
    Log,
    Restore,
    Show,
}

impl GitOp {
    fn tool_name(&self) -> &'static str {
        match self {
            GitOp::Status => "git.status",
            GitOp::Diff => "git.diff",
            GitOp::Log => "git.log",
            GitOp::Restore => "git.restore",
            GitOp::Show => "git.show",
        }
    }
}

pub struct GitTool {
    pub workspace: PathBuf,
    pub op: GitOp,
}

impl GitTool {
    pub fn new(workspace: PathBuf, op: GitOp) -> Self {
        Self { workspace, op }
    }

    fn git_args(&self, call: &ToolCall) -> Result<Vec<String>, String> {
        let args = match self.op {
            GitOp::Status => vec!["status".into(), "--porcelain=v1".into(), "-b".into()],
            GitOp::Diff => {
                let mut a = vec!["diff".into()];
                if call.arg_bool("staged").unwrap_or(false) {
                    a.push("--staged".into());
                }
                if let Some(path) = call.arg_str("path") {
                    a.push("--".into());
                    a.push(path.to_string());
                }
                a
            }
            GitOp::Log => {
                let count = call.arg_u64("count").unwrap_or(10).clamp(1, 100);
                vec!["log".into(), "--oneline".into(), format!("-{count}")]
            }
            GitOp::Restore => {
                let path = call
                    .arg_str("path")
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| "missing 'path' argument".to_string())?;
                vec!["restore".into(), "--".into(), path.to_string()]
            }
            GitOp::Show => {
                let rev = call.arg_str("ref").unwrap_or("HEAD").to_string();
                vec!["show".into(), "--stat".into(), rev]
            }
        };
        Ok(args)
    }
}

#[async_trait]
impl Tool for GitTool {
    fn name(&self) -> &str {
        self.op.tool_name()
    }

    fn description(&self) -> &str {
        match self.op {
            GitOp::Status => "Show the git working-tree status (porcelain format).",
            GitOp::Diff => {
                "Show unstaged changes.\n\
                 Args: path (optional, limit to one file), staged (optional bool)."
            }
            GitOp::Log => "Show recent commits.\nArgs: count (optional, default 10).",
            GitOp::Restore => {
                "Discard working-tree changes to one path (git restore).\n\
                 Args: path (required).  This throws away local edits."
            }
            GitOp::Show => "Show one commit.\nArgs: ref (optional, default HEAD).",
        }
    }

    fn destructive(&self) -> bool {
        self.op == GitOp::Restore
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let args = match self.git_args(call) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(call, e),
        };
        debug!(op = ?self.op, ?args, "git tool");

        let mut cmd = Command::new("git");
        cmd.args(&args)
            .current_dir(&self.workspace)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(GIT_TIMEOUT_SECS), cmd.output())
                .await;

        match result {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if output.status.success() {
                    let text = if stdout.trim().is_empty() {
                        "(no output)".to_string()
                    } else {
                        truncate(&stdout, OUTPUT_LIMIT)
                    };
                    ToolOutput::ok(call, text)
                } else {
                    ToolOutput::err(
                        call,
                        format!(
                            "git {} failed: {}",
                            args.first().map(String::as_str).unwrap_or(""),
                            truncate(stderr.trim(), 2000)
                        ),
                    )
                }
            }
            Ok(Err(e)) => ToolOutput::err(call, format!("spawn error: {e}")),
            Err(_) => ToolOutput::err(call, format!("git timed out after {GIT_TIMEOUT_SECS}s")),
        }
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        let mut end = limit;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...[truncated]", &s[..end])
    }
}
