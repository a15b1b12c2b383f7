// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolOutput};

const OUTPUT_LIMIT: usize = 100_000;

pub struct RunTerminalCommandTool {
    pub workspace: PathBuf,
    pub timeout_secs: u64,
}

#[async_trait]
impl Tool for RunTerminalCommandTool {
    fn name(&self) -> &str {
        "run_terminal_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace directory.\n\
         Args:\n\
           command      — the shell command (run under sh -c)\n\
           timeout_secs — optional override of the default timeout\n\
         Both stdout and stderr are captured; a non-zero exit code is\n\
         returned as an error together with the output.  Commands that\n\
         exceed the timeout are killed.  Prefer the dedicated file tools\n\
         over cat/sed/grep."
    }

    fn destructive(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let command = match call.arg_str("command") {
            Some(c) if !c.trim().is_empty() => c.to_string(),
            _ => return ToolOutput::err(call, "missing 'command' argument"),
        };
        let timeout = call.arg_u64("timeout_secs").unwrap_or(self.timeout_secs);

        debug!(cmd = %command, timeout, "run_terminal_command tool");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&self.workspace)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(timeout), cmd.output()).await;

        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);

                if !stdout.is_empty() {
                    content.push_str(&truncate(&stdout, OUTPUT_LIMIT));
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&truncate(&stderr, OUTPUT_LIMIT));
                }
                if content.is_empty() {
                    content = format!("[exit {}]", output.status.code().unwrap_or(-1));
                }

                if output.status.success() {
                    ToolOutput::ok(call, content)
                } else {
                    let code = output.status.code().unwrap_or(-1);
                    ToolOutput::err(call, format!("[exit {code}]\n{content}"))
                }
            }
            Ok(Err(e)) => ToolOutput::err(call, format!("spawn error: {e}")),
            Err(_) => ToolOutput::err(call, format!("timeout after {timeout}s; command killed")),
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
        format!("{}...[truncated {} bytes]", &s[..end], s.len() - end)
    }
}
