// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod apply_text_edits;
mod create_new_file;
mod edit_file;
mod find_files;
mod git;
mod list_dir;
mod read_file;
mod run_terminal_command;
mod search_file;

use std::path::Path;

use popilot_config::Config;

use crate::ToolRegistry;

pub use apply_text_edits::ApplyTextEditsTool;
pub use create_new_file::CreateNewFileTool;
pub use edit_file::EditFileTool;
pub use find_files::FindFilesTool;
pub use git::{GitOp, GitTool};
pub use list_dir::{ListDirectoryTool, TreeTool};
pub use read_file::ReadFileTool;
pub use run_terminal_command::RunTerminalCommandTool;
pub use search_file::SearchFileTool;

/// Build the registry with the full built-in tool set for one workspace.
/// `read_file` is registered as an alias of `file.read`.
pub fn builtin_registry(workspace: &Path, config: &Config) -> ToolRegistry {
    let ws = workspace.to_path_buf();
    let mut reg = ToolRegistry::new();

    reg.register(ReadFileTool { workspace: ws.clone() });
    reg.register(SearchFileTool { workspace: ws.clone() });
    reg.register(ApplyTextEditsTool {
        workspace: ws.clone(),
        limits: config.edits.clone(),
    });
    reg.register(CreateNewFileTool { workspace: ws.clone() });
    reg.register(EditFileTool { workspace: ws.clone() });
    reg.register(RunTerminalCommandTool {
        workspace: ws.clone(),
        timeout_secs: config.agent.command_timeout_secs,
    });
    reg.register(ListDirectoryTool { workspace: ws.clone() });
    reg.register(TreeTool { workspace: ws.clone() });
    reg.register(FindFilesTool { workspace: ws.clone() });
    for op in [GitOp::Status, GitOp::Diff, GitOp::Log, GitOp::Restore, GitOp::Show] {
        reg.register(GitTool::new(ws.clone(), op));
    }
    reg.register_alias("read_file", "file.read");

    reg
}
