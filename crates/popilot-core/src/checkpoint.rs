// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pre-destruction checkpoints.
//!
//! Before a workspace-mutating tool runs, the controller records the
//! conversation snapshot plus (when the workspace is a git repository) the
//! current commit hash and a patch of uncommitted changes.  A checkpoint
//! owns its patch file: deleting the checkpoint removes the patch too.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use popilot_model::Message;
use popilot_tools::fsio::atomic_write;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub conversation: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tool_call: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_path: Option<PathBuf>,
}

pub struct CheckpointStore {
    workspace: PathBuf,
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(workspace: &Path) -> anyhow::Result<Self> {
        let dir = workspace.join(".popilot").join("checkpoints");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating checkpoint dir {}", dir.display()))?;
        Ok(Self {
            workspace: workspace.to_path_buf(),
            dir,
        })
    }

    pub async fn create(
        &self,
        description: &str,
        conversation: &[Message],
        last_tool_call: Option<&str>,
    ) -> anyhow::Result<Checkpoint> {
        let id = Uuid::new_v4().to_string();
        let git_commit_hash = self.git_stdout(&["rev-parse", "HEAD"]).await;

        // A patch file is only written when there are uncommitted changes.
        let patch_path = match self.git_stdout(&["diff", "HEAD"]).await {
            Some(diff) if !diff.trim().is_empty() => {
                let path = self.dir.join(format!("{id}.patch"));
                atomic_write(&path, diff.as_bytes())
                    .await
                    .context("writing checkpoint patch")?;
                Some(path)
            }
            _ => None,
        };

        let checkpoint = Checkpoint {
            id: id.clone(),
            timestamp: Utc::now(),
            description: description.to_string(),
            conversation: conversation.to_vec(),
            last_tool_call: last_tool_call.map(str::to_string),
            git_commit_hash,
            patch_path,
        };

        let json = serde_json::to_string_pretty(&checkpoint)?;
        atomic_write(&self.dir.join(format!("{id}.json")), json.as_bytes())
            .await
            .context("writing checkpoint record")?;
        debug!(id = %id, description, "checkpoint created");
        Ok(checkpoint)
    }

    /// All checkpoints, newest first.
    pub async fn list(&self) -> Vec<Checkpoint> {
        let mut out = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(text) = tokio::fs::read_to_string(&path).await {
                    if let Ok(cp) = serde_json::from_str::<Checkpoint>(&text) {
                        out.push(cp);
                    }
                }
            }
        }
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out
    }

    /// Delete one checkpoint and its patch file (cascading).
    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        if let Ok(text) = tokio::fs::read_to_string(self.dir.join(format!("{id}.json"))).await {
            if let Ok(cp) = serde_json::from_str::<Checkpoint>(&text) {
                if let Some(patch) = cp.patch_path {
                    let _ = tokio::fs::remove_file(&patch).await;
                }
            }
        }
        tokio::fs::remove_file(self.dir.join(format!("{id}.json")))
            .await
            .with_context(|| format!("deleting checkpoint {id}"))?;
        Ok(())
    }

    async fn git_stdout(&self, args: &[&str]) -> Option<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workspace)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            None
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
