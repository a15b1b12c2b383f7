// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Tool, ToolCall, ToolOutput};

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// Register one tool under an additional name (e.g. `read_file` as an
    /// alias of `file.read`).
    pub fn register_alias(&mut self, alias: &str, canonical: &str) {
        if let Some(tool) = self.tools.get(canonical).cloned() {
            self.tools.insert(alias.to_string(), tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// True when the named tool mutates the workspace (checkpoint trigger).
    pub fn is_destructive(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.destructive()).unwrap_or(false)
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => ToolOutput::err(call, format!("unknown tool: {}", call.name)),
        }
    }

    /// Sorted tool names, for the "supported set" refusal message and the
    /// system prompt.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(name, description)` pairs sorted by name, rendered by the request
    /// transformer into the tool-format instructions.
    pub fn descriptions(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
