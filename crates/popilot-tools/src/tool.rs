// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use popilot_model::FileAttachment;

/// A single tool invocation parsed out of the model's text output.
///
/// `args` is always a JSON object.  Argument values arrive as strings from
/// the wire grammar; the reserved argument `edits` is pre-parsed into a JSON
/// array when its body is valid JSON (otherwise the raw string is kept so
/// the executor can error with a stable code).  `raw_block` preserves the
/// original text for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Generated identifier, threaded into [`ToolOutput::call_id`].
    pub id: String,
    pub name: String,
    pub args: Value,
    pub raw_block: String,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Value, raw_block: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            args,
            raw_block: raw_block.into(),
        }
    }

    /// String argument accessor; trims nothing, missing or non-string → None.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }

    pub fn arg_bool(&self, key: &str) -> Option<bool> {
        match self.args.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            Some(Value::String(s)) => match s.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn arg_u64(&self, key: &str) -> Option<u64> {
        match self.args.get(key) {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// The result of executing a tool.
///
/// Errors are data: they are appended to the conversation as tool messages so
/// the model can self-correct, and never unwind the agent loop.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
    /// Side-band attachment for oversized file contents; picked up by the
    /// request transformer instead of being inlined into the request text.
    pub attachment: Option<FileAttachment>,
}

impl ToolOutput {
    pub fn ok(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
            is_error: false,
            attachment: None,
        }
    }

    pub fn err(call: &ToolCall, msg: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: msg.into(),
            is_error: true,
            attachment: None,
        }
    }

    /// Structured error in the `{code, message, recovery}` shape the model
    /// is instructed to act on.
    pub fn err_code(call: &ToolCall, code: &str, message: &str, recovery: &str) -> Self {
        Self::err(
            call,
            format!("ERROR {code}: {message}\nrecovery: {recovery}"),
        )
    }

    pub fn with_attachment(mut self, attachment: FileAttachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// Trait implemented by every built-in tool.
///
/// `destructive()` marks tools that mutate the workspace; the loop controller
/// records a checkpoint before running one.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// Argument documentation rendered into the system prompt's tool-format
    /// instructions.
    fn description(&self) -> &str;
    fn destructive(&self) -> bool {
        false
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
