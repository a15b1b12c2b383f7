// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation → request-text transformation.
//!
//! The chat backend takes one flat text per request, so the ordered message
//! history is rendered into a single string: system prompt (including the
//! tool-block wire format instructions), then role-framed turns.  Older
//! messages are trimmed to per-message caps and, when the whole render still
//! exceeds the hard limit, dropped oldest-first; the most recent
//! `keep_recent_messages` are exempt.  Oversized file contents never travel
//! in the text — the executor already lifted them into [`FileAttachment`]s,
//! which are forwarded here for the upload step.

use popilot_config::TransformerConfig;
use popilot_model::{FileAttachment, Message, Role};

/// What goes on the wire for one round.
#[derive(Debug, Clone)]
pub struct TransformedRequest {
    pub message: String,
    pub files: Vec<FileAttachment>,
}

/// External-collaborator seam: the loop controller is agnostic to how the
/// request text is composed.
pub trait RequestTransformer: Send + Sync {
    fn transform(&self, messages: &[Message], attachments: &[FileAttachment])
        -> TransformedRequest;
}

pub struct DefaultTransformer {
    config: TransformerConfig,
    /// `(name, description)` pairs rendered into the tool instructions.
    tool_docs: Vec<(String, String)>,
}

impl DefaultTransformer {
    pub fn new(config: TransformerConfig, tool_docs: Vec<(String, String)>) -> Self {
        Self { config, tool_docs }
    }

    fn system_prompt(&self) -> String {
        let mut s = String::from(
            "You are Popilot, a coding assistant working inside the user's workspace.\n\
             You can call tools by emitting a block in EXACTLY this format:\n\
             \n\
             ```tool\n\
             TOOL_NAME: <name>\n\
             BEGIN_ARG: <arg name>\n\
             <arg value>\n\
             END_ARG\n\
             ```\n\
             \n\
             Rules:\n\
             - One TOOL_NAME line per block; repeat BEGIN_ARG/END_ARG per argument.\n\
             - Tool results come back as [tool:<name>] messages; read them before continuing.\n\
             - When a tool returns an ERROR line, follow its recovery hint.\n\
             - Before file.applyTextEdits, read the file to obtain its sha256.\n\
             \n\
             Available tools:\n",
        );
        for (name, docs) in &self.tool_docs {
            s.push_str(&format!("## {name}\n{docs}\n\n"));
        }
        s
    }

    fn frame(msg: &Message) -> String {
        match msg.role {
            Role::System => format!("[system]\n{}", msg.as_text()),
            Role::User => format!("[user]\n{}", msg.as_text()),
            Role::Assistant => format!("[assistant]\n{}", msg.as_text()),
            Role::Tool => format!(
                "[tool:{}]\n{}",
                msg.name.as_deref().unwrap_or("unknown"),
                msg.as_text()
            ),
        }
    }

    fn cap(text: &str, limit: usize) -> String {
        if text.chars().count() <= limit {
            return text.to_string();
        }
        let kept: String = text.chars().take(limit).collect();
        format!("{kept}\n…[trimmed]")
    }
}

impl RequestTransformer for DefaultTransformer {
    fn transform(
        &self,
        messages: &[Message],
        attachments: &[FileAttachment],
    ) -> TransformedRequest {
        let keep_from = messages.len().saturating_sub(self.config.keep_recent_messages);

        let mut framed: Vec<String> = Vec::with_capacity(messages.len());
        for (i, msg) in messages.iter().enumerate() {
            let text = Self::frame(msg);
            let framed_text = if i >= keep_from {
                text
            } else {
                let limit = match msg.role {
                    Role::Tool => self.config.max_tool_output_length,
                    _ => self.config.max_text_length,
                };
                Self::cap(&text, limit)
            };
            framed.push(framed_text);
        }

        // Hard-limit pass: drop oldest trimmed messages until the render
        // fits, leaving a marker so the model knows context was cut.
        let prompt = self.system_prompt();
        let mut start = 0usize;
        loop {
            let body_len: usize = framed[start..].iter().map(|f| f.len() + 2).sum();
            if prompt.len() + body_len <= self.config.hard_limit || start >= keep_from {
                break;
            }
            start += 1;
        }

        let mut message = prompt;
        if start > 0 {
            message.push_str("[…earlier conversation trimmed…]\n\n");
        }
        message.push_str(&framed[start..].join("\n\n"));

        TransformedRequest {
            message,
            files: attachments.to_vec(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
