// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use popilot_model::Message;

/// One conversation, exclusively owned by this process.  The message list is
/// append-only during a turn; `thread_id` is immutable once the server has
/// assigned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            model: model.into(),
            thread_id: None,
            title: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.updated_at = Utc::now();
    }

    /// Store the server-assigned thread id.  The first assignment wins;
    /// a different id later is a server inconsistency and is ignored.
    pub fn set_thread_id(&mut self, thread_id: i64) {
        match self.thread_id {
            None => {
                self.thread_id = Some(thread_id);
                self.updated_at = Utc::now();
            }
            Some(existing) if existing != thread_id => {
                warn!(existing, thread_id, "ignoring attempt to change thread id");
            }
            Some(_) => {}
        }
    }

    /// Derive a title from the first user message when none is set.
    pub fn ensure_title(&mut self) {
        if self.title.is_some() {
            return;
        }
        if let Some(first) = self
            .messages
            .iter()
            .find(|m| m.role == popilot_model::Role::User)
        {
            let text = first.as_text();
            let mut title: String = text.chars().take(60).collect();
            if text.chars().count() > 60 {
                title.push('…');
            }
            if !title.trim().is_empty() {
                self.title = Some(title);
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
