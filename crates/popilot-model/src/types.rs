// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// A single content part in a multi-part message.
///
/// Used for user messages that mix text with images.  Images are represented
/// by URL (remote reference or data URL).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: image_url.into(),
        }
    }
}

/// The content of a message: plain string or ordered parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Lossy plain-text view — image parts are omitted.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A single message in the conversation history.
///
/// Insertion order is authoritative: the `Vec<Message>` held by the session
/// IS the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            name: None,
            tool_call_id: None,
        }
    }

    /// A tool-result message.  `name` records the originating tool so the
    /// transformer can render `[tool:<name>]` framing and the invariant
    /// "the conversation ends with a tool message referencing its tool"
    /// is checkable.
    pub fn tool(tool_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(text.into()),
            name: Some(tool_name.into()),
            tool_call_id: None,
        }
    }

    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        let content = if parts.len() == 1 {
            if let ContentPart::Text { text } = &parts[0] {
                MessageContent::Text(text.clone())
            } else {
                MessageContent::Parts(parts)
            }
        } else {
            MessageContent::Parts(parts)
        };
        Self {
            role: Role::User,
            content,
            name: None,
            tool_call_id: None,
        }
    }

    pub fn as_text(&self) -> String {
        self.content.as_text()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// An out-of-band file reference produced when tool output would otherwise
/// bloat the request text.
///
/// `pending_content` holds the bytes until the transformer uploads them;
/// `url` is filled in by the upload step and forwarded on the wire as
/// `files: [{id, name, url}]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileAttachment {
    pub id: String,
    pub name: String,
    pub pending_content: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl FileAttachment {
    pub fn new(name: impl Into<String>, content: impl Into<String>, mime: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            pending_content: content.into(),
            mime_type: mime.to_string(),
            url: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_roundtrips_through_json() {
        let m = Message::user("hello");
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn parts_message_roundtrips_through_json() {
        let m = Message::user_with_parts(vec![
            ContentPart::text("look at this"),
            ContentPart::image("https://example.com/shot.png"),
        ]);
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn single_text_part_collapses_to_plain_text() {
        let m = Message::user_with_parts(vec![ContentPart::text("only text")]);
        assert_eq!(m.content, MessageContent::Text("only text".into()));
    }

    #[test]
    fn tool_message_carries_originating_tool_name() {
        let m = Message::tool("file.read", "contents here");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.name.as_deref(), Some("file.read"));
    }

    #[test]
    fn as_text_skips_images() {
        let m = Message::user_with_parts(vec![
            ContentPart::text("a"),
            ContentPart::image("data:image/png;base64,xxxx"),
            ContentPart::text("b"),
        ]);
        assert_eq!(m.as_text(), "a\nb");
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }

    #[test]
    fn attachment_ids_are_unique() {
        let a = FileAttachment::new("a.txt", "x", "text/plain");
        let b = FileAttachment::new("a.txt", "x", "text/plain");
        assert_ne!(a.id, b.id);
    }
}
