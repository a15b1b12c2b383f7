// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod client;
pub mod mock;
mod types;

pub use client::{
    complete_with_retry, is_backend_parse_error, is_transient_backend_error, AuthMode, ChatError,
    ChatOutcome, ChatRequest, ChatStreamClient, ChatTransport, ResponseStream, StreamEvent,
};
pub use types::{ContentPart, FileAttachment, Message, MessageContent, Role};
