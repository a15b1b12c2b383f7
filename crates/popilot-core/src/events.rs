// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use popilot_tools::ToolCall;

use crate::agent::{LoopEnd, LoopState};

/// Events emitted by the agent during a turn.  The view layer consumes these
/// from an mpsc channel; it never touches the loop's state directly.
/// Confirmation is a request/response pair: the agent emits
/// [`AgentEvent::PendingToolCall`] and suspends until the frontend calls
/// `Agent::resume_pending`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A display-ready text batch (tool-block bytes already withheld,
    /// batched by the UI throttle window).
    TextDelta(String),
    /// Loop state transition.
    Status(LoopState),
    /// The server assigned (or confirmed) the conversation thread id.
    ThreadId(i64),
    /// A tool call was approved and started executing.
    ToolCallStarted { call_id: String, name: String },
    /// A tool call finished; `output` is the text appended to history.
    ToolCallFinished {
        call_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    /// The policy said `ask`: the loop is suspended until the user answers.
    PendingToolCall {
        call_id: String,
        name: String,
        args: serde_json::Value,
    },
    /// A non-fatal error worth showing (retries, refusals).
    Error(String),
    /// The turn ended; `iterations` counts completed loop rounds.
    TurnComplete { end: LoopEnd, iterations: u32 },
}
