// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod loader;
mod schema;

pub use loader::load;
pub use schema::{
    AgentConfig, AgentMode, ChatConfig, Config, EditLimits, ModelConfig, ModelFamily,
    PolicyConfig, SessionConfig, TransformerConfig, UserInfo,
};
