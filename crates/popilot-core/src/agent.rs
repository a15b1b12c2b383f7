// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use popilot_config::{AgentMode, Config, ModelFamily, UserInfo};
use popilot_model::{
    complete_with_retry, is_transient_backend_error, AuthMode, ChatError, ChatOutcome,
    ChatRequest, ChatTransport, FileAttachment, Message, StreamEvent,
};
use popilot_tools::{Decision, PolicyEngine, ToolCall, ToolRegistry};

use crate::checkpoint::CheckpointStore;
use crate::events::AgentEvent;
use crate::parser::{self, ToolBlockParser};
use crate::store::SessionStore;
use crate::transform::RequestTransformer;
use crate::Session;

/// Loop controller states.  `Confirming` means a `PendingLoopState` is
/// stashed and the turn is suspended on the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Streaming,
    ExecutingTool,
    Confirming,
    Error,
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEnd {
    Completed,
    MaxIterations,
    Error,
    Interrupted,
}

/// Everything needed to resume an in-flight turn after a user confirmation.
/// Created at suspension, consumed at resume, discarded on completion or
/// interrupt.  Owned exclusively by the controller — the view never sees it.
#[derive(Debug, Clone)]
pub struct PendingLoopState {
    pub iteration: u32,
    pub tool_calls: Vec<ToolCall>,
    pub cursor_index: usize,
    pub conversation_snapshot: Vec<Message>,
    pub display_accumulator: String,
    pub credential: String,
    pub auth_mode: AuthMode,
    pub model_family: ModelFamily,
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Rounds per user turn.
    pub max_iterations: u32,
    /// Loop-level retries for transient backend errors.
    pub max_error_retries: u32,
    pub request_timeout_secs: u64,
    /// Client-level retries for backend parse errors (with thread id).
    pub client_max_retries: u32,
    pub retry_delay_ms: u64,
    pub ui_throttle_ms: u64,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_error_retries: 3,
            request_timeout_secs: 60,
            client_max_retries: 3,
            retry_delay_ms: 3000,
            ui_throttle_ms: 50,
        }
    }
}

impl AgentOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iterations: config.agent.max_iterations,
            max_error_retries: config.agent.max_error_retries,
            request_timeout_secs: config.chat.request_timeout_secs,
            client_max_retries: config.chat.max_retries,
            retry_delay_ms: config.chat.retry_delay_ms,
            ui_throttle_ms: config.agent.ui_throttle_ms,
        }
    }
}

enum Flow {
    Continue,
    Suspended,
}

/// The agentic loop controller.  One instance owns one session; exactly one
/// turn is in flight at a time.
pub struct Agent {
    session: Session,
    transport: Arc<dyn ChatTransport>,
    tools: Arc<ToolRegistry>,
    policy: PolicyEngine,
    transformer: Arc<dyn RequestTransformer>,
    store: Option<Arc<SessionStore>>,
    checkpoints: Option<Arc<CheckpointStore>>,
    options: AgentOptions,

    state: LoopState,
    pending: Option<PendingLoopState>,
    /// Side-band attachments produced by tools, consumed by the next request.
    pending_attachments: Vec<FileAttachment>,
    /// Display text emitted so far in the current turn.
    display_accumulator: String,

    // Identity mirrored into PendingLoopState so a resume after re-auth
    // replays with the credentials the round started with.
    credential: String,
    auth_mode: AuthMode,
    model_family: ModelFamily,
    user_info: Option<UserInfo>,
}

impl Agent {
    pub fn new(
        session: Session,
        transport: Arc<dyn ChatTransport>,
        tools: Arc<ToolRegistry>,
        policy: PolicyEngine,
        transformer: Arc<dyn RequestTransformer>,
        options: AgentOptions,
    ) -> Self {
        Self {
            session,
            transport,
            tools,
            policy,
            transformer,
            store: None,
            checkpoints: None,
            options,
            state: LoopState::Idle,
            pending: None,
            pending_attachments: Vec::new(),
            display_accumulator: String::new(),
            credential: String::new(),
            auth_mode: AuthMode::ApiKey,
            model_family: ModelFamily::Claude,
            user_info: None,
        }
    }

    pub fn with_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_identity(
        mut self,
        credential: String,
        auth_mode: AuthMode,
        model_family: ModelFamily,
        user_info: Option<UserInfo>,
    ) -> Self {
        self.credential = credential;
        self.auth_mode = auth_mode;
        self.model_family = model_family;
        self.user_info = user_info;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn mode(&self) -> AgentMode {
        self.policy.mode()
    }

    pub fn set_mode(&mut self, mode: AgentMode) {
        self.policy.set_mode(mode);
    }

    /// The call awaiting confirmation, if the loop is suspended.
    pub fn pending_tool_call(&self) -> Option<&ToolCall> {
        self.pending
            .as_ref()
            .map(|p| &p.tool_calls[p.cursor_index])
    }

    /// Run one user turn.  Emits [`AgentEvent`]s through `tx`; suspends (and
    /// returns) when a tool needs confirmation; `cancel` interrupts at the
    /// next suspension point.
    pub async fn submit(
        &mut self,
        user_input: &str,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        if self.state != LoopState::Idle {
            bail!("a turn is already in flight (state {:?})", self.state);
        }
        self.display_accumulator.clear();
        self.session.push(Message::user(user_input));
        self.session.ensure_title();
        self.schedule_save();
        self.run_loop(tx, cancel, 0).await
    }

    /// Resume a suspended turn with the user's verdict on the pending call.
    /// `remember` persists the verdict for this tool via the policy engine.
    pub async fn resume_pending(
        &mut self,
        approved: bool,
        remember: bool,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let Some(pending) = self.pending.take() else {
            bail!("no pending tool call to resume");
        };
        debug!(
            cursor = pending.cursor_index,
            iteration = pending.iteration,
            approved,
            "resuming suspended loop"
        );

        // Restore the stashed state; the snapshot is authoritative.
        self.session.messages = pending.conversation_snapshot.clone();
        self.display_accumulator = pending.display_accumulator.clone();

        let decision = if approved { Decision::Allow } else { Decision::Deny };
        if remember {
            let tool = pending.tool_calls[pending.cursor_index].name.clone();
            if let Err(e) = self.policy.remember(&tool, decision) {
                warn!("failed to persist decision: {e}");
            }
        }

        match self
            .process_calls(
                pending.iteration,
                pending.tool_calls,
                pending.cursor_index,
                Some(decision),
                tx,
                cancel,
            )
            .await?
        {
            Flow::Suspended => Ok(()),
            Flow::Continue => self.run_loop(tx, cancel, pending.iteration).await,
        }
    }

    // ── The loop ──────────────────────────────────────────────────────────────

    async fn run_loop(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &mut oneshot::Receiver<()>,
        start_iteration: u32,
    ) -> anyhow::Result<()> {
        let mut iteration = start_iteration;
        let mut error_retry_count = 0u32;
        let mut empty_retry_used = false;

        loop {
            if iteration >= self.options.max_iterations {
                warn!(iteration, "iteration cap reached");
                self.session.push(Message::assistant(format!(
                    "[stopped: reached the {}-round tool budget]",
                    self.options.max_iterations
                )));
                self.finish(tx, LoopEnd::MaxIterations, iteration).await;
                return Ok(());
            }
            iteration += 1;

            self.set_state(LoopState::Streaming, tx).await;
            let (result, display) = self.stream_round(tx, cancel).await;
            self.display_accumulator.push_str(&display);

            let outcome = match result {
                Ok(o) => o,
                Err(ChatError::Cancelled) => {
                    self.handle_interrupt(&display, tx, iteration).await;
                    return Ok(());
                }
                Err(ChatError::Unauthorized) => {
                    // Auth state flips to unauthenticated; the frontend must
                    // re-login before the next turn.
                    self.credential.clear();
                    let _ = tx
                        .send(AgentEvent::Error(
                            "authentication rejected (401); log in again".into(),
                        ))
                        .await;
                    self.finish(tx, LoopEnd::Error, iteration).await;
                    return Ok(());
                }
                Err(e) => {
                    let _ = tx.send(AgentEvent::Error(e.to_string())).await;
                    self.finish(tx, LoopEnd::Error, iteration).await;
                    return Ok(());
                }
            };

            if let Some(tid) = outcome.thread_id {
                self.session.set_thread_id(tid);
                self.schedule_save();
            }

            // Transient backend failures show up as reply text; retry the
            // round rather than poisoning the conversation with them.
            if is_transient_backend_error(&outcome.text) {
                error_retry_count += 1;
                if error_retry_count <= self.options.max_error_retries {
                    warn!(
                        attempt = error_retry_count,
                        "transient backend error; retrying round"
                    );
                    let _ = tx
                        .send(AgentEvent::Error(format!(
                            "backend error, retrying ({error_retry_count}/{})",
                            self.options.max_error_retries
                        )))
                        .await;
                    tokio::time::sleep(Duration::from_millis(self.options.retry_delay_ms)).await;
                    iteration -= 1;
                    continue;
                }
                let _ = tx
                    .send(AgentEvent::Error(format!(
                        "backend kept failing after {} retries",
                        self.options.max_error_retries
                    )))
                    .await;
                self.finish(tx, LoopEnd::Error, iteration).await;
                return Ok(());
            }

            if outcome.text.trim().is_empty() {
                if !empty_retry_used {
                    empty_retry_used = true;
                    debug!("empty response; retrying once");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    iteration -= 1;
                    continue;
                }
                self.session.push(Message::assistant("(empty response)"));
                self.schedule_save();
                self.finish(tx, LoopEnd::Completed, iteration).await;
                return Ok(());
            }
            error_retry_count = 0;
            empty_retry_used = false;

            // Post-hoc extraction is authoritative; the streaming parser only
            // feeds the display.
            let calls = parser::extract_all(&outcome.text);
            let clean = parser::remove_tool_blocks(&outcome.text);

            if calls.is_empty() {
                let final_text = if clean.is_empty() {
                    outcome.text.clone()
                } else {
                    clean
                };
                self.session.push(Message::assistant(final_text));
                self.schedule_save();
                self.finish(tx, LoopEnd::Completed, iteration).await;
                return Ok(());
            }

            let assistant_text = if clean.is_empty() {
                format!("(requested {} tool call(s))", calls.len())
            } else {
                clean
            };
            self.session.push(Message::assistant(assistant_text));
            self.schedule_save();

            match self
                .process_calls(iteration, calls, 0, None, tx, cancel)
                .await?
            {
                Flow::Suspended => return Ok(()),
                Flow::Continue => {}
            }
        }
    }

    /// Execute/deny/suspend each call of one round, starting at `start_idx`.
    /// `override_first` carries the user's verdict for the call at
    /// `start_idx` on resume.
    async fn process_calls(
        &mut self,
        iteration: u32,
        calls: Vec<ToolCall>,
        start_idx: usize,
        override_first: Option<Decision>,
        tx: &mpsc::Sender<AgentEvent>,
        _cancel: &mut oneshot::Receiver<()>,
    ) -> anyhow::Result<Flow> {
        for idx in start_idx..calls.len() {
            let call = &calls[idx];

            if !self.tools.is_supported(&call.name) {
                let msg = format!(
                    "Unsupported tool '{}'. Supported tools: {}",
                    call.name,
                    self.tools.names().join(", ")
                );
                self.session.push(Message::tool(&call.name, msg));
                self.schedule_save();
                continue;
            }

            let decision = match override_first {
                Some(d) if idx == start_idx => d,
                _ => self.policy.evaluate(&call.name, &call.args),
            };
            debug!(tool = %call.name, ?decision, "policy decision");

            match decision {
                Decision::Deny => {
                    self.session.push(Message::tool(
                        &call.name,
                        format!("Tool call '{}' was denied by policy.", call.name),
                    ));
                    self.schedule_save();
                    let _ = tx
                        .send(AgentEvent::ToolCallFinished {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            output: "denied by policy".into(),
                            is_error: true,
                        })
                        .await;
                }
                Decision::Ask => {
                    self.pending = Some(PendingLoopState {
                        iteration,
                        tool_calls: calls.clone(),
                        cursor_index: idx,
                        conversation_snapshot: self.session.messages.clone(),
                        display_accumulator: self.display_accumulator.clone(),
                        credential: self.credential.clone(),
                        auth_mode: self.auth_mode,
                        model_family: self.model_family,
                        user_info: self.user_info.clone(),
                    });
                    self.set_state(LoopState::Confirming, tx).await;
                    let _ = tx
                        .send(AgentEvent::PendingToolCall {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            args: call.args.clone(),
                        })
                        .await;
                    return Ok(Flow::Suspended);
                }
                Decision::Allow => {
                    self.set_state(LoopState::ExecutingTool, tx).await;
                    self.checkpoint_before(call).await;
                    let _ = tx
                        .send(AgentEvent::ToolCallStarted {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                        })
                        .await;

                    let output = self.tools.execute(call).await;
                    if let Some(att) = &output.attachment {
                        self.pending_attachments.push(att.clone());
                    }
                    let _ = tx
                        .send(AgentEvent::ToolCallFinished {
                            call_id: output.call_id.clone(),
                            name: output.name.clone(),
                            output: output.content.clone(),
                            is_error: output.is_error,
                        })
                        .await;
                    self.session
                        .push(Message::tool(&output.name, &output.content));
                    self.schedule_save();
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// One streamed request.  Returns the drive result plus the display text
    /// emitted during this round (prose only; tool-block bytes withheld,
    /// batched at the UI throttle window).
    async fn stream_round(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> (Result<ChatOutcome, ChatError>, String) {
        let attachments = std::mem::take(&mut self.pending_attachments);
        if !attachments.is_empty() && self.credential.is_empty() {
            warn!(
                count = attachments.len(),
                "no credential for attachment upload; sending without attachments"
            );
        }

        let transformed = self
            .transformer
            .transform(&self.session.messages, &attachments);
        let req = ChatRequest {
            text: transformed.message,
            files: transformed.files,
            thread_id: self.session.thread_id,
        };

        let (ev_tx, mut ev_rx) = mpsc::channel::<StreamEvent>(256);
        let transport = Arc::clone(&self.transport);
        let options = self.options.clone();

        let drive = async move {
            let out = complete_with_retry(
                transport.as_ref(),
                req,
                options.request_timeout_secs,
                options.client_max_retries,
                options.retry_delay_ms,
                &ev_tx,
                cancel,
            )
            .await;
            drop(ev_tx);
            out
        };

        let throttle = Duration::from_millis(self.options.ui_throttle_ms);
        let drain = async {
            let mut block_parser = ToolBlockParser::new();
            let mut emitted = String::new();
            let mut batch = String::new();
            let mut last_flush = Instant::now();
            while let Some(ev) = ev_rx.recv().await {
                match ev {
                    StreamEvent::TextDelta(delta) => {
                        let r = block_parser.process_chunk(&delta);
                        batch.push_str(&r.emit_output);
                        if !batch.is_empty() && last_flush.elapsed() >= throttle {
                            emitted.push_str(&batch);
                            let _ = tx.send(AgentEvent::TextDelta(std::mem::take(&mut batch))).await;
                            last_flush = Instant::now();
                        }
                    }
                    StreamEvent::ThreadId(tid) => {
                        let _ = tx.send(AgentEvent::ThreadId(tid)).await;
                    }
                    StreamEvent::Restart => {
                        // The client dropped the stream and is retrying;
                        // whatever was shown for this round is stale.
                        block_parser = ToolBlockParser::new();
                        batch.clear();
                    }
                    StreamEvent::Done => {}
                }
            }
            let fin = block_parser.finish();
            batch.push_str(&fin.emit_output);
            if !batch.is_empty() {
                emitted.push_str(&batch);
                let _ = tx.send(AgentEvent::TextDelta(batch)).await;
            }
            emitted
        };

        let (result, display) = tokio::join!(drive, drain);
        (result, display)
    }

    async fn checkpoint_before(&mut self, call: &ToolCall) {
        if !self.tools.is_destructive(&call.name) {
            return;
        }
        if let Some(checkpoints) = &self.checkpoints {
            let description = format!("before {}", call.name);
            if let Err(e) = checkpoints
                .create(&description, &self.session.messages, Some(&call.name))
                .await
            {
                warn!("checkpoint failed (continuing): {e}");
            }
        }
    }

    async fn handle_interrupt(
        &mut self,
        partial: &str,
        tx: &mpsc::Sender<AgentEvent>,
        iteration: u32,
    ) {
        debug!(iteration, "turn interrupted by user");
        if !partial.trim().is_empty() {
            self.session
                .push(Message::assistant(format!("{partial} [interrupted]")));
        }
        self.pending = None;
        self.schedule_save();
        self.finish(tx, LoopEnd::Interrupted, iteration).await;
    }

    async fn finish(&mut self, tx: &mpsc::Sender<AgentEvent>, end: LoopEnd, iterations: u32) {
        debug!(?end, iterations, "turn finished");
        if let Some(store) = &self.store {
            let _ = store.flush().await;
            let _ = store.save_now(&self.session).await;
        }
        self.set_state(LoopState::Idle, tx).await;
        let _ = tx.send(AgentEvent::TurnComplete { end, iterations }).await;
    }

    async fn set_state(&mut self, state: LoopState, tx: &mpsc::Sender<AgentEvent>) {
        if self.state != state {
            self.state = state;
            let _ = tx.send(AgentEvent::Status(state)).await;
        }
    }

    fn schedule_save(&self) {
        if let Some(store) = &self.store {
            store.schedule_save(&self.session);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use popilot_config::Config;
    use popilot_model::mock::MockTransport;
    use popilot_model::Role;
    use popilot_tools::builtin_registry;

    use crate::transform::DefaultTransformer;

    use super::*;

    fn text_round(text: &str) -> Vec<Result<StreamEvent, ChatError>> {
        vec![
            Ok(StreamEvent::TextDelta(text.to_string())),
            Ok(StreamEvent::Done),
        ]
    }

    struct Fixture {
        agent: Agent,
        rx: mpsc::Receiver<AgentEvent>,
        tx: mpsc::Sender<AgentEvent>,
        _dir: tempfile::TempDir,
    }

    fn fixture(scripts: Vec<Vec<Result<StreamEvent, ChatError>>>, mode: AgentMode) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let tools = Arc::new(builtin_registry(dir.path(), &config));
        let transformer = Arc::new(DefaultTransformer::new(
            config.transformer.clone(),
            tools.descriptions(),
        ));
        let policy = PolicyEngine::with_defaults(mode);
        let transport = Arc::new(MockTransport::with_script(scripts));
        let options = AgentOptions {
            retry_delay_ms: 1,
            ui_throttle_ms: 1,
            ..AgentOptions::default()
        };
        let agent = Agent::new(
            Session::new("claude"),
            transport,
            tools,
            policy,
            transformer,
            options,
        );
        let (tx, rx) = mpsc::channel(1024);
        Fixture { agent, rx, tx, _dir: dir }
    }

    fn drain(rx: &mut mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn turn_end(events: &[AgentEvent]) -> Option<(LoopEnd, u32)> {
        events.iter().rev().find_map(|e| match e {
            AgentEvent::TurnComplete { end, iterations } => Some((*end, *iterations)),
            _ => None,
        })
    }

    #[tokio::test]
    async fn plain_response_completes_in_one_round() {
        let mut f = fixture(vec![text_round("Hello there!")], AgentMode::Default);
        let (_c, mut cancel) = oneshot::channel::<()>();
        f.agent.submit("hi", &f.tx, &mut cancel).await.unwrap();

        let events = drain(&mut f.rx);
        assert_eq!(turn_end(&events), Some((LoopEnd::Completed, 1)));
        let msgs = &f.agent.session().messages;
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].as_text(), "Hello there!");
        assert_eq!(f.agent.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn tool_round_executes_and_feeds_result_back() {
        let block = "I will list the directory.\n```tool\nTOOL_NAME: list_directory\n```";
        let mut f = fixture(
            vec![text_round(block), text_round("All done.")],
            AgentMode::Default,
        );
        let (_c, mut cancel) = oneshot::channel::<()>();
        f.agent.submit("what is here?", &f.tx, &mut cancel).await.unwrap();

        let events = drain(&mut f.rx);
        assert_eq!(turn_end(&events), Some((LoopEnd::Completed, 2)));

        // user → assistant(clean) → tool → assistant(final)
        let msgs = &f.agent.session().messages;
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].as_text(), "I will list the directory.");
        assert_eq!(msgs[2].role, Role::Tool);
        assert_eq!(msgs[2].name.as_deref(), Some("list_directory"));
        assert_eq!(msgs[3].as_text(), "All done.");

        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ToolCallFinished { name, is_error: false, .. } if name == "list_directory"
        )));
    }

    #[tokio::test]
    async fn ask_suspends_and_resume_approves() {
        let block = "```tool\nTOOL_NAME: run_terminal_command\nBEGIN_ARG: command\necho approved\nEND_ARG\n```";
        let mut f = fixture(
            vec![text_round(block), text_round("Command ran.")],
            AgentMode::Default,
        );
        let (_c, mut cancel) = oneshot::channel::<()>();
        f.agent.submit("run it", &f.tx, &mut cancel).await.unwrap();

        // Suspended, not completed.
        let events = drain(&mut f.rx);
        assert!(turn_end(&events).is_none());
        assert_eq!(f.agent.state(), LoopState::Confirming);
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::PendingToolCall { name, .. } if name == "run_terminal_command"
        )));
        assert_eq!(
            f.agent.pending_tool_call().map(|c| c.name.as_str()),
            Some("run_terminal_command")
        );

        // Approve: tool executes, loop streams one more round, completes.
        f.agent
            .resume_pending(true, false, &f.tx, &mut cancel)
            .await
            .unwrap();
        let events = drain(&mut f.rx);
        assert_eq!(turn_end(&events).map(|(e, _)| e), Some(LoopEnd::Completed));
        let msgs = &f.agent.session().messages;
        let tool_msg = msgs.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.as_text().contains("approved"));
    }

    #[tokio::test]
    async fn resume_denied_appends_refusal() {
        let block = "```tool\nTOOL_NAME: run_terminal_command\nBEGIN_ARG: command\nrm x\nEND_ARG\n```";
        let mut f = fixture(
            vec![text_round(block), text_round("Understood.")],
            AgentMode::Default,
        );
        let (_c, mut cancel) = oneshot::channel::<()>();
        f.agent.submit("run it", &f.tx, &mut cancel).await.unwrap();
        drain(&mut f.rx);

        f.agent
            .resume_pending(false, false, &f.tx, &mut cancel)
            .await
            .unwrap();
        let events = drain(&mut f.rx);
        assert_eq!(turn_end(&events).map(|(e, _)| e), Some(LoopEnd::Completed));
        let msgs = &f.agent.session().messages;
        let tool_msg = msgs.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.as_text().contains("denied"));
    }

    #[tokio::test]
    async fn unsupported_tool_gets_refusal_with_supported_set() {
        let block = "```tool\nTOOL_NAME: quantum.entangle\n```";
        let mut f = fixture(
            vec![text_round(block), text_round("Sorry about that.")],
            AgentMode::Default,
        );
        let (_c, mut cancel) = oneshot::channel::<()>();
        f.agent.submit("try it", &f.tx, &mut cancel).await.unwrap();

        let events = drain(&mut f.rx);
        assert_eq!(turn_end(&events).map(|(e, _)| e), Some(LoopEnd::Completed));
        let msgs = &f.agent.session().messages;
        let tool_msg = msgs.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.as_text().contains("Unsupported tool"));
        assert!(tool_msg.as_text().contains("file.read"));
    }

    #[tokio::test]
    async fn transient_backend_errors_are_retried_then_succeed() {
        // Scenario: two failed rounds, then a clean tool-less response.
        let mut f = fixture(
            vec![
                text_round("failed to parse stringified json"),
                text_round("Internal Server Error"),
                text_round("Recovered fine."),
            ],
            AgentMode::Default,
        );
        let (_c, mut cancel) = oneshot::channel::<()>();
        f.agent.submit("go", &f.tx, &mut cancel).await.unwrap();

        let events = drain(&mut f.rx);
        assert_eq!(turn_end(&events), Some((LoopEnd::Completed, 1)));
        let msgs = &f.agent.session().messages;
        // History: user + ONE assistant message; no tool messages, no error text.
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].as_text(), "Recovered fine.");
        assert!(!msgs.iter().any(|m| m.role == Role::Tool));
    }

    #[tokio::test]
    async fn persistent_backend_errors_end_the_turn() {
        let bad = || text_round("Internal Server Error");
        let mut f = fixture(vec![bad(), bad(), bad(), bad(), bad()], AgentMode::Default);
        let (_c, mut cancel) = oneshot::channel::<()>();
        f.agent.submit("go", &f.tx, &mut cancel).await.unwrap();

        let events = drain(&mut f.rx);
        assert_eq!(turn_end(&events).map(|(e, _)| e), Some(LoopEnd::Error));
    }

    #[tokio::test]
    async fn empty_response_is_retried_once() {
        let mut f = fixture(
            vec![text_round(""), text_round("Here now.")],
            AgentMode::Default,
        );
        let (_c, mut cancel) = oneshot::channel::<()>();
        f.agent.submit("go", &f.tx, &mut cancel).await.unwrap();

        let events = drain(&mut f.rx);
        assert_eq!(turn_end(&events), Some((LoopEnd::Completed, 1)));
        assert_eq!(f.agent.session().messages[1].as_text(), "Here now.");
    }

    #[tokio::test]
    async fn iteration_cap_ends_the_turn() {
        let block = "```tool\nTOOL_NAME: list_directory\n```";
        let rounds: Vec<_> = (0..10).map(|_| text_round(block)).collect();
        let mut f = fixture(rounds, AgentMode::Default);
        f.agent.options.max_iterations = 3;
        let (_c, mut cancel) = oneshot::channel::<()>();
        f.agent.submit("loop forever", &f.tx, &mut cancel).await.unwrap();

        let events = drain(&mut f.rx);
        assert_eq!(turn_end(&events).map(|(e, _)| e), Some(LoopEnd::MaxIterations));
    }

    #[tokio::test]
    async fn thread_id_is_stored_once() {
        let mut f = fixture(
            vec![vec![
                Ok(StreamEvent::ThreadId(99)),
                Ok(StreamEvent::TextDelta("ok".into())),
                Ok(StreamEvent::Done),
            ]],
            AgentMode::Default,
        );
        let (_c, mut cancel) = oneshot::channel::<()>();
        f.agent.submit("hi", &f.tx, &mut cancel).await.unwrap();
        assert_eq!(f.agent.session().thread_id, Some(99));
    }

    #[tokio::test]
    async fn cancelled_stream_marks_turn_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let tools = Arc::new(builtin_registry(dir.path(), &config));
        let transformer = Arc::new(DefaultTransformer::new(
            config.transformer.clone(),
            tools.descriptions(),
        ));
        let transport = Arc::new(MockTransport::pending());
        let mut agent = Agent::new(
            Session::new("claude"),
            transport,
            tools,
            PolicyEngine::with_defaults(AgentMode::Default),
            transformer,
            AgentOptions::default(),
        );
        let (tx, mut rx) = mpsc::channel(256);
        let (c_tx, mut cancel) = oneshot::channel::<()>();
        let _ = c_tx.send(());
        agent.submit("hi", &tx, &mut cancel).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(turn_end(&events).map(|(e, _)| e), Some(LoopEnd::Interrupted));
        assert_eq!(agent.state(), LoopState::Idle);
        assert!(agent.pending_tool_call().is_none());
    }

    #[tokio::test]
    async fn submit_while_suspended_is_rejected() {
        let block = "```tool\nTOOL_NAME: run_terminal_command\nBEGIN_ARG: command\nls\nEND_ARG\n```";
        let mut f = fixture(vec![text_round(block)], AgentMode::Default);
        let (_c, mut cancel) = oneshot::channel::<()>();
        f.agent.submit("go", &f.tx, &mut cancel).await.unwrap();
        assert_eq!(f.agent.state(), LoopState::Confirming);

        let err = f.agent.submit("again", &f.tx, &mut cancel).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn auto_edit_mode_runs_edits_without_asking() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\nb\n").unwrap();
        let sha = popilot_tools::fsio::sha256_hex(b"a\nb\n");
        let block = format!(
            "```tool\nTOOL_NAME: file.applyTextEdits\nBEGIN_ARG: file_path\nf.txt\nEND_ARG\n\
             BEGIN_ARG: expected_sha256\n{sha}\nEND_ARG\n\
             BEGIN_ARG: edits\n[{{\"start_line\":1,\"end_line\":1,\"new_text\":\"A\"}}]\nEND_ARG\n```"
        );

        let config = Config::default();
        let tools = Arc::new(builtin_registry(dir.path(), &config));
        let transformer = Arc::new(DefaultTransformer::new(
            config.transformer.clone(),
            tools.descriptions(),
        ));
        let transport = Arc::new(MockTransport::with_script(vec![
            text_round(&block),
            text_round("Edited."),
        ]));
        let mut agent = Agent::new(
            Session::new("claude"),
            transport,
            tools,
            PolicyEngine::with_defaults(AgentMode::AutoEdit),
            transformer,
            AgentOptions { ui_throttle_ms: 1, ..AgentOptions::default() },
        );
        let (tx, mut rx) = mpsc::channel(1024);
        let (_c, mut cancel) = oneshot::channel::<()>();
        agent.submit("fix it", &tx, &mut cancel).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(turn_end(&events).map(|(e, _)| e), Some(LoopEnd::Completed));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "A\nb\n"
        );
    }
}
