// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write as _;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use popilot_config::ModelConfig;
use popilot_core::{
    Agent, AgentEvent, AgentOptions, CheckpointStore, DefaultTransformer, LoopEnd, LoopState,
    Session, SessionStore,
};
use popilot_model::{AuthMode, ChatStreamClient};
use popilot_tools::{builtin_registry, PolicyEngine};

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    match runtime.block_on(run(cli)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("popilot: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

/// Logging goes to POPILOT_LOG_FILE when set, to stderr with --verbose,
/// and nowhere otherwise (stderr noise corrupts the interactive display).
fn init_logging(verbose: bool) {
    let filter = || EnvFilter::try_from_env("POPILOT_LOG").unwrap_or_else(|_| "info".into());
    if let Ok(path) = std::env::var("POPILOT_LOG_FILE") {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false)
                        .with_filter(filter()),
                )
                .init();
            return;
        }
    }
    if verbose {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter()))
            .init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let workspace = match &cli.dir {
        Some(d) => d
            .canonicalize()
            .with_context(|| format!("workspace directory {}", d.display()))?,
        None => std::env::current_dir().context("current directory")?,
    };

    // Invalid model is a startup error (exit code 1).
    let Some((family, resolved_name, provider)) = ModelConfig::resolve(&cli.model) else {
        anyhow::bail!(
            "unknown model '{}' (aliases: claude, gpt, gemini)",
            cli.model
        );
    };

    let mut config = popilot_config::load(&workspace, cli.config.as_deref())?;
    config.model.name = cli.model.clone();
    config.model.provider = provider.to_string();
    if let Some(v) = cli.hard_limit {
        config.transformer.hard_limit = v as usize;
    }
    if let Some(v) = cli.max_text_length {
        config.transformer.max_text_length = v as usize;
    }
    if let Some(v) = cli.max_tool_output {
        config.transformer.max_tool_output_length = v as usize;
    }
    if let Some(v) = cli.keep_recent {
        config.transformer.keep_recent_messages = v as usize;
    }

    // Credential selection decides the transport family.
    let (auth_mode, credential) = match std::env::var("POPILOT_SSO_TOKEN") {
        Ok(token) if !token.is_empty() => (AuthMode::Sso, token),
        _ => match std::env::var("POPILOT_API_KEY") {
            Ok(key) if !key.is_empty() => (AuthMode::ApiKey, key),
            _ => {
                eprintln!("warning: neither POPILOT_SSO_TOKEN nor POPILOT_API_KEY is set");
                (AuthMode::ApiKey, String::new())
            }
        },
    };

    let tools = Arc::new(builtin_registry(&workspace, &config));
    let transformer = Arc::new(DefaultTransformer::new(
        config.transformer.clone(),
        tools.descriptions(),
    ));
    let policy_dir = match &config.policy.dir {
        Some(d) => std::path::PathBuf::from(shellexpand::tilde(d).to_string()),
        None => workspace.join(".popilot").join("policy"),
    };
    // Mode precedence: explicit --mode, else policy-file settings, else the
    // configured default.
    let mut policy =
        PolicyEngine::load(&policy_dir, cli.mode.unwrap_or(config.agent.default_mode))?;
    if let Some(mode) = cli.mode {
        policy.set_mode(mode);
    }

    let store = Arc::new(SessionStore::new(
        &workspace,
        config.session.debounce_ms,
        config.session.retention,
    )?);
    let checkpoints = Arc::new(CheckpointStore::new(&workspace)?);

    // Restore the previous session for this workspace when one exists.
    let session = match store.load_last().await {
        Some(s) if s.model == cli.model => s,
        _ => Session::new(cli.model.as_str()),
    };

    let transport = Arc::new(ChatStreamClient::new(
        config.chat.clone(),
        config.model.clone(),
        family,
        auth_mode,
        credential.clone(),
    ));

    let mut agent = Agent::new(
        session,
        transport,
        tools,
        policy,
        transformer,
        AgentOptions::from_config(&config),
    )
    .with_store(Arc::clone(&store))
    .with_checkpoints(checkpoints)
    .with_identity(
        credential,
        auth_mode,
        family,
        Some(config.chat.user.clone()),
    );

    let ui = Ui::new(cli.no_color);
    ui.banner(&cli.model, resolved_name, &workspace);

    repl(&mut agent, &store, &ui).await
}

async fn repl(agent: &mut Agent, store: &Arc<SessionStore>, ui: &Ui) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        ui.prompt();
        let Some(line) = lines.next_line().await? else {
            break; // EOF
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }

        run_turn(agent, ui, TurnKind::Submit(input)).await?;

        // Confirmation round-trips until the turn actually ends.
        while agent.state() == LoopState::Confirming {
            let Some((name, args)) = agent
                .pending_tool_call()
                .map(|c| (c.name.clone(), c.args.clone()))
            else {
                break;
            };
            ui.confirm_prompt(&name, &args);
            let Some(answer) = lines.next_line().await? else {
                break;
            };
            let answer = answer.trim().to_ascii_lowercase();
            let (approved, remember) = match answer.as_str() {
                "y" | "yes" => (true, false),
                "a" | "always" => (true, true),
                _ => (false, false),
            };
            run_turn(agent, ui, TurnKind::Resume { approved, remember }).await?;
        }
    }

    store.flush().await?;
    Ok(())
}

enum TurnKind<'a> {
    Submit(&'a str),
    Resume { approved: bool, remember: bool },
}

/// Drive one submit/resume to completion: render events while the loop runs,
/// wire ctrl-c to the cancellation handle.
async fn run_turn(agent: &mut Agent, ui: &Ui, kind: TurnKind<'_>) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(());
        }
    });

    // The sender is owned by the turn future so the renderer's channel
    // closes no matter how the turn ends.
    let turn = async {
        let result = match kind {
            TurnKind::Submit(input) => agent.submit(input, &tx, &mut cancel_rx).await,
            TurnKind::Resume { approved, remember } => {
                agent.resume_pending(approved, remember, &tx, &mut cancel_rx).await
            }
        };
        drop(tx);
        result
    };
    let render = async {
        while let Some(event) = rx.recv().await {
            ui.render(&event);
            if matches!(
                event,
                AgentEvent::TurnComplete { .. } | AgentEvent::PendingToolCall { .. }
            ) {
                break;
            }
        }
    };

    let (result, ()) = tokio::join!(turn, render);
    watcher.abort();
    result
}

// ── Terminal rendering ───────────────────────────────────────────────────────

struct Ui {
    color: bool,
}

impl Ui {
    fn new(no_color: bool) -> Self {
        Self { color: !no_color }
    }

    fn dim(&self, s: &str) -> String {
        if self.color {
            format!("\x1b[2m{s}\x1b[0m")
        } else {
            s.to_string()
        }
    }

    fn red(&self, s: &str) -> String {
        if self.color {
            format!("\x1b[31m{s}\x1b[0m")
        } else {
            s.to_string()
        }
    }

    fn banner(&self, model: &str, resolved: &str, workspace: &std::path::Path) {
        println!(
            "{}",
            self.dim(&format!(
                "popilot · model {model} ({resolved}) · workspace {}",
                workspace.display()
            ))
        );
    }

    fn prompt(&self) {
        print!("> ");
        let _ = std::io::stdout().flush();
    }

    fn confirm_prompt(&self, tool: &str, args: &serde_json::Value) {
        println!();
        println!("{}", self.dim(&format!("tool request: {tool}")));
        if let Some(obj) = args.as_object() {
            for (k, v) in obj {
                let rendered = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let short: String = rendered.chars().take(200).collect();
                println!("{}", self.dim(&format!("  {k}: {short}")));
            }
        }
        print!("allow? [y/N/a(lways)] ");
        let _ = std::io::stdout().flush();
    }

    fn render(&self, event: &AgentEvent) {
        match event {
            AgentEvent::TextDelta(text) => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            AgentEvent::Status(state) => {
                if *state == LoopState::ExecutingTool {
                    println!();
                }
            }
            AgentEvent::ThreadId(_) => {}
            AgentEvent::ToolCallStarted { name, .. } => {
                println!("{}", self.dim(&format!("· {name} …")));
            }
            AgentEvent::ToolCallFinished { name, is_error, .. } => {
                let mark = if *is_error { "✗" } else { "✓" };
                println!("{}", self.dim(&format!("· {name} {mark}")));
            }
            AgentEvent::PendingToolCall { .. } => {}
            AgentEvent::Error(msg) => {
                println!("{}", self.red(&format!("! {msg}")));
            }
            AgentEvent::TurnComplete { end, iterations } => {
                let label = match end {
                    LoopEnd::Completed => format!("done ({iterations} rounds)"),
                    LoopEnd::MaxIterations => format!("stopped at the {iterations}-round cap"),
                    LoopEnd::Error => format!("failed after {iterations} rounds"),
                    LoopEnd::Interrupted => "interrupted".to_string(),
                };
                println!();
                println!("{}", self.dim(&label));
            }
        }
    }
}
