use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use terminal_bridge::{
    agent::{Agent, HistoryEntry, ModelClient, RunOutcome, StepStatus},
    bridge::SessionBridge,
    config::{Cli, Command, RunArgs, ServeArgs},
    events::{init_logging, EventEmitter},
    gemini::{GeminiSettings, ModelClientCache},
    protocol::{BridgeToClient, SessionStatus},
    server::{self, ServerState},
};

const RUN_SESSION_ID: &str = "cli";
/// Settle time after the shell reports ready, so its prompt is printed
/// before the first command is typed.
const PROMPT_SETTLE: Duration = Duration::from_millis(300);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let events = EventEmitter::new(cli.json_output);

    match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Run(args) => {
            let outcome = run_agent(args, events).await?;
            if outcome.is_failure() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let addr = args.listen_addr()?;
    let model: Option<Arc<dyn ModelClient>> = match GeminiSettings::from_env() {
        Ok(settings) => {
            let cache = ModelClientCache::new(settings).context("failed to build model client")?;
            let client: Arc<dyn ModelClient> = cache.default_client();
            Some(client)
        }
        Err(error) => {
            tracing::warn!(target = "agent_terminal::main", %error, "agent disabled");
            None
        }
    };
    let bridge = Arc::new(SessionBridge::new(args.bridge.bridge_config()));
    server::serve(addr, ServerState::new(bridge, model, args.agent.agent_config())).await
}

async fn run_agent(args: RunArgs, events: EventEmitter) -> Result<RunOutcome> {
    let settings = GeminiSettings::from_env().context("model credentials")?;
    let cache = ModelClientCache::new(settings).context("failed to build model client")?;
    let descriptor = args.descriptor()?;

    let bridge = Arc::new(SessionBridge::new(args.bridge.bridge_config()));
    let (outbound_tx, mut outbound_rx) = mpsc::channel(256);
    bridge.open_session(RUN_SESSION_ID, outbound_tx);
    bridge
        .connect(RUN_SESSION_ID, descriptor)
        .await
        .context("failed to start session")?;
    wait_until_ready(&mut outbound_rx).await?;

    // Terminal output is only needed by interactive clients.
    let drain = tokio::spawn(async move { while outbound_rx.recv().await.is_some() {} });

    let agent = Arc::new(Agent::new(
        cache.default_client(),
        Arc::new(bridge.handle(RUN_SESSION_ID)),
        args.agent.agent_config(),
    ));
    if let Some(path) = args.history_file.as_deref() {
        if let Some(history) = load_history(path)? {
            agent.restore_history(history);
        }
    }

    let mut steps = agent.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = steps.recv().await {
            if event.step.status != StepStatus::Running {
                print_step(&event.step);
            }
            events.emit("agent_step", &event);
        }
    });

    let mut run = {
        let agent = Arc::clone(&agent);
        let prompt = args.prompt.clone();
        tokio::spawn(async move { agent.start(prompt).await })
    };
    let outcome = tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::signal::ctrl_c() => {
            agent.stop();
            run.await
        }
    }
    .context("agent task failed")?;

    if let Some(path) = args.history_file.as_deref() {
        save_history(path, &agent.history())?;
    }
    drop(agent);
    printer.abort();

    bridge.close_session(RUN_SESSION_ID).await;
    drain.abort();

    match &outcome {
        RunOutcome::Completed { summary } => println!("\ncompleted: {summary}"),
        RunOutcome::TextAnswer { text } => println!("\n{text}"),
        RunOutcome::Aborted => println!("\naborted"),
        RunOutcome::Error { message } => eprintln!("\nerror: {message}"),
        RunOutcome::IterationCapReached { iterations } => {
            eprintln!("\nstopped after {iterations} iterations without completing")
        }
    }
    Ok(outcome)
}

async fn wait_until_ready(outbound: &mut mpsc::Receiver<BridgeToClient>) -> Result<()> {
    while let Some(message) = outbound.recv().await {
        match message {
            BridgeToClient::Status { status, message } => match status {
                SessionStatus::Ready => {
                    tokio::time::sleep(PROMPT_SETTLE).await;
                    return Ok(());
                }
                SessionStatus::Error | SessionStatus::Disconnected => {
                    anyhow::bail!(
                        "session ended before it was ready: {}",
                        message.unwrap_or_else(|| format!("{status:?}"))
                    );
                }
                _ => {}
            },
            BridgeToClient::Error { message } => anyhow::bail!("session failed: {message}"),
            _ => {}
        }
    }
    anyhow::bail!("session closed before it was ready")
}

fn print_step(step: &terminal_bridge::agent::StepRecord) {
    let subject = step
        .command
        .as_deref()
        .or(step.keys.as_deref())
        .or(step.summary.as_deref())
        .unwrap_or_default();
    println!("[{:?}/{:?}] {subject}", step.kind, step.status);
    if let Some(output) = step.output.as_deref().filter(|output| !output.is_empty()) {
        println!("{output}");
    }
}

fn load_history(path: &Path) -> Result<Option<Vec<HistoryEntry>>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read history {}", path.display()))?;
    let history = serde_json::from_str(&raw)
        .with_context(|| format!("invalid history file {}", path.display()))?;
    Ok(Some(history))
}

fn save_history(path: &Path, history: &[HistoryEntry]) -> Result<()> {
    let raw = serde_json::to_string_pretty(history)?;
    std::fs::write(path, raw).with_context(|| format!("failed to write history {}", path.display()))
}
