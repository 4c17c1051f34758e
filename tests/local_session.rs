//! End-to-end tests: an agent driving a real local shell through the bridge.

#![cfg(unix)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use terminal_bridge::agent::{
    Agent, AgentConfig, AgentTerminal, HistoryEntry, ModelClient, ModelResponse, RunOutcome,
    StepStatus,
};
use terminal_bridge::backend::BackendOptions;
use terminal_bridge::bridge::{BridgeConfig, SessionBridge};
use terminal_bridge::capture::CaptureStatus;
use terminal_bridge::error::ModelError;
use terminal_bridge::protocol::{BridgeToClient, ConnectionDescriptor, SessionStatus};

struct ScriptedModel {
    script: Mutex<VecDeque<ModelResponse>>,
}

impl ScriptedModel {
    fn new(script: Vec<ModelResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
        })
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn call_model(
        &self,
        _model_id: &str,
        _history: &[HistoryEntry],
        _cancel: CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        Ok(self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| ModelResponse::text("out of script")))
    }
}

fn bridge(command_timeout: Duration) -> Arc<SessionBridge> {
    Arc::new(SessionBridge::new(BridgeConfig {
        backend: BackendOptions {
            shell: Some("/bin/sh".to_string()),
            ..BackendOptions::default()
        },
        command_timeout,
        sample_window: Duration::from_millis(500),
    }))
}

/// Open a local session, wait for the prompt, then keep draining output.
async fn ready_session(bridge: &SessionBridge, id: &str) -> tokio::task::JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel(64);
    bridge.open_session(id, tx);
    bridge
        .connect(id, ConnectionDescriptor::local())
        .await
        .expect("connect");

    let mut ready = false;
    loop {
        let message = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for shell")
            .expect("outbound closed");
        match message {
            BridgeToClient::Status {
                status: SessionStatus::Ready,
                ..
            } => ready = true,
            BridgeToClient::Output { .. } if ready => break,
            BridgeToClient::Error { message } => panic!("session failed: {message}"),
            _ => {}
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    tokio::spawn(async move { while rx.recv().await.is_some() {} })
}

#[tokio::test]
async fn agent_runs_a_command_in_a_local_shell() {
    let bridge = bridge(Duration::from_secs(10));
    let drain = ready_session(&bridge, "e2e").await;

    let model = ScriptedModel::new(vec![
        ModelResponse::call("run_command", json!({"command": "echo agent-$((40 + 2))"})),
        ModelResponse::call("task_complete", json!({"summary": "echoed"})),
    ]);
    let agent = Agent::new(
        model,
        Arc::new(bridge.handle("e2e")),
        AgentConfig::default(),
    );

    let outcome = timeout(Duration::from_secs(15), agent.start("echo something"))
        .await
        .expect("run finished");

    assert_eq!(
        outcome,
        RunOutcome::Completed {
            summary: "echoed".into()
        }
    );
    let steps = agent.steps();
    assert_eq!(steps[0].status, StepStatus::Done);
    assert_eq!(steps[0].output.as_deref(), Some("agent-42"));

    bridge.close_session("e2e").await;
    drain.abort();
}

#[tokio::test]
async fn multi_line_output_is_captured_between_echo_and_marker() {
    let bridge = bridge(Duration::from_secs(10));
    let drain = ready_session(&bridge, "lines").await;
    let terminal = bridge.handle("lines");

    let outcome = terminal
        .run_command("printf 'one\\ntwo\\nthree\\n'")
        .await
        .unwrap();

    assert_eq!(outcome.status, CaptureStatus::Done);
    assert_eq!(outcome.output, "one\ntwo\nthree");

    bridge.close_session("lines").await;
    drain.abort();
}

#[tokio::test]
async fn long_running_command_times_out_and_stops_the_agent() {
    let bridge = bridge(Duration::from_millis(800));
    let drain = ready_session(&bridge, "slow").await;

    let model = ScriptedModel::new(vec![
        ModelResponse::call("run_command", json!({"command": "sleep 5"})),
        ModelResponse::call("run_command", json!({"command": "echo never"})),
    ]);
    let agent = Agent::new(
        model,
        Arc::new(bridge.handle("slow")),
        AgentConfig::default(),
    );

    let outcome = timeout(Duration::from_secs(5), agent.start("wait a bit"))
        .await
        .expect("run finished");

    assert_eq!(outcome, RunOutcome::Aborted);
    let steps = agent.steps();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Timeout);

    bridge.close_session("slow").await;
    drain.abort();
}

#[tokio::test]
async fn stop_aborts_a_pending_command() {
    let bridge = bridge(Duration::from_secs(30));
    let drain = ready_session(&bridge, "stop").await;

    let model = ScriptedModel::new(vec![ModelResponse::call(
        "run_command",
        json!({"command": "sleep 20"}),
    )]);
    let agent = Arc::new(Agent::new(
        model,
        Arc::new(bridge.handle("stop")),
        AgentConfig::default(),
    ));

    let run = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.start("sleep").await })
    };
    timeout(Duration::from_secs(5), async {
        while agent.steps().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("command started");
    agent.stop();

    let outcome = timeout(Duration::from_secs(5), run)
        .await
        .expect("run finished")
        .unwrap();
    assert_eq!(outcome, RunOutcome::Aborted);
    assert_eq!(agent.steps()[0].status, StepStatus::Aborted);

    bridge.close_session("stop").await;
    drain.abort();
}
