use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::action::{interpret, AgentAction, ModelTurn};
use super::control::{RunControl, RunMode};
use super::history::HistoryEntry;
use super::model::ModelClient;
use super::{AgentConfig, AgentTerminal, RunOutcome, StepRecord, StepStatus, TIMEOUT_NOTE};
use crate::capture::{CaptureOutcome, CaptureStatus};
use crate::error::{BridgeError, ModelError};

const STEP_EVENT_CAPACITY: usize = 256;
const EMPTY_OUTPUT: &str = "(no output)";

/// A step as published to subscribers. The same index is re-published when
/// a running step resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepEvent {
    pub index: usize,
    pub step: StepRecord,
}

/// Snapshot of the agent's run state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRunState {
    pub running: bool,
    pub paused: bool,
    pub stop_requested: bool,
    pub iteration_count: usize,
    pub last_prompt: Option<String>,
}

#[derive(Default)]
struct AgentInner {
    history: Vec<HistoryEntry>,
    steps: Vec<StepRecord>,
    running: bool,
    iteration_count: usize,
    last_prompt: Option<String>,
}

pub struct Agent {
    model: Arc<dyn ModelClient>,
    terminal: Arc<dyn AgentTerminal>,
    config: AgentConfig,
    control: RunControl,
    inner: Mutex<AgentInner>,
    step_tx: broadcast::Sender<StepEvent>,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ModelClient>,
        terminal: Arc<dyn AgentTerminal>,
        config: AgentConfig,
    ) -> Self {
        let (step_tx, _) = broadcast::channel(STEP_EVENT_CAPACITY);
        Self {
            model,
            terminal,
            config,
            control: RunControl::new(),
            inner: Mutex::new(AgentInner::default()),
            step_tx,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run the loop for `prompt` until the model completes, answers in
    /// text, errors, is stopped, or the iteration cap is reached.
    ///
    /// History carries over from earlier runs; the step log starts fresh.
    pub async fn start(&self, prompt: impl Into<String>) -> RunOutcome {
        let prompt = prompt.into();
        let cancel = {
            let mut inner = self.inner.lock();
            if inner.running {
                tracing::warn!(target = "agent_terminal::agent", "start ignored; run in progress");
                return RunOutcome::Error {
                    message: "agent is already running".to_string(),
                };
            }
            inner.running = true;
            inner.iteration_count = 0;
            inner.last_prompt = Some(prompt.clone());
            inner.steps.clear();
            inner.history.push(HistoryEntry::user(prompt));
            self.control.reset()
        };

        tracing::info!(
            target = "agent_terminal::agent",
            model = %self.config.model,
            max_iterations = self.config.max_iterations,
            "agent run started"
        );
        let outcome = self.run_loop(&cancel).await;
        self.inner.lock().running = false;
        tracing::info!(target = "agent_terminal::agent", ?outcome, "agent run finished");
        outcome
    }

    /// Re-run the most recent prompt. `None` when nothing has run yet.
    pub async fn retry_last(&self) -> Option<RunOutcome> {
        let prompt = self.inner.lock().last_prompt.clone()?;
        Some(self.start(prompt).await)
    }

    /// Cooperative: the current action finishes first.
    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    /// Stop the run and abort any capture in flight.
    pub fn stop(&self) {
        self.control.stop();
        self.terminal.abort_capture();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.step_tx.subscribe()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.lock().history.clone()
    }

    /// Replace the conversation, e.g. with one loaded from disk.
    pub fn restore_history(&self, history: Vec<HistoryEntry>) {
        self.inner.lock().history = history;
    }

    /// Take over another agent's conversation and last prompt, e.g. after
    /// switching models.
    pub fn continue_from(&self, previous: &Agent) {
        let (history, last_prompt) = {
            let previous = previous.inner.lock();
            (previous.history.clone(), previous.last_prompt.clone())
        };
        let mut inner = self.inner.lock();
        inner.history = history;
        inner.last_prompt = last_prompt;
    }

    pub fn steps(&self) -> Vec<StepRecord> {
        self.inner.lock().steps.clone()
    }

    pub fn state(&self) -> AgentRunState {
        let inner = self.inner.lock();
        let mode = self.control.mode();
        AgentRunState {
            running: inner.running,
            paused: inner.running && mode == RunMode::Paused,
            stop_requested: mode == RunMode::Stopped,
            iteration_count: inner.iteration_count,
            last_prompt: inner.last_prompt.clone(),
        }
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> RunOutcome {
        let max_iterations = self.config.max_iterations;

        for iteration in 1..=max_iterations {
            match self.control.mode() {
                RunMode::Stopped => return RunOutcome::Aborted,
                RunMode::Paused => {
                    tracing::info!(target = "agent_terminal::agent", iteration, "run paused");
                    if self.control.wait_while_paused().await == RunMode::Stopped {
                        return RunOutcome::Aborted;
                    }
                    tracing::info!(target = "agent_terminal::agent", iteration, "run resumed");
                }
                RunMode::Running => {}
            }
            self.inner.lock().iteration_count = iteration;

            let history = self.history();
            tracing::debug!(
                target = "agent_terminal::agent",
                iteration,
                history_len = history.len(),
                "requesting next action"
            );
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ModelError::Cancelled),
                result = self.model.call_model(&self.config.model, &history, cancel.clone()) => result,
            };
            let response = match response {
                Ok(response) => response,
                Err(error) if error.is_cancelled() => return RunOutcome::Aborted,
                Err(error) => {
                    let message = error.to_string();
                    tracing::warn!(target = "agent_terminal::agent", %message, "model call failed");
                    self.push_step(StepRecord::error(message.clone()));
                    return RunOutcome::Error { message };
                }
            };
            if cancel.is_cancelled() {
                return RunOutcome::Aborted;
            }

            let action = match interpret(response) {
                ModelTurn::Text(text) => {
                    self.push_history(HistoryEntry::model(text.clone()));
                    self.push_step(StepRecord::text(text.clone()));
                    return RunOutcome::TextAnswer { text };
                }
                ModelTurn::Action(action) => action,
            };
            self.push_history(HistoryEntry::call(action.name(), action.args()));

            let outcome = match action {
                AgentAction::TaskComplete { summary } => {
                    self.push_history(HistoryEntry::tool_result(
                        "task_complete",
                        json!({"acknowledged": true}),
                    ));
                    self.push_step(StepRecord::complete(summary.clone()));
                    return RunOutcome::Completed { summary };
                }
                AgentAction::RunCommand { command, reasoning } => {
                    tracing::info!(target = "agent_terminal::agent", iteration, %command, "running command");
                    let index = self.push_step(StepRecord::command(command.as_str(), reasoning));
                    let result = self
                        .observe(self.terminal.run_command(&command), cancel)
                        .await;
                    self.record_capture(index, "run_command", result)
                }
                AgentAction::SendKeys { keys, reasoning } => {
                    tracing::info!(target = "agent_terminal::agent", iteration, %keys, "sending keys");
                    let index = self.push_step(StepRecord::keys(keys.as_str(), reasoning));
                    let result = self.observe(self.terminal.send_keys(&keys), cancel).await;
                    self.record_capture(index, "send_keys", result)
                }
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
        }

        tracing::warn!(
            target = "agent_terminal::agent",
            max_iterations,
            "iteration cap reached without completion"
        );
        RunOutcome::IterationCapReached {
            iterations: max_iterations,
        }
    }

    /// Await a capture, aborting it if the run is stopped meanwhile.
    async fn observe<F>(
        &self,
        capture: F,
        cancel: &CancellationToken,
    ) -> Result<CaptureOutcome, BridgeError>
    where
        F: Future<Output = Result<CaptureOutcome, BridgeError>>,
    {
        tokio::pin!(capture);
        // Polling the capture first arms it before any abort.
        tokio::select! {
            biased;
            result = &mut capture => result,
            _ = cancel.cancelled() => {
                self.terminal.abort_capture();
                capture.await
            }
        }
    }

    /// Fold a capture result into the step log and history. Returns an
    /// outcome when the run has to end here.
    fn record_capture(
        &self,
        index: usize,
        tool: &str,
        result: Result<CaptureOutcome, BridgeError>,
    ) -> Option<RunOutcome> {
        match result {
            Ok(capture) => {
                let status = StepStatus::from(capture.status);
                self.update_step(index, |step| {
                    step.status = status;
                    step.output = Some(capture.output.clone());
                });
                let output = if capture.output.is_empty() {
                    EMPTY_OUTPUT
                } else {
                    capture.output.as_str()
                };
                self.push_history(HistoryEntry::tool_result(
                    tool,
                    json!({"status": capture.status, "output": output}),
                ));
                if capture.status == CaptureStatus::Timeout {
                    tracing::warn!(target = "agent_terminal::agent", tool, "capture timed out; stopping run");
                    self.push_history(HistoryEntry::user(TIMEOUT_NOTE));
                    self.control.stop();
                }
                None
            }
            Err(error) => {
                let message = error.to_string();
                tracing::warn!(target = "agent_terminal::agent", tool, %message, "terminal unavailable");
                self.update_step(index, |step| {
                    step.status = StepStatus::Error;
                    step.output = Some(message.clone());
                });
                self.push_history(HistoryEntry::tool_result(tool, json!({"error": message})));
                Some(RunOutcome::Error { message })
            }
        }
    }

    fn push_history(&self, entry: HistoryEntry) {
        self.inner.lock().history.push(entry);
    }

    fn push_step(&self, step: StepRecord) -> usize {
        let index = {
            let mut inner = self.inner.lock();
            inner.steps.push(step.clone());
            inner.steps.len() - 1
        };
        let _ = self.step_tx.send(StepEvent { index, step });
        index
    }

    fn update_step(&self, index: usize, apply: impl FnOnce(&mut StepRecord)) {
        let step = {
            let mut inner = self.inner.lock();
            let Some(step) = inner.steps.get_mut(index) else {
                return;
            };
            apply(step);
            step.clone()
        };
        let _ = self.step_tx.send(StepEvent { index, step });
    }
}
