//! Output capture on top of a session's live output stream.
//!
//! Two modes share one pending slot per session:
//!
//! - **Sentinel**: the command is followed by a `printf` of a unique marker;
//!   output accumulates until the marker shows up at the start of a line or
//!   the deadline passes.
//! - **Sample**: output accumulates for a fixed quiescence window after raw
//!   keystrokes were sent.
//!
//! Whichever of match, deadline or [`CaptureEngine::abort`] gets to the
//! pending slot first resolves it; the others find the slot empty.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::helpers::strip_ansi;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SAMPLE_WINDOW: Duration = Duration::from_secs(3);
pub const ABORTED_PLACEHOLDER: &str = "(aborted by user)";

const MARKER_PREFIX: &str = "__AGENT_DONE_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Done,
    Timeout,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub status: CaptureStatus,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureMode {
    Sentinel { marker: String },
    Sample,
}

/// A fresh marker unlikely to appear in real output.
pub fn new_marker() -> String {
    format!("{MARKER_PREFIX}{}__", uuid::Uuid::new_v4().simple())
}

/// The input line that runs `command` and then prints `marker` on a line of
/// its own.
///
/// The marker is written as two adjacent quoted halves so the terminal's echo
/// of the typed line never contains it verbatim; only the `printf` output does.
/// A trailing comment or `;` is dropped and a trailing `&` keeps its job in
/// the background, so the marker always runs.
pub fn wrap_command(command: &str, marker: &str) -> String {
    let mid = marker.len() / 2;
    let (head, tail) = marker.split_at(mid);
    let body = strip_trailing_comment(command)
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    let separator = if body.is_empty() {
        ""
    } else if body.ends_with('&') && !body.ends_with("&&") {
        " "
    } else {
        "; "
    };
    format!("{body}{separator}printf '\\n%s\\n' '{head}''{tail}'\r")
}

/// Cut an unquoted `#` comment off the end of a command line.
fn strip_trailing_comment(command: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut previous: Option<char> = None;
    for (idx, c) in command.char_indices() {
        if escaped {
            escaped = false;
            previous = Some(c);
            continue;
        }
        match (quote, c) {
            (Some('\''), '\'') => quote = None,
            (Some('\''), _) => {}
            (_, '\\') => escaped = true,
            (Some(_), '"') => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '#')
                if previous.map_or(true, |p| p.is_whitespace() || matches!(p, ';' | '&' | '|')) =>
            {
                return &command[..idx];
            }
            _ => {}
        }
        previous = Some(c);
    }
    command
}

/// Look for `marker` at the start of a line in already-scrubbed output.
///
/// On a match returns the text before it minus the first line (the echoed
/// command), trimmed.
pub fn extract_sentinel_output(clean: &str, marker: &str) -> Option<String> {
    let needle = format!("\n{marker}");
    let idx = clean.find(&needle)?;
    let before = &clean[..idx];
    let body = before.split_once('\n').map_or("", |(_, rest)| rest);
    Some(body.trim().to_string())
}

struct PendingCapture {
    id: u64,
    mode: CaptureMode,
    buffer: Vec<u8>,
    resolver: oneshot::Sender<CaptureOutcome>,
    timer: Option<JoinHandle<()>>,
}

impl PendingCapture {
    fn cleaned(&self) -> String {
        strip_ansi(&String::from_utf8_lossy(&self.buffer))
    }

    fn resolve(mut self, status: CaptureStatus, output: String) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let _ = self.resolver.send(CaptureOutcome { status, output });
    }
}

#[derive(Default)]
struct CaptureSlot {
    next_id: u64,
    pending: Option<PendingCapture>,
}

/// Per-session capture state. Cheap to clone; clones share the slot.
#[derive(Clone, Default)]
pub struct CaptureEngine {
    inner: Arc<Mutex<CaptureSlot>>,
}

impl CaptureEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a capture that resolves by match (sentinel only), by `deadline`,
    /// or by [`abort`](Self::abort).
    ///
    /// Only one capture may be pending; callers await each capture before
    /// starting the next. A capture still pending here is resolved as aborted.
    pub fn begin(&self, mode: CaptureMode, deadline: Duration) -> oneshot::Receiver<CaptureOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.inner.lock();
        if let Some(stale) = slot.pending.take() {
            tracing::warn!(
                target = "agent_terminal::capture",
                id = stale.id,
                "capture started while another was pending; aborting the older one"
            );
            let output = stale.cleaned().trim().to_string();
            stale.resolve(CaptureStatus::Aborted, output);
        }

        slot.next_id += 1;
        let id = slot.next_id;
        let engine = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            engine.expire(id);
        });

        slot.pending = Some(PendingCapture {
            id,
            mode,
            buffer: Vec::new(),
            resolver: tx,
            timer: Some(timer),
        });
        rx
    }

    /// Feed a chunk of raw backend output.
    pub fn feed(&self, bytes: &[u8]) {
        let mut slot = self.inner.lock();
        let Some(pending) = slot.pending.as_mut() else {
            return;
        };
        pending.buffer.extend_from_slice(bytes);

        let CaptureMode::Sentinel { marker } = &pending.mode else {
            return;
        };
        let Some(output) = extract_sentinel_output(&pending.cleaned(), marker) else {
            return;
        };
        if let Some(done) = slot.pending.take() {
            tracing::debug!(target = "agent_terminal::capture", id = done.id, "sentinel matched");
            done.resolve(CaptureStatus::Done, output);
        }
    }

    /// Resolve the pending capture, if any, with what it has so far.
    /// Returns whether a capture was pending.
    pub fn abort(&self) -> bool {
        let Some(pending) = self.inner.lock().pending.take() else {
            return false;
        };
        let mut output = pending.cleaned().trim().to_string();
        if output.is_empty() && pending.mode == CaptureMode::Sample {
            output = ABORTED_PLACEHOLDER.to_string();
        }
        tracing::debug!(target = "agent_terminal::capture", id = pending.id, "capture aborted");
        pending.resolve(CaptureStatus::Aborted, output);
        true
    }

    #[cfg(test)]
    fn is_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    fn expire(&self, id: u64) {
        let mut slot = self.inner.lock();
        if slot.pending.as_ref().map(|p| p.id) != Some(id) {
            return;
        }
        let Some(mut pending) = slot.pending.take() else {
            return;
        };
        // Our own task is the one running; don't abort it mid-resolve.
        pending.timer = None;
        let output = pending.cleaned().trim().to_string();
        let status = match pending.mode {
            CaptureMode::Sentinel { .. } => {
                tracing::info!(
                    target = "agent_terminal::capture",
                    id,
                    "command did not finish before deadline"
                );
                CaptureStatus::Timeout
            }
            CaptureMode::Sample => CaptureStatus::Done,
        };
        pending.resolve(status, output);
    }
}
