//! Pause/resume/stop for one agent run.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Running,
    Paused,
    Stopped,
}

/// Three-state run control. `Stopped` is a latch for the current run: it
/// cancels the run's token and wakes any pause wait.
pub struct RunControl {
    mode: watch::Sender<RunMode>,
    cancel: Mutex<CancellationToken>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (mode, _) = watch::channel(RunMode::Running);
        Self {
            mode,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Arm for a new run and hand back its cancellation token.
    pub fn reset(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        self.mode.send_replace(RunMode::Running);
        token
    }

    pub fn mode(&self) -> RunMode {
        *self.mode.borrow()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Takes effect at the top of the next iteration.
    pub fn pause(&self) -> bool {
        self.mode.send_if_modified(|mode| {
            if *mode == RunMode::Running {
                *mode = RunMode::Paused;
                true
            } else {
                false
            }
        })
    }

    pub fn resume(&self) -> bool {
        self.mode.send_if_modified(|mode| {
            if *mode == RunMode::Paused {
                *mode = RunMode::Running;
                true
            } else {
                false
            }
        })
    }

    pub fn stop(&self) {
        self.mode.send_if_modified(|mode| {
            if *mode == RunMode::Stopped {
                false
            } else {
                *mode = RunMode::Stopped;
                true
            }
        });
        self.cancel.lock().cancel();
    }

    /// Block while paused. Returns `Running` after a resume or `Stopped`
    /// after a stop; never stays parked once the run is stopped.
    pub async fn wait_while_paused(&self) -> RunMode {
        let mut rx = self.mode.subscribe();
        let token = self.token();
        tokio::select! {
            result = rx.wait_for(|mode| *mode != RunMode::Paused) => match result {
                Ok(mode) => *mode,
                Err(_) => RunMode::Stopped,
            },
            _ = token.cancelled() => RunMode::Stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn pause_and_resume_only_apply_from_the_right_state() {
        let control = RunControl::new();
        assert!(!control.resume());
        assert!(control.pause());
        assert!(!control.pause());
        assert_eq!(control.mode(), RunMode::Paused);
        assert!(control.resume());
        assert!(!control.resume());
        assert_eq!(control.mode(), RunMode::Running);
    }

    #[test]
    fn stop_is_a_latch_and_idempotent() {
        let control = RunControl::new();
        let token = control.reset();
        control.stop();
        control.stop();
        assert_eq!(control.mode(), RunMode::Stopped);
        assert!(token.is_cancelled());
        assert!(!control.pause());
        assert!(!control.resume());
    }

    #[test]
    fn reset_rearms_with_a_fresh_token() {
        let control = RunControl::new();
        let first = control.reset();
        control.stop();
        let second = control.reset();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(control.mode(), RunMode::Running);
    }

    #[tokio::test]
    async fn stop_while_paused_releases_the_wait() {
        let control = Arc::new(RunControl::new());
        control.reset();
        control.pause();

        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.stop();
        let mode = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mode, RunMode::Stopped);
    }

    #[tokio::test]
    async fn resume_releases_the_wait() {
        let control = Arc::new(RunControl::new());
        control.reset();
        control.pause();

        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        control.resume();
        let mode = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mode, RunMode::Running);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_not_paused() {
        let control = RunControl::new();
        control.reset();
        assert_eq!(control.wait_while_paused().await, RunMode::Running);
    }
}
