use std::{
    env,
    io::{Read, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;

const DEFAULT_LANG: &str = "en_US.UTF-8";
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct PtySession {
    master: Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send>>>,
    child_pid: Option<u32>,
    reaped: Arc<AtomicBool>,
}

fn resolve_home() -> Option<PathBuf> {
    env::var_os("HOME")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
}

/// Build the command for the user's login shell, or `shell` when given.
///
/// The environment is inherited, with `TERM=xterm-256color` and resolved
/// `HOME`/`LANG` set explicitly.
fn shell_command(shell: Option<&str>) -> CommandBuilder {
    let mut cmd = match shell {
        Some(shell) => {
            let mut cmd = CommandBuilder::new(shell);
            cmd.arg("-l");
            cmd
        }
        None => CommandBuilder::new_default_prog(),
    };

    cmd.env("TERM", "xterm-256color");
    let lang = env::var("LANG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LANG.to_string());
    cmd.env("LANG", lang);
    if let Some(home) = resolve_home() {
        cmd.env("HOME", &home);
        cmd.cwd(home);
    }
    cmd
}

impl PtySession {
    /// Spawn a login shell in a fresh pseudo-terminal of `cols`x`rows`.
    ///
    /// Output is read on a dedicated thread and delivered through the
    /// returned receiver, which closes when the terminal hits EOF.
    pub fn spawn_shell(
        shell: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let child = pair
            .slave
            .spawn_command(shell_command(shell))
            .context("failed to spawn shell")?;
        let child_pid = child.process_id();
        // Release our copy of the slave so EOF reaches the reader once the
        // shell exits.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        let (tx, rx) = mpsc::channel(256);
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        tracing::info!(
            target = "agent_terminal::pty",
            pid = ?child_pid,
            cols,
            rows,
            "local shell spawned"
        );

        Ok((
            Self {
                master: Mutex::new(pair.master),
                writer: Arc::new(Mutex::new(writer)),
                child: Arc::new(Mutex::new(child)),
                child_pid,
                reaped: Arc::new(AtomicBool::new(false)),
            },
            rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.child_pid
    }

    pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock();
        guard.write_all(bytes)?;
        guard.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to resize pty")
    }

    /// Check if the child process has exited without blocking.
    fn has_exited(&self) -> bool {
        if self.reaped.load(Ordering::Relaxed) {
            return true;
        }

        {
            let mut child = self.child.lock();
            match child.try_wait() {
                Ok(Some(_status)) => {
                    self.reaped.store(true, Ordering::Relaxed);
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    // ECHILD: someone else already reaped it.
                    tracing::debug!(
                        target = "agent_terminal::pty",
                        pid = ?self.child_pid,
                        error = %e,
                        "try_wait failed; treating shell as exited"
                    );
                    self.reaped.store(true, Ordering::Relaxed);
                    return true;
                }
            }
        }

        #[cfg(unix)]
        if let Some(pid) = self.child_pid {
            // SAFETY: signal 0 only checks that the process exists.
            let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
            if ret == -1 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno == libc::ESRCH {
                    self.reaped.store(true, Ordering::Relaxed);
                    return true;
                }
            }
        }

        false
    }

    /// Wait for the shell to exit and return its exit code.
    pub async fn wait_exit(&self) -> Option<u32> {
        loop {
            {
                let mut child = self.child.lock();
                match child.try_wait() {
                    Ok(Some(status)) => {
                        self.reaped.store(true, Ordering::Relaxed);
                        return Some(status.exit_code());
                    }
                    Ok(None) => {}
                    Err(_) => {
                        self.reaped.store(true, Ordering::Relaxed);
                        return None;
                    }
                }
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        let mut child = self.child.lock();
        let _ = child.kill();
        let _ = child.wait();
        self.reaped.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::PtySession;
    use tokio::time::{timeout, Duration};

    async fn read_until(rx: &mut tokio::sync::mpsc::Receiver<Vec<u8>>, needle: &str) -> String {
        let mut collected = Vec::new();
        while let Ok(Some(chunk)) = timeout(Duration::from_secs(5), rx.recv()).await {
            collected.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&collected).contains(needle) {
                break;
            }
        }
        String::from_utf8_lossy(&collected).to_string()
    }

    #[test]
    fn session_can_be_shared_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PtySession>();
    }

    #[tokio::test]
    async fn spawn_shell_and_echo() {
        let (pty, mut rx) = PtySession::spawn_shell(Some("/bin/sh"), 80, 24).unwrap();
        pty.write_all(b"echo pty-$((40+2))\r").unwrap();
        let output = read_until(&mut rx, "pty-42").await;
        assert!(output.contains("pty-42"), "output was {output:?}");
        let _ = pty.shutdown();
    }

    #[tokio::test]
    async fn shell_sees_term_variable() {
        let (pty, mut rx) = PtySession::spawn_shell(Some("/bin/sh"), 80, 24).unwrap();
        pty.write_all(b"echo term=$TERM\r").unwrap();
        let output = read_until(&mut rx, "term=xterm-256color").await;
        assert!(output.contains("term=xterm-256color"), "output was {output:?}");
        let _ = pty.shutdown();
    }

    #[tokio::test]
    async fn resize_does_not_error() {
        let (pty, _rx) = PtySession::spawn_shell(Some("/bin/sh"), 80, 24).unwrap();
        assert!(pty.resize(120, 40).is_ok());
        let _ = pty.shutdown();
    }

    #[tokio::test]
    async fn exit_is_observed() {
        let (pty, mut rx) = PtySession::spawn_shell(Some("/bin/sh"), 80, 24).unwrap();
        pty.write_all(b"exit 3\r").unwrap();
        while let Ok(Some(_)) = timeout(Duration::from_secs(5), rx.recv()).await {}
        assert_eq!(pty.wait_exit().await, Some(3));
        assert!(pty.has_exited());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (pty, mut rx) = PtySession::spawn_shell(Some("/bin/sh"), 80, 24).unwrap();
        assert!(pty.shutdown().is_ok());
        assert!(pty.shutdown().is_ok());
        assert!(pty.has_exited());
        let result = timeout(Duration::from_secs(2), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(result.is_ok());
    }
}
