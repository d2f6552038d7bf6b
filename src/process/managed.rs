//! One managed child process: PTY spawn, output capture, stop escalation

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::watch;

use crate::core::{LogBuffer, Process};
use crate::process::{ProcessState, Status};

/// Grace period between SIGTERM and SIGKILL on stop.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A single supervised child with lifecycle state and PTY output capture.
///
/// The child is launched via `sh -c` in its own process group so stop signals
/// reach the shell's descendants. Output is preferred through a PTY (children
/// keep color and line buffering); if PTY allocation fails the child runs
/// with piped stdio instead. A reader thread pumps output into the log buffer
/// and a waiter thread observes the exit, records it, and closes the `done`
/// signal for that run session.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    config: Process,
    log: Arc<LogBuffer>,
    // Shared with the waiter thread, which records the exit after the
    // ManagedProcess itself may already be gone.
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    state: ProcessState,
    done: watch::Receiver<bool>,
}

/// Handles produced by a successful spawn, before the background threads
/// take them over.
struct Spawned {
    pid: u32,
    readers: Vec<Box<dyn Read + Send>>,
    waiter: ChildWaiter,
}

enum ChildWaiter {
    Pty {
        child: Box<dyn portable_pty::Child + Send + Sync>,
        // Dropped after wait() so the master fd is released on every exit path.
        master: Box<dyn MasterPty + Send>,
    },
    Piped {
        child: std::process::Child,
    },
}

struct ExitOutcome {
    code: i32,
    success: bool,
    message: String,
}

impl ChildWaiter {
    /// Block until the child exits, then release the PTY master (or let the
    /// pipe fds close with the child handle).
    fn wait(self) -> ExitOutcome {
        match self {
            ChildWaiter::Pty { mut child, master } => {
                let result = child.wait();
                drop(master);
                match result {
                    Ok(status) if status.success() => ExitOutcome {
                        code: 0,
                        success: true,
                        message: String::new(),
                    },
                    Ok(status) => {
                        let code = status.exit_code() as i32;
                        ExitOutcome {
                            code,
                            success: false,
                            message: format!("exit status {}", code),
                        }
                    }
                    Err(e) => ExitOutcome {
                        code: -1,
                        success: false,
                        message: e.to_string(),
                    },
                }
            }
            ChildWaiter::Piped { mut child } => match child.wait() {
                Ok(status) if status.success() => ExitOutcome {
                    code: 0,
                    success: true,
                    message: String::new(),
                },
                Ok(status) => ExitOutcome {
                    code: status.code().unwrap_or(-1),
                    success: false,
                    message: status.to_string(),
                },
                Err(e) => ExitOutcome {
                    code: -1,
                    success: false,
                    message: e.to_string(),
                },
            },
        }
    }
}

impl ManagedProcess {
    pub fn new(name: &str, config: Process, log: Arc<LogBuffer>) -> Self {
        // Start with an already-closed done signal: no session is active.
        let (done_tx, done_rx) = watch::channel(true);
        drop(done_tx);

        Self {
            name: name.to_string(),
            config,
            log,
            inner: Arc::new(Mutex::new(Inner {
                state: ProcessState::new(name),
                done: done_rx,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Launch the child. Fails if already Running. PTY first, pipes as
    /// fallback; a spawn failure on both paths leaves the process Failed.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.state.status == Status::Running {
            return Err(anyhow!("process {} is already running", self.name));
        }
        inner.state.status = Status::Starting;

        let spawned = match self.spawn_pty() {
            Ok(s) => s,
            Err(_) => match self.spawn_piped() {
                Ok(s) => s,
                Err(e) => {
                    inner.state.status = Status::Failed;
                    inner.state.last_error = e.to_string();
                    return Err(e).with_context(|| format!("starting process {}", self.name));
                }
            },
        };

        let (done_tx, done_rx) = watch::channel(false);
        inner.state.status = Status::Running;
        inner.state.pid = Some(spawned.pid);
        inner.state.started_at = Some(Local::now());
        inner.state.stopped_at = None;
        inner.state.last_error.clear();
        inner.state.exit_code = 0;
        inner.done = done_rx;
        drop(inner);

        for reader in spawned.readers {
            let log = Arc::clone(&self.log);
            thread::Builder::new()
                .name(format!("read-{}", self.name))
                .spawn(move || pump_output(reader, &log))
                .with_context(|| format!("spawning reader thread for {}", self.name))?;
        }

        let shared = Arc::clone(&self.inner);
        let waiter = spawned.waiter;
        thread::Builder::new()
            .name(format!("wait-{}", self.name))
            .spawn(move || {
                let outcome = waiter.wait();

                {
                    let mut inner = shared.lock();
                    inner.state.stopped_at = Some(Local::now());
                    inner.state.pid = None;

                    if outcome.success {
                        inner.state.exit_code = 0;
                        inner.state.status = Status::Stopped;
                    } else {
                        inner.state.exit_code = outcome.code;
                        if inner.state.status == Status::Stopping {
                            inner.state.status = Status::Stopped;
                        } else {
                            inner.state.status = Status::Failed;
                            inner.state.last_error = outcome.message;
                        }
                    }
                }

                // State is recorded before the session's done signal closes.
                let _ = done_tx.send(true);
            })
            .with_context(|| format!("spawning waiter thread for {}", self.name))?;

        Ok(())
    }

    fn spawn_pty(&self) -> Result<Spawned> {
        let pty = native_pty_system();
        let pair = pty.openpty(PtySize {
            rows: 24,
            cols: 120,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let mut cmd = CommandBuilder::new("sh");
        cmd.arg("-c");
        cmd.arg(&self.config.command);
        if !self.config.working_dir.is_empty() {
            cmd.cwd(&self.config.working_dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd)?;
        drop(pair.slave);

        let pid = child
            .process_id()
            .ok_or_else(|| anyhow!("spawned child has no pid"))?;
        let reader = pair.master.try_clone_reader()?;

        Ok(Spawned {
            pid,
            readers: vec![reader],
            waiter: ChildWaiter::Pty {
                child,
                master: pair.master,
            },
        })
    }

    fn spawn_piped(&self) -> Result<Spawned> {
        let mut cmd = std::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&self.config.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, same as the PTY session leader gives us.
            .process_group(0);

        if !self.config.working_dir.is_empty() {
            cmd.current_dir(&self.config.working_dir);
        }
        cmd.envs(&self.config.env);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let mut readers: Vec<Box<dyn Read + Send>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(Box::new(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(Box::new(stderr));
        }

        Ok(Spawned {
            pid,
            readers,
            waiter: ChildWaiter::Piped { child },
        })
    }

    /// Stop the child: SIGTERM to the process group, escalate to SIGKILL
    /// after the grace period. No-op unless Starting or Running.
    pub async fn stop(&self) -> Result<()> {
        let (pid, done) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state.status, Status::Running | Status::Starting) {
                return Ok(());
            }
            inner.state.status = Status::Stopping;
            (inner.state.pid, inner.done.clone())
        };

        let Some(pid) = pid else {
            return Ok(());
        };
        let pgid = Pid::from_raw(pid as i32);

        let _ = signal::killpg(pgid, Signal::SIGTERM);

        if tokio::time::timeout(STOP_TIMEOUT, wait_done(done.clone()))
            .await
            .is_err()
        {
            let _ = signal::killpg(pgid, Signal::SIGKILL);
            wait_done(done).await;
        }
        Ok(())
    }

    /// The done signal for the current run session. Already closed when no
    /// session is active.
    pub fn wait(&self) -> watch::Receiver<bool> {
        self.inner.lock().done.clone()
    }

    /// Block until the current session's child has exited (immediately if
    /// none is running).
    pub async fn exited(&self) {
        wait_done(self.wait()).await;
    }

    /// Consistent snapshot of the runtime state.
    pub fn state(&self) -> ProcessState {
        self.inner.lock().state.clone()
    }

    /// Record a transition not driven by the child itself (Retrying,
    /// cascaded failure).
    pub fn set_status(&self, status: Status) {
        self.inner.lock().state.status = status;
    }

    pub fn set_error(&self, error: &str) {
        self.inner.lock().state.last_error = error.to_string();
    }

    pub fn set_retry_state(&self, count: u32, next_retry_at: chrono::DateTime<Local>) {
        let mut inner = self.inner.lock();
        inner.state.retry_count = count;
        inner.state.next_retry_at = Some(next_retry_at);
    }

    pub fn reset_retry(&self) {
        let mut inner = self.inner.lock();
        inner.state.retry_count = 0;
        inner.state.next_retry_at = None;
    }
}

/// Resolve once the session's done flag is raised; a dropped sender counts
/// as done too.
pub(crate) async fn wait_done(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|done| *done).await;
}

/// Pump a raw output stream into the log buffer, line by line. Partial lines
/// are held back until their newline arrives so readers never see torn lines.
fn pump_output(mut reader: Box<dyn Read + Send>, log: &LogBuffer) {
    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    log.write_bytes(&line);
                }
            }
            // PTY masters report EIO once the child side is gone.
            Err(_) => break,
        }
    }

    if !pending.is_empty() {
        log.write_bytes(&pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn test_process(command: &str) -> (Arc<ManagedProcess>, Arc<LogBuffer>) {
        let log = Arc::new(LogBuffer::new(100));
        let proc = Arc::new(ManagedProcess::new(
            "test",
            Process {
                command: command.to_string(),
                ..Default::default()
            },
            Arc::clone(&log),
        ));
        (proc, log)
    }

    async fn wait_exit(proc: &Arc<ManagedProcess>) {
        timeout(Duration::from_secs(5), proc.exited())
            .await
            .expect("process did not exit in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_and_exit() {
        let (proc, log) = test_process("echo hello");

        proc.start().unwrap();
        let state = proc.state();
        assert_eq!(proc.name(), "test");
        assert_eq!(state.status, Status::Running);
        assert!(state.pid.is_some());

        wait_exit(&proc).await;

        let state = proc.state();
        assert_eq!(state.status, Status::Stopped);
        assert_eq!(state.exit_code, 0);
        assert!(state.stopped_at.is_some());

        // Give the reader thread a moment to drain the last chunk.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!log.all().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_and_stop() {
        let (proc, _log) = test_process("sleep 3600");

        proc.start().unwrap();
        assert_eq!(proc.state().status, Status::Running);

        proc.stop().await.unwrap();
        wait_exit(&proc).await;
        assert_eq!(proc.state().status, Status::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_command_records_exit_code() {
        let (proc, _log) = test_process("exit 42");

        proc.start().unwrap();
        wait_exit(&proc).await;

        let state = proc.state();
        assert_eq!(state.status, Status::Failed);
        assert_eq!(state.exit_code, 42);
        assert!(!state.last_error.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn nonexistent_command_fails_after_shell_start() {
        let (proc, _log) = test_process("this_command_does_not_exist_12345");

        // sh itself starts fine, then exits non-zero.
        proc.start().unwrap();
        wait_exit(&proc).await;

        let state = proc.state();
        assert_eq!(state.status, Status::Failed);
        assert_ne!(state.exit_code, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn double_start_rejected() {
        let (proc, _log) = test_process("sleep 3600");

        proc.start().unwrap();
        let err = proc.start().unwrap_err();
        assert!(err.to_string().contains("already running"));

        proc.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_when_not_running_is_noop() {
        let (proc, _log) = test_process("echo hi");
        proc.stop().await.unwrap();
        assert_eq!(proc.state().status, Status::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_without_session_is_closed() {
        let (proc, _log) = test_process("echo hi");
        // Must resolve immediately: no session has ever run.
        timeout(Duration::from_millis(100), proc.exited())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn uptime_advances_while_running() {
        let (proc, _log) = test_process("sleep 3600");

        proc.start().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(proc.state().uptime() >= Duration::from_millis(100));

        proc.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn output_capture_multiple_lines() {
        let (proc, log) = test_process("echo line1 && echo line2 && echo line3");

        proc.start().unwrap();
        wait_exit(&proc).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(log.all().len() >= 3, "got lines: {:?}", log.all());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn working_dir_applied() {
        let log = Arc::new(LogBuffer::new(100));
        let proc = Arc::new(ManagedProcess::new(
            "test",
            Process {
                command: "pwd".into(),
                working_dir: "/tmp".into(),
                ..Default::default()
            },
            Arc::clone(&log),
        ));

        proc.start().unwrap();
        wait_exit(&proc).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let lines = log.all();
        // macOS resolves /tmp to /private/tmp.
        assert!(
            lines.iter().any(|l| l.contains("/tmp")),
            "expected /tmp in output, got: {:?}",
            lines
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn env_overrides_applied() {
        let log = Arc::new(LogBuffer::new(100));
        let mut env = std::collections::BTreeMap::new();
        env.insert("SHEPHERD_TEST_VAR".to_string(), "hello_from_shepherd".to_string());
        let proc = Arc::new(ManagedProcess::new(
            "test",
            Process {
                command: "echo $SHEPHERD_TEST_VAR".into(),
                env,
                ..Default::default()
            },
            Arc::clone(&log),
        ));

        proc.start().unwrap();
        wait_exit(&proc).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let lines = log.all();
        assert!(
            lines.iter().any(|l| l.contains("hello_from_shepherd")),
            "expected env var in output, got: {:?}",
            lines
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_after_exit() {
        let (proc, _log) = test_process("echo once");

        proc.start().unwrap();
        wait_exit(&proc).await;
        assert_eq!(proc.state().status, Status::Stopped);

        // A finished process can be started again with a fresh session.
        proc.start().unwrap();
        wait_exit(&proc).await;
        assert_eq!(proc.state().status, Status::Stopped);
    }
}
