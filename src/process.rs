use crate::config::Service;
use crate::log::LogSink;
use chrono::{DateTime, Local};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process already running")]
    AlreadyRunning,
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Point-in-time view of a handle, taken under its lock.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub state: ProcessState,
    pub pid: u32,
    pub started_at: Option<DateTime<Local>>,
    pub exit_code: Option<i32>,
    pub restarts: u32,
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

struct Inner {
    state: ProcessState,
    pid: u32,
    started_at: Option<DateTime<Local>>,
    exit_code: Option<i32>,
    restarts: u32,
    stdout: Option<LogSink>,
    stderr: Option<LogSink>,
    /// Fires once per run when the child has been reaped.
    done: watch::Receiver<bool>,
    stdin_tx: Option<mpsc::Sender<String>>,
}

/// Lifecycle wrapper around one service's child process. All transitions go
/// through the handle's own lock; the lock is never held across an await.
/// The inner state is shared with the monitor task that reaps the child.
pub struct ProcessHandle {
    service: Service,
    inner: Arc<Mutex<Inner>>,
}

impl ProcessHandle {
    pub fn new(service: Service) -> Self {
        // Closed-and-true so that waiting on a never-started handle resolves
        let (done_tx, done_rx) = watch::channel(true);
        drop(done_tx);

        ProcessHandle {
            service,
            inner: Arc::new(Mutex::new(Inner {
                state: ProcessState::Stopped,
                pid: 0,
                started_at: None,
                exit_code: None,
                restarts: 0,
                stdout: None,
                stderr: None,
                done: done_rx,
                stdin_tx: None,
            })),
        }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Register the sinks the next run's output goes to.
    pub fn set_output(&self, stdout: LogSink, stderr: LogSink) {
        let mut inner = self.inner.lock().expect("process lock poisoned");
        inner.stdout = Some(stdout);
        inner.stderr = Some(stderr);
    }

    /// Launch the child via `sh -c` in its own process group and spawn the
    /// monitor task that reaps it.
    pub fn start(&self) -> Result<(), ProcessError> {
        let mut inner = self.inner.lock().expect("process lock poisoned");

        if !matches!(inner.state, ProcessState::Stopped | ProcessState::Failed) {
            return Err(ProcessError::AlreadyRunning);
        }
        inner.state = ProcessState::Starting;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.service.command)
            .current_dir(&self.service.working_dir)
            .envs(&self.service.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                inner.state = ProcessState::Failed;
                return Err(ProcessError::Spawn(e));
            }
        };

        inner.pid = child.id().unwrap_or(0);
        inner.started_at = Some(Local::now());
        inner.state = ProcessState::Running;

        let (done_tx, done_rx) = watch::channel(false);
        inner.done = done_rx;

        if let (Some(stdout), Some(sink)) = (child.stdout.take(), inner.stdout.take()) {
            tokio::spawn(copy_output(stdout, sink));
        }
        if let (Some(stderr), Some(sink)) = (child.stderr.take(), inner.stderr.take()) {
            tokio::spawn(copy_output(stderr, sink));
        }
        if let Some(stdin) = child.stdin.take() {
            let (tx, rx) = mpsc::channel::<String>(16);
            inner.stdin_tx = Some(tx);
            tokio::spawn(forward_stdin(stdin, rx));
        }

        drop(inner);

        let shared = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let status = child.wait().await;

            let mut inner = shared.lock().expect("process lock poisoned");
            inner.pid = 0;
            inner.started_at = None;
            inner.stdin_tx = None;
            inner.exit_code = Some(match &status {
                Ok(st) => st.code().unwrap_or(-1),
                Err(_) => -1,
            });
            inner.state = if inner.state == ProcessState::Stopping {
                ProcessState::Stopped
            } else {
                match &status {
                    Ok(st) if st.success() => ProcessState::Stopped,
                    _ => ProcessState::Failed,
                }
            };
            drop(inner);

            let _ = done_tx.send(true);
        });

        Ok(())
    }

    /// Stop the current run: SIGTERM the process group, then SIGKILL it if
    /// the child outlives the grace window. No-op unless starting/running.
    pub async fn stop(&self, grace: Duration) {
        let (pid, mut done) = {
            let mut inner = self.inner.lock().expect("process lock poisoned");
            if !matches!(inner.state, ProcessState::Starting | ProcessState::Running) {
                return;
            }
            inner.state = ProcessState::Stopping;
            (inner.pid, inner.done.clone())
        };

        signal_group(pid, Signal::SIGTERM);

        if tokio::time::timeout(grace, done.wait_for(|exited| *exited))
            .await
            .is_err()
        {
            signal_group(pid, Signal::SIGKILL);
            let _ = done.wait_for(|exited| *exited).await;
        }
    }

    /// The done-signal of the most recent run; observers see it flip to true
    /// exactly once per run.
    pub fn wait(&self) -> watch::Receiver<bool> {
        self.inner.lock().expect("process lock poisoned").done.clone()
    }

    /// Write a chunk to the child's stdin. Silently dropped when the child
    /// is not running.
    pub async fn send_stdin(&self, data: String) {
        let tx = {
            let inner = self.inner.lock().expect("process lock poisoned");
            inner.stdin_tx.clone()
        };
        if let Some(tx) = tx {
            let _ = tx.send(data).await;
        }
    }

    pub fn state(&self) -> ProcessState {
        self.inner.lock().expect("process lock poisoned").state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner.lock().expect("process lock poisoned").exit_code
    }

    pub fn restarts(&self) -> u32 {
        self.inner.lock().expect("process lock poisoned").restarts
    }

    pub fn increment_restarts(&self) {
        self.inner.lock().expect("process lock poisoned").restarts += 1;
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let inner = self.inner.lock().expect("process lock poisoned");
        ProcessSnapshot {
            state: inner.state,
            pid: inner.pid,
            started_at: inner.started_at,
            exit_code: inner.exit_code,
            restarts: inner.restarts,
        }
    }
}

fn signal_group(pid: u32, signal: Signal) {
    if pid == 0 {
        return;
    }
    // Negative pid targets the whole process group
    let _ = kill(Pid::from_raw(-(pid as i32)), signal);
}

async fn copy_output(mut reader: impl AsyncRead + Unpin, mut sink: LogSink) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.write(&buf[..n]),
        }
    }
}

async fn forward_stdin(
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::Receiver<String>,
) {
    while let Some(data) = rx.recv().await {
        if stdin.write_all(data.as_bytes()).await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }
}
