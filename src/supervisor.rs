use crate::config::RestartPolicy;
use crate::log::LogBus;
use crate::process::{ProcessHandle, ProcessState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const MIN_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Backoff before the n-th consecutive restart (1-indexed):
/// 1s, 2s, 4s, 8s, 16s, then capped at 30s.
pub fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(6);
    let delay = MIN_BACKOFF.saturating_mul(1u32 << exp);
    delay.min(MAX_BACKOFF)
}

/// Runs one monitor task per supervised service, restarting the child per
/// its policy. Monitors are cancelled before a user-initiated stop so a
/// pending restart cannot race it.
pub struct Supervisor {
    monitors: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor {
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Begin monitoring a running service. An existing monitor for the same
    /// name is cancelled first.
    pub fn start_monitoring(&self, handle: Arc<ProcessHandle>, bus: LogBus) {
        let name = handle.service().name.clone();
        let policy = handle.service().restart;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut monitors = self.monitors.lock().expect("supervisor lock poisoned");
            if let Some(old) = monitors.insert(name.clone(), cancel_tx) {
                let _ = old.send(true);
            }
        }

        tokio::spawn(monitor(name, handle, policy, bus, cancel_rx));
    }

    /// Cancel the monitor for a service, if any.
    pub fn stop_monitoring(&self, name: &str) {
        let mut monitors = self.monitors.lock().expect("supervisor lock poisoned");
        if let Some(cancel) = monitors.remove(name) {
            let _ = cancel.send(true);
        }
    }

    pub fn stop_all(&self) {
        let mut monitors = self.monitors.lock().expect("supervisor lock poisoned");
        for (_, cancel) in monitors.drain() {
            let _ = cancel.send(true);
        }
    }
}

async fn monitor(
    name: String,
    handle: Arc<ProcessHandle>,
    policy: RestartPolicy,
    bus: LogBus,
    mut cancel: watch::Receiver<bool>,
) {
    let mut consecutive_failures: u32 = 0;

    loop {
        let mut done = handle.wait();
        tokio::select! {
            _ = cancel.changed() => return,
            res = done.wait_for(|exited| *exited) => {
                if res.is_err() {
                    return;
                }
            }
        }

        let restart = match policy {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => {
                handle.exit_code().is_none_or(|code| code != 0)
                    || handle.state() == ProcessState::Failed
            }
            RestartPolicy::Never => false,
        };
        if !restart {
            return;
        }

        consecutive_failures += 1;
        tokio::select! {
            _ = cancel.changed() => return,
            _ = tokio::time::sleep(backoff_delay(consecutive_failures)) => {}
        }
        if *cancel.borrow() {
            return;
        }

        handle.increment_restarts();
        handle.set_output(bus.writer(&name), bus.stderr_writer(&name));
        if let Err(e) = handle.start() {
            // Stay in the loop; the next pass backs off longer
            eprintln!("failed to restart '{name}': {e}");
        }
    }
}
