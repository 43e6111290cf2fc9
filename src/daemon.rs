use crate::config::Config;
use crate::deps;
use crate::log::{LogBus, LogRecord};
use crate::process::{ProcessHandle, ProcessState};
use crate::protocol::ServiceStatus;
use crate::server::Server;
use crate::supervisor::Supervisor;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};

/// SIGTERM-to-SIGKILL grace window for a stopping service.
pub const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

/// Load-bearing owner of the process records, the log bus, and the config.
/// Lifecycle operations serialize on the write side of the process-map lock;
/// status and log reads share it.
pub struct Daemon {
    config: Config,
    processes: RwLock<HashMap<String, Arc<ProcessHandle>>>,
    bus: LogBus,
    supervisor: Supervisor,
    shutdown_tx: watch::Sender<bool>,
}

/// Run a daemon for the given config on a unix socket. Blocks until the
/// daemon is shut down by RPC or signal.
pub async fn run(config: Config, socket_path: PathBuf) -> color_eyre::Result<()> {
    let daemon = Arc::new(Daemon::new(config));
    Server::new(daemon, socket_path).run().await
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        let mut processes = HashMap::new();
        for (name, svc) in &config.services {
            processes.insert(name.clone(), Arc::new(ProcessHandle::new(svc.clone())));
        }

        let (shutdown_tx, _) = watch::channel(false);

        Daemon {
            config,
            processes: RwLock::new(processes),
            bus: LogBus::new(),
            supervisor: Supervisor::new(),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.config.services.contains_key(name)
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Start the targets plus their transitive dependencies, dependencies
    /// first. Empty targets start everything. Names that are unknown or
    /// fail to spawn land in the second list.
    pub async fn start_services(&self, targets: &[String]) -> (Vec<String>, Vec<String>) {
        let processes = self.processes.write().await;

        let order = deps::start_order(&self.config.services, targets);
        let mut started = Vec::new();
        let mut failed = Vec::new();

        for name in order {
            let Some(handle) = processes.get(&name) else {
                failed.push(name);
                continue;
            };
            match handle.state() {
                ProcessState::Stopped | ProcessState::Failed => {}
                _ => continue,
            }

            handle.set_output(self.bus.writer(&name), self.bus.stderr_writer(&name));
            match handle.start() {
                Ok(()) => {
                    self.supervisor
                        .start_monitoring(Arc::clone(handle), self.bus.clone());
                    started.push(name);
                }
                Err(e) => {
                    eprintln!("failed to start '{name}': {e}");
                    failed.push(name);
                }
            }
        }

        (started, failed)
    }

    /// Stop the targets plus their transitive dependents, dependents first.
    /// Empty targets stop everything. Monitors are cancelled before the
    /// processes so no queued restart can fire mid-stop.
    pub async fn stop_services(&self, targets: &[String]) -> Vec<String> {
        let processes = self.processes.write().await;

        let order = deps::stop_order(&self.config.services, targets);
        for name in &order {
            self.supervisor.stop_monitoring(name);
        }

        let mut stopped = Vec::new();
        for name in order {
            let Some(handle) = processes.get(&name) else {
                continue;
            };
            if matches!(
                handle.state(),
                ProcessState::Stopped | ProcessState::Failed
            ) {
                continue;
            }
            handle.stop(GRACEFUL_TIMEOUT).await;
            stopped.push(name);
        }

        stopped
    }

    /// Stop-then-start: exactly the services the stop sweep brought down
    /// are started again.
    pub async fn restart_services(&self, targets: &[String]) -> (Vec<String>, Vec<String>) {
        let stopped = self.stop_services(targets).await;
        self.start_services(&stopped).await
    }

    /// Stop everything and tell the RPC server to wind down.
    pub async fn shutdown(&self) -> Vec<String> {
        let stopped = self.stop_services(&[]).await;
        self.supervisor.stop_all();
        let _ = self.shutdown_tx.send(true);
        stopped
    }

    pub async fn status(&self) -> Vec<ServiceStatus> {
        let processes = self.processes.read().await;

        let mut statuses = Vec::new();
        for name in self.config.service_names() {
            let Some(handle) = processes.get(&name) else {
                continue;
            };
            let snap = handle.snapshot();
            statuses.push(ServiceStatus {
                name,
                state: snap.state.to_string(),
                pid: (snap.pid > 0).then_some(snap.pid),
                restarts: snap.restarts,
                started_at: snap
                    .started_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
                exit_code: snap.exit_code,
            });
        }
        statuses
    }

    /// Recent buffered log records; empty services means all of them.
    pub async fn logs(&self, services: &[String], count: usize) -> Vec<LogRecord> {
        let _processes = self.processes.read().await;
        let names = if services.is_empty() {
            self.config.service_names()
        } else {
            services.to_vec()
        };
        self.bus.lines(&names, count)
    }

    pub fn subscribe_logs(&self, services: &[String]) -> (u64, mpsc::Receiver<LogRecord>) {
        self.bus.subscribe(services)
    }

    pub fn unsubscribe_logs(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    /// Route attach stdin to a service's child. Unknown or stopped services
    /// swallow the data.
    pub async fn send_stdin(&self, service: &str, data: String) {
        let handle = {
            let processes = self.processes.read().await;
            processes.get(service).cloned()
        };
        if let Some(handle) = handle {
            handle.send_stdin(data).await;
        }
    }
}
