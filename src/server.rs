use crate::daemon::Daemon;
use crate::protocol::{
    self, AttachParams, AttachResult, DownParams, DownResult, LogEntry, LogsParams, LogsResult,
    METHOD_ATTACH, METHOD_DOWN, METHOD_LOG, METHOD_LOGS, METHOD_NOT_FOUND, METHOD_RESTART,
    METHOD_SHUTDOWN, METHOD_STATUS, METHOD_STDIN, METHOD_UP, PARSE_ERROR, Request, Response,
    RestartParams, RestartResult, SERVICE_NOT_FOUND, ShutdownResult, StatusResult, StdinParams,
    UpParams, UpResult, INTERNAL_ERROR, INVALID_PARAMS,
};
use serde::Serialize;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Tail length used when a logs/attach request does not name one.
pub const DEFAULT_LOG_LINES: usize = 100;

/// Line-delimited JSON-RPC 2.0 server on a unix socket. One reader task per
/// connection; all of a connection's writes funnel through a single writer
/// task so responses and pushed notifications never interleave.
pub struct Server {
    daemon: Arc<Daemon>,
    socket_path: PathBuf,
}

impl Server {
    pub fn new(daemon: Arc<Daemon>, socket_path: PathBuf) -> Self {
        Server {
            daemon,
            socket_path,
        }
    }

    /// Bind the socket and serve until shutdown. The socket file is
    /// owner-only and removed on exit.
    pub async fn run(&self) -> color_eyre::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;

        let mut shutdown_rx = self.daemon.subscribe_shutdown();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept = listener.accept() => {
                    let Ok((stream, _addr)) = accept else { continue };
                    let daemon = Arc::clone(&self.daemon);
                    let conn_shutdown = self.daemon.subscribe_shutdown();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(daemon, stream, conn_shutdown).await {
                            eprintln!("connection error: {e}");
                        }
                    });
                }
                _ = shutdown_rx.changed() => break,
                _ = shutdown_signal() => {
                    self.daemon.shutdown().await;
                    break;
                }
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

async fn shutdown_signal() {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).unwrap();
    let mut sigint =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

/// What a dispatched request asks the connection loop to do after the
/// response goes out.
struct Dispatched {
    response: Response,
    /// Subscription to bridge into `log` notifications.
    follow: Option<(u64, mpsc::Receiver<crate::log::LogRecord>)>,
    /// Service to route subsequent `stdin` notifications to.
    attach: Option<String>,
    close: bool,
}

impl Dispatched {
    fn reply(response: Response) -> Self {
        Dispatched {
            response,
            follow: None,
            attach: None,
            close: false,
        }
    }
}

async fn handle_connection(
    daemon: Arc<Daemon>,
    stream: UnixStream,
    mut shutdown_rx: watch::Receiver<bool>,
) -> color_eyre::Result<()> {
    let (read_half, write_half) = stream.into_split();

    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);
    let writer = tokio::spawn(write_outgoing(write_half, out_rx));

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut attached: Option<String> = None;

    loop {
        line.clear();
        let read = tokio::select! {
            _ = shutdown_rx.changed() => break,
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if line.trim().is_empty() {
            continue;
        }

        let req = match protocol::decode_request(&line) {
            Ok(req) => req,
            Err(_) => {
                let resp = Response::failure(PARSE_ERROR, "invalid JSON", None);
                if send_response(&out_tx, &resp).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if req.is_notification() {
            handle_notification(&daemon, &req, &attached).await;
            continue;
        }

        let dispatched = dispatch(&daemon, &req).await;
        if send_response(&out_tx, &dispatched.response).await.is_err() {
            break;
        }

        // Only now that the response is queued may notifications start
        if let Some((sub_id, rx)) = dispatched.follow {
            spawn_log_forwarder(
                Arc::clone(&daemon),
                sub_id,
                rx,
                out_tx.clone(),
                shutdown_rx.clone(),
            );
        }
        if dispatched.attach.is_some() {
            attached = dispatched.attach;
        }
        if dispatched.close {
            break;
        }
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn handle_notification(daemon: &Arc<Daemon>, req: &Request, attached: &Option<String>) {
    if req.method != METHOD_STDIN {
        return;
    }
    let Some(service) = attached else { return };
    if let Ok(params) = req.parse_params::<StdinParams>() {
        daemon.send_stdin(service, params.data).await;
    }
}

async fn dispatch(daemon: &Arc<Daemon>, req: &Request) -> Dispatched {
    // Requests carry a non-null integer id by definition
    let id = req.id.unwrap_or(0);

    match req.method.as_str() {
        METHOD_UP => {
            let params: UpParams = match req.parse_params() {
                Ok(p) => p,
                Err(e) => return invalid_params(e, id),
            };
            let (started, failed) = daemon.start_services(&params.services).await;
            Dispatched::reply(respond(&UpResult { started, failed }, id))
        }
        METHOD_DOWN => {
            let params: DownParams = match req.parse_params() {
                Ok(p) => p,
                Err(e) => return invalid_params(e, id),
            };
            let stopped = daemon.stop_services(&params.services).await;
            Dispatched::reply(respond(&DownResult { stopped }, id))
        }
        METHOD_SHUTDOWN => {
            let stopped = daemon.shutdown().await;
            let mut dispatched = Dispatched::reply(respond(&ShutdownResult { stopped }, id));
            dispatched.close = true;
            dispatched
        }
        METHOD_STATUS => {
            let services = daemon.status().await;
            Dispatched::reply(respond(&StatusResult { services }, id))
        }
        METHOD_RESTART => {
            let params: RestartParams = match req.parse_params() {
                Ok(p) => p,
                Err(e) => return invalid_params(e, id),
            };
            let (restarted, failed) = daemon.restart_services(&params.services).await;
            Dispatched::reply(respond(&RestartResult { restarted, failed }, id))
        }
        METHOD_LOGS => {
            let params: LogsParams = match req.parse_params() {
                Ok(p) => p,
                Err(e) => return invalid_params(e, id),
            };
            for service in &params.services {
                if !daemon.has_service(service) {
                    return Dispatched::reply(Response::failure(
                        SERVICE_NOT_FOUND,
                        format!("service not found: {service}"),
                        Some(id),
                    ));
                }
            }

            let count = if params.lines == 0 {
                DEFAULT_LOG_LINES
            } else {
                params.lines
            };
            let lines: Vec<LogEntry> = daemon
                .logs(&params.services, count)
                .await
                .into_iter()
                .map(LogEntry::from)
                .collect();

            let mut dispatched = Dispatched::reply(respond(&LogsResult { lines }, id));
            if params.follow {
                dispatched.follow = Some(daemon.subscribe_logs(&params.services));
            }
            dispatched
        }
        METHOD_ATTACH => {
            let params: AttachParams = match req.parse_params() {
                Ok(p) => p,
                Err(e) => return invalid_params(e, id),
            };
            if !daemon.has_service(&params.service) {
                return Dispatched::reply(Response::failure(
                    SERVICE_NOT_FOUND,
                    format!("service not found: {}", params.service),
                    Some(id),
                ));
            }

            let services = vec![params.service.clone()];
            let lines: Vec<LogEntry> = daemon
                .logs(&services, DEFAULT_LOG_LINES)
                .await
                .into_iter()
                .map(LogEntry::from)
                .collect();

            let mut dispatched = Dispatched::reply(respond(&AttachResult { lines }, id));
            dispatched.follow = Some(daemon.subscribe_logs(&services));
            dispatched.attach = Some(params.service);
            dispatched
        }
        _ => Dispatched::reply(Response::failure(
            METHOD_NOT_FOUND,
            "method not found",
            Some(id),
        )),
    }
}

fn respond<T: Serialize>(result: &T, id: i64) -> Response {
    Response::success(result, id)
        .unwrap_or_else(|e| Response::failure(INTERNAL_ERROR, e.to_string(), Some(id)))
}

fn invalid_params(err: protocol::ProtocolError, id: i64) -> Dispatched {
    Dispatched::reply(Response::failure(
        INVALID_PARAMS,
        err.to_string(),
        Some(id),
    ))
}

async fn send_response(
    out_tx: &mpsc::Sender<Vec<u8>>,
    resp: &Response,
) -> Result<(), protocol::ProtocolError> {
    let bytes = protocol::encode_response(resp)?;
    out_tx
        .send(bytes)
        .await
        .map_err(|e| protocol::ProtocolError::Io(std::io::Error::other(e.to_string())))
}

/// Bridge a log subscription into `log` notifications until the daemon
/// shuts down, the subscription closes, or the connection goes away.
fn spawn_log_forwarder(
    daemon: Arc<Daemon>,
    sub_id: u64,
    mut rx: mpsc::Receiver<crate::log::LogRecord>,
    out_tx: mpsc::Sender<Vec<u8>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                rec = rx.recv() => {
                    let Some(rec) = rec else { break };
                    let Ok(note) = Request::notification(METHOD_LOG, &LogEntry::from(rec)) else {
                        continue;
                    };
                    let Ok(bytes) = protocol::encode_request(&note) else { continue };
                    if out_tx.send(bytes).await.is_err() {
                        break;
                    }
                }
            }
        }
        daemon.unsubscribe_logs(sub_id);
    });
}

async fn write_outgoing(
    mut write_half: tokio::net::unix::OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(bytes) = rx.recv().await {
        if write_half.write_all(&bytes).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
