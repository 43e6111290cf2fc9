use comproc::protocol::{
    self, AttachResult, DownResult, LogsResult, Request, Response, RestartResult, ShutdownResult,
    StatusResult, UpResult,
};
use comproc::{config, daemon};
use regex::Regex;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct TestDaemon {
    _dir: TempDir,
    socket: PathBuf,
    handle: tokio::task::JoinHandle<color_eyre::Result<()>>,
}

async fn start_daemon(config_content: &str) -> TestDaemon {
    let dir = TempDir::new().unwrap();
    let cfg = config::parse(config_content, dir.path()).unwrap();
    let socket = dir.path().join("comproc.sock");

    let task_socket = socket.clone();
    let handle = tokio::spawn(async move { daemon::run(cfg, task_socket).await });

    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(socket.exists(), "daemon socket was not created");

    TestDaemon {
        _dir: dir,
        socket,
        handle,
    }
}

fn rpc_sync(socket: &PathBuf, method: &str, params: serde_json::Value) -> Response {
    let mut stream = UnixStream::connect(socket).unwrap();
    let req = Request::call(method, Some(&params), 1).unwrap();
    stream
        .write_all(&protocol::encode_request(&req).unwrap())
        .unwrap();

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    protocol::decode_response(&line).unwrap()
}

async fn rpc(socket: &PathBuf, method: &'static str, params: serde_json::Value) -> Response {
    let socket = socket.clone();
    tokio::task::spawn_blocking(move || rpc_sync(&socket, method, params))
        .await
        .unwrap()
}

fn result_of<T: serde::de::DeserializeOwned + Default>(resp: Response) -> T {
    assert!(resp.error.is_none(), "unexpected RPC error: {:?}", resp.error);
    resp.parse_result().unwrap()
}

async fn up(td: &TestDaemon, services: serde_json::Value) -> UpResult {
    result_of(rpc(&td.socket, "up", json!({ "services": services })).await)
}

async fn status(td: &TestDaemon) -> StatusResult {
    result_of(rpc(&td.socket, "status", json!({})).await)
}

async fn shutdown(td: &TestDaemon) -> ShutdownResult {
    result_of(rpc(&td.socket, "shutdown", json!({})).await)
}

fn position(list: &[String], name: &str) -> usize {
    list.iter()
        .position(|n| n == name)
        .unwrap_or_else(|| panic!("{name} missing from {list:?}"))
}

fn service<'a>(status: &'a StatusResult, name: &str) -> &'a protocol::ServiceStatus {
    status
        .services
        .iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("{name} missing from status"))
}

const CHAIN_CONFIG: &str = r#"
[services.db]
command = "sleep 60"

[services.api]
command = "sleep 60"
depends_on = ["db"]

[services.frontend]
command = "sleep 60"
depends_on = ["api"]
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_up_single_service() {
    let td = start_daemon("[services.app]\ncommand = \"sleep 60\"\n").await;

    let result = up(&td, json!([])).await;
    assert_eq!(result.started, vec!["app".to_string()]);
    assert!(result.failed.is_empty());

    let st = status(&td).await;
    let app = service(&st, "app");
    assert_eq!(app.state, "running");
    assert!(app.pid.unwrap() > 0);
    assert!(app.started_at.is_some());

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_up_starts_dependencies_in_order() {
    let td = start_daemon(CHAIN_CONFIG).await;

    let result = up(&td, json!([])).await;
    assert_eq!(result.started.len(), 3);
    assert!(position(&result.started, "db") < position(&result.started, "api"));
    assert!(position(&result.started, "api") < position(&result.started, "frontend"));

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_down_stops_dependents_first() {
    let td = start_daemon(CHAIN_CONFIG).await;
    up(&td, json!([])).await;

    let result: DownResult =
        result_of(rpc(&td.socket, "down", json!({ "services": ["db"] })).await);
    assert_eq!(result.stopped.len(), 3);
    assert!(position(&result.stopped, "frontend") < position(&result.stopped, "api"));
    assert!(position(&result.stopped, "api") < position(&result.stopped, "db"));

    let st = status(&td).await;
    for svc in &st.services {
        assert_eq!(svc.state, "stopped", "{} not stopped", svc.name);
    }

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_up_is_idempotent() {
    let td = start_daemon("[services.app]\ncommand = \"sleep 60\"\n").await;

    up(&td, json!([])).await;
    let pid_before = service(&status(&td).await, "app").pid;

    let again = up(&td, json!([])).await;
    assert!(again.started.is_empty());
    assert!(again.failed.is_empty());
    assert_eq!(service(&status(&td).await, "app").pid, pid_before);

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_down_twice_second_is_empty() {
    let td = start_daemon("[services.app]\ncommand = \"sleep 60\"\n").await;
    up(&td, json!([])).await;

    let first: DownResult = result_of(rpc(&td.socket, "down", json!({})).await);
    assert_eq!(first.stopped, vec!["app".to_string()]);

    let second: DownResult = result_of(rpc(&td.socket, "down", json!({})).await);
    assert!(second.stopped.is_empty());

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_replaces_pid() {
    let td = start_daemon("[services.app]\ncommand = \"sleep 60\"\n").await;
    up(&td, json!([])).await;
    let pid_before = service(&status(&td).await, "app").pid;

    let result: RestartResult =
        result_of(rpc(&td.socket, "restart", json!({ "services": ["app"] })).await);
    assert_eq!(result.restarted, vec!["app".to_string()]);
    assert!(result.failed.is_empty());

    let pid_after = service(&status(&td).await, "app").pid;
    assert!(pid_after.is_some());
    assert_ne!(pid_before, pid_after);

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_on_failure_policy_restarts() {
    let td = start_daemon(
        "[services.app]\ncommand = \"exit 1\"\nrestart = \"on-failure\"\n",
    )
    .await;
    up(&td, json!([])).await;

    // First restart lands after a 1s backoff
    let deadline = Instant::now() + Duration::from_secs(6);
    let mut restarts = 0;
    while Instant::now() < deadline {
        restarts = service(&status(&td).await, "app").restarts;
        if restarts >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(restarts >= 1, "no restart observed: {restarts}");

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_always_policy_restarts_after_clean_exit() {
    let td = start_daemon(
        "[services.app]\ncommand = \"exit 0\"\nrestart = \"always\"\n",
    )
    .await;
    up(&td, json!([])).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut restarts = 0;
    while Instant::now() < deadline {
        restarts = service(&status(&td).await, "app").restarts;
        if restarts >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(restarts >= 1, "no restart observed: {restarts}");

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_spawn_reported_others_started() {
    let td = start_daemon(
        r#"
[services.ok]
command = "sleep 60"

[services.broken]
command = "true"
working_dir = "/nonexistent-comproc-dir"
"#,
    )
    .await;

    let result = up(&td, json!([])).await;
    assert_eq!(result.started, vec!["ok".to_string()]);
    assert_eq!(result.failed, vec!["broken".to_string()]);
    assert_eq!(service(&status(&td).await, "broken").state, "failed");

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_logs_returns_tail_in_order() {
    let td = start_daemon(
        "[services.app]\ncommand = \"for i in 1 2 3 4 5; do echo line$i; done; sleep 60\"\n",
    )
    .await;
    up(&td, json!([])).await;

    // Wait until the output has flowed through the bus
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let all: LogsResult = result_of(rpc(&td.socket, "logs", json!({})).await);
        if all.lines.len() >= 5 || Instant::now() >= deadline {
            assert!(all.lines.len() >= 5, "expected 5 lines, got {:?}", all.lines);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let tail: LogsResult = result_of(
        rpc(&td.socket, "logs", json!({ "services": ["app"], "lines": 2 })).await,
    );
    let lines: Vec<&str> = tail.lines.iter().map(|l| l.line.as_str()).collect();
    assert_eq!(lines, vec!["line4", "line5"]);
    assert!(tail.lines.iter().all(|l| l.service == "app"));
    assert!(tail.lines.iter().all(|l| l.stream == "stdout"));

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stderr_lines_are_tagged() {
    let td = start_daemon("[services.app]\ncommand = \"echo oops >&2; sleep 60\"\n").await;
    up(&td, json!([])).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut result = LogsResult::default();
    while Instant::now() < deadline {
        result = result_of(rpc(&td.socket, "logs", json!({})).await);
        if !result.lines.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(result.lines[0].line, "oops");
    assert_eq!(result.lines[0].stream, "stderr");

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_logs_unknown_service_is_an_error() {
    let td = start_daemon("[services.app]\ncommand = \"sleep 60\"\n").await;

    let resp = rpc(&td.socket, "logs", json!({ "services": ["ghost"] })).await;
    let err = resp.error.expect("expected an error response");
    assert_eq!(err.code, protocol::SERVICE_NOT_FOUND);
    assert!(err.message.contains("ghost"));

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_json_keeps_connection_open() {
    let td = start_daemon("[services.app]\ncommand = \"sleep 60\"\n").await;

    let socket = td.socket.clone();
    tokio::task::spawn_blocking(move || {
        let mut stream = UnixStream::connect(&socket).unwrap();
        stream.write_all(b"this is not json\n").unwrap();

        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let resp = protocol::decode_response(&line).unwrap();
        let err = resp.error.expect("expected parse error");
        assert_eq!(err.code, protocol::PARSE_ERROR);
        assert_eq!(resp.id, None);

        // Same connection still serves valid requests
        let req = Request::call("status", Some(&json!({})), 2).unwrap();
        stream
            .write_all(&protocol::encode_request(&req).unwrap())
            .unwrap();
        line.clear();
        reader.read_line(&mut line).unwrap();
        let resp = protocol::decode_response(&line).unwrap();
        assert!(resp.error.is_none());
        assert_eq!(resp.id, Some(2));
    })
    .await
    .unwrap();

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_method() {
    let td = start_daemon("[services.app]\ncommand = \"sleep 60\"\n").await;

    let resp = rpc(&td.socket, "frobnicate", json!({})).await;
    let err = resp.error.expect("expected an error response");
    assert_eq!(err.code, protocol::METHOD_NOT_FOUND);

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_follow_pushes_log_notifications() {
    let td = start_daemon(
        "[services.app]\ncommand = \"sleep 1; echo delayed; sleep 60\"\n",
    )
    .await;
    up(&td, json!([])).await;

    let socket = td.socket.clone();
    let entry = tokio::task::spawn_blocking(move || {
        let stream = UnixStream::connect(&socket).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);

        let req = Request::call(
            "logs",
            Some(&json!({ "services": ["app"], "follow": true })),
            1,
        )
        .unwrap();
        writer
            .write_all(&protocol::encode_request(&req).unwrap())
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let resp = protocol::decode_response(&line).unwrap();
        assert!(resp.error.is_none());
        let initial: LogsResult = resp.parse_result().unwrap();
        if let Some(found) = initial.lines.iter().find(|l| l.line == "delayed") {
            return found.clone();
        }

        // Not in the snapshot yet, so it must arrive as a notification
        loop {
            line.clear();
            reader.read_line(&mut line).unwrap();
            let note = protocol::decode_request(&line).unwrap();
            assert!(note.is_notification());
            assert_eq!(note.method, protocol::METHOD_LOG);
            let entry: protocol::LogEntry = note.parse_params().unwrap();
            if entry.line == "delayed" {
                return entry;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(entry.service, "app");
    assert_eq!(entry.stream, "stdout");
    let iso8601 = Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}").unwrap();
    assert!(
        iso8601.is_match(&entry.timestamp),
        "timestamp not ISO-8601: {}",
        entry.timestamp
    );

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attach_streams_logs_and_routes_stdin() {
    let td = start_daemon("[services.app]\ncommand = \"cat\"\n").await;
    up(&td, json!([])).await;

    let socket = td.socket.clone();
    let echoed = tokio::task::spawn_blocking(move || {
        let stream = UnixStream::connect(&socket).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);

        let req = Request::call("attach", Some(&json!({ "service": "app" })), 1).unwrap();
        writer
            .write_all(&protocol::encode_request(&req).unwrap())
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let resp = protocol::decode_response(&line).unwrap();
        assert!(resp.error.is_none());
        let _initial: AttachResult = resp.parse_result().unwrap();

        // cat repeats whatever reaches its stdin
        let note =
            Request::notification("stdin", &json!({ "data": "hello from attach\n" })).unwrap();
        writer
            .write_all(&protocol::encode_request(&note).unwrap())
            .unwrap();

        loop {
            line.clear();
            reader.read_line(&mut line).unwrap();
            let note = protocol::decode_request(&line).unwrap();
            if note.method != protocol::METHOD_LOG {
                continue;
            }
            let entry: protocol::LogEntry = note.parse_params().unwrap();
            if entry.line == "hello from attach" {
                return entry;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(echoed.service, "app");

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attach_without_service_is_invalid_params() {
    let td = start_daemon("[services.app]\ncommand = \"sleep 60\"\n").await;

    let resp = rpc(&td.socket, "attach", json!({})).await;
    let err = resp.error.expect("expected an error response");
    assert_eq!(err.code, protocol::INVALID_PARAMS);

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attach_unknown_service() {
    let td = start_daemon("[services.app]\ncommand = \"sleep 60\"\n").await;

    let resp = rpc(&td.socket, "attach", json!({ "service": "ghost" })).await;
    let err = resp.error.expect("expected an error response");
    assert_eq!(err.code, protocol::SERVICE_NOT_FOUND);

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_services_and_exits() {
    let td = start_daemon(CHAIN_CONFIG).await;
    up(&td, json!([])).await;

    let result = shutdown(&td).await;
    assert_eq!(result.stopped.len(), 3);
    assert!(position(&result.stopped, "frontend") < position(&result.stopped, "db"));

    let run_result = tokio::time::timeout(Duration::from_secs(5), td.handle)
        .await
        .expect("daemon did not exit after shutdown")
        .unwrap();
    assert!(run_result.is_ok(), "daemon exited with: {run_result:?}");
    assert!(!td.socket.exists(), "socket file should be removed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_before_up_shows_everything_stopped() {
    let td = start_daemon(CHAIN_CONFIG).await;

    let st = status(&td).await;
    assert_eq!(st.services.len(), 3);
    for svc in &st.services {
        assert_eq!(svc.state, "stopped");
        assert!(svc.pid.is_none());
        assert!(svc.started_at.is_none());
        assert_eq!(svc.restarts, 0);
    }

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exit_code_recorded_after_run() {
    let td = start_daemon("[services.app]\ncommand = \"exit 7\"\n").await;
    up(&td, json!([])).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut app_status = None;
    while Instant::now() < deadline {
        let st = status(&td).await;
        let app = service(&st, "app").clone();
        if app.state == "failed" {
            app_status = Some(app);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let app = app_status.expect("service never reached failed state");
    assert_eq!(app.exit_code, Some(7));
    assert!(app.pid.is_none());

    shutdown(&td).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_up_unknown_service_reported_failed() {
    let td = start_daemon("[services.app]\ncommand = \"sleep 60\"\n").await;

    let result = up(&td, json!(["ghost"])).await;
    assert!(result.started.is_empty());
    assert_eq!(result.failed, vec!["ghost".to_string()]);

    shutdown(&td).await;
}
