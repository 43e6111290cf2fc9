use crate::log::LogRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

pub const JSONRPC_VERSION: &str = "2.0";

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Application-specific error codes
pub const SERVICE_NOT_FOUND: i32 = -32000;
pub const SERVICE_ERROR: i32 = -32001;

// ---------------------------------------------------------------------------
// Method names
// ---------------------------------------------------------------------------

pub const METHOD_UP: &str = "up";
pub const METHOD_DOWN: &str = "down";
pub const METHOD_SHUTDOWN: &str = "shutdown";
pub const METHOD_STATUS: &str = "status";
pub const METHOD_RESTART: &str = "restart";
pub const METHOD_LOGS: &str = "logs";
pub const METHOD_ATTACH: &str = "attach";

// Notification methods: `log` is server-pushed, `stdin` is client-pushed.
pub const METHOD_LOG: &str = "log";
pub const METHOD_STDIN: &str = "stdin";

// ---------------------------------------------------------------------------
// Wire envelopes
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request. An absent `id` marks a notification, which
/// expects no response. Params stay raw until a handler picks the matching
/// typed struct for its method.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

/// A JSON-RPC 2.0 response. `id` is serialized even when null so that
/// parse-error responses stay well-formed.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Request {
    pub fn call<T: Serialize>(
        method: &str,
        params: Option<&T>,
        id: i64,
    ) -> Result<Request, ProtocolError> {
        Ok(Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: params.map(serde_json::value::to_raw_value).transpose()?,
            id: Some(id),
        })
    }

    pub fn notification<T: Serialize>(method: &str, params: &T) -> Result<Request, ProtocolError> {
        Ok(Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: Some(serde_json::value::to_raw_value(params)?),
            id: None,
        })
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Decode params into the typed struct for this method. Absent params
    /// decode to the struct's default, mirroring optional param objects.
    pub fn parse_params<T: DeserializeOwned + Default>(&self) -> Result<T, ProtocolError> {
        match &self.params {
            None => Ok(T::default()),
            Some(raw) => Ok(serde_json::from_str(raw.get())?),
        }
    }
}

impl Response {
    pub fn success<T: Serialize>(result: &T, id: i64) -> Result<Response, ProtocolError> {
        Ok(Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(serde_json::value::to_raw_value(result)?),
            error: None,
            id: Some(id),
        })
    }

    pub fn failure(code: i32, message: impl Into<String>, id: Option<i64>) -> Response {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    pub fn parse_result<T: DeserializeOwned + Default>(&self) -> Result<T, ProtocolError> {
        match &self.result {
            None => Ok(T::default()),
            Some(raw) => Ok(serde_json::from_str(raw.get())?),
        }
    }
}

// ---------------------------------------------------------------------------
// Method params and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpParams {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DownParams {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RestartParams {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogsParams {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
    #[serde(default)]
    pub lines: usize,
    #[serde(default)]
    pub follow: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttachParams {
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StdinParams {
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub started: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DownResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stopped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShutdownResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stopped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RestartResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restarted: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusResult {
    #[serde(default)]
    pub services: Vec<ServiceStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub restarts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogsResult {
    #[serde(default)]
    pub lines: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttachResult {
    #[serde(default)]
    pub lines: Vec<LogEntry>,
}

/// A log record as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub service: String,
    pub line: String,
    pub timestamp: String,
    pub stream: String,
}

impl From<LogRecord> for LogEntry {
    fn from(rec: LogRecord) -> Self {
        LogEntry {
            service: rec.service,
            line: rec.line,
            timestamp: rec.timestamp.to_rfc3339(),
            stream: rec.stream.as_str().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Line codecs
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(req)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(resp)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_response(line: &str) -> Result<Response, ProtocolError> {
    Ok(serde_json::from_str(line.trim_end())?)
}
