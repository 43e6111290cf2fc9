use crate::protocol::{
    self, AttachParams, AttachResult, DownParams, DownResult, LogsParams, LogsResult,
    METHOD_ATTACH, METHOD_DOWN, METHOD_LOGS, METHOD_RESTART, METHOD_SHUTDOWN, METHOD_STATUS,
    METHOD_STDIN, METHOD_UP, Request, RestartParams, RestartResult, ShutdownResult, StatusResult,
    StdinParams, UpParams, UpResult,
};
use color_eyre::eyre::{Context, bail};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Blocking JSON-RPC client over the daemon's unix socket. One request in
/// flight at a time; notifications are read explicitly by the caller.
pub struct Client {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
    next_id: i64,
}

impl Client {
    pub fn connect(socket_path: &Path) -> color_eyre::Result<Client> {
        let stream = UnixStream::connect(socket_path)
            .wrap_err_with(|| format!("failed to connect to {}", socket_path.display()))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Client {
            stream,
            reader,
            next_id: 0,
        })
    }

    fn call<P: serde::Serialize, R: serde::de::DeserializeOwned + Default>(
        &mut self,
        method: &str,
        params: Option<&P>,
    ) -> color_eyre::Result<R> {
        self.next_id += 1;
        let req = Request::call(method, params, self.next_id)?;
        self.stream.write_all(&protocol::encode_request(&req)?)?;

        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                bail!("daemon closed the connection");
            }
            if line.trim().is_empty() {
                continue;
            }
            let resp = protocol::decode_response(&line)?;
            if let Some(err) = resp.error {
                bail!("{err}");
            }
            return Ok(resp.parse_result()?);
        }
    }

    /// Read one server-pushed notification, blocking until it arrives.
    pub fn read_notification(&mut self) -> color_eyre::Result<Request> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                bail!("daemon closed the connection");
            }
            if line.trim().is_empty() {
                continue;
            }
            return Ok(protocol::decode_request(&line)?);
        }
    }

    /// A handle for pushing `stdin` notifications from another thread while
    /// this client keeps reading notifications.
    pub fn stdin_sender(&self) -> color_eyre::Result<StdinSender> {
        Ok(StdinSender {
            stream: self.stream.try_clone()?,
        })
    }

    pub fn up(&mut self, services: &[String]) -> color_eyre::Result<UpResult> {
        let params = UpParams {
            services: services.to_vec(),
        };
        self.call(METHOD_UP, Some(&params))
    }

    pub fn down(&mut self, services: &[String]) -> color_eyre::Result<DownResult> {
        let params = DownParams {
            services: services.to_vec(),
        };
        self.call(METHOD_DOWN, Some(&params))
    }

    pub fn shutdown(&mut self) -> color_eyre::Result<ShutdownResult> {
        self.call(METHOD_SHUTDOWN, None::<&()>)
    }

    pub fn status(&mut self) -> color_eyre::Result<StatusResult> {
        self.call(METHOD_STATUS, None::<&()>)
    }

    pub fn restart(&mut self, services: &[String]) -> color_eyre::Result<RestartResult> {
        let params = RestartParams {
            services: services.to_vec(),
        };
        self.call(METHOD_RESTART, Some(&params))
    }

    pub fn logs(
        &mut self,
        services: &[String],
        lines: usize,
        follow: bool,
    ) -> color_eyre::Result<LogsResult> {
        let params = LogsParams {
            services: services.to_vec(),
            lines,
            follow,
        };
        self.call(METHOD_LOGS, Some(&params))
    }

    pub fn attach(&mut self, service: &str) -> color_eyre::Result<AttachResult> {
        let params = AttachParams {
            service: service.to_string(),
        };
        self.call(METHOD_ATTACH, Some(&params))
    }
}

pub struct StdinSender {
    stream: UnixStream,
}

impl StdinSender {
    pub fn send(&mut self, data: &str) -> color_eyre::Result<()> {
        let params = StdinParams {
            data: data.to_string(),
        };
        let note = Request::notification(METHOD_STDIN, &params)?;
        self.stream.write_all(&protocol::encode_request(&note)?)?;
        Ok(())
    }
}
