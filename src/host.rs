//! Side control channel toward the embedding host.
//!
//! Messages are JSON objects `{"event": <name>, "data": <value>}`, one per line. After connect
//! the host greets with `go-eval`, after that every request is answered with a `<name>-result`
//! style event. Messages that do not answer the current request are skipped.

use crate::error::Error;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Greeting the host sends once it is ready to serve requests.
pub const GREETING: &str = "go-eval";

/// How long to wait for a single host message.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Code and namespace the host wants an expression to be evaluated with.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct EvalContext {
    pub code: String,
    #[serde(default)]
    pub ns: Option<String>,
}

pub struct HostChannel {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl HostChannel {
    /// Connect to the host and wait for its greeting. Refused connections are retried
    /// every `retry_interval`.
    pub fn connect(addr: &str, retry_interval: Duration) -> Result<Self, Error> {
        Self::connect_cancellable(addr, retry_interval, &AtomicBool::new(false))
    }

    /// Same as [`HostChannel::connect`], but stop retrying once `cancelled` is set.
    pub fn connect_cancellable(
        addr: &str,
        retry_interval: Duration,
        cancelled: &AtomicBool,
    ) -> Result<Self, Error> {
        let stream = loop {
            if cancelled.load(Ordering::SeqCst) {
                return Err(Error::Host(format!("connect to {addr} cancelled")));
            }
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    debug!(target: "host", "host {addr} refused connection, retry");
                    thread::sleep(retry_interval);
                }
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let mut channel = HostChannel {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        };
        channel.wait_for(GREETING)?;
        info!(target: "host", "side channel to {addr} is ready");
        Ok(channel)
    }

    fn read(&mut self) -> Result<HostMessage, Error> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).map_err(|e| match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                    Error::Host("timeout while waiting for host".to_string())
                }
                _ => Error::IO(e),
            })?;
            if n == 0 {
                return Err(Error::Host("host closed the side channel".to_string()));
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            trace!(target: "host", "<- {line}");
            return serde_json::from_str(line)
                .map_err(|e| Error::Host(format!("unreadable host message: {e}")));
        }
    }

    fn wait_for(&mut self, event: &str) -> Result<Value, Error> {
        loop {
            let msg = self.read()?;
            if msg.event == event {
                return Ok(msg.data);
            }
            debug!(target: "host", "skip unsolicited `{}` event", msg.event);
        }
    }

    fn send(&mut self, event: &str, data: Value) -> io::Result<()> {
        let msg = HostMessage {
            event: event.to_string(),
            data,
        };
        let mut line = serde_json::to_string(&msg)?;
        trace!(target: "host", "-> {line}");
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()
    }

    /// Send `event` and wait for the `reply` event.
    pub fn request(&mut self, event: &str, data: Value, reply: &str) -> Result<Value, Error> {
        debug!(target: "host", "{event} request");
        self.send(event, data)?;
        let data = self.wait_for(reply)?;
        if let Some(err) = data.get("error").and_then(Value::as_str) {
            return Err(Error::Host(format!("{event}: {err}")));
        }
        Ok(data)
    }

    /// Installation directory of the host extension.
    pub fn extension_directory(&mut self) -> Result<PathBuf, Error> {
        let data = self.request(
            "get-extension-directory",
            Value::Null,
            "get-extension-directory-result",
        )?;
        data.as_str()
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| Error::Host(format!("bad extension directory: {data}")))
    }

    /// Let the host rewrite an expression and choose its namespace.
    pub fn eval_context(&mut self, code: &str) -> Result<EvalContext, Error> {
        let data = self.request("eval-code", Value::from(code), "eval-code-result")?;
        match data {
            Value::String(code) => Ok(EvalContext { code, ns: None }),
            data => serde_json::from_value(data)
                .map_err(|e| Error::Host(format!("bad eval-code result: {e}"))),
        }
    }

    pub fn source_paths(&mut self) -> Result<Vec<PathBuf>, Error> {
        let data = self.request("get-source-paths", Value::Null, "source-path-result")?;
        let paths: Vec<String> = serde_json::from_value(data)
            .map_err(|e| Error::Host(format!("bad source paths: {e}")))?;
        Ok(paths.into_iter().map(PathBuf::from).collect())
    }

    /// Ask the host to load a namespace, return when it is loaded.
    pub fn load_namespace(&mut self, ns: &str) -> Result<(), Error> {
        self.request("load-namespace", Value::from(ns), "load-namespace-result")
            .map(drop)
    }

    /// Exception class that should stop the runtime, if the host wants one.
    pub fn breakpoint_exception_class(&mut self) -> Result<Option<String>, Error> {
        let data = self.request(
            "get-breakpoint-exception-class",
            Value::Null,
            "get-breakpoint-exception-class-result",
        )?;
        Ok(data
            .as_str()
            .map(str::trim)
            .filter(|class| !class.is_empty())
            .map(ToString::to_string))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{BufRead, Write};
    use std::net::TcpListener;

    /// Fake host, answers every request line with the scripted replies.
    fn fake_host(script: Vec<(&'static str, Vec<&'static str>)>) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            writeln!(writer, r#"{{"event":"hello"}}"#).unwrap();
            writeln!(writer, r#"{{"event":"go-eval"}}"#).unwrap();
            for (expected_event, replies) in script {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let msg: HostMessage = serde_json::from_str(&line).unwrap();
                assert_eq!(msg.event, expected_event);
                for reply in replies {
                    writeln!(writer, "{reply}").unwrap();
                }
            }
        });
        (addr, handle)
    }

    #[test]
    fn test_requests() {
        let (addr, host) = fake_host(vec![
            (
                "get-extension-directory",
                vec![
                    r#"{"event":"eval-code-result","data":"stale"}"#,
                    r#"{"event":"get-extension-directory-result","data":"/opt/ext"}"#,
                ],
            ),
            (
                "eval-code",
                vec![r#"{"event":"eval-code-result","data":{"code":"(+ 1 2)","ns":"user"}}"#],
            ),
            (
                "get-source-paths",
                vec![r#"{"event":"source-path-result","data":["/src","/test"]}"#],
            ),
            (
                "load-namespace",
                vec![r#"{"event":"load-namespace-result","data":{"error":"no such ns"}}"#],
            ),
            (
                "get-breakpoint-exception-class",
                vec![r#"{"event":"get-breakpoint-exception-class-result","data":""}"#],
            ),
        ]);

        let mut channel = HostChannel::connect(&addr, Duration::from_millis(10)).unwrap();
        assert_eq!(
            channel.extension_directory().unwrap(),
            PathBuf::from("/opt/ext")
        );
        assert_eq!(
            channel.eval_context("(+ 1 2)").unwrap(),
            EvalContext {
                code: "(+ 1 2)".to_string(),
                ns: Some("user".to_string()),
            }
        );
        assert_eq!(
            channel.source_paths().unwrap(),
            vec![PathBuf::from("/src"), PathBuf::from("/test")]
        );
        assert!(matches!(
            channel.load_namespace("nope"),
            Err(Error::Host(_))
        ));
        assert_eq!(channel.breakpoint_exception_class().unwrap(), None);
        host.join().unwrap();
    }

    #[test]
    fn test_cancelled_connect() {
        // nothing listens on the port of a dropped listener
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .to_string();
        let cancelled = AtomicBool::new(true);
        let err = HostChannel::connect_cancellable(&addr, Duration::from_millis(10), &cancelled)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Host(ref msg) if msg.ends_with("cancelled")), "{err:?}");
    }

    #[test]
    fn test_host_gone() {
        let (addr, host) = fake_host(vec![]);
        let mut channel = HostChannel::connect(&addr, Duration::from_millis(10)).unwrap();
        host.join().unwrap();
        assert!(channel.extension_directory().is_err());
    }
}
