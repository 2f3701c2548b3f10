#![allow(dead_code)]

use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(15);

pub fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

pub struct DapClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    next_seq: i64,
    pending_events: VecDeque<Value>,
    /// Responses that arrived while another response was awaited.
    pending_responses: Vec<Value>,
}

impl DapClient {
    pub fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let start = Instant::now();
        let stream = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(err) => {
                    if start.elapsed() > CONNECT_TIMEOUT {
                        return Err(anyhow!("failed to connect to {addr}: {err}"));
                    }
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
            }
        };
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .context("set DAP read timeout")?;
        stream
            .set_write_timeout(Some(READ_TIMEOUT))
            .context("set DAP write timeout")?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            stream,
            reader,
            next_seq: 1,
            pending_events: VecDeque::new(),
            pending_responses: vec![],
        })
    }

    pub fn send_request(&mut self, command: &str, arguments: Value) -> anyhow::Result<i64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let request = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        self.write_message(&request)?;
        Ok(seq)
    }

    pub fn read_response(&mut self, request_seq: i64) -> anyhow::Result<Value> {
        let is_reply =
            |msg: &Value| msg.get("request_seq").and_then(Value::as_i64) == Some(request_seq);
        if let Some(pos) = self.pending_responses.iter().position(is_reply) {
            return Ok(self.pending_responses.remove(pos));
        }
        loop {
            let msg = self.read_message()?;
            match msg.get("type").and_then(Value::as_str) {
                Some("event") => self.pending_events.push_back(msg),
                Some("response") if is_reply(&msg) => return Ok(msg),
                Some("response") => self.pending_responses.push(msg),
                _ => {}
            }
        }
    }

    pub fn read_event(&mut self) -> anyhow::Result<Value> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(event);
        }
        loop {
            let msg = self.read_message()?;
            if msg.get("type").and_then(Value::as_str) == Some("event") {
                return Ok(msg);
            }
        }
    }

    pub fn wait_for_event(&mut self, name: &str) -> anyhow::Result<Value> {
        loop {
            let event = self.read_event()?;
            if event.get("event").and_then(Value::as_str) == Some(name) {
                return Ok(event);
            }
        }
    }

    fn read_message(&mut self) -> anyhow::Result<Value> {
        let deadline = Instant::now() + MESSAGE_TIMEOUT;
        let mut content_length = None;
        loop {
            let mut line = String::new();
            let read_n = loop {
                match self.reader.read_line(&mut line) {
                    Ok(n) => break n,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        if Instant::now() > deadline {
                            return Err(anyhow!("Timed out waiting for DAP header"));
                        }
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            if read_n == 0 {
                return Err(anyhow!("DAP connection closed"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = Some(value.trim().parse::<usize>()?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length"))?;
        let mut buf = vec![0u8; len];
        self.read_exact_with_deadline(&mut buf, deadline)?;
        let msg = serde_json::from_slice(&buf)?;
        Ok(msg)
    }

    fn read_exact_with_deadline(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> anyhow::Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.reader.read(&mut buf[offset..]) {
                Ok(0) => return Err(anyhow!("DAP connection closed")),
                Ok(n) => offset += n,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() > deadline {
                        return Err(anyhow!("Timed out waiting for DAP body"));
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(message)?;
        write!(self.stream, "Content-Length: {}\r\n\r\n", payload.len())?;
        self.stream.write_all(&payload)?;
        self.stream.flush()?;
        Ok(())
    }
}

pub struct DapSession {
    pub client: DapClient,
    process: Child,
    closed: bool,
    _config: NamedTempFile,
}

impl DapSession {
    /// Start adapter in single-client mode with an empty configuration file.
    pub fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").context("bind test TCP port")?;
        let addr = listener.local_addr()?;
        drop(listener);

        let config = NamedTempFile::new().context("create config file")?;
        let bin_path = std::env::var("CARGO_BIN_EXE_replstalker")
            .map(PathBuf::from)
            .unwrap_or_else(|_| repo_root().join("target").join("debug").join("replstalker"));
        let process = Command::new(bin_path)
            .args(["--listen", &addr.to_string(), "--oneshot", "--config"])
            .arg(config.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawn replstalker")?;
        let client = DapClient::connect(addr)?;
        Ok(Self {
            client,
            process,
            closed: false,
            _config: config,
        })
    }

    pub fn request(&mut self, command: &str, arguments: Value) -> anyhow::Result<Value> {
        let seq = self.client.send_request(command, arguments)?;
        self.client.read_response(seq)
    }

    pub fn disconnect(&mut self) -> anyhow::Result<Value> {
        let response = self.request("disconnect", json!({}))?;
        self.closed = true;
        Ok(response)
    }

    /// Adapter process exit status, `None` if it is still running after `timeout`.
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        wait_for_exit(&mut self.process, timeout).ok()
    }
}

impl Drop for DapSession {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.disconnect();
        }
        if wait_for_exit(&mut self.process, SHUTDOWN_TIMEOUT).is_err() {
            let _ = self.process.kill();
        }
    }
}

pub fn wait_for_exit(child: &mut Child, timeout: Duration) -> anyhow::Result<ExitStatus> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if start.elapsed() >= timeout {
            return Err(anyhow!("process did not exit in time"));
        }
        thread::sleep(Duration::from_millis(50));
    }
}
