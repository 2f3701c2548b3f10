//! DAP framing and front-end connections.
//! Supports both stdio (for embedded mode) and TCP (for server mode).

use crate::dap::protocol::{DapEvent, DapRequest, DapResponse};
use crate::repl::{ConsoleKind, ConsoleSink};
use anyhow::{anyhow, Context};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Read a single message with `Content-Length` framing.
pub fn read_frame(reader: &mut impl BufRead) -> anyhow::Result<Value> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line)?;
        if read_n == 0 {
            return Err(anyhow!("DAP connection closed"));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some(v) = line.strip_prefix("Content-Length:") {
            content_length = Some(v.trim().parse().context("bad Content-Length header")?);
        }
    }

    let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Write a single message with `Content-Length` framing.
pub fn write_frame(writer: &mut impl Write, message: &Value) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(message)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// File based tracer of the front-end traffic.
#[derive(Clone)]
pub struct FileTracer {
    file: Arc<Mutex<std::fs::File>>,
}

impl FileTracer {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn line(&self, text: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{text}");
        }
    }

    fn message(&self, direction: &str, message: &Value) {
        if let Ok(line) = serde_json::to_string(message) {
            self.line(&format!("{direction} {line}"));
        }
    }
}

/// Inbound half of a front-end connection.
pub struct DapReader {
    reader: Box<dyn BufRead + Send>,
    tracer: Option<FileTracer>,
}

impl DapReader {
    pub fn new(reader: impl BufRead + Send + 'static, tracer: Option<FileTracer>) -> Self {
        Self {
            reader: Box::new(reader),
            tracer,
        }
    }

    pub fn read_message(&mut self) -> anyhow::Result<Value> {
        let msg = read_frame(&mut self.reader)?;
        if let Some(tracer) = &self.tracer {
            tracer.message("<-", &msg);
        }
        Ok(msg)
    }
}

struct OutputState {
    writer: Box<dyn Write + Send>,
    seq: i64,
    tracer: Option<FileTracer>,
    /// Socket to shut down when the session ends, so a blocked reader wakes up.
    socket: Option<TcpStream>,
}

/// Outbound half of a front-end connection. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub struct DapOutput {
    state: Arc<Mutex<OutputState>>,
}

impl DapOutput {
    pub fn new(writer: impl Write + Send + 'static, tracer: Option<FileTracer>) -> Self {
        Self {
            state: Arc::new(Mutex::new(OutputState {
                writer: Box::new(writer),
                seq: 1,
                tracer,
                socket: None,
            })),
        }
    }

    fn emit(&self, make: impl FnOnce(i64) -> anyhow::Result<Value>) -> anyhow::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("DAP output poisoned"))?;
        let seq = state.seq;
        state.seq += 1;
        let msg = make(seq)?;
        if let Some(tracer) = &state.tracer {
            tracer.message("->", &msg);
        }
        write_frame(&mut state.writer, &msg)
    }

    pub fn send_success(&self, req: &DapRequest) -> anyhow::Result<()> {
        self.send_response_raw(req, true, None, None)
    }

    pub fn send_success_body<T: Serialize>(&self, req: &DapRequest, body: T) -> anyhow::Result<()> {
        let body = serde_json::to_value(body)?;
        self.send_response_raw(req, true, None, Some(body))
    }

    pub fn send_err(&self, req: &DapRequest, message: impl ToString) -> anyhow::Result<()> {
        self.send_response_raw(req, false, Some(message.to_string()), None)
    }

    pub fn send_response_raw(
        &self,
        req: &DapRequest,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) -> anyhow::Result<()> {
        self.emit(|seq| {
            let rsp = DapResponse {
                seq,
                r#type: "response",
                request_seq: req.seq,
                success,
                command: req.command.clone(),
                message,
                body,
            };
            Ok(serde_json::to_value(rsp)?)
        })
    }

    pub fn send_event(&self, name: &'static str) -> anyhow::Result<()> {
        self.send_event_raw(name, None)
    }

    pub fn send_event_body<T: Serialize>(&self, name: &'static str, body: T) -> anyhow::Result<()> {
        let body = serde_json::to_value(body)?;
        self.send_event_raw(name, Some(body))
    }

    pub fn send_event_raw(&self, name: &'static str, body: Option<Value>) -> anyhow::Result<()> {
        self.emit(|seq| {
            let ev = DapEvent {
                seq,
                r#type: "event",
                event: name,
                body,
            };
            Ok(serde_json::to_value(ev)?)
        })
    }

    /// Send text to the debug console.
    pub fn send_output(&self, category: &str, output: &str) -> anyhow::Result<()> {
        self.send_event_body("output", json!({"category": category, "output": output}))
    }

    /// Unblock the reader of a socket based connection.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(socket) = state.socket.take() {
                let _ = socket.shutdown(Shutdown::Both);
            }
        }
    }
}

impl ConsoleSink for DapOutput {
    fn forward(&self, kind: ConsoleKind, text: &str) {
        let category = match kind {
            ConsoleKind::Stdout => "stdout",
            ConsoleKind::Stderr => "stderr",
        };
        if let Err(e) = self.send_output(category, text) {
            log::debug!(target: "dap", "drop console output: {e:#}");
        }
    }
}

/// Front-end connection that can be split into independent halves.
pub trait DapTransport {
    fn split(self) -> anyhow::Result<(DapReader, DapOutput)>;
}

/// TCP-based DAP transport (for server mode).
pub struct TcpTransport {
    stream: TcpStream,
    tracer: Option<FileTracer>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, tracer: Option<FileTracer>) -> anyhow::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream, tracer })
    }
}

impl DapTransport for TcpTransport {
    fn split(self) -> anyhow::Result<(DapReader, DapOutput)> {
        let reader = DapReader::new(BufReader::new(self.stream.try_clone()?), self.tracer.clone());
        let socket = self.stream.try_clone()?;
        let output = DapOutput::new(self.stream, self.tracer);
        if let Ok(mut state) = output.state.lock() {
            state.socket = Some(socket);
        }
        Ok((reader, output))
    }
}

/// Stdio-based DAP transport (for embedded mode).
pub struct StdioTransport {
    tracer: Option<FileTracer>,
}

impl StdioTransport {
    pub fn new(tracer: Option<FileTracer>) -> Self {
        Self { tracer }
    }
}

impl DapTransport for StdioTransport {
    fn split(self) -> anyhow::Result<(DapReader, DapOutput)> {
        Ok((
            DapReader::new(BufReader::new(std::io::stdin()), self.tracer.clone()),
            DapOutput::new(std::io::stdout(), self.tracer),
        ))
    }
}
