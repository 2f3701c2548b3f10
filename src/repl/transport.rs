use crate::error::Error;
use crate::registry::{Frame, Variable};
use crate::repl::accumulator::Accumulator;
use crate::repl::bencode::{self, Value};
use crate::repl::message::{Message, RemoteEvent, Reply, Request, StepKind, Terminal};
use crate::repl::Lane;
use log::{debug, info, trace, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, BufReader, ErrorKind, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Destination for `out`/`err` texts that arrive inside replies.
pub trait ConsoleSink: Send + Sync {
    fn forward(&self, kind: ConsoleKind, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleKind {
    Stdout,
    Stderr,
}

/// Opens a socket to the remote side.
pub trait Dialer {
    fn dial(&mut self, addr: &str) -> io::Result<TcpStream>;
}

pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&mut self, addr: &str) -> io::Result<TcpStream> {
        TcpStream::connect(addr)
    }
}

/// Dialer that gives up once the flag is raised, so a refused address is not retried forever.
pub struct CancellableDialer(pub Arc<AtomicBool>);

impl Dialer for CancellableDialer {
    fn dial(&mut self, addr: &str) -> io::Result<TcpStream> {
        if self.0.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::Interrupted, "connect cancelled"));
        }
        TcpStream::connect(addr)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Pause between attempts when connection is refused.
    pub retry_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Sessions {
    eval: String,
    command: String,
    event: String,
}

impl Sessions {
    fn id(&self, lane: Lane) -> &str {
        match lane {
            Lane::Eval => &self.eval,
            Lane::Command => &self.command,
            Lane::Event => &self.event,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Route {
    /// Clone handshake, replies are not tagged with a known session yet.
    Handshake,
    Session(String),
}

struct Pending {
    acc: Accumulator,
    reply: mpsc::Sender<Result<Reply, Error>>,
}

#[derive(Default)]
struct Demux {
    pending: HashMap<Route, Pending>,
    /// Sessions whose last reply ended with `eval-error`.
    after_eval_error: HashSet<String>,
    closed: bool,
}

/// Message that carries nothing but the `done` status.
fn is_bare_done(raw: &BTreeMap<String, Value>) -> bool {
    let done = raw
        .get("status")
        .and_then(Value::as_list)
        .is_some_and(|s| s.len() == 1 && s[0].as_str() == Some("done"));
    done && raw.keys().all(|k| matches!(k.as_str(), "status" | "session" | "id"))
}

/// State shared with the reader thread.
struct Shared {
    demux: Mutex<Demux>,
    console: Arc<dyn ConsoleSink>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Demux> {
        // poisoning means a panic in the reader, pending map is still consistent
        self.demux.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn route(&self, value: Value) {
        let Some(raw) = value.as_dict() else {
            warn!(target: "repl", "skip message that is not a dictionary: {value}");
            return;
        };
        let session = raw.get("session").and_then(Value::as_str).map(ToString::to_string);
        let is_clone_reply = raw.contains_key("new-session");

        for (key, kind) in [("out", ConsoleKind::Stdout), ("err", ConsoleKind::Stderr)] {
            if let Some(text) = raw.get(key).and_then(Value::as_str) {
                self.console.forward(kind, text);
            }
        }

        let mut demux = self.lock();
        if let Some(s) = &session {
            // nREPL style servers follow `eval-error` with a separate `done`, it must not finish
            // the next request of the session
            if demux.after_eval_error.remove(s) && is_bare_done(raw) {
                debug!(target: "repl", "drop trailing done of session {s}");
                return;
            }
        }
        let route = match session {
            Some(s) if demux.pending.contains_key(&Route::Session(s.clone())) => Route::Session(s),
            _ if is_clone_reply || raw.get("session").is_none() => Route::Handshake,
            _ => {
                debug!(target: "repl", "unsolicited message: {value}");
                return;
            }
        };
        if !demux.pending.contains_key(&route) {
            debug!(target: "repl", "unsolicited message: {value}");
            return;
        }

        let outcome = match Message::from_value(value) {
            Ok(msg) => {
                if let (Some(Terminal::EvalError), Route::Session(s)) = (msg.terminal(), &route) {
                    demux.after_eval_error.insert(s.clone());
                }
                demux.pending.get_mut(&route).and_then(|p| p.acc.feed(&msg))
            }
            Err(e) => Some(Err(e)),
        };
        if let Some(outcome) = outcome {
            // terminal status frees the session slot
            if let Some(pending) = demux.pending.remove(&route) {
                let _ = pending.reply.send(outcome);
            }
        }
    }

    fn close(&self, reason: impl Fn() -> Error) {
        let mut demux = self.lock();
        demux.closed = true;
        for (_, pending) in demux.pending.drain() {
            let _ = pending.reply.send(Err(reason()));
        }
    }
}

fn read_loop(stream: TcpStream, shared: Arc<Shared>) {
    let mut reader = BufReader::new(stream);
    loop {
        match bencode::read_value(&mut reader) {
            Ok(Some(value)) => {
                trace!(target: "repl", "<- {value}");
                shared.route(value);
            }
            Ok(None) => {
                if !shared.lock().closed {
                    info!(target: "repl", "remote side closed the connection");
                }
                shared.close(|| Error::Disconnected);
                return;
            }
            Err(Error::Decode(msg)) => {
                warn!(target: "repl", "unreadable message, connection dropped: {msg}");
                shared.close(|| Error::Decode(msg.clone()));
                return;
            }
            Err(e) => {
                if !shared.lock().closed {
                    warn!(target: "repl", "connection read error: {e:#}");
                }
                shared.close(|| Error::NotConnected);
                return;
            }
        }
    }
}

/// Reply that has not reached its terminal status yet.
pub struct PendingReply {
    receiver: mpsc::Receiver<Result<Reply, Error>>,
}

impl PendingReply {
    /// Block until terminal status.
    pub fn wait(self) -> Result<Reply, Error> {
        self.receiver.recv().map_err(|_| Error::NotConnected)?
    }
}

/// Connection to the remote evaluation server.
pub struct Transport {
    shared: Arc<Shared>,
    writer: Mutex<Option<TcpStream>>,
    sessions: RwLock<Option<Sessions>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Connect to `addr`, retry every second while connection is refused.
    pub fn connect(addr: &str, console: Arc<dyn ConsoleSink>) -> Result<Transport, Error> {
        Self::connect_with(&mut TcpDialer, addr, ConnectOptions::default(), console)
    }

    pub fn connect_with(
        dialer: &mut dyn Dialer,
        addr: &str,
        options: ConnectOptions,
        console: Arc<dyn ConsoleSink>,
    ) -> Result<Transport, Error> {
        let mut attempt = 1;
        let stream = loop {
            match dialer.dial(addr) {
                Ok(stream) => break stream,
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    debug!(target: "repl", "connect to {addr} refused (attempt {attempt}), retry");
                    attempt += 1;
                    thread::sleep(options.retry_interval);
                }
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_nodelay(true)?;
        info!(target: "repl", "connected to {addr}");

        let shared = Arc::new(Shared {
            demux: Mutex::new(Demux::default()),
            console,
        });
        let reader = thread::Builder::new().name("repl-reader".to_string()).spawn({
            let stream = stream.try_clone()?;
            let shared = shared.clone();
            move || read_loop(stream, shared)
        })?;

        let transport = Transport {
            shared,
            writer: Mutex::new(Some(stream)),
            sessions: RwLock::new(None),
            reader: Mutex::new(Some(reader)),
        };

        let sessions = (|| {
            Ok::<_, Error>(Sessions {
                eval: transport.clone_session()?,
                command: transport.clone_session()?,
                event: transport.clone_session()?,
            })
        })();
        match sessions {
            Ok(sessions) => {
                debug!(target: "repl", "sessions established: {sessions:?}");
                if let Ok(mut guard) = transport.sessions.write() {
                    *guard = Some(sessions);
                }
                Ok(transport)
            }
            Err(e) => {
                transport.close();
                Err(match e {
                    Error::Handshake(_) => e,
                    other => Error::Handshake(format!("{other:#}")),
                })
            }
        }
    }

    fn clone_session(&self) -> Result<String, Error> {
        let reply = self
            .dispatch(Route::Handshake, None, Request::Clone.to_message(None))?
            .wait()?;
        reply
            .new_session()
            .map_err(|e| Error::Handshake(e.to_string()))
    }

    fn session_id(&self, lane: Lane) -> Result<String, Error> {
        let guard = self.sessions.read().map_err(|_| Error::NotConnected)?;
        guard
            .as_ref()
            .map(|s| s.id(lane).to_string())
            .ok_or(Error::NotConnected)
    }

    fn dispatch(&self, route: Route, lane: Option<Lane>, message: Value) -> Result<PendingReply, Error> {
        let (sender, receiver) = mpsc::channel();
        {
            let mut demux = self.shared.lock();
            if demux.closed {
                return Err(Error::NotConnected);
            }
            if demux.pending.contains_key(&route) {
                return Err(match lane {
                    Some(lane) => Error::SessionBusy(lane),
                    None => Error::Handshake("handshake already in progress".to_string()),
                });
            }
            demux.pending.insert(
                route.clone(),
                Pending {
                    acc: Accumulator::default(),
                    reply: sender,
                },
            );
        }

        trace!(target: "repl", "-> {message}");
        let bytes = message.to_bytes();
        let written = match self.writer.lock() {
            Ok(mut writer) => match writer.as_mut() {
                Some(stream) => stream.write_all(&bytes).and_then(|_| stream.flush()),
                None => Err(io::Error::new(ErrorKind::NotConnected, "closed")),
            },
            Err(_) => Err(io::Error::new(ErrorKind::Other, "writer poisoned")),
        };
        if let Err(e) = written {
            self.shared.lock().pending.remove(&route);
            return Err(match e.kind() {
                ErrorKind::NotConnected => Error::NotConnected,
                _ => e.into(),
            });
        }

        Ok(PendingReply { receiver })
    }

    /// Send request on its lane without waiting for a reply.
    pub fn send(&self, request: &Request) -> Result<PendingReply, Error> {
        let lane = request.lane();
        let session = self.session_id(lane)?;
        self.dispatch(
            Route::Session(session.clone()),
            Some(lane),
            request.to_message(Some(&session)),
        )
    }

    /// Send request and wait for its terminal status.
    pub fn request(&self, request: &Request) -> Result<Reply, Error> {
        debug!(target: "repl", "{} request", request.op());
        self.send(request)?.wait()
    }

    pub fn eval(&self, code: &str, ns: Option<&str>) -> Result<Reply, Error> {
        self.request(&Request::Eval {
            code: code.to_string(),
            ns: ns.map(ToString::to_string),
        })
    }

    pub fn list_threads(&self) -> Result<Vec<String>, Error> {
        self.request(&Request::ListThreads)?.threads()
    }

    pub fn list_frames(&self, thread: &str) -> Result<Vec<Frame>, Error> {
        self.request(&Request::ListFrames {
            thread: thread.to_string(),
        })?
        .frames(thread)
    }

    pub fn list_vars(&self, thread: &str, frame: i64) -> Result<(Vec<Variable>, Vec<Variable>), Error> {
        self.request(&Request::ListVars {
            thread: thread.to_string(),
            frame,
        })?
        .vars()
    }

    pub fn set_breakpoint(&self, path: &str, line: i64) -> Result<(), Error> {
        self.request(&Request::SetBreakpoint {
            path: path.to_string(),
            line,
        })
        .map(drop)
    }

    pub fn clear_breakpoints(&self, path: &str) -> Result<(), Error> {
        self.request(&Request::ClearBreakpoints {
            path: path.to_string(),
        })
        .map(drop)
    }

    pub fn set_exception_breakpoint(&self, class: &str) -> Result<(), Error> {
        self.request(&Request::SetExceptionBreakpoint {
            class: class.to_string(),
        })
        .map(drop)
    }

    pub fn resume(&self, thread: Option<&str>) -> Result<(), Error> {
        self.request(&Request::Continue {
            thread: thread.map(ToString::to_string),
        })
        .map(drop)
    }

    pub fn step(&self, kind: StepKind, thread: &str) -> Result<(), Error> {
        self.request(&Request::Step {
            kind,
            thread: thread.to_string(),
        })
        .map(drop)
    }

    /// Attach debug tool to a process that listens on debug `port`.
    pub fn attach(&self, port: u16) -> Result<(), Error> {
        self.request(&Request::Attach { port }).map(drop)
    }

    pub fn refresh(&self) -> Result<(), Error> {
        self.request(&Request::Refresh).map(drop)
    }

    /// Wait for next asynchronous event (breakpoint hit, exception).
    pub fn next_event(&self) -> Result<RemoteEvent, Error> {
        self.request(&Request::GetEvent)?.event()
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.lock().closed
    }

    /// Close socket and invalidate sessions. Requests in flight fail with "not connected".
    pub fn close(&self) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.take();
        }
        self.shared.close(|| Error::NotConnected);
        if let Ok(mut writer) = self.writer.lock() {
            if let Some(stream) = writer.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        let reader = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(reader) = reader {
            if reader.join().is_err() {
                warn!(target: "repl", "reader thread panicked");
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}
