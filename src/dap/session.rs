//! Debug session of a single front-end client.
//!
//! The session runs on one thread and owns the registry, the launch state and the handlers.
//! Other threads (front-end reader, process watchers, event listener) only post [`Input`]s
//! into its channel. Calls that can wait for a long time (evaluations, connects, the attach
//! handshake) run on short-lived worker threads and come back as a [`Completion`].

use crate::breakpoint::{self, BreakpointSet};
use crate::config::{AttachConfig, ConfigFile, LaunchConfig};
use crate::cursor::{self, LineCursor};
use crate::dap::io::{DapOutput, DapReader};
use crate::dap::protocol::{
    DapRequest, EvaluateArguments, ScopesArguments, SetBreakpointsArguments,
    StackTraceArguments, ThreadArguments, VariablesArguments,
};
use crate::dap::sourcemap::{PathResolver, SourceMap, SourceResolver};
use crate::error::Error;
use crate::host::{EvalContext, HostChannel};
use crate::launch::process::{Notifier, ProcessSignal};
use crate::launch::{self, Launch, Phase, Step};
use crate::listener::{self, ListenerSignal};
use crate::registry::{Frame, Registry, Thread};
use crate::repl::{
    CancellableDialer, ConnectOptions, ConsoleSink, EventKind, RemoteEvent, Reply, Request,
    StepKind, Transport,
};
use crate::{muted_error, weak_error};
use anyhow::{anyhow, bail, Context};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Everything the session reacts to.
pub enum Input {
    Request(DapRequest),
    Process(ProcessSignal),
    Listener(ListenerSignal),
    Completed(Completion),
    /// Front-end connection is closed.
    ClientGone(String),
}

/// Connections opened for an `attach` request.
pub struct Attachment {
    host: Option<HostChannel>,
    transport: Transport,
    refresh: bool,
}

/// Result of a call that finished on a worker thread.
pub enum Completion {
    /// Side channel is open and the debug tool installation directory is known.
    HostReady(anyhow::Result<(HostChannel, PathBuf)>),
    /// Transport to the launched debug tool is connected.
    Connected(anyhow::Result<Transport>),
    /// Reply to the attach request of the launch sequence.
    AttachAcked(anyhow::Result<Reply>),
    /// Outcome of an `attach` front-end request.
    Attached(DapRequest, anyhow::Result<Attachment>),
    /// Reply to an `evaluate` front-end request.
    Evaluated(DapRequest, Result<Reply, Error>),
}

/// Place of the last reported stop.
#[derive(Debug, Clone)]
struct StopLocation {
    thread: String,
    line: i64,
    source: Option<String>,
}

/// Debug session state for a single front-end client.
pub struct DebugSession {
    output: DapOutput,
    inputs: Receiver<Input>,
    sender: Sender<Input>,
    config_file: ConfigFile,
    launch: Option<Launch>,
    /// Launch request waiting for the end of the launch sequence.
    launch_request: Option<DapRequest>,
    /// Attach request waiting for its connections.
    attach_request: Option<DapRequest>,
    /// Attach request of the launch sequence is not answered yet, the command session is busy.
    attach_in_flight: bool,
    /// Raised to stop connect retries of an abandoned launch or attach.
    cancelled: Arc<AtomicBool>,
    /// Requests that arrived during the launch sequence.
    deferred: VecDeque<DapRequest>,
    transport: Option<Arc<Transport>>,
    host: Option<HostChannel>,
    resolver: SourceResolver,
    registry: Registry,
    breakpoints: BreakpointSet,
    cursor: Option<LineCursor>,
    last_stop: Option<StopLocation>,
    terminated: bool,
}

impl DebugSession {
    pub fn new(mut reader: DapReader, output: DapOutput, config_file: ConfigFile) -> anyhow::Result<Self> {
        let (sender, inputs) = mpsc::channel();

        let tx = sender.clone();
        thread::Builder::new()
            .name("dap-reader".to_string())
            .spawn(move || loop {
                let input = match reader.read_message() {
                    Ok(msg) => match serde_json::from_value::<DapRequest>(msg) {
                        Ok(req) if req.r#type == "request" => Input::Request(req),
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(target: "dap", "skip malformed request: {e}");
                            continue;
                        }
                    },
                    Err(e) => {
                        let _ = tx.send(Input::ClientGone(format!("{e:#}")));
                        return;
                    }
                };
                if tx.send(input).is_err() {
                    return;
                }
            })?;

        Ok(Self {
            output,
            inputs,
            sender,
            config_file,
            launch: None,
            launch_request: None,
            attach_request: None,
            attach_in_flight: false,
            cancelled: Arc::new(AtomicBool::new(false)),
            deferred: VecDeque::new(),
            transport: None,
            host: None,
            resolver: SourceResolver::default(),
            registry: Registry::new(),
            breakpoints: BreakpointSet::default(),
            cursor: None,
            last_stop: None,
            terminated: false,
        })
    }

    fn transport(&self) -> Result<Arc<Transport>, Error> {
        self.transport.clone().ok_or(Error::NotConnected)
    }

    fn launch_mut(&mut self) -> anyhow::Result<&mut Launch> {
        self.launch
            .as_mut()
            .ok_or_else(|| anyhow!("no launch in progress"))
    }

    /// Run `work` on a worker thread, its result comes back as [`Input::Completed`].
    fn in_background(
        &self,
        name: &str,
        work: impl FnOnce() -> Completion + Send + 'static,
    ) -> anyhow::Result<()> {
        let sender = self.sender.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = sender.send(Input::Completed(work()));
            })?;
        Ok(())
    }

    fn starting(&self) -> bool {
        self.launch_request.is_some() || self.attach_request.is_some()
    }

    fn cancel_connects(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn console(&self) -> Arc<dyn ConsoleSink> {
        Arc::new(self.output.clone())
    }

    fn process_notifier(&self) -> Notifier {
        let sender = Mutex::new(self.sender.clone());
        Arc::new(move |signal| {
            if let Ok(sender) = sender.lock() {
                let _ = sender.send(Input::Process(signal));
            }
        })
    }

    fn emit_stopped(
        &self,
        reason: &str,
        thread_id: i64,
        description: Option<String>,
    ) -> anyhow::Result<()> {
        self.output.send_event_body(
            "stopped",
            json!({
                "reason": reason,
                "threadId": thread_id,
                "allThreadsStopped": true,
                "description": description,
            }),
        )
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        if !self.terminated {
            self.terminated = true;
            self.output.send_event("terminated")?;
        }
        Ok(())
    }

    fn handle_initialize(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let body = json!({
            "supportsConfigurationDoneRequest": true,
            "supportsEvaluateForHovers": true,
            "supportsTerminateRequest": false,
            "supportsRestartRequest": false,
            "supportsSetVariable": false,
            "supportsStepBack": false,
            "supportsCancelRequest": false,
        });
        self.output.send_success_body(req, body)?;
        self.output.send_event("initialized")
    }

    fn ensure_not_started(&self, command: &str) -> anyhow::Result<()> {
        if self.starting()
            || self.launch.is_some()
            || self.transport.is_some()
            || self.cursor.is_some()
        {
            bail!("{command}: debug session already started");
        }
        Ok(())
    }

    fn handle_launch(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        self.ensure_not_started("launch")?;
        let config: LaunchConfig = self
            .config_file
            .resolve(&req.arguments)
            .context("launch: bad arguments")?;

        // Source map (remote/container path mapping).
        self.resolver = SourceResolver::new(SourceMap::new(&config.source_map));
        self.terminated = false;

        if config.offline {
            return self.launch_offline(req, &config);
        }

        self.cancelled = Arc::new(AtomicBool::new(false));
        let mut launch = Launch::new(config, self.process_notifier());
        launch.spawn_primary()?;
        self.launch = Some(launch);
        // response is sent when the launch sequence is over
        self.launch_request = Some(req.clone());
        Ok(())
    }

    fn launch_offline(&mut self, req: &DapRequest, config: &LaunchConfig) -> anyhow::Result<()> {
        let program = config
            .program
            .as_ref()
            .ok_or_else(|| anyhow!("launch: offline mode requires arguments.program"))?;
        let cursor = LineCursor::load(program)
            .with_context(|| format!("launch: load {}", program.display()))?;
        info!(target: "launch", "offline session for {}", program.display());

        let main = self.registry.ensure_thread("main");
        self.cursor = Some(cursor);
        self.output.send_success(req)?;
        if config.stop_on_entry {
            self.stop_on_entry(&main)?;
        }
        Ok(())
    }

    fn on_process_signal(&mut self, signal: ProcessSignal) -> anyhow::Result<()> {
        if let ProcessSignal::Output { stream, line, .. } = &signal {
            self.output.forward(*stream, &format!("{line}\n"));
        }

        // signals of a failed launch processes
        let Some(phase) = self.launch.as_ref().map(Launch::phase) else {
            return Ok(());
        };

        let result = match launch::step(phase, &signal) {
            Step::Ignore => Ok(()),
            Step::PrimaryStarted => self.on_primary_started(),
            Step::DebugToolStarted => self.on_debug_tool_started(),
            Step::Attached => self.complete_launch(),
            Step::EarlyExit(role, code) => Err(Error::EarlyExit(role.into(), code).into()),
            Step::Exited(role, code) => {
                match code {
                    Some(0) => info!(target: "launch", "{role} process exited"),
                    _ => warn!(target: "launch", "{role} process exited with code {code:?}"),
                }
                Ok(())
            }
        };
        if let Err(e) = result {
            self.fail_launch(e)?;
        }
        Ok(())
    }

    fn on_primary_started(&mut self) -> anyhow::Result<()> {
        let launch = self.launch_mut()?;
        launch.advance(Phase::ReplStarted);
        let addr = launch
            .config()
            .host_addr()
            .ok_or_else(|| anyhow!("launch: hostPort is required to locate the debug tool"))?;
        let retry = launch.config().retry_interval();

        let cancelled = self.cancelled.clone();
        self.in_background("host-connect", move || {
            let ready = (|| {
                let mut host = HostChannel::connect_cancellable(&addr, retry, &cancelled)
                    .context("open side channel")?;
                let install_dir = host
                    .extension_directory()
                    .context("locate debug tool installation")?;
                Ok((host, install_dir))
            })();
            Completion::HostReady(ready)
        })
    }

    fn on_host_ready(
        &mut self,
        ready: anyhow::Result<(HostChannel, PathBuf)>,
    ) -> anyhow::Result<()> {
        if self.launch.as_ref().map(Launch::phase) != Some(Phase::ReplStarted) {
            debug!(target: "launch", "side channel of an abandoned launch is dropped");
            return Ok(());
        }
        let (host, install_dir) = ready?;
        self.host = Some(host);

        let launch = self.launch_mut()?;
        launch.spawn_debug_tool(&install_dir)?;
        launch.advance(Phase::DebuggerAttached);
        Ok(())
    }

    fn on_debug_tool_started(&mut self) -> anyhow::Result<()> {
        let launch = self.launch_mut()?;
        let addr = launch.config().repl_addr();
        let options = ConnectOptions {
            retry_interval: launch.config().retry_interval(),
        };

        let mut dialer = CancellableDialer(self.cancelled.clone());
        let console = self.console();
        self.in_background("repl-connect", move || {
            let transport = Transport::connect_with(&mut dialer, &addr, options, console)
                .with_context(|| format!("connect to {addr}"));
            Completion::Connected(transport)
        })
    }

    fn on_connected(&mut self, transport: anyhow::Result<Transport>) -> anyhow::Result<()> {
        let phase = self.launch.as_ref().map(Launch::phase);
        if phase != Some(Phase::DebuggerAttached) || self.transport.is_some() {
            debug!(target: "launch", "connection of an abandoned launch is dropped");
            return Ok(());
        }
        let transport = Arc::new(transport?);
        self.transport = Some(transport.clone());

        let launch = self.launch_mut()?;
        launch.advance(Phase::ReplReady);
        let debug_port = launch.config().debug_port;
        let pending = transport.send(&Request::Attach { port: debug_port })?;
        self.attach_in_flight = true;
        self.in_background("attach-wait", move || {
            let ack = pending
                .wait()
                .with_context(|| format!("attach debug tool to port {debug_port}"));
            Completion::AttachAcked(ack)
        })
    }

    fn on_attach_acked(&mut self, ack: anyhow::Result<Reply>) -> anyhow::Result<()> {
        self.attach_in_flight = false;
        if self.launch_request.is_none() {
            return Ok(());
        }
        let complete = self.launch.as_ref().is_some_and(Launch::is_complete);
        match ack {
            Ok(_) if complete => self.finish_launch(),
            Ok(_) => self.complete_launch(),
            Err(e) if complete => {
                // debug tool already reported that it is attached
                warn!(target: "launch", "{e:#}");
                self.finish_launch()
            }
            Err(e) => Err(e),
        }
    }

    fn complete_launch(&mut self) -> anyhow::Result<()> {
        if !self.launch_mut()?.advance(Phase::LaunchComplete) {
            return Ok(());
        }
        info!(target: "launch", "launch complete");
        if self.attach_in_flight {
            debug!(target: "launch", "wait for the attach reply before using the command session");
            return Ok(());
        }
        self.finish_launch()
    }

    /// Prepare the runtime and answer the launch request.
    fn finish_launch(&mut self) -> anyhow::Result<()> {
        let launch = self.launch_mut()?;
        let stop_on_entry = launch.config().stop_on_entry;
        let refresh = launch.config().refresh_on_launch;

        let transport = self.transport()?;
        if let Some(host) = self.host.as_mut() {
            if let Some(Some(class)) =
                weak_error!(host.breakpoint_exception_class(), "exception breakpoint class:")
            {
                weak_error!(
                    transport.set_exception_breakpoint(&class),
                    "set exception breakpoint:"
                );
            }
        }
        self.start_session(&transport, refresh)?;

        if let Some(req) = self.launch_request.take() {
            self.output.send_success(&req)?;
        }
        match self.registry.thread_by_id(0) {
            Some(main) if stop_on_entry => self.stop_on_entry(&main)?,
            None if stop_on_entry => {
                let main = self.registry.ensure_thread("main");
                self.stop_on_entry(&main)?
            }
            main => {
                let name = main.map(|t| t.name);
                weak_error!(transport.resume(name.as_deref()), "continue after launch:");
            }
        }
        self.replay_deferred()
    }

    /// Common part of launch and attach, after the transport is ready.
    fn start_session(&mut self, transport: &Arc<Transport>, refresh: bool) -> anyhow::Result<()> {
        if let Some(host) = self.host.as_mut() {
            if let Some(roots) = weak_error!(host.source_paths(), "source paths:") {
                self.resolver.set_roots(roots);
            }
        }

        self.restore_breakpoints(transport);

        let sender = self.sender.clone();
        listener::spawn(transport.clone(), move |signal| {
            let _ = sender.send(Input::Listener(signal));
        })?;

        if refresh {
            weak_error!(transport.refresh(), "refresh:");
        }
        weak_error!(self.refresh_threads(transport), "list threads:");
        Ok(())
    }

    /// Send breakpoints that were set while there was no transport.
    fn restore_breakpoints(&self, transport: &Transport) {
        for (local_path, lines) in self.breakpoints.verified() {
            let remote_path = self.resolver.to_remote(local_path);
            weak_error!(transport.clear_breakpoints(&remote_path), "clear breakpoints:");
            for line in lines {
                weak_error!(transport.set_breakpoint(&remote_path, line), "set breakpoint:");
            }
        }
    }

    fn stop_on_entry(&mut self, thread: &Thread) -> anyhow::Result<()> {
        self.last_stop = Some(StopLocation {
            thread: thread.name.clone(),
            line: 1,
            source: None,
        });
        self.emit_stopped("entry", thread.id, None)
    }

    fn fail_launch(&mut self, err: anyhow::Error) -> anyhow::Result<()> {
        warn!(target: "launch", "launch failed: {err:#}");
        self.cancel_connects();
        self.attach_in_flight = false;
        if let Some(mut launch) = self.launch.take() {
            launch.kill_all();
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.host = None;
        if let Some(req) = self.launch_request.take() {
            self.output.send_err(&req, format!("launch failed: {err:#}"))?;
        }
        self.replay_deferred()
    }

    fn replay_deferred(&mut self) -> anyhow::Result<()> {
        // disconnect is never deferred, so replayed requests can't end the session
        while let Some(req) = self.deferred.pop_front() {
            self.on_request(req)?;
        }
        Ok(())
    }

    fn handle_attach(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        self.ensure_not_started("attach")?;
        let config: AttachConfig = self
            .config_file
            .resolve(&req.arguments)
            .context("attach: bad arguments")?;
        self.resolver = SourceResolver::new(SourceMap::new(&config.source_map));
        self.terminated = false;

        self.cancelled = Arc::new(AtomicBool::new(false));
        let cancelled = self.cancelled.clone();
        let console = self.console();
        // response is sent when connections are ready
        self.attach_request = Some(req.clone());
        let req = req.clone();
        self.in_background("attach", move || {
            Completion::Attached(req, connect_attached(&config, console, cancelled))
        })
    }

    fn on_attached(
        &mut self,
        req: &DapRequest,
        attachment: anyhow::Result<Attachment>,
    ) -> anyhow::Result<()> {
        if self.attach_request.take().is_none() {
            debug!(target: "dap", "connections of an abandoned attach are dropped");
            return Ok(());
        }
        let result = attachment.and_then(|attachment| {
            self.host = attachment.host;
            let transport = Arc::new(attachment.transport);
            self.transport = Some(transport.clone());
            self.start_session(&transport, attachment.refresh)
        });
        match result {
            Ok(()) => self.output.send_success(req)?,
            Err(e) => {
                warn!(target: "dap", "attach failed: {e:#}");
                if let Some(transport) = self.transport.take() {
                    transport.close();
                }
                self.host = None;
                self.output.send_err(req, format!("{e:#}"))?;
            }
        }
        self.replay_deferred()
    }

    fn handle_set_breakpoints(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: SetBreakpointsArguments = req.args()?;
        let local_path = args.source.path.clone();
        let remote_path = self.resolver.to_remote(&local_path);
        let transport = self.transport.clone();

        if let Some(transport) = &transport {
            weak_error!(transport.clear_breakpoints(&remote_path), "clear breakpoints:");
        }

        let text = match fs::read_to_string(&local_path) {
            Ok(text) => text,
            Err(e) => {
                warn!("setBreakpoints: read {local_path}: {e}");
                String::new()
            }
        };
        let lines: Vec<&str> = text.lines().collect();

        if let (Some(ns), Some(host)) = (breakpoint::namespace_of(&text), self.host.as_mut()) {
            weak_error!(host.load_namespace(&ns), "load namespace:");
        }

        let mut placed = vec![];
        let mut rsp_bps = vec![];
        for line in args.requested_lines() {
            let placement = breakpoint::place(&lines, line);
            if let (true, Some(transport)) = (placement.verified, &transport) {
                weak_error!(
                    transport.set_breakpoint(&remote_path, placement.line),
                    "set breakpoint:"
                );
            }
            placed.push(placement);
            rsp_bps.push(json!({
                "verified": placement.verified,
                "line": placement.line,
                "source": {"path": local_path},
            }));
        }

        self.breakpoints.replace(&local_path, placed);
        self.output
            .send_success_body(req, json!({"breakpoints": rsp_bps}))
    }

    fn refresh_threads(&mut self, transport: &Transport) -> Result<Vec<Thread>, Error> {
        let names = transport.list_threads()?;
        Ok(self.registry.upsert_threads(&names))
    }

    fn handle_threads(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let threads = if self.cursor.is_some() {
            self.registry.threads()
        } else {
            let transport = self.transport()?;
            self.refresh_threads(&transport)?
        };
        let threads: Vec<Value> = threads
            .iter()
            .map(|t| json!({"id": t.id, "name": t.name}))
            .collect();
        self.output
            .send_success_body(req, json!({"threads": threads}))
    }

    fn frame_json(&self, frame: &Frame) -> Value {
        let name = if frame.source_name.is_empty() {
            format!("frame {}", frame.index)
        } else {
            frame.source_name.clone()
        };
        let source = (!frame.source_path.is_empty()).then(|| {
            json!({
                "name": frame.source_name,
                "path": self.resolver.to_local(&frame.source_path),
            })
        });
        json!({
            "id": frame.index,
            "name": name,
            "source": source,
            "line": frame.line,
            "column": 1,
        })
    }

    fn handle_stack_trace(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: StackTraceArguments = req.args()?;
        let thread = self
            .registry
            .thread_by_id(args.thread_id)
            .ok_or(Error::ThreadNotFound(args.thread_id))?;

        let frames = match &self.cursor {
            Some(cursor) => vec![Frame {
                index: 0,
                thread_name: thread.name.clone(),
                source_name: cursor
                    .path()
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                source_path: cursor.path().to_string_lossy().to_string(),
                line: cursor.current(),
            }],
            None => {
                let frames = self.transport()?.list_frames(&thread.name)?;
                match &self.last_stop {
                    // runtime has no frames for a thread stopped on entry or by an event
                    Some(stop) if frames.is_empty() && stop.thread == thread.name => vec![Frame {
                        index: 0,
                        thread_name: thread.name.clone(),
                        source_name: stop.source.clone().unwrap_or_default(),
                        source_path: stop.source.clone().unwrap_or_default(),
                        line: stop.line,
                    }],
                    _ => frames,
                }
            }
        };
        self.registry.set_frames(frames);

        let total = self.registry.frames().len();
        let levels = args
            .levels
            .filter(|levels| *levels > 0)
            .map(|levels| levels as usize)
            .unwrap_or(total);
        let frames: Vec<Value> = self
            .registry
            .frames()
            .iter()
            .take(levels)
            .map(|f| self.frame_json(f))
            .collect();
        self.output.send_success_body(
            req,
            json!({"stackFrames": frames, "totalFrames": total}),
        )
    }

    fn handle_scopes(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: ScopesArguments = req.args()?;
        let frame = self
            .registry
            .frame(args.frame_id)
            .cloned()
            .ok_or(Error::FrameNotFound(args.frame_id))?;

        let (arguments, locals) = match &self.cursor {
            Some(_) => (vec![], vec![]),
            None => self
                .transport()?
                .list_vars(&frame.thread_name, frame.index)?,
        };
        let locals_ref = self.registry.mint_variable_handle(locals);
        let args_ref = self.registry.mint_variable_handle(arguments);

        let scopes = vec![
            json!({"name": "Locals", "variablesReference": locals_ref, "expensive": false}),
            json!({"name": "Arguments", "variablesReference": args_ref, "expensive": false}),
        ];
        self.output
            .send_success_body(req, json!({"scopes": scopes}))
    }

    fn handle_variables(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: VariablesArguments = req.args()?;
        let vars = self
            .registry
            .resolve_handle(args.variables_reference)
            .ok_or(Error::UnknownReference(args.variables_reference))?;

        let out: Vec<Value> = vars
            .iter()
            .map(|v| json!({"name": v.name, "value": v.value, "variablesReference": 0}))
            .collect();
        self.output
            .send_success_body(req, json!({"variables": out}))
    }

    fn handle_continue(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: ThreadArguments = req.args()?;
        if self.cursor.is_some() {
            self.output
                .send_success_body(req, json!({"allThreadsContinued": true}))?;
            return self.continue_offline();
        }

        let transport = self.transport()?;
        let thread = self.registry.thread_by_id(args.thread_id).map(|t| t.name);
        transport.resume(thread.as_deref())?;
        self.last_stop = None;
        self.output
            .send_success_body(req, json!({"allThreadsContinued": true}))
    }

    /// Run the offline program until the next breakpoint line or the end of the source.
    fn continue_offline(&mut self) -> anyhow::Result<()> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(());
        };
        let path = cursor.path().to_string_lossy().to_string();
        let hit = loop {
            match cursor.next() {
                cursor::Step::Line(line) if self.breakpoints.lines(&path).contains(&line) => {
                    break Some(line);
                }
                cursor::Step::Line(_) => {}
                cursor::Step::End => break None,
            }
        };
        match hit {
            Some(_) => self.emit_stopped("breakpoint", 0, None),
            None => self.terminate(),
        }
    }

    fn handle_step(&mut self, req: &DapRequest, kind: StepKind) -> anyhow::Result<()> {
        let args: ThreadArguments = req.args()?;
        if self.transport.is_none() && kind == StepKind::Over {
            return self.step_offline(req);
        }

        let thread = self
            .registry
            .thread_by_id(args.thread_id)
            .ok_or(Error::ThreadNotFound(args.thread_id))?;
        self.transport()?.step(kind, &thread.name)?;
        self.last_stop = None;
        self.output.send_success(req)
    }

    /// Step over the statically loaded source, used without a transport.
    fn step_offline(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let step = self.cursor.as_mut().ok_or(Error::NotConnected)?.next();
        self.output.send_success(req)?;
        match step {
            cursor::Step::Line(_) => self.emit_stopped("step", 0, None),
            cursor::Step::End => self.terminate(),
        }
    }

    fn handle_evaluate(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: EvaluateArguments = req.args()?;

        let request = match args.frame_id {
            Some(frame_id) => {
                let frame = self
                    .registry
                    .frame(frame_id)
                    .cloned()
                    .ok_or(Error::FrameNotFound(frame_id))?;
                Request::FrameEval {
                    thread: frame.thread_name,
                    frame: frame.index,
                    code: args.expression,
                }
            }
            None => {
                let plain = || EvalContext {
                    code: args.expression.clone(),
                    ns: None,
                };
                let ctx = match self.host.as_mut() {
                    Some(host) => weak_error!(host.eval_context(&args.expression), "eval-code:")
                        .unwrap_or_else(plain),
                    None => plain(),
                };
                Request::Eval {
                    code: ctx.code,
                    ns: ctx.ns,
                }
            }
        };

        // evaluation may stop on a breakpoint, its reply comes after a `continue`
        let pending = self.transport()?.send(&request)?;
        let req = req.clone();
        self.in_background("evaluate", move || Completion::Evaluated(req, pending.wait()))
    }

    fn on_evaluated(
        &mut self,
        req: &DapRequest,
        reply: Result<Reply, Error>,
    ) -> anyhow::Result<()> {
        match reply {
            Ok(reply) => self.output.send_success_body(
                req,
                json!({"result": reply.value, "variablesReference": 0}),
            ),
            Err(e) => self.output.send_err(req, format!("{e:#}")),
        }
    }

    fn handle_disconnect(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        self.cancel_connects();
        if self.launch_request.is_some() {
            self.fail_launch(anyhow!("cancelled by disconnect"))?;
        }
        if let Some(attach) = self.attach_request.take() {
            self.output.send_err(&attach, "attach cancelled by disconnect")?;
            self.replay_deferred()?;
        }

        if let Some(mut launch) = self.launch.take() {
            if let Some(transport) = &self.transport {
                let exit = Request::Eval {
                    code: launch.config().exit_expression.clone(),
                    ns: None,
                };
                // reply is not awaited, the runtime is going away
                muted_error!(transport.send(&exit), "exit expression:");
            }
            launch.kill_all();
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.host = None;
        self.cursor = None;

        self.output.send_success(req)
    }

    /// Return false if session should end.
    fn dispatch(&mut self, req: &DapRequest) -> anyhow::Result<bool> {
        match req.command.as_str() {
            "initialize" => self.handle_initialize(req)?,
            "launch" => self.handle_launch(req)?,
            "attach" => self.handle_attach(req)?,
            "configurationDone" => self.output.send_success(req)?,
            "setBreakpoints" => self.handle_set_breakpoints(req)?,
            "threads" => self.handle_threads(req)?,
            "stackTrace" => self.handle_stack_trace(req)?,
            "scopes" => self.handle_scopes(req)?,
            "variables" => self.handle_variables(req)?,
            "continue" => self.handle_continue(req)?,
            "next" => self.handle_step(req, StepKind::Over)?,
            "stepIn" => self.handle_step(req, StepKind::Into)?,
            "stepOut" => self.handle_step(req, StepKind::Out)?,
            "evaluate" => self.handle_evaluate(req)?,
            "disconnect" => {
                self.handle_disconnect(req)?;
                return Ok(false);
            }
            other => {
                self.output
                    .send_err(req, format!("unsupported command: {other}"))?;
            }
        }
        Ok(true)
    }

    /// Requests that talk to the remote runtime wait for the launch sequence.
    fn needs_transport(command: &str) -> bool {
        matches!(
            command,
            "setBreakpoints"
                | "threads"
                | "stackTrace"
                | "scopes"
                | "continue"
                | "next"
                | "stepIn"
                | "stepOut"
                | "evaluate"
        )
    }

    fn on_request(&mut self, req: DapRequest) -> anyhow::Result<bool> {
        if self.starting() && Self::needs_transport(&req.command) {
            debug!(target: "dap", "defer `{}` until launch is complete", req.command);
            self.deferred.push_back(req);
            return Ok(true);
        }

        match self.dispatch(&req) {
            Ok(cont) => Ok(cont),
            Err(e) => {
                self.output.send_err(&req, format!("{e:#}"))?;
                Ok(true)
            }
        }
    }

    fn on_listener_signal(&mut self, signal: ListenerSignal) -> anyhow::Result<()> {
        match signal {
            ListenerSignal::Event(event) => self.on_remote_event(event),
            ListenerSignal::Stopped(e) => {
                if self.transport.is_none() {
                    return Ok(());
                }
                if e.is_fatal() {
                    warn!("connection to the debug tool is lost: {e:#}");
                    return self.terminate();
                }
                warn!("event listener stopped: {e:#}");
                Ok(())
            }
        }
    }

    fn on_remote_event(&mut self, event: RemoteEvent) -> anyhow::Result<()> {
        let thread = self.registry.ensure_thread(&event.thread);
        let (reason, description) = match &event.kind {
            EventKind::Breakpoint => ("breakpoint", None),
            EventKind::Exception => ("exception", event.message.clone()),
            EventKind::Other(kind) if kind == "step" => ("step", None),
            EventKind::Other(kind) => {
                debug!(target: "repl", "ignore `{kind}` event");
                return Ok(());
            }
        };

        self.last_stop = event.line.map(|line| StopLocation {
            thread: thread.name.clone(),
            line,
            source: event.source.clone(),
        });
        self.emit_stopped(reason, thread.id, description)
    }

    fn on_completion(&mut self, completion: Completion) -> anyhow::Result<()> {
        let result = match completion {
            Completion::HostReady(ready) => self.on_host_ready(ready),
            Completion::Connected(transport) => self.on_connected(transport),
            Completion::AttachAcked(ack) => self.on_attach_acked(ack),
            Completion::Attached(req, attachment) => return self.on_attached(&req, attachment),
            Completion::Evaluated(req, reply) => return self.on_evaluated(&req, reply),
        };
        if let Err(e) = result {
            self.fail_launch(e)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.cancel_connects();
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        if let Some(mut launch) = self.launch.take() {
            launch.kill_all();
        }
        self.output.close();
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        let result = self.run_loop();
        self.shutdown();
        result
    }

    fn run_loop(&mut self) -> anyhow::Result<()> {
        loop {
            let time_left = match self.launch_request {
                Some(_) => self.launch.as_ref().and_then(Launch::time_left),
                None => None,
            };
            let input = match time_left {
                Some(left) => match self.inputs.recv_timeout(left) {
                    Ok(input) => input,
                    Err(RecvTimeoutError::Timeout) => {
                        self.fail_launch(anyhow!("launch did not complete in time"))?;
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => return Ok(()),
                },
                None => match self.inputs.recv() {
                    Ok(input) => input,
                    Err(_) => return Ok(()),
                },
            };

            match input {
                Input::Request(req) => {
                    if !self.on_request(req)? {
                        return Ok(());
                    }
                }
                Input::Process(signal) => self.on_process_signal(signal)?,
                Input::Listener(signal) => self.on_listener_signal(signal)?,
                Input::Completed(completion) => self.on_completion(completion)?,
                Input::ClientGone(reason) => {
                    info!(target: "dap", "client gone: {reason}");
                    return Ok(());
                }
            }
        }
    }
}

/// Open the side channel and the transport of an attach request.
fn connect_attached(
    config: &AttachConfig,
    console: Arc<dyn ConsoleSink>,
    cancelled: Arc<AtomicBool>,
) -> anyhow::Result<Attachment> {
    let retry = Duration::from_millis(config.connect_retry_millis);
    let host = match config.host_addr() {
        Some(addr) => Some(
            HostChannel::connect_cancellable(&addr, retry, &cancelled)
                .context("open side channel")?,
        ),
        None => None,
    };

    let addr = config.addr();
    let transport = Transport::connect_with(
        &mut CancellableDialer(cancelled),
        &addr,
        ConnectOptions {
            retry_interval: retry,
        },
        console,
    )
    .with_context(|| format!("connect to {addr}"))?;
    if let Some(port) = config.debug_port {
        transport
            .attach(port)
            .with_context(|| format!("attach debug tool to port {port}"))?;
    }
    Ok(Attachment {
        host,
        transport,
        refresh: config.refresh_on_launch,
    })
}
