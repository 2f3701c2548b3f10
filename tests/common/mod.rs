#![allow(dead_code)]

use replstalker::repl::bencode::{self, Value};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn dict(pairs: Vec<(&str, Value)>) -> Value {
    Value::Dict(
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<BTreeMap<_, _>>(),
    )
}

pub fn list(items: Vec<Value>) -> Value {
    Value::List(items)
}

/// Reply message for `req`, tagged with its session.
pub fn reply(req: &Value, mut fields: Vec<(&str, Value)>, done: bool) -> Value {
    if let Some(session) = req.get("session").and_then(Value::as_str) {
        fields.push(("session", session.into()));
    }
    if done {
        fields.push(("status", list(vec!["done".into()])));
    }
    dict(fields)
}

pub fn op(req: &Value) -> &str {
    req.get("op").and_then(Value::as_str).unwrap_or_default()
}

/// Replies of a well-behaved debug tool. `get-event` is never answered.
pub fn default_reply(req: &Value) -> Vec<Value> {
    match op(req) {
        "list-threads" => vec![reply(
            req,
            vec![("threads", list(vec!["main".into(), "worker".into()]))],
            true,
        )],
        "list-frames" => vec![reply(
            req,
            vec![(
                "frames",
                list(vec![dict(vec![
                    ("index", Value::Int(0)),
                    ("source-name", "core.clj".into()),
                    ("source-path", "app/core.clj".into()),
                    ("line", Value::Int(3)),
                ])]),
            )],
            true,
        )],
        "list-vars" => vec![reply(
            req,
            vec![(
                "vars",
                list(vec![
                    list(vec![list(vec!["a".into(), "1".into()])]),
                    list(vec![list(vec!["b".into(), Value::Int(2)])]),
                ]),
            )],
            true,
        )],
        "eval" => {
            let code = req.get("code").and_then(Value::as_str).unwrap_or_default();
            if code.contains("boom") {
                return vec![reply(req, vec![("ex", "class Boom".into())], false)
                    .with_status("eval-error")];
            }
            vec![
                reply(req, vec![("out", "evaluating\n".into())], false),
                reply(req, vec![("value", "4".into())], false),
                reply(req, vec![("value", "2".into())], false),
                reply(req, vec![], true),
            ]
        }
        "frame-eval" => vec![reply(req, vec![("value", "frame-value".into())], true)],
        "get-event" => vec![],
        _ => vec![reply(req, vec![], true)],
    }
}

trait WithStatus {
    fn with_status(self, status: &str) -> Value;
}

impl WithStatus for Value {
    fn with_status(self, status: &str) -> Value {
        match self {
            Value::Dict(mut fields) => {
                fields.insert("status".to_string(), list(vec![status.into()]));
                Value::Dict(fields)
            }
            other => other,
        }
    }
}

type Responder = dyn Fn(&Value) -> Vec<Value> + Send + Sync;

/// Remote evaluation server that records every request.
pub struct FakeRemote {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeRemote {
    pub fn start() -> Self {
        Self::with_responder(default_reply)
    }

    pub fn with_responder(responder: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(vec![]));
        let responder: Arc<Responder> = Arc::new(responder);
        let sessions = Arc::new(AtomicUsize::new(0));

        let recorded = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    return;
                };
                let recorded = recorded.clone();
                let responder = responder.clone();
                let sessions = sessions.clone();
                thread::spawn(move || serve(stream, recorded, responder, sessions));
            }
        });

        Self { addr, requests }
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn ops(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|req| op(req).to_string())
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.ops().iter().filter(|op| *op == name).count()
    }

    /// Wait until a request with `name` op arrives, return it.
    pub fn wait_for_op(&self, name: &str) -> Option<Value> {
        let start = Instant::now();
        while start.elapsed() < WAIT_TIMEOUT {
            if let Some(req) = self.requests().into_iter().find(|req| op(req) == name) {
                return Some(req);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }
}

fn serve(
    stream: TcpStream,
    requests: Arc<Mutex<Vec<Value>>>,
    responder: Arc<Responder>,
    sessions: Arc<AtomicUsize>,
) {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    while let Ok(Some(req)) = bencode::read_value(&mut reader) {
        requests.lock().unwrap().push(req.clone());
        let replies = match op(&req) {
            "clone" => {
                let n = sessions.fetch_add(1, Ordering::SeqCst) + 1;
                vec![dict(vec![
                    ("new-session", format!("session-{n}").into()),
                    ("status", list(vec!["done".into()])),
                ])]
            }
            _ => responder(&req),
        };
        for reply in replies {
            if writer.write_all(&reply.to_bytes()).is_err() {
                return;
            }
        }
    }
}

/// Host side channel: greets with `go-eval` and answers every known request.
pub struct FakeHost {
    pub port: u16,
    events: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl FakeHost {
    pub fn start(install_dir: PathBuf) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let events = Arc::new(Mutex::new(vec![]));

        let recorded = events.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    return;
                };
                let recorded = recorded.clone();
                let install_dir = install_dir.clone();
                thread::spawn(move || serve_host(stream, recorded, install_dir));
            }
        });

        Self { port, events }
    }

    /// Received requests as `{"event": .., "data": ..}` values.
    pub fn events(&self) -> Vec<serde_json::Value> {
        self.events.lock().unwrap().clone()
    }

    pub fn wait_for_event(&self, name: &str) -> Option<serde_json::Value> {
        let start = Instant::now();
        while start.elapsed() < WAIT_TIMEOUT {
            if let Some(e) = self.events().into_iter().find(|e| e["event"] == name) {
                return Some(e);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }
}

fn serve_host(stream: TcpStream, events: Arc<Mutex<Vec<serde_json::Value>>>, install_dir: PathBuf) {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    let mut send = |event: &str, data: serde_json::Value| {
        let line = json!({"event": event, "data": data}).to_string();
        writeln!(writer, "{line}").is_ok()
    };
    if !send("go-eval", serde_json::Value::Null) {
        return;
    }

    let mut line = String::new();
    while matches!(reader.read_line(&mut line), Ok(n) if n > 0) {
        let Ok(msg) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            line.clear();
            continue;
        };
        line.clear();
        events.lock().unwrap().push(msg.clone());

        let data = msg["data"].clone();
        let (event, data) = match msg["event"].as_str().unwrap_or_default() {
            "get-extension-directory" => (
                "get-extension-directory-result",
                json!(install_dir.to_string_lossy()),
            ),
            "get-breakpoint-exception-class" => ("get-breakpoint-exception-class-result", json!("")),
            "get-source-paths" => ("source-path-result", json!([])),
            "load-namespace" => ("load-namespace-result", serde_json::Value::Null),
            "eval-code" => ("eval-code-result", json!({"code": data, "ns": "user"})),
            _ => continue,
        };
        if !send(event, data) {
            return;
        }
    }
}
