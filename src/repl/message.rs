//! Typed requests and replies of the remote evaluation protocol.

use crate::error::Error;
use crate::registry::{Frame, Variable};
use crate::repl::bencode::Value;
use crate::repl::Lane;
use std::collections::BTreeMap;

/// Statuses that finish a reply with an error.
const ERROR_STATUSES: [&str; 5] = [
    "error",
    "unknown-op",
    "unknown-session",
    "namespace-not-found",
    "session-closed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Over,
    Into,
    Out,
}

/// Remote evaluation protocol request, one variant per verb.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Clone,
    Eval {
        code: String,
        ns: Option<String>,
    },
    FrameEval {
        thread: String,
        frame: i64,
        code: String,
    },
    ListThreads,
    ListFrames {
        thread: String,
    },
    ListVars {
        thread: String,
        frame: i64,
    },
    SetBreakpoint {
        path: String,
        line: i64,
    },
    ClearBreakpoints {
        path: String,
    },
    SetExceptionBreakpoint {
        class: String,
    },
    Continue {
        thread: Option<String>,
    },
    Step {
        kind: StepKind,
        thread: String,
    },
    Attach {
        port: u16,
    },
    Refresh,
    GetEvent,
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Clone => "clone",
            Request::Eval { .. } => "eval",
            Request::FrameEval { .. } => "frame-eval",
            Request::ListThreads => "list-threads",
            Request::ListFrames { .. } => "list-frames",
            Request::ListVars { .. } => "list-vars",
            Request::SetBreakpoint { .. } => "set-breakpoint",
            Request::ClearBreakpoints { .. } => "clear-breakpoints",
            Request::SetExceptionBreakpoint { .. } => "set-exception-breakpoint",
            Request::Continue { .. } => "continue",
            Request::Step {
                kind: StepKind::Over,
                ..
            } => "step-over",
            Request::Step {
                kind: StepKind::Into,
                ..
            } => "step-into",
            Request::Step {
                kind: StepKind::Out, ..
            } => "step-out",
            Request::Attach { .. } => "attach",
            Request::Refresh => "refresh",
            Request::GetEvent => "get-event",
        }
    }

    /// Session lane that carries this request.
    pub fn lane(&self) -> Lane {
        match self {
            Request::Eval { .. } | Request::FrameEval { .. } => Lane::Eval,
            Request::GetEvent => Lane::Event,
            _ => Lane::Command,
        }
    }

    /// Build wire message tagged with a session id.
    pub fn to_message(&self, session: Option<&str>) -> Value {
        let mut msg = BTreeMap::new();
        msg.insert("op".to_string(), Value::from(self.op()));
        if let Some(session) = session {
            msg.insert("session".to_string(), Value::from(session));
        }

        let mut put = |k: &str, v: Value| {
            msg.insert(k.to_string(), v);
        };
        match self {
            Request::Clone | Request::ListThreads | Request::Refresh | Request::GetEvent => {}
            Request::Eval { code, ns } => {
                put("code", wrap_code(code).into());
                if let Some(ns) = ns {
                    put("ns", ns.as_str().into());
                }
            }
            Request::FrameEval {
                thread,
                frame,
                code,
            } => {
                put("thread-name", thread.as_str().into());
                put("frame-index", Value::Int(*frame));
                put("code", code.as_str().into());
            }
            Request::ListFrames { thread } => put("thread-name", thread.as_str().into()),
            Request::ListVars { thread, frame } => {
                put("thread-name", thread.as_str().into());
                put("frame-index", Value::Int(*frame));
            }
            Request::SetBreakpoint { path, line } => {
                put("path", path.as_str().into());
                put("line", Value::Int(*line));
            }
            Request::ClearBreakpoints { path } => put("path", path.as_str().into()),
            Request::SetExceptionBreakpoint { class } => put("class", class.as_str().into()),
            Request::Continue { thread } => {
                if let Some(thread) = thread {
                    put("thread-name", thread.as_str().into());
                }
            }
            Request::Step { thread, .. } => put("thread-name", thread.as_str().into()),
            Request::Attach { port } => put("port", Value::Int(*port as i64)),
        }
        Value::Dict(msg)
    }
}

/// Wrap user code so the remote runtime reads it as data instead of treating it as part of the
/// protocol payload.
pub fn wrap_code(code: &str) -> String {
    let mut escaped = String::with_capacity(code.len() + 2);
    for c in code.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            c => escaped.push(c),
        }
    }
    format!("(eval (read-string \"{escaped}\"))")
}

/// How a reply ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Done,
    EvalError,
    Failed(String),
}

/// Single physical message received from the remote side.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub session: Option<String>,
    pub status: Option<Vec<String>>,
    pub fields: BTreeMap<String, Value>,
}

impl Message {
    pub fn from_value(value: Value) -> Result<Message, Error> {
        let Value::Dict(mut fields) = value else {
            return Err(Error::MalformedReply("message is not a dictionary".to_string()));
        };

        let session = match fields.remove("session") {
            None => None,
            Some(v) => Some(
                v.as_str()
                    .ok_or_else(|| Error::MalformedReply("session is not a string".to_string()))?
                    .to_string(),
            ),
        };

        let status = match fields.remove("status") {
            None => None,
            Some(Value::List(items)) => Some(
                items
                    .iter()
                    .map(|s| s.as_str().map(ToString::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        Error::MalformedReply("status contains non-string item".to_string())
                    })?,
            ),
            Some(Value::Bytes(b)) => Some(vec![String::from_utf8_lossy(&b).to_string()]),
            Some(_) => return Err(Error::MalformedReply("status is not a list".to_string())),
        };

        Ok(Message {
            session,
            status,
            fields,
        })
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Classify message status, `None` means that more messages will follow.
    pub fn terminal(&self) -> Option<Terminal> {
        let status = self.status.as_ref()?;
        let first = status.first()?;
        match first.as_str() {
            "done" => {
                match status.iter().find(|s| ERROR_STATUSES.contains(&s.as_str())) {
                    Some(marker) => Some(Terminal::Failed(marker.clone())),
                    None => Some(Terminal::Done),
                }
            }
            "eval-error" => Some(Terminal::EvalError),
            s if ERROR_STATUSES.contains(&s) => Some(Terminal::Failed(s.to_string())),
            _ => None,
        }
    }
}

/// Complete reply assembled from one or more messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub value: String,
    pub fields: BTreeMap<String, Value>,
}

impl Reply {
    fn field(&self, key: &str) -> Result<&Value, Error> {
        self.fields
            .get(key)
            .ok_or_else(|| Error::MalformedReply(format!("reply has no `{key}` key")))
    }

    pub fn new_session(&self) -> Result<String, Error> {
        self.field("new-session")?
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| Error::MalformedReply("`new-session` is not a string".to_string()))
    }

    pub fn threads(&self) -> Result<Vec<String>, Error> {
        let list = self
            .field("threads")?
            .as_list()
            .ok_or_else(|| Error::MalformedReply("`threads` is not a list".to_string()))?;
        list.iter()
            .map(|t| {
                t.as_str()
                    .or_else(|| t.get("name").and_then(Value::as_str))
                    .map(ToString::to_string)
                    .ok_or_else(|| Error::MalformedReply(format!("bad thread entry {t}")))
            })
            .collect()
    }

    pub fn frames(&self, thread_name: &str) -> Result<Vec<Frame>, Error> {
        let list = self
            .field("frames")?
            .as_list()
            .ok_or_else(|| Error::MalformedReply("`frames` is not a list".to_string()))?;

        list.iter()
            .enumerate()
            .map(|(pos, f)| {
                if f.as_dict().is_none() {
                    return Err(Error::MalformedReply(format!("bad frame entry {f}")));
                }
                let text = |key: &str| {
                    f.get(key)
                        .and_then(Value::as_str)
                        .map(ToString::to_string)
                        .unwrap_or_default()
                };
                Ok(Frame {
                    index: f.get("index").and_then(Value::as_int).unwrap_or(pos as i64),
                    thread_name: thread_name.to_string(),
                    source_name: text("source-name"),
                    source_path: text("source-path"),
                    line: f.get("line").and_then(Value::as_int).unwrap_or(0),
                })
            })
            .collect()
    }

    /// Decode `(arguments, locals)` pair.
    pub fn vars(&self) -> Result<(Vec<Variable>, Vec<Variable>), Error> {
        let pair = self
            .field("vars")?
            .as_list()
            .filter(|l| l.len() == 2)
            .ok_or_else(|| Error::MalformedReply("`vars` is not a pair of lists".to_string()))?;
        Ok((decode_vars(&pair[0])?, decode_vars(&pair[1])?))
    }

    pub fn event(&self) -> Result<RemoteEvent, Error> {
        RemoteEvent::from_value(self.field("event")?)
    }
}

fn decode_vars(v: &Value) -> Result<Vec<Variable>, Error> {
    let list = v
        .as_list()
        .ok_or_else(|| Error::MalformedReply(format!("variable list expected, got {v}")))?;
    list.iter()
        .map(|item| {
            let (name, value) = match item {
                Value::List(kv) if kv.len() == 2 => (kv[0].as_str(), Some(render(&kv[1]))),
                Value::Dict(_) => (
                    item.get("name").and_then(Value::as_str),
                    item.get("value").map(render),
                ),
                _ => (None, None),
            };
            match (name, value) {
                (Some(name), Some(value)) => Ok(Variable {
                    name: name.to_string(),
                    value,
                }),
                _ => Err(Error::MalformedReply(format!("bad variable entry {item}"))),
            }
        })
        .collect()
}

fn render(v: &Value) -> String {
    match v {
        Value::Bytes(_) => v.as_str().map(ToString::to_string).unwrap_or_else(|| v.to_string()),
        Value::Int(i) => i.to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Breakpoint,
    Exception,
    Other(String),
}

/// Asynchronous event reported by the debug tool.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub kind: EventKind,
    pub thread: String,
    pub line: Option<i64>,
    pub source: Option<String>,
    pub message: Option<String>,
}

impl RemoteEvent {
    pub fn from_value(v: &Value) -> Result<RemoteEvent, Error> {
        let text = |key: &str| v.get(key).and_then(Value::as_str).map(ToString::to_string);
        let kind = match text("type").as_deref() {
            Some("breakpoint") => EventKind::Breakpoint,
            Some("exception") => EventKind::Exception,
            Some(other) => EventKind::Other(other.to_string()),
            None => return Err(Error::MalformedReply(format!("event without type: {v}"))),
        };
        let thread =
            text("thread").ok_or_else(|| Error::MalformedReply(format!("event without thread: {v}")))?;

        Ok(RemoteEvent {
            kind,
            thread,
            line: v.get("line").and_then(Value::as_int),
            source: text("source"),
            message: text("message"),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::repl::bencode;

    fn message(raw: &str) -> Message {
        Message::from_value(bencode::from_bytes(raw.as_bytes()).unwrap()).unwrap()
    }

    #[test]
    fn test_wrap_code() {
        assert_eq!(wrap_code("(+ 1 2)"), r#"(eval (read-string "(+ 1 2)"))"#);
        assert_eq!(
            wrap_code(r#"(println "a\b")"#),
            r#"(eval (read-string "(println \"a\\b\")"))"#
        );
    }

    #[test]
    fn test_request_message() {
        let req = Request::ListVars {
            thread: "main".to_string(),
            frame: 2,
        };
        assert_eq!(req.lane(), Lane::Command);
        let msg = req.to_message(Some("s1"));
        assert_eq!(msg.get("op").and_then(Value::as_str), Some("list-vars"));
        assert_eq!(msg.get("session").and_then(Value::as_str), Some("s1"));
        assert_eq!(msg.get("frame-index").and_then(Value::as_int), Some(2));

        let eval = Request::Eval {
            code: "x".to_string(),
            ns: Some("user".to_string()),
        };
        assert_eq!(eval.lane(), Lane::Eval);
        let frame_eval = Request::FrameEval {
            thread: "main".to_string(),
            frame: 0,
            code: "x".to_string(),
        };
        assert_eq!(frame_eval.lane(), Lane::Eval);
        assert_eq!(Request::GetEvent.lane(), Lane::Event);
        assert!(Request::Clone.to_message(None).get("session").is_none());
    }

    #[test]
    fn test_terminal_status() {
        struct TestCase {
            raw: &'static str,
            expected: Option<Terminal>,
        }

        let cases = [
            TestCase {
                raw: "d5:value1:1e",
                expected: None,
            },
            TestCase {
                raw: "d6:statusl4:doneee",
                expected: Some(Terminal::Done),
            },
            TestCase {
                raw: "d6:statusl10:eval-erroree",
                expected: Some(Terminal::EvalError),
            },
            TestCase {
                raw: "d6:statusl5:error10:unknown-op4:doneee",
                expected: Some(Terminal::Failed("error".to_string())),
            },
            TestCase {
                raw: "d6:statusl4:done14:session-closedee",
                expected: Some(Terminal::Failed("session-closed".to_string())),
            },
            TestCase {
                raw: "d6:statusl10:need-inputee",
                expected: None,
            },
        ];

        for tc in cases {
            assert_eq!(message(tc.raw).terminal(), tc.expected, "{}", tc.raw);
        }
    }

    #[test]
    fn test_malformed_status() {
        let value = bencode::from_bytes(b"d7:session1:a6:statusi1ee").unwrap();
        assert!(matches!(
            Message::from_value(value),
            Err(Error::MalformedReply(_))
        ));
    }

    #[test]
    fn test_decode_vars() {
        let mut reply = Reply::default();
        reply.fields.insert(
            "vars".to_string(),
            bencode::from_bytes(b"lld4:name1:a5:value1:1eeld4:name1:b5:valuei2eel1:c1:3eee")
                .unwrap(),
        );
        let (args, locals) = reply.vars().unwrap();
        assert_eq!(
            args,
            vec![Variable {
                name: "a".to_string(),
                value: "1".to_string()
            }]
        );
        assert_eq!(locals.len(), 2);
        assert_eq!(locals[0].value, "2");
        assert_eq!(locals[1].name, "c");

        // entry without a value
        reply.fields.insert(
            "vars".to_string(),
            bencode::from_bytes(b"lld4:name1:aeele").unwrap(),
        );
        assert!(matches!(reply.vars(), Err(Error::MalformedReply(_))));
    }

    #[test]
    fn test_decode_event() {
        let v = bencode::from_bytes(b"d4:linei12e6:thread4:main4:type10:breakpointe").unwrap();
        let event = RemoteEvent::from_value(&v).unwrap();
        assert_eq!(event.kind, EventKind::Breakpoint);
        assert_eq!(event.thread, "main");
        assert_eq!(event.line, Some(12));

        let v = bencode::from_bytes(b"d4:type9:exceptione").unwrap();
        assert!(RemoteEvent::from_value(&v).is_err());
    }
}
