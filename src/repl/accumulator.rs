use crate::error::Error;
use crate::repl::message::{Message, Reply, Terminal};

/// Merges a chunked reply of one session until a terminal status arrives.
///
/// `out` and `err` texts are not stored here, the multiplexer forwards them to the console as
/// soon as they arrive.
#[derive(Debug, Default)]
pub struct Accumulator {
    value: String,
    error: String,
    reply: Reply,
    chunks: usize,
}

impl Accumulator {
    /// Append a message. Return reply outcome if message has a terminal status.
    pub fn feed(&mut self, msg: &Message) -> Option<Result<Reply, Error>> {
        self.chunks += 1;
        for (key, value) in &msg.fields {
            match key.as_str() {
                "value" => self.value.push_str(value.as_str().unwrap_or_default()),
                "ex" | "error" => self.error.push_str(value.as_str().unwrap_or_default()),
                "out" | "err" => {}
                _ => {
                    self.reply.fields.insert(key.clone(), value.clone());
                }
            }
        }

        let terminal = msg.terminal()?;
        log::trace!(target: "repl", "reply complete after {} chunk(s)", self.chunks);

        let acc = std::mem::take(self);
        Some(acc.finish(terminal))
    }

    fn finish(self, terminal: Terminal) -> Result<Reply, Error> {
        match (terminal, self.error.is_empty()) {
            (Terminal::Done, true) => Ok(Reply {
                value: self.value,
                fields: self.reply.fields,
            }),
            (Terminal::Done | Terminal::EvalError, false) => Err(Error::Remote(self.error)),
            (Terminal::EvalError, true) => Err(Error::Remote("evaluation error".to_string())),
            (Terminal::Failed(marker), true) => Err(Error::Remote(marker)),
            (Terminal::Failed(marker), false) => {
                Err(Error::Remote(format!("{marker}: {}", self.error)))
            }
        }
    }
}
