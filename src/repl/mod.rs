//! Client side of the remote evaluation protocol.
//!
//! Requests are bencode dictionaries tagged with a session id. Replies may span several
//! messages, a message without `status` is a partial chunk. Correlation is done by session
//! id only, so each session allows one request in flight.

pub mod accumulator;
pub mod bencode;
pub mod message;
pub mod transport;

pub use message::{EventKind, RemoteEvent, Reply, Request, StepKind};
pub use transport::{
    CancellableDialer, ConnectOptions, ConsoleKind, ConsoleSink, Dialer, TcpDialer, Transport,
};

use strum_macros::Display;

/// Logical session used by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Lane {
    #[strum(serialize = "eval")]
    Eval,
    #[strum(serialize = "command")]
    Command,
    #[strum(serialize = "event")]
    Event,
}
