use crate::error::Error;
use crate::repl::{RemoteEvent, Transport};
use log::{debug, warn};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// What the listener reports to its owner.
#[derive(Debug)]
pub enum ListenerSignal {
    Event(RemoteEvent),
    /// Listener is finished and will not re-issue a request.
    Stopped(Error),
}

/// Keep a single `get-event` request in flight and report every delivered event.
///
/// A malformed event is skipped, any other failure (transport closed, remote error) stops the
/// loop for good.
pub fn spawn(
    transport: Arc<Transport>,
    notify: impl Fn(ListenerSignal) + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("event-listener".to_string())
        .spawn(move || loop {
            match transport.next_event() {
                Ok(event) => {
                    debug!(target: "repl", "event delivered: {event:?}");
                    notify(ListenerSignal::Event(event));
                }
                Err(Error::MalformedReply(msg)) => {
                    warn!(target: "repl", "skip malformed event: {msg}");
                }
                Err(e) => {
                    debug!(target: "repl", "event listener stopped: {e:#}");
                    notify(ListenerSignal::Stopped(e));
                    return;
                }
            }
        })
}
