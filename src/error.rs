use crate::repl::Lane;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    // --------------------------------- transport errors ------------------------------------------
    #[error("not connected")]
    NotConnected,
    #[error("connection closed by remote side")]
    Disconnected,
    #[error("{0} session busy: previous request still waits for a terminal status")]
    SessionBusy(Lane),
    #[error("bencode decoding error: {0}")]
    Decode(String),
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    #[error("clone handshake failed: {0}")]
    Handshake(String),

    // --------------------------------- protocol errors -------------------------------------------
    #[error("{0}")]
    Remote(String),

    // --------------------------------- registry lookups ------------------------------------------
    #[error("thread {0} not found")]
    ThreadNotFound(i64),
    #[error("frame not found: {0}")]
    FrameNotFound(i64),
    #[error("unknown variables reference {0}")]
    UnknownReference(i64),

    // --------------------------------- launch errors ---------------------------------------------
    #[error("side channel: {0}")]
    Host(String),
    #[error("{0} process exited before launch completed (code {1:?})")]
    EarlyExit(&'static str, Option<i32>),
}

impl Error {
    /// Return true if error means that the connection is gone for good.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::NotConnected | Error::Disconnected | Error::Decode(_) | Error::IO(_)
        )
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "replstalker", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "replstalker", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
