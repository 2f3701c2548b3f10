//! Debug adapter protocol front end.

pub mod args;
pub mod io;
pub mod logger;
pub mod protocol;
pub mod session;
pub mod sourcemap;
