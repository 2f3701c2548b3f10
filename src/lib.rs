pub mod breakpoint;
pub mod config;
pub mod cursor;
pub mod dap;
pub mod error;
pub mod host;
pub mod launch;
pub mod listener;
pub mod log;
pub mod registry;
pub mod repl;
