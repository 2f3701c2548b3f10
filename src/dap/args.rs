use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on (default: 127.0.0.1:4711)
    #[clap(long, default_value = "127.0.0.1:4711")]
    pub listen: String,

    /// Serve a single session over stdin/stdout instead of TCP.
    #[clap(long, conflicts_with = "oneshot")]
    pub stdio: bool,

    /// Exit after the first debug session ends (single-client mode).
    #[clap(long)]
    pub oneshot: bool,

    /// Optional log file for adapter diagnostics (no output to stdout).
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Trace DAP traffic (requests/responses/events) into the log file.
    /// Requires --log-file.
    #[clap(long)]
    pub trace_dap: bool,

    /// Configuration file (default: ~/.config/replstalker/config.toml).
    #[clap(short, long, env = "REPLSTALKER_CONFIG")]
    pub config: Option<PathBuf>,
}
