use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use replstalker::config::ConfigFile;
use replstalker::dap::args::Args;
use replstalker::dap::io::{DapTransport, FileTracer, StdioTransport, TcpTransport};
use replstalker::dap::logger::DapLogger;
use replstalker::dap::session::DebugSession;
use replstalker::log::{init_default, LOGGER_SWITCHER};
use std::net::{SocketAddr, TcpListener};

/// Run one debug session until the client disconnects.
fn serve(transport: impl DapTransport, config: &ConfigFile, tracer: Option<&FileTracer>) {
    let res = transport.split().and_then(|(reader, output)| {
        let logger = DapLogger::new(output.clone());
        let filter = logger.filter();
        LOGGER_SWITCHER.switch(logger, filter);

        let res = DebugSession::new(reader, output, config.clone()).and_then(DebugSession::run);
        init_default();
        res
    });

    if let Err(err) = res {
        warn!(target: "dap", "session ended with error: {err:#}");
        if let Some(t) = tracer {
            t.line(&format!("session error: {err:#}"));
        }
    } else if let Some(t) = tracer {
        t.line("session finished OK");
    }
}

fn main() -> anyhow::Result<()> {
    init_default();

    let args = Args::parse();
    let config = ConfigFile::from_file(args.config.as_deref());

    let tracer = match (&args.log_file, args.trace_dap) {
        (Some(path), true) => Some(FileTracer::new(path)?),
        (None, true) => {
            warn!(target: "dap", "--trace-dap requires --log-file; tracing disabled");
            None
        }
        _ => None,
    };

    if args.stdio {
        serve(StdioTransport::new(tracer.clone()), &config, tracer.as_ref());
        return Ok(());
    }

    let addr: SocketAddr = args.listen.parse().context("Invalid listen address")?;
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
    info!(target: "dap", "replstalker listening on {}", listener.local_addr()?);

    // Server mode: clients are served one after another, one client is one debug session.
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "dap", "accept failed: {err:#}");
                continue;
            }
        };
        info!(target: "dap", "DAP client connected: {peer}");
        if let Some(t) = &tracer {
            t.line(&format!("client connected: {peer}"));
        }

        match TcpTransport::new(stream, tracer.clone()) {
            Ok(transport) => serve(transport, &config, tracer.as_ref()),
            Err(err) => warn!(target: "dap", "failed to init DAP I/O: {err:#}"),
        }

        if args.oneshot {
            break;
        }
    }
    Ok(())
}
