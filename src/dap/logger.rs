use crate::dap::io::DapOutput;
use log::{Level, LevelFilter};
use std::fmt::Write as _;

/// Logger of a front-end session: records go to `env_logger` as usual, warnings and errors are
/// also mirrored into the debug console.
pub struct DapLogger {
    inner: env_logger::Logger,
    output: DapOutput,
}

impl DapLogger {
    pub fn new(output: DapOutput) -> Self {
        Self {
            inner: env_logger::Logger::from_default_env(),
            output,
        }
    }

    /// Console mirroring needs warn records even if `env_logger` filters them out.
    pub fn filter(&self) -> LevelFilter {
        self.inner.filter().max(LevelFilter::Warn)
    }
}

impl log::Log for DapLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= Level::Warn || self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if self.inner.enabled(record.metadata()) {
            self.inner.log(record);
        }

        // records about the front-end connection itself would loop back into it
        if record.level() > Level::Warn || record.target() == "dap" {
            return;
        }

        let mut output = String::new();
        let _ = write!(output, "[{}] ", record.level());
        if record.target() != "replstalker" {
            let _ = write!(output, "{} ", record.target());
        }
        let _ = writeln!(output, "{}", record.args());
        let _ = self.output.send_output("console", &output);
    }

    fn flush(&self) {
        self.inner.flush()
    }
}
