//! Process wide logger that can be replaced at runtime.
//!
//! Adapter starts with a plain `env_logger`, a front-end session switches it to a logger that
//! mirrors records into the debug console and switches back when the session ends.

use log::{LevelFilter, Log, Metadata, Record};
use std::sync::RwLock;

pub struct LoggerSwitcher {
    inner: RwLock<Option<Box<dyn Log>>>,
}

pub static LOGGER_SWITCHER: LoggerSwitcher = LoggerSwitcher {
    inner: RwLock::new(None),
};

impl LoggerSwitcher {
    /// Replace current logger. First call also installs the switcher as a global logger.
    pub fn switch(&'static self, logger: impl Log + 'static, filter: LevelFilter) {
        if let Ok(mut inner) = self.inner.write() {
            *inner = Some(Box::new(logger));
        }
        // error means that switcher already installed
        let _ = log::set_logger(self);
        log::set_max_level(filter);
    }
}

impl Log for LoggerSwitcher {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match self.inner.read() {
            Ok(inner) => inner.as_ref().is_some_and(|l| l.enabled(metadata)),
            Err(_) => false,
        }
    }

    fn log(&self, record: &Record) {
        if let Ok(inner) = self.inner.read() {
            if let Some(logger) = inner.as_ref() {
                logger.log(record)
            }
        }
    }

    fn flush(&self) {
        if let Ok(inner) = self.inner.read() {
            if let Some(logger) = inner.as_ref() {
                logger.flush()
            }
        }
    }
}

/// Install default `env_logger` based logger.
pub fn init_default() {
    let logger = env_logger::Logger::from_default_env();
    let filter = logger.filter();
    LOGGER_SWITCHER.switch(logger, filter);
}
