use std::sync::{Arc, RwLock};

/// Severity of an engine log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Process-wide sink for engine log messages.
pub type LoggerCallback = dyn Fn(LogLevel, &str) + Send + Sync;

static LOGGER: RwLock<Option<Arc<LoggerCallback>>> = RwLock::new(None);

/// Installs the process-wide logger, returning the previous one. Passing
/// `None` restores the default stderr sink.
pub fn set_logger(logger: Option<Arc<LoggerCallback>>) -> Option<Arc<LoggerCallback>> {
    let mut slot = LOGGER.write().unwrap();
    std::mem::replace(&mut slot, logger)
}

pub(crate) fn log(level: LogLevel, message: &str) {
    let logger = LOGGER.read().unwrap().clone();
    match logger {
        Some(callback) => callback(level, message),
        None => eprintln!("[tagstream {}] {message}", level.as_str()),
    }
}
