//! Forwarding of `log` records to the host's logger.

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use serde::Serialize;

/// Log level in the host's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => Self::Error,
            Level::Warn => Self::Warn,
            Level::Info => Self::Info,
            Level::Debug | Level::Trace => Self::Debug,
        }
    }
}

pub type LogSink = Box<dyn Fn(LogLevel, &str) + Send + Sync + 'static>;

/// `log::Log` implementation handing every enabled record to a host sink.
pub struct HostLogger {
    sink: LogSink,
    max_level: LevelFilter,
}

impl HostLogger {
    pub fn new(sink: LogSink, max_level: LevelFilter) -> Self {
        Self { sink, max_level }
    }
}

impl Log for HostLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("[{}] {}", record.target(), record.args());
        (self.sink)(record.level().into(), &message);
    }

    fn flush(&self) {}
}

/// Install a `HostLogger` as the process-wide logger.
///
/// Fails if another logger is already installed.
pub fn install_host_logger(sink: LogSink, max_level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(HostLogger::new(sink, max_level)))?;
    log::set_max_level(max_level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn forwards_enabled_records() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&lines);
        let logger = HostLogger::new(
            Box::new(move |level, message| l.lock().push((level, message.to_string()))),
            LevelFilter::Info,
        );

        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .target("audio_tap_core::session")
                .args(format_args!("device {} gone", 42))
                .build(),
        );
        logger.log(&Record::builder().level(Level::Debug).args(format_args!("hidden")).build());

        let lines = lines.lock();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], (LogLevel::Warn, "[audio_tap_core::session] device 42 gone".to_string()));
    }

    #[test]
    fn trace_maps_to_debug() {
        assert_eq!(LogLevel::from(Level::Trace), LogLevel::Debug);
        assert_eq!(LogLevel::from(Level::Error).as_str(), "error");
    }
}
