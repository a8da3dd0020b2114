use chrono::Local;
use log::{Level, Log, Metadata, Record, SetLoggerError};

/// Timestamped stdout logger for the jade server.
pub struct JadeLogger {
    max_level: Level,
}

static LOGGER: JadeLogger = JadeLogger { max_level: Level::Info };
static TRACE_LOGGER: JadeLogger = JadeLogger { max_level: Level::Trace };
static DEBUG_LOGGER: JadeLogger = JadeLogger { max_level: Level::Debug };
static WARN_LOGGER: JadeLogger = JadeLogger { max_level: Level::Warn };
static ERROR_LOGGER: JadeLogger = JadeLogger { max_level: Level::Error };

impl JadeLogger {
    /// Installs the logger as the global `log` sink at the given level.
    pub fn init(level: Level) -> Result<(), SetLoggerError> {
        let logger: &'static JadeLogger = match level {
            Level::Error => &ERROR_LOGGER,
            Level::Warn => &WARN_LOGGER,
            Level::Info => &LOGGER,
            Level::Debug => &DEBUG_LOGGER,
            Level::Trace => &TRACE_LOGGER,
        };
        log::set_logger(logger)?;
        log::set_max_level(level.to_level_filter());
        Ok(())
    }
}

impl Log for JadeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now = Local::now();
            println!(
                "{} {} {}",
                now.format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}
