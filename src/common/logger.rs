use log::{Level, LevelFilter, Metadata, Record};

/// Minimal stdout/stderr logger behind the `log` facade, installed by the
/// binary. Library code only emits through the facade.
pub struct Logger {
    level: LevelFilter,
}

impl Logger {
    pub fn init(level: LevelFilter) -> std::result::Result<(), log::SetLoggerError> {
        log::set_boxed_logger(Box::new(Logger { level }))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match record.level() {
            Level::Error | Level::Warn => {
                eprintln!("[{}] {}", record.level(), record.args())
            }
            _ => println!("[{}] {}", record.level(), record.args()),
        }
    }

    fn flush(&self) {}
}
