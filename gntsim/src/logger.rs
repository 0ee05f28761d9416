//! Logger implementation

use {
    log::{Level, LevelFilter, Log, Metadata, Record},
    std::io::{self, Write},
};

static LOGGER: Logger = Logger;

/// Initialise logger writing to standard error
pub fn init(level: LevelFilter) {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(level))
        .expect("Failed to set logger");
}

struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{} {}", format_level(record.level()), record.args());
        }
    }

    fn flush(&self) {
        // stderr is unbuffered, there is nothing to report
        io::stderr().flush().ok();
    }
}

fn format_level(level: Level) -> &'static str {
    match level {
        Level::Trace => "\x1b[0;35mTRACE\x1b[0m",
        Level::Debug => "\x1b[0;34mDEBUG\x1b[0m",
        Level::Info => "\x1b[0;32mINFO \x1b[0m",
        Level::Warn => "\x1b[0;33mWARN \x1b[0m",
        Level::Error => "\x1b[0;31mERROR\x1b[0m",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_padded_alike() {
        let visible = |level| format_level(level).replace("\x1b[0m", "").len();
        assert!([Level::Debug, Level::Info, Level::Warn, Level::Error]
            .iter()
            .all(|level| visible(*level) == visible(Level::Trace)));
    }

    #[test]
    fn flush_without_logger_installed() {
        LOGGER.flush();
    }
}
