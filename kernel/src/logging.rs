use core::fmt::Write;
use core::sync::atomic::{AtomicU8, Ordering};
use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};

use crate::arch::x86_64::interrupts::InterruptGuard;
use crate::arch::x86_64::serial::SERIAL;

#[derive(Default)]
pub struct ConsoleLogger {
    log_level_int: AtomicU8,
}

// Table of log levels corresponding ANSI colour codes
const LOG_LEVEL_COLOURS: [&str; 6] = [
    "\x1b[0m",  // Off
    "\x1b[31m", // Error
    "\x1b[33m", // Warn
    "\x1b[32m", // Info
    "\x1b[34m", // Debug
    "\x1b[36m", // Trace
];

const RESET_COLOUR: &str = "\x1b[0m";

impl ConsoleLogger {
    fn log_level(&self) -> LevelFilter {
        match self.log_level_int.load(Ordering::SeqCst) {
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            5 => LevelFilter::Trace,
            _ => LevelFilter::Off,
        }
    }

    fn set_log_level(&self, level: LevelFilter) {
        self.log_level_int.store(level as u8, Ordering::SeqCst);
        log::info!("Log level set to {}", level);
    }

    fn log_colour(&self, level: Level) -> &'static str {
        LOG_LEVEL_COLOURS
            .get(level as usize)
            .copied()
            .unwrap_or(RESET_COLOUR)
    }
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.log_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Threads log from the timer path too; a tick must not find the console locked.
        let _guard = InterruptGuard::new();
        let mut ser = SERIAL.lock();
        // A console that cannot take the line has nowhere else to report it.
        let _ = writeln!(
            ser,
            "{}[{}] - {}: {}{}",
            self.log_colour(record.level()),
            record.level(),
            record.target(),
            record.args(),
            RESET_COLOUR
        );
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger {
    log_level_int: AtomicU8::new(LevelFilter::Info as u8),
};

pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Trace))?;
    LOGGER.set_log_level(level);

    Ok(())
}

/// Change verbosity after `init`.
pub fn set_level(level: LevelFilter) {
    LOGGER.set_log_level(level);
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    let _guard = InterruptGuard::new();
    let _ = SERIAL.lock().write_fmt(args);
}

/// Raw console output, bypassing the logger's level and decoration.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::logging::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::kprint!("{}\n", format_args!($($arg)*))
    };
}
