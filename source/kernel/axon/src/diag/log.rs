// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel log records, level threshold and output sink
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (line format, threshold)
//! PUBLIC API: log_* macros, Level, Record, emit, set_max_level, max_level
//! DEPENDS_ON: uart::KernelUart (OS), std stderr (unit tests)
//! INVARIANTS:
//!   - One record is one line: `[LEVEL target] message`
//!   - Debug/Trace never reach the sink in release builds, whatever the threshold
//!
//! Subsystems log under a fixed target: "shm", "task", "mm", "syscall".

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// Severity of a record; lower is more severe.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }

    const fn compiled_in(self) -> bool {
        cfg!(debug_assertions) || (self as u8) <= Level::Info as u8
    }
}

const DEFAULT_MAX: Level = if cfg!(debug_assertions) { Level::Trace } else { Level::Info };

static MAX_LEVEL: AtomicU8 = AtomicU8::new(DEFAULT_MAX as u8);

/// Lowers or raises the most verbose level that reaches the sink.
pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn max_level() -> Level {
    Level::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

/// Whether a record at `level` would currently be written.
#[inline]
pub fn enabled(level: Level) -> bool {
    level.compiled_in() && level <= max_level()
}

/// One log line before it hits the sink.
pub struct Record<'a> {
    pub level: Level,
    pub target: &'static str,
    pub args: fmt::Arguments<'a>,
}

impl fmt::Display for Record<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}] {}", self.level.as_str(), self.target, self.args)
    }
}

/// Writes one record if its level passes the threshold.
pub fn emit(level: Level, target: &'static str, args: fmt::Arguments<'_>) {
    if enabled(level) {
        sink(&Record { level, target, args });
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn sink(record: &Record<'_>) {
    use core::fmt::Write;

    let mut uart = crate::uart::KernelUart::lock();
    let _ = writeln!(&mut *uart, "{record}");
}

#[cfg(all(test, not(all(target_arch = "riscv64", target_os = "none"))))]
fn sink(record: &Record<'_>) {
    std::eprintln!("{record}");
}

// Host library builds have no console.
#[cfg(all(not(test), not(all(target_arch = "riscv64", target_os = "none"))))]
fn sink(_record: &Record<'_>) {}

#[doc(hidden)]
#[macro_export]
macro_rules! __log {
    ($level:ident, target: $target:expr, $($arg:tt)+) => {
        $crate::diag::log::emit($crate::diag::log::Level::$level, $target, format_args!($($arg)+))
    };
    ($level:ident, $($arg:tt)+) => {
        $crate::diag::log::emit($crate::diag::log::Level::$level, module_path!(), format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)+) => { $crate::__log!(Error, $($arg)+) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)+) => { $crate::__log!(Warn, $($arg)+) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)+) => { $crate::__log!(Info, $($arg)+) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)+) => { $crate::__log!(Debug, $($arg)+) };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)+) => { $crate::__log!(Trace, $($arg)+) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_renders_as_one_line() {
        let fd = 3;
        let line = std::format!(
            "{}",
            Record { level: Level::Warn, target: "shm", args: format_args!("close fd {fd}") }
        );
        assert_eq!(line, "[WARN shm] close fd 3");
    }

    #[test]
    fn threshold_filters_verbose_levels() {
        let saved = max_level();
        set_max_level(Level::Warn);
        assert!(enabled(Level::Error));
        assert!(enabled(Level::Warn));
        assert!(!enabled(Level::Info));
        assert!(!enabled(Level::Trace));
        set_max_level(saved);
        assert_eq!(enabled(Level::Debug), cfg!(debug_assertions) && saved >= Level::Debug);
    }
}
