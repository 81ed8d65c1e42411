//! Leveled stderr logging for the reactor crates.
//!
//! Lines look like `evmux warn: fd = 7 got EPOLLHUP with no data`. The
//! filter starts at `info` and is configured through a single environment
//! variable, read on first use:
//!
//! ```text
//! EVMUX_LOG=trace          # most verbose level to let through (or "off")
//! EVMUX_LOG=debug,flush    # ...and flush stderr after every line
//! ```
//!
//! `elog_fatal!` and `elog_sysfatal!` log unconditionally and then abort the
//! process; they back the reactor's treatment of programmer errors
//! (wrong-thread access, a failed EPOLL_CTL_ADD). `elog_syserr!` appends the
//! calling thread's `errno` for best-effort failures that are logged and
//! survived.

use std::fmt::{self, Write as _};
use std::io::{self, Write as _};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Severity of one log line, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Severities in rank order; rank doubles as the `as u8` cast.
const LEVELS: [LogLevel; 5] = [
    LogLevel::Error,
    LogLevel::Warn,
    LogLevel::Info,
    LogLevel::Debug,
    LogLevel::Trace,
];

impl LogLevel {
    /// Tag rendered after the crate name on every line.
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Look a level up by its tag, case-insensitively.
    fn parse(name: &str) -> Option<LogLevel> {
        LEVELS
            .into_iter()
            .find(|level| name.eq_ignore_ascii_case(level.tag()))
    }
}

// The filter counts how many severities pass, from `Error` down: 0 silences
// everything, 5 lets trace through. The sentinel marks "environment not read
// yet".
const DEFAULT_FILTER: u8 = LogLevel::Info as u8 + 1;
const FILTER_UNSET: u8 = u8::MAX;

static FILTER: AtomicU8 = AtomicU8::new(FILTER_UNSET);
static FLUSH_LINES: AtomicBool = AtomicBool::new(false);

fn filter() -> u8 {
    let current = FILTER.load(Ordering::Relaxed);
    if current != FILTER_UNSET {
        return current;
    }
    let raw = std::env::var("EVMUX_LOG").unwrap_or_default();
    let (filter, flush) = parse_config(&raw);
    FLUSH_LINES.store(flush, Ordering::Relaxed);
    FILTER.store(filter, Ordering::Relaxed);
    filter
}

/// Parse an `EVMUX_LOG` value: a level tag or `off`, optionally joined by
/// `flush`, comma-separated in any order. Unknown items are ignored.
fn parse_config(raw: &str) -> (u8, bool) {
    let mut filter = DEFAULT_FILTER;
    let mut flush = false;
    for item in raw.split(',') {
        let item = item.trim();
        if item.eq_ignore_ascii_case("flush") {
            flush = true;
        } else if item.eq_ignore_ascii_case("off") {
            filter = 0;
        } else if let Some(level) = LogLevel::parse(item) {
            filter = level as u8 + 1;
        }
    }
    (filter, flush)
}

/// Is `level` currently let through?
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    (level as u8) < filter()
}

/// Override the filter: the most verbose level to allow, or `None` to
/// silence logging entirely. Takes precedence over the environment.
pub fn set_max_level(level: Option<LogLevel>) {
    let filter = match level {
        Some(level) => level as u8 + 1,
        None => 0,
    };
    FILTER.store(filter, Ordering::Relaxed);
}

/// The most verbose level currently allowed.
pub fn max_level() -> Option<LogLevel> {
    match filter() {
        0 => None,
        n => LEVELS.get(n as usize - 1).copied(),
    }
}

/// Internal: assemble one line and hand it to stderr in a single write.
#[doc(hidden)]
pub fn _emit(level: LogLevel, args: fmt::Arguments<'_>, errno: Option<io::Error>) {
    if !enabled(level) {
        return;
    }
    let mut line = String::with_capacity(80);
    let _ = write!(line, "evmux {}: {}", level.tag(), args);
    if let Some(err) = errno {
        let _ = write!(line, ": {}", err);
    }
    line.push('\n');
    let mut stderr = io::stderr().lock();
    let _ = stderr.write_all(line.as_bytes());
    if FLUSH_LINES.load(Ordering::Relaxed) {
        let _ = stderr.flush();
    }
}

/// Internal: like `_emit` but unfiltered, flushed, and followed by an abort.
#[doc(hidden)]
pub fn _emit_fatal(args: fmt::Arguments<'_>, errno: Option<io::Error>) -> ! {
    let mut line = String::with_capacity(80);
    let _ = write!(line, "evmux fatal: {}", args);
    if let Some(err) = errno {
        let _ = write!(line, ": {}", err);
    }
    line.push('\n');
    let mut stderr = io::stderr().lock();
    let _ = stderr.write_all(line.as_bytes());
    let _ = stderr.flush();
    drop(stderr);
    std::process::abort();
}

/// Log at an explicit level; the per-level macros below are the usual
/// entry points.
#[macro_export]
macro_rules! elog {
    ($level:expr, $($arg:tt)*) => {
        $crate::elog::_emit($level, format_args!($($arg)*), None)
    };
}

#[macro_export]
macro_rules! elog_error {
    ($($arg:tt)*) => { $crate::elog!($crate::elog::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! elog_warn {
    ($($arg:tt)*) => { $crate::elog!($crate::elog::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! elog_info {
    ($($arg:tt)*) => { $crate::elog!($crate::elog::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! elog_debug {
    ($($arg:tt)*) => { $crate::elog!($crate::elog::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! elog_trace {
    ($($arg:tt)*) => { $crate::elog!($crate::elog::LogLevel::Trace, $($arg)*) };
}

/// Error line with the calling thread's `errno` appended. The capture
/// happens before the format arguments are evaluated.
#[macro_export]
macro_rules! elog_syserr {
    ($($arg:tt)*) => {{
        let err = ::std::io::Error::last_os_error();
        $crate::elog::_emit(
            $crate::elog::LogLevel::Error,
            format_args!($($arg)*),
            Some(err),
        );
    }};
}

/// Log an unrecoverable misuse, then abort the process.
#[macro_export]
macro_rules! elog_fatal {
    ($($arg:tt)*) => {
        $crate::elog::_emit_fatal(format_args!($($arg)*), None)
    };
}

/// Log an unrecoverable OS failure with `errno`, then abort the process.
#[macro_export]
macro_rules! elog_sysfatal {
    ($($arg:tt)*) => {{
        let err = ::std::io::Error::last_os_error();
        $crate::elog::_emit_fatal(format_args!($($arg)*), Some(err))
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_parse_level_by_tag() {
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("noise"), None);
        assert_eq!(LogLevel::parse(""), None);
    }

    #[test]
    fn test_parse_config_variants() {
        assert_eq!(parse_config(""), (DEFAULT_FILTER, false));
        assert_eq!(parse_config("debug"), (LogLevel::Debug as u8 + 1, false));
        assert_eq!(parse_config("trace,flush"), (LogLevel::Trace as u8 + 1, true));
        assert_eq!(parse_config("flush"), (DEFAULT_FILTER, true));
        assert_eq!(parse_config("off"), (0, false));
        assert_eq!(parse_config("bogus"), (DEFAULT_FILTER, false));
    }

    #[test]
    fn test_filter_override() {
        set_max_level(Some(LogLevel::Warn));
        assert!(enabled(LogLevel::Error));
        assert!(enabled(LogLevel::Warn));
        assert!(!enabled(LogLevel::Info));
        assert_eq!(max_level(), Some(LogLevel::Warn));

        set_max_level(None);
        assert!(!enabled(LogLevel::Error));
        assert_eq!(max_level(), None);

        set_max_level(Some(LogLevel::Info));
    }
}
