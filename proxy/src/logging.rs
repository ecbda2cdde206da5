//! Terminal logging for the proxy. Every line is prefixed with a
//! wall-clock timestamp in the operator-chosen strftime format, optionally
//! with microseconds appended; verbose mode turns on the per-packet trace
//! lines logged at debug level.

use chrono::format::{Item, StrftimeItems};
use chrono::Timelike;
use slog::{o, Drain, Level, Logger};
use std::fmt::Write as _;
use std::io;
use std::io::Write as _;

pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%F %T";

/// Validates an operator-supplied strftime format, falling back to the
/// default when it contains specifiers chrono cannot render.
fn checked_format(fmt: &str) -> String {
    let valid = !StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error));
    if valid {
        fmt.to_string()
    } else {
        DEFAULT_TIMESTAMP_FORMAT.to_string()
    }
}

pub fn init(timefmt: &str, microseconds: bool, verbose: bool) -> Logger {
    let fmt = checked_format(timefmt);
    let timestamp = move |out: &mut dyn io::Write| -> io::Result<()> {
        let now = chrono::Local::now();
        let mut stamp = String::new();
        if write!(&mut stamp, "{}", now.format(&fmt)).is_err() {
            stamp = now.format(DEFAULT_TIMESTAMP_FORMAT).to_string();
        }
        if microseconds {
            write!(out, "{}.{:06}", stamp, now.nanosecond() / 1000)
        } else {
            write!(out, "{}", stamp)
        }
    };

    let decorator = slog_term::PlainSyncDecorator::new(io::stdout());
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(timestamp)
        .build()
        .fuse();
    let level = if verbose { Level::Debug } else { Level::Info };
    let drain = drain.filter_level(level).fuse();
    Logger::root(drain, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_format_accepts_default() {
        assert_eq!(checked_format("%F %T"), "%F %T");
        assert_eq!(checked_format("%Y-%m-%dT%H:%M:%S"), "%Y-%m-%dT%H:%M:%S");
    }

    #[test]
    fn test_checked_format_rejects_bad_specifier() {
        assert_eq!(checked_format("%Q-nope"), DEFAULT_TIMESTAMP_FORMAT);
    }
}
