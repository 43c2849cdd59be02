//! Logger construction.
//!
//! Every component receives a `slog::Logger` at construction and derives a
//! child logger with its own key-value context.

use slog::{o, Drain, Level, Logger};

/// Build the production root logger: terminal output drained asynchronously,
/// filtered at `level` ("trace", "debug", "info", "warning", "error", "critical").
pub fn create_logger(level: &str) -> Logger {
    let level = parse_level(level);
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = drain.filter_level(level).fuse();
    Logger::root(drain, o!())
}

/// Logger for unit and integration tests; output is captured by the test harness.
pub fn test_logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = drain.filter_level(Level::Info).fuse();
    Logger::root(drain, o!())
}

fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::Trace,
        "debug" => Level::Debug,
        "warn" | "warning" => Level::Warning,
        "error" => Level::Error,
        "critical" | "crit" => Level::Critical,
        _ => Level::Info,
    }
}
