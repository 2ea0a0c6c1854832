use crate::config::LogLevel;
use slog::{o, Drain as _, LevelFilter, Logger};
use slog_term::{FullFormat, PlainSyncDecorator, TestStdoutWriter};

/// Logger for the sandbox. Writes synchronously to standard error so lines
/// interleave with the worker's forwarded output at line granularity instead
/// of being reordered by a drain thread.
pub fn stderr_logger(log_level: LogLevel) -> Logger {
    let decorator = PlainSyncDecorator::new(std::io::stderr());
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = LevelFilter::new(drain, log_level.as_slog_level()).fuse();
    Logger::root(drain, o!())
}

pub fn test_logger() -> Logger {
    let decorator = PlainSyncDecorator::new(TestStdoutWriter);
    let drain = FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}
