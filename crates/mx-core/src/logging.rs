//! Logging initialization using the `tracing` ecosystem.
//!
//! The console always gets a human-readable layer. When a log directory is
//! configured, a second layer writes to a daily-rotating file through a
//! non-blocking writer so the stream reader tasks never stall on disk I/O;
//! the returned [`LogGuard`] must be kept alive for the life of the process
//! or buffered lines are lost on exit.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps the file writer thread alive.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Logging options, usually taken from the `app` block of the config.
#[derive(Debug, Clone)]
pub struct LogOptions<'a> {
    /// Default filter when `RUST_LOG` is unset.
    pub level: &'a str,
    /// Directory for rotating log files.
    pub dir: Option<&'a str>,
    /// File prefix.
    pub file_prefix: &'a str,
    /// Emit JSON lines to the file instead of plain text.
    pub json_file: bool,
}

/// Install the global subscriber. Call once at program start.
pub fn init_logging(opts: &LogOptions<'_>) -> LogGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(opts.level));

    let console_layer = fmt::layer().with_target(true).with_thread_ids(true).with_ansi(true);

    let Some(dir) = opts.dir else {
        tracing_subscriber::registry().with(env_filter).with(console_layer).init();
        return LogGuard { _file: None };
    };

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, opts.file_prefix));
    let file_layer = if opts.json_file {
        fmt::layer().json().with_writer(writer).with_target(true).boxed()
    } else {
        fmt::layer().with_writer(writer).with_ansi(false).with_target(true).with_thread_ids(true).boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(console_layer).with(file_layer).init();
    LogGuard { _file: Some(guard) }
}
