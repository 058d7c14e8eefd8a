//! Logging initialisation for qmgr.
//!
//! Logs go to stderr, filtered by `RUST_LOG` (default `warn`, or
//! `qmgr=debug` with `--debug`). When the `QMGR_LOG` environment variable is
//! set to `1`, the same events are also written without colour to
//! `qmgr.log` in the log directory.
//!
//! Keep the returned [`LogGuard`] alive for the duration of the process so
//! buffered file output is flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE: &str = "qmgr.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug { "warn,qmgr=debug" } else { "warn" })
    })
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`. `log_dir` is only used when `QMGR_LOG=1`.
pub fn init(debug: bool, log_dir: &Path) -> LogGuard {
    let file_guard = if std::env::var("QMGR_LOG").as_deref() == Ok("1") {
        let _ = std::fs::create_dir_all(log_dir);
        let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter(debug))
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter(debug))
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}
