//! Logging initialisation for jit-launcher.
//!
//! Most of what is worth reading happens off the main thread: the
//! `exception-relay` thread reports signals it re-delivers or declines, and
//! the `vm-worker` thread reports each engine phase. Every line therefore
//! carries its thread name.
//!
//! Setting `JIT_LAUNCHER_LOG=1` also writes `jit-launcher.log` into the log
//! directory and raises this crate's default level to `info`. `RUST_LOG`
//! overrides the default filter either way.

use std::path::{Path, PathBuf};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_ENV: &str = "JIT_LAUNCHER_LOG";
const LOG_FILE: &str = "jit-launcher.log";

/// Keeps the file writer alive; buffered lines are flushed when dropped.
pub struct LogGuard {
    file: Option<PathBuf>,
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl LogGuard {
    /// Where the log file is written, if file logging is on.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }
}

/// Filter used when `RUST_LOG` is unset.
fn default_directives(to_file: bool) -> &'static str {
    if to_file {
        "warn,jit_launcher=info"
    } else {
        "warn"
    }
}

fn file_logging_requested(value: Option<&str>) -> bool {
    value == Some("1")
}

fn env_filter(to_file: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(to_file)))
}

/// Install the global tracing subscriber.
///
/// Call once from `main`. `log_dir` receives the log file; without one the
/// system temp directory is used.
pub fn init(log_dir: Option<PathBuf>) -> LogGuard {
    let to_file = file_logging_requested(std::env::var(LOG_ENV).ok().as_deref());
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true);

    if !to_file {
        tracing_subscriber::registry()
            .with(env_filter(false))
            .with(stderr_layer)
            .init();
        return LogGuard {
            file: None,
            _file_guard: None,
        };
    }

    let dir = log_dir.unwrap_or_else(std::env::temp_dir);
    let _ = std::fs::create_dir_all(&dir);
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, LOG_FILE));

    tracing_subscriber::registry()
        .with(env_filter(true))
        .with(stderr_layer)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true),
        )
        .init();

    LogGuard {
        file: Some(dir.join(LOG_FILE)),
        _file_guard: Some(guard),
    }
}
