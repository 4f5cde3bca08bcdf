//! Tracing setup.
//!
//! Compact human output goes to stderr, filtered by `RUST_LOG` (default `warn`,
//! or `info` with `--verbose`). When a log directory is given, a JSON copy of
//! every event is written there through a daily rolling, non-blocking appender.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "autopilot.log";

fn default_filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { "info" } else { "warn" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process so buffered file
/// output is flushed. Failing to set up the file layer falls back to stderr
/// only, and a subscriber installed earlier (tests) is left in place.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).compact();

    let file_dir = log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok());
    match file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let installed = tracing_subscriber::registry()
                .with(default_filter(verbose))
                .with(stderr_layer)
                .with(fmt::layer().json().with_writer(writer))
                .try_init()
                .is_ok();
            installed.then_some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(default_filter(verbose))
                .with(stderr_layer)
                .try_init();
            None
        }
    }
}
