//! Tracing subscriber setup.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// File name prefix of the daily log files.
const LOG_FILE: &str = "imagemod.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Filtering follows `RUST_LOG` (default `info`). With `log_dir`, events go to a
/// daily rotated file there through a non-blocking writer and the returned
/// guard must be kept alive to flush it. Without, events go to stderr.
/// If a subscriber is already installed this is a no-op.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_target(true)
                        .with_thread_ids(false)
                        .with_file(false)
                        .with_line_number(false)
                        .with_ansi(false),
                )
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
                .try_init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let guard = init(Some(dir.path()));
        assert!(guard.is_some());

        tracing::info!("first");
        assert!(init(None).is_none());
        drop(guard);

        let logs: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE))
            .collect();
        assert!(!logs.is_empty());
    }
}
