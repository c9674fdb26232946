//! Tracing setup: stderr always, plus a daily-rotated file when a log
//! directory is given. Stdout is reserved for JSON output.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_PREFIX: &str = "idlesync-sim.log";

/// Keep the returned guard alive for the life of the process so buffered
/// file output is flushed on exit.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let mut guard = None;
    let file_layer = match log_dir {
        Some(dir) => match fs_err::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
                let (writer, worker_guard) = tracing_appender::non_blocking(appender);
                guard = Some(worker_guard);
                Some(fmt::layer().with_ansi(false).with_writer(writer))
            }
            Err(err) => {
                eprintln!("idlesync-sim: log directory unavailable: {}", err);
                None
            }
        },
        None => None,
    };

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    // A subscriber may already be installed (tests); keep it.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    guard
}

fn debug_enabled() -> bool {
    env::var("IDLESYNC_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}
