//! Log setup: stderr plus a daily-rolling file under `~/.leadsync/logs/`.
//!
//! `LEADSYNC_DEBUG_LOG=1` forces debug output; otherwise `RUST_LOG` applies,
//! falling back to `info`.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEBUG_ENV: &str = "LEADSYNC_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "leadsync.log";

fn debug_forced() -> bool {
    env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init(logs_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = if debug_forced() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (file_layer, guard) = match logs_dir.filter(|dir| fs_err::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();

    install_panic_hook();
    guard
}

/// Routes panics through tracing instead of the default stderr printer, so
/// they land in the log file with the same format as everything else.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "leadsync panicked");
    }));
}
