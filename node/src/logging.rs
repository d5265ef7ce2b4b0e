use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

const LOG_SUFFIX: &str = "orcanet_node.log";

/// Initialize logging. Files rotate daily next to the settings file; if
/// that cannot be set up, logging falls back to stdout.
pub fn init(args: &crate::Cli) -> Option<WorkerGuard> {
    let verbose = args.verbose || cfg!(debug_assertions);
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = Targets::new()
        .with_target("orcanet_node", level)
        .with_target("orcanet_shared", level)
        .with_target("libp2p", if verbose { Level::INFO } else { Level::WARN });

    if !args.log_to_stdout {
        match rolling_writer(&log_dir(args)) {
            Ok((writer, guard)) => {
                tracing_subscriber::registry()
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_ansi(false)
                            .with_writer(writer),
                    )
                    .with(filter)
                    .init();
                return Some(guard);
            }
            Err(e) => {
                eprintln!("Failed to set up file logging ({e}), falling back to stdout");
            }
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
    None
}

/// Logs live in the same directory as the settings file.
fn log_dir(args: &crate::Cli) -> PathBuf {
    args.config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Build the non-blocking rotating writer, clearing log files left over
/// from previous runs first.
fn rolling_writer(
    dir: &Path,
) -> Result<(NonBlocking, WorkerGuard), tracing_appender::rolling::InitError> {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().ends_with(LOG_SUFFIX) {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    eprintln!("Failed to remove old log file: {e}");
                }
            }
        }
    }

    let appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_suffix(LOG_SUFFIX)
        .max_log_files(2)
        .build(dir)?;
    Ok(tracing_appender::non_blocking(appender))
}
