use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(debug_assertions)]
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use simplelog::{CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, WriteLogger};

use runkit_backend::RuntimeKind;
use runkit_platform::AppPaths;

/// `debug.log` becomes `debug.log.1`.
fn rotated_path(log_path: &Path) -> PathBuf {
    let mut name = log_path
        .file_name()
        .map_or_else(|| OsString::from("runkit.log"), OsString::from);
    name.push(".1");
    log_path.with_file_name(name)
}

/// Move an oversized log aside, replacing the previous rotation.
fn rotate_if_oversized(log_path: &Path, max_log_size: u64) -> io::Result<bool> {
    match std::fs::metadata(log_path) {
        Ok(metadata) if metadata.len() > max_log_size => {
            std::fs::rename(log_path, rotated_path(log_path))?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

fn open_log(log_path: &Path) -> io::Result<File> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(log_path)
}

fn max_level(debug_enabled: bool) -> LevelFilter {
    if debug_enabled {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Install the file logger (plus a stderr logger in debug builds) and open
/// the run with a header naming the runtime kind and command.
///
/// Failures are logged where possible and never stop a command.
pub fn init_logging(
    paths: &AppPaths,
    kind: RuntimeKind,
    command: &str,
    debug_enabled: bool,
    max_log_size: u64,
) {
    let log_path = paths.log_file();
    let rotation = rotate_if_oversized(&log_path, max_log_size);

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_thread_level(LevelFilter::Off)
        .add_filter_allow_str("runkit")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    #[cfg(debug_assertions)]
    loggers.push(TermLogger::new(
        LevelFilter::Debug,
        config.clone(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    ));
    let open_error = match open_log(&log_path) {
        Ok(file) => {
            loggers.push(WriteLogger::new(LevelFilter::Debug, config, file));
            None
        }
        Err(error) => Some(error),
    };
    if !loggers.is_empty() {
        let _ = CombinedLogger::init(loggers);
    }
    log::set_max_level(max_level(debug_enabled));

    log::info!("runkit {} {kind} {command}", env!("CARGO_PKG_VERSION"));
    match rotation {
        Ok(true) => log::info!("Previous log moved to {}", rotated_path(&log_path).display()),
        Ok(false) => {}
        Err(error) => log::warn!("Failed to rotate {}: {error}", log_path.display()),
    }
    if let Some(error) = open_error {
        log::warn!("Logging to {} is disabled: {error}", log_path.display());
    }
    log::debug!("Log file: {}", log_path.display());
}
