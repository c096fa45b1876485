mod commands;
mod paths;

pub use commands::{HideWindow, probe_command};
pub use paths::{AppPaths, AppPathsError, DATA_DIR_ENV};
