use std::path::{Path, PathBuf};

use runkit_backend::{MajorVersion, RuntimeKind};
use runkit_platform::AppPaths;

/// Filesystem locations owned by one runtime kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    pub kind: RuntimeKind,
    /// Versioned binaries (`php83`) and the `{kind}.default` pointer.
    pub bin_dir: PathBuf,
    /// Global wrapper scripts.
    pub wrappers_dir: PathBuf,
    /// Parent of the per-major configuration directories.
    pub config_root: PathBuf,
    /// Archive downloads and extraction staging.
    pub downloads_dir: PathBuf,
}

impl RuntimeLayout {
    #[must_use]
    pub fn from_paths(paths: &AppPaths, kind: RuntimeKind) -> Self {
        Self {
            kind,
            bin_dir: paths.runtimes_dir(),
            wrappers_dir: paths.wrappers_dir(),
            config_root: paths.runtime_config_root(kind.as_str()),
            downloads_dir: paths.downloads_dir(),
        }
    }

    /// Layout with every directory under `root`; used by tests and portable
    /// installs.
    #[must_use]
    pub fn rooted(root: &Path, kind: RuntimeKind) -> Self {
        Self::from_paths(&AppPaths::rooted(root), kind)
    }

    #[must_use]
    pub fn binary_path(&self, major: &MajorVersion) -> PathBuf {
        self.bin_dir.join(self.kind.binary_name(major))
    }

    #[must_use]
    pub fn pointer_path(&self) -> PathBuf {
        self.bin_dir.join(self.kind.default_link_name())
    }

    #[must_use]
    pub fn config_dir(&self, major: &MajorVersion) -> PathBuf {
        self.config_root.join(major.to_string())
    }

    #[must_use]
    pub fn wrapper_paths(&self) -> Vec<PathBuf> {
        self.kind
            .wrapper_names()
            .iter()
            .map(|name| self.wrappers_dir.join(wrapper_file_name(name)))
            .collect()
    }

    /// Scratch directory for extracting one major's archive.
    #[must_use]
    pub fn staging_dir(&self, major: &MajorVersion) -> PathBuf {
        self.downloads_dir
            .join(format!(".staging-{}", self.kind.binary_name(major)))
    }
}

fn wrapper_file_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.cmd")
    } else {
        name.to_string()
    }
}
