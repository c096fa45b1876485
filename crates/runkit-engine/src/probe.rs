use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use log::{debug, trace, warn};
use regex::Regex;
use runkit_backend::{DefaultPointer, FullVersion, MajorVersion, RuntimeError, RuntimeKind};
use runkit_platform::probe_command;

use crate::layout::RuntimeLayout;

static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"v?(\d+)\.(\d+)\.(\d+)").expect("VERSION_REGEX must compile")
});

const SPAWN_BUSY_RETRIES: u32 = 3;

/// Pull the first `X.Y.Z` out of a runtime's version banner.
#[must_use]
pub fn parse_version_output(output: &str) -> Option<FullVersion> {
    let captures = VERSION_REGEX.captures(output)?;
    Some(FullVersion::new(
        captures[1].parse().ok()?,
        captures[2].parse().ok()?,
        captures[3].parse().ok()?,
    ))
}

/// Reads and mutates the on-disk state of one runtime kind.
#[derive(Debug, Clone)]
pub struct FilesystemProbe {
    layout: RuntimeLayout,
    version_timeout: Duration,
}

impl FilesystemProbe {
    #[must_use]
    pub fn new(layout: RuntimeLayout, version_timeout: Duration) -> Self {
        Self {
            layout,
            version_timeout,
        }
    }

    #[must_use]
    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    #[must_use]
    pub fn kind(&self) -> RuntimeKind {
        self.layout.kind
    }

    /// List every binary-directory entry whose name maps to a major of this
    /// kind, usable or not.
    ///
    /// # Errors
    /// Returns an error when the directory exists but cannot be listed.
    pub async fn scan_installed(&self) -> Result<BTreeMap<MajorVersion, PathBuf>, RuntimeError> {
        let kind = self.kind();
        let mut found = BTreeMap::new();

        let mut entries = match tokio::fs::read_dir(&self.layout.bin_dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!("{} does not exist yet", self.layout.bin_dir.display());
                return Ok(found);
            }
            Err(error) => {
                return Err(RuntimeError::io("failed to list runtime directory", &error));
            }
        };

        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|error| RuntimeError::io("failed to list runtime directory", &error))?;
            let Some(entry) = entry else {
                break;
            };
            let name = entry.file_name();
            let Some(major) = name.to_str().and_then(|name| kind.parse_binary_name(name)) else {
                continue;
            };
            found.insert(major, entry.path());
        }

        debug!("Scan found {} {kind} binaries", found.len());
        Ok(found)
    }

    pub async fn validate_integrity(&self, path: &Path) -> bool {
        match self.check_integrity(path).await {
            Ok(version) => {
                trace!("{} reports {version}", path.display());
                true
            }
            Err(error) => {
                debug!("Integrity check failed: {error}");
                false
            }
        }
    }

    /// Executable check plus a successful version probe.
    ///
    /// # Errors
    /// Returns one of the integrity errors describing why the binary is not
    /// usable.
    pub async fn check_integrity(&self, path: &Path) -> Result<FullVersion, RuntimeError> {
        if !is_executable(path).await {
            return Err(RuntimeError::BinaryNotExecutable {
                path: path.to_path_buf(),
            });
        }
        self.extract_version(path).await
    }

    /// Run the binary with the kind's version flag and parse its output.
    ///
    /// # Errors
    /// Returns [`RuntimeError::VersionExtractionFailed`] when the process
    /// cannot run, times out or exits unsuccessfully, and
    /// [`RuntimeError::VersionParsingFailed`] when no version is found.
    pub async fn extract_version(&self, path: &Path) -> Result<FullVersion, RuntimeError> {
        let output = self.run_version_probe(path).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(RuntimeError::VersionExtractionFailed {
                path: path.to_path_buf(),
                details: format!("exited with {}: {stderr}", output.status),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        trace!("{} stdout: {stdout}", path.display());
        let version = parse_version_output(&stdout).or_else(|| {
            let stderr = String::from_utf8_lossy(&output.stderr);
            parse_version_output(&stderr)
        });

        version.ok_or_else(|| RuntimeError::VersionParsingFailed {
            path: path.to_path_buf(),
            output: stdout.lines().next().unwrap_or_default().trim().to_string(),
        })
    }

    async fn run_version_probe(&self, path: &Path) -> Result<std::process::Output, RuntimeError> {
        let args = self.kind().version_args();
        let mut attempt = 0;

        loop {
            let mut cmd = probe_command(path, args);
            match tokio::time::timeout(self.version_timeout, cmd.output()).await {
                Ok(Ok(output)) => return Ok(output),
                // A binary written moments ago may still be open in a forked child.
                Ok(Err(error)) if is_text_file_busy(&error) && attempt < SPAWN_BUSY_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok(Err(error)) => {
                    return Err(RuntimeError::VersionExtractionFailed {
                        path: path.to_path_buf(),
                        details: error.to_string(),
                    });
                }
                Err(_) => {
                    return Err(RuntimeError::VersionExtractionFailed {
                        path: path.to_path_buf(),
                        details: format!("timed out after {:?}", self.version_timeout),
                    });
                }
            }
        }
    }

    /// Resolve `{kind}.default` to the major it names.
    pub async fn detect_default_pointer(&self) -> Option<MajorVersion> {
        let pointer_path = self.layout.pointer_path();
        let target = match tokio::fs::read_link(&pointer_path).await {
            Ok(target) => target.to_string_lossy().into_owned(),
            Err(error) if error.kind() == ErrorKind::NotFound => return None,
            Err(_) => tokio::fs::read_to_string(&pointer_path).await.ok()?,
        };

        match DefaultPointer::parse(self.kind(), &target) {
            Ok(pointer) => Some(pointer.major),
            Err(error) => {
                warn!("Ignoring malformed {}: {error}", pointer_path.display());
                None
            }
        }
    }

    /// Point `{kind}.default` at `major`, replacing any previous target.
    ///
    /// # Errors
    /// Returns an error if the pointer cannot be written.
    pub async fn update_default_pointer(&self, major: &MajorVersion) -> Result<(), RuntimeError> {
        let pointer = DefaultPointer::new(self.kind(), major.clone());
        tokio::fs::create_dir_all(&self.layout.bin_dir)
            .await
            .map_err(|error| RuntimeError::io("failed to create runtime directory", &error))?;

        let pointer_path = self.layout.pointer_path();
        let tmp_path = self
            .layout
            .bin_dir
            .join(format!(".{}.{}.tmp", pointer.kind.default_link_name(), std::process::id()));
        remove_path(&tmp_path).await?;
        write_pointer(&tmp_path, &pointer.format()).await?;
        if let Err(error) = tokio::fs::rename(&tmp_path, &pointer_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(RuntimeError::io("failed to replace default pointer", &error));
        }

        debug!("Updated {pointer}");
        Ok(())
    }

    /// Remove `{kind}.default`; absent is success.
    ///
    /// # Errors
    /// Returns an error if an existing pointer cannot be removed.
    pub async fn clear_default_pointer(&self) -> Result<(), RuntimeError> {
        remove_path(&self.layout.pointer_path()).await
    }

    /// Delete the binary for `major`; absent is success.
    ///
    /// # Errors
    /// Returns an error if an existing binary cannot be removed.
    pub async fn delete_installation(&self, major: &MajorVersion) -> Result<(), RuntimeError> {
        let path = self.layout.binary_path(major);
        debug!("Deleting {}", path.display());
        remove_path(&path).await
    }

    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub async fn create_config_directory(
        &self,
        major: &MajorVersion,
    ) -> Result<PathBuf, RuntimeError> {
        let dir = self.layout.config_dir(major);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|error| RuntimeError::io("failed to create config directory", &error))?;
        Ok(dir)
    }

    /// # Errors
    /// Returns an error if an existing directory cannot be removed.
    pub async fn delete_config_directory(&self, major: &MajorVersion) -> Result<(), RuntimeError> {
        remove_path(&self.layout.config_dir(major)).await
    }
}

async fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

fn is_text_file_busy(error: &std::io::Error) -> bool {
    // ETXTBSY
    cfg!(target_os = "linux") && error.raw_os_error() == Some(26)
}

#[cfg(unix)]
async fn write_pointer(path: &Path, target: &str) -> Result<(), RuntimeError> {
    tokio::fs::symlink(target, path)
        .await
        .map_err(|error| RuntimeError::io("failed to create default pointer", &error))
}

#[cfg(not(unix))]
async fn write_pointer(path: &Path, target: &str) -> Result<(), RuntimeError> {
    tokio::fs::write(path, target)
        .await
        .map_err(|error| RuntimeError::io("failed to create default pointer", &error))
}

pub(crate) async fn remove_path(path: &Path) -> Result<(), RuntimeError> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(RuntimeError::io("failed to inspect path", &error)),
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(RuntimeError::io("failed to remove path", &error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_php, probe_for};

    #[test]
    fn parse_version_output_handles_runtime_banners() {
        assert_eq!(
            parse_version_output("PHP 8.3.12 (cli) (built: Sep 24 2024)\nCopyright"),
            Some(FullVersion::new(8, 3, 12))
        );
        assert_eq!(
            parse_version_output("v22.11.0\n"),
            Some(FullVersion::new(22, 11, 0))
        );
        assert_eq!(parse_version_output("Segmentation fault"), None);
    }

    #[tokio::test]
    async fn scan_installed_is_empty_without_directory() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let probe = probe_for(temp.path(), RuntimeKind::Php);

        let found = probe.scan_installed().await.expect("scan should not fail");

        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn scan_installed_matches_names_only() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let probe = probe_for(temp.path(), RuntimeKind::Php);
        let bin_dir = &probe.layout().bin_dir;
        std::fs::create_dir_all(bin_dir).expect("bin dir should be created");
        for name in ["php83", "php74", "php", "php.default", "node22", "php83.bak"] {
            std::fs::write(bin_dir.join(name), b"garbage").expect("fixture should be written");
        }

        let found = probe.scan_installed().await.expect("scan should succeed");

        assert_eq!(
            found.keys().cloned().collect::<Vec<_>>(),
            vec![MajorVersion::new(7, Some(4)), MajorVersion::new(8, Some(3))]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn integrity_rejects_non_executable_and_garbage_output() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let probe = probe_for(temp.path(), RuntimeKind::Php);
        let bin_dir = &probe.layout().bin_dir;
        std::fs::create_dir_all(bin_dir).expect("bin dir should be created");

        let plain = bin_dir.join("php82");
        std::fs::write(&plain, "#!/bin/sh\necho 'PHP 8.2.20'\n").expect("fixture");
        assert!(matches!(
            probe.check_integrity(&plain).await,
            Err(RuntimeError::BinaryNotExecutable { .. })
        ));

        let garbage = bin_dir.join("php81");
        std::fs::write(&garbage, "#!/bin/sh\necho 'hello'\n").expect("fixture");
        std::fs::set_permissions(&garbage, std::fs::Permissions::from_mode(0o755))
            .expect("chmod should succeed");
        assert!(matches!(
            probe.check_integrity(&garbage).await,
            Err(RuntimeError::VersionParsingFailed { ref output, .. }) if output == "hello"
        ));

        let failing = bin_dir.join("php80");
        std::fs::write(&failing, "#!/bin/sh\nexit 3\n").expect("fixture");
        std::fs::set_permissions(&failing, std::fs::Permissions::from_mode(0o755))
            .expect("chmod should succeed");
        assert!(!probe.validate_integrity(&failing).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn extract_version_reads_fake_binary() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let probe = probe_for(temp.path(), RuntimeKind::Php);
        let path = fake_php(probe.layout(), "8.3.12");

        assert_eq!(
            probe.extract_version(&path).await.expect("version should parse"),
            FullVersion::new(8, 3, 12)
        );
        assert!(probe.validate_integrity(&path).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn extract_version_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = RuntimeLayout::rooted(temp.path(), RuntimeKind::Node);
        let probe = FilesystemProbe::new(layout.clone(), Duration::from_millis(100));
        std::fs::create_dir_all(&layout.bin_dir).expect("bin dir should be created");
        let path = layout.bin_dir.join("node22");
        std::fs::write(&path, "#!/bin/sh\nsleep 5\n").expect("fixture");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod should succeed");

        assert!(matches!(
            probe.extract_version(&path).await,
            Err(RuntimeError::VersionExtractionFailed { ref details, .. }) if details.starts_with("timed out")
        ));
    }

    #[tokio::test]
    async fn default_pointer_round_trips_and_replaces() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let probe = probe_for(temp.path(), RuntimeKind::Php);

        assert_eq!(probe.detect_default_pointer().await, None);

        probe
            .update_default_pointer(&MajorVersion::new(8, Some(3)))
            .await
            .expect("pointer should be written");
        probe
            .update_default_pointer(&MajorVersion::new(8, Some(4)))
            .await
            .expect("pointer should be replaced");

        assert_eq!(
            probe.detect_default_pointer().await,
            Some(MajorVersion::new(8, Some(4)))
        );

        probe.clear_default_pointer().await.expect("pointer should be removed");
        probe.clear_default_pointer().await.expect("absent pointer is fine");
        assert_eq!(probe.detect_default_pointer().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn malformed_pointer_is_none() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let probe = probe_for(temp.path(), RuntimeKind::Php);
        std::fs::create_dir_all(&probe.layout().bin_dir).expect("bin dir should be created");
        std::os::unix::fs::symlink("node22", probe.layout().pointer_path())
            .expect("symlink should be created");

        assert_eq!(probe.detect_default_pointer().await, None);
    }

    #[tokio::test]
    async fn mutators_treat_absent_targets_as_success() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let probe = probe_for(temp.path(), RuntimeKind::Php);
        let major = MajorVersion::new(8, Some(3));

        probe.delete_installation(&major).await.expect("absent binary is fine");
        probe.delete_config_directory(&major).await.expect("absent dir is fine");

        let dir = probe
            .create_config_directory(&major)
            .await
            .expect("config dir should be created");
        probe
            .create_config_directory(&major)
            .await
            .expect("existing config dir is fine");
        assert!(dir.is_dir());

        probe.delete_config_directory(&major).await.expect("dir should be removed");
        assert!(!dir.exists());
    }
}
