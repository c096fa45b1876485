use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, info};
use runkit_backend::{MajorVersion, RuntimeError, RuntimeKind};

use crate::layout::RuntimeLayout;
use crate::probe::remove_path;

/// Generates the files that depend on installed versions: per-major
/// configuration and the global wrapper scripts.
///
/// Existing files are never rewritten so user edits survive.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    layout: RuntimeLayout,
}

impl ArtifactWriter {
    #[must_use]
    pub fn new(layout: RuntimeLayout) -> Self {
        Self { layout }
    }

    /// Write the default config files for `major` that are missing from
    /// `dir`, the directory made by `FilesystemProbe::create_config_directory`.
    /// Returns the files that were written.
    ///
    /// # Errors
    /// Returns an error if a file cannot be created.
    pub async fn ensure_config_files(
        &self,
        major: &MajorVersion,
        dir: &Path,
    ) -> Result<Vec<PathBuf>, RuntimeError> {
        let mut written = Vec::new();
        for name in self.layout.kind.config_files() {
            let path = dir.join(name);
            let contents = default_config(self.layout.kind, name, major, &self.layout);
            if write_if_missing(&path, &contents).await? {
                debug!("Wrote default {}", path.display());
                written.push(path);
            }
        }
        Ok(written)
    }

    /// Write missing wrapper scripts. Returns how many were created.
    ///
    /// # Errors
    /// Returns an error if a wrapper cannot be written.
    pub async fn install_wrappers(&self) -> Result<usize, RuntimeError> {
        tokio::fs::create_dir_all(&self.layout.wrappers_dir)
            .await
            .map_err(|error| RuntimeError::io("failed to create wrapper directory", &error))?;

        let target = self.layout.pointer_path();
        let mut created = 0;
        for path in self.layout.wrapper_paths() {
            if write_if_missing(&path, &wrapper_script(&target)).await? {
                make_executable(&path).await?;
                created += 1;
            }
        }

        if created > 0 {
            info!("Installed {created} {} wrapper scripts", self.layout.kind);
        }
        Ok(created)
    }

    /// Delete wrapper scripts. Returns how many existed.
    ///
    /// # Errors
    /// Returns an error if an existing wrapper cannot be removed.
    pub async fn remove_wrappers(&self) -> Result<usize, RuntimeError> {
        let mut removed = 0;
        for path in self.layout.wrapper_paths() {
            if tokio::fs::symlink_metadata(&path).await.is_ok() {
                remove_path(&path).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {removed} {} wrapper scripts", self.layout.kind);
        }
        Ok(removed)
    }

    pub async fn wrappers_present(&self) -> bool {
        for path in self.layout.wrapper_paths() {
            if tokio::fs::metadata(&path).await.is_err() {
                return false;
            }
        }
        true
    }
}

async fn write_if_missing(path: &Path, contents: &str) -> Result<bool, RuntimeError> {
    use tokio::io::AsyncWriteExt;

    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await;
    let mut file = match file {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(error) => return Err(RuntimeError::io("failed to create artifact", &error)),
    };

    file.write_all(contents.as_bytes())
        .await
        .map_err(|error| RuntimeError::io("failed to write artifact", &error))?;
    file.flush()
        .await
        .map_err(|error| RuntimeError::io("failed to write artifact", &error))?;
    Ok(true)
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<(), RuntimeError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|error| RuntimeError::io("failed to mark wrapper executable", &error))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<(), RuntimeError> {
    Ok(())
}

#[cfg(unix)]
fn wrapper_script(target: &Path) -> String {
    format!(
        "#!/bin/sh\n# Generated by runkit. Runs the current default version.\nexec \"{}\" \"$@\"\n",
        target.display()
    )
}

#[cfg(not(unix))]
fn wrapper_script(target: &Path) -> String {
    format!("@echo off\r\n\"{}\" %*\r\n", target.display())
}

fn default_config(
    kind: RuntimeKind,
    file_name: &str,
    major: &MajorVersion,
    layout: &RuntimeLayout,
) -> String {
    match (kind, file_name) {
        (RuntimeKind::Php, "php.ini") => format!(
            "; PHP {major} settings managed by runkit. Edits are preserved.\n\
             memory_limit = 512M\n\
             upload_max_filesize = 64M\n\
             post_max_size = 64M\n\
             max_execution_time = 120\n\
             display_errors = On\n\
             error_reporting = E_ALL\n\
             date.timezone = UTC\n"
        ),
        (RuntimeKind::Php, "php-fpm.conf") => {
            let digits = major.name_digits();
            format!(
                "; PHP-FPM {major} pool managed by runkit. Edits are preserved.\n\
                 [global]\n\
                 error_log = {log}\n\
                 \n\
                 [www]\n\
                 listen = 127.0.0.1:{port}\n\
                 pm = dynamic\n\
                 pm.max_children = 5\n\
                 pm.start_servers = 1\n\
                 pm.min_spare_servers = 1\n\
                 pm.max_spare_servers = 3\n",
                log = layout.config_dir(major).join("php-fpm.log").display(),
                port = fpm_port(&digits),
            )
        }
        (RuntimeKind::Node, "npmrc") => format!(
            "# npm settings for Node.js {major} managed by runkit. Edits are preserved.\n\
             prefix={}\n\
             fund=false\n\
             update-notifier=false\n",
            layout.config_dir(major).join("global").display()
        ),
        _ => String::new(),
    }
}

/// `9000 + XY`, so 8.3 listens on 9083.
fn fpm_port(digits: &str) -> u32 {
    9000 + digits.parse::<u32>().unwrap_or(0) % 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(root: &Path, kind: RuntimeKind) -> (ArtifactWriter, RuntimeLayout) {
        let layout = RuntimeLayout::rooted(root, kind);
        (ArtifactWriter::new(layout.clone()), layout)
    }

    fn config_dir(layout: &RuntimeLayout, major: &MajorVersion) -> PathBuf {
        let dir = layout.config_dir(major);
        std::fs::create_dir_all(&dir).expect("config dir should be created");
        dir
    }

    #[tokio::test]
    async fn config_files_are_created_once_and_never_overwritten() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (writer, layout) = writer(temp.path(), RuntimeKind::Php);
        let major = MajorVersion::new(8, Some(3));
        let dir = config_dir(&layout, &major);

        let written = writer
            .ensure_config_files(&major, &dir)
            .await
            .expect("config files should be written");
        assert_eq!(written.len(), 2);

        let ini = layout.config_dir(&major).join("php.ini");
        std::fs::write(&ini, "memory_limit = 2G\n").expect("user edit should be written");

        let second = writer
            .ensure_config_files(&major, &dir)
            .await
            .expect("second pass should succeed");
        assert!(second.is_empty());
        assert_eq!(
            std::fs::read_to_string(&ini).expect("ini should be readable"),
            "memory_limit = 2G\n"
        );
        assert!(
            std::fs::read_to_string(layout.config_dir(&major).join("php-fpm.conf"))
                .expect("fpm config should exist")
                .contains("listen = 127.0.0.1:9083")
        );
    }

    #[tokio::test]
    async fn wrappers_install_and_remove() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (writer, _layout) = writer(temp.path(), RuntimeKind::Node);

        assert!(!writer.wrappers_present().await);
        assert_eq!(writer.install_wrappers().await.expect("install"), 1);
        assert_eq!(writer.install_wrappers().await.expect("reinstall"), 0);
        assert!(writer.wrappers_present().await);

        assert_eq!(writer.remove_wrappers().await.expect("remove"), 1);
        assert_eq!(writer.remove_wrappers().await.expect("remove again"), 0);
        assert!(!writer.wrappers_present().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn wrapper_script_execs_default_pointer() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (writer, layout) = writer(temp.path(), RuntimeKind::Php);
        writer.install_wrappers().await.expect("install");

        let path = &layout.wrapper_paths()[0];
        let script = std::fs::read_to_string(path).expect("wrapper should exist");
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains(&layout.pointer_path().display().to_string()));
        let mode = std::fs::metadata(path)
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn fpm_port_derives_from_name_digits() {
        assert_eq!(fpm_port("83"), 9083);
        assert_eq!(fpm_port("74"), 9074);
    }
}
