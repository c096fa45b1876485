use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use runkit_backend::{
    ArchiveService, DownloadProgress, ExtractOptions, MajorVersion, MetadataCatalog, ProgressFn,
    RemoteMetadataEntry, RuntimeError,
};

use crate::layout::RuntimeLayout;
use crate::probe::remove_path;

/// A binary shipped with the application, used when nothing is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundledFallback {
    pub major: MajorVersion,
    pub path: PathBuf,
}

/// Places runtime binaries into the binary directory, either from the
/// catalog (download, verify, extract) or from the bundled fallback.
#[derive(Clone)]
pub struct Installer {
    layout: RuntimeLayout,
    catalog: Arc<dyn MetadataCatalog>,
    archive: Arc<dyn ArchiveService>,
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl Installer {
    #[must_use]
    pub fn new(
        layout: RuntimeLayout,
        catalog: Arc<dyn MetadataCatalog>,
        archive: Arc<dyn ArchiveService>,
    ) -> Self {
        Self {
            layout,
            catalog,
            archive,
        }
    }

    /// Catalog entry for `major`.
    ///
    /// # Errors
    /// Returns [`RuntimeError::MetadataUnavailable`] when the catalog cannot be
    /// read and [`RuntimeError::VersionNotAvailable`] when it has no entry.
    pub async fn metadata(&self, major: &MajorVersion) -> Result<RemoteMetadataEntry, RuntimeError> {
        let kind = self.layout.kind;
        self.catalog
            .entry(kind, major)
            .await?
            .ok_or_else(|| RuntimeError::VersionNotAvailable {
                kind,
                major: major.clone(),
            })
    }

    /// Download and verify the archive for `entry`.
    ///
    /// # Errors
    /// Returns the archive service's download or checksum error.
    pub async fn download(
        &self,
        entry: &RemoteMetadataEntry,
        progress: ProgressFn<'_>,
    ) -> Result<PathBuf, RuntimeError> {
        info!("Downloading {} {}", self.layout.kind, entry.latest_version);
        self.archive
            .fetch(
                &entry.download,
                &entry.checksum,
                &self.layout.downloads_dir,
                progress,
            )
            .await
    }

    /// Extract `archive` and move its binary to the path for `major`.
    /// The archive and staging directory are removed afterwards.
    ///
    /// # Errors
    /// Returns [`RuntimeError::ExtractionFailed`] when the archive cannot be
    /// unpacked or lacks the binary, or an I/O error when placing it fails.
    pub async fn extract_and_place(
        &self,
        major: &MajorVersion,
        entry: &RemoteMetadataEntry,
        archive: &Path,
    ) -> Result<PathBuf, RuntimeError> {
        let binary_name = self.layout.kind.binary_name(major);
        let staging = self.layout.staging_dir(major);
        remove_path(&staging).await?;
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|error| RuntimeError::io("failed to create staging directory", &error))?;

        let options = ExtractOptions::for_binary(&entry.download, &binary_name);
        let result = match self.archive.extract(archive, &staging, &options).await {
            Ok(()) => place_binary(&staging.join(&binary_name), &self.layout.binary_path(major)).await,
            Err(error) => Err(error),
        };

        if let Err(error) = remove_path(&staging).await {
            warn!("Failed to clean up {}: {error}", staging.display());
        }
        if let Err(error) = remove_path(archive).await {
            warn!("Failed to clean up {}: {error}", archive.display());
        }
        result
    }

    /// Download, extract and place the catalog's latest release of `major`.
    ///
    /// # Errors
    /// Returns the first metadata, download or extraction error.
    pub async fn install_from_catalog(&self, major: &MajorVersion) -> Result<PathBuf, RuntimeError> {
        let entry = self.metadata(major).await?;
        let archive = self.download(&entry, &|_: DownloadProgress| {}).await?;
        self.extract_and_place(major, &entry, &archive).await
    }

    /// Copy the bundled binary to the path for its major.
    ///
    /// # Errors
    /// Returns an I/O error when the bundled binary cannot be copied.
    pub async fn copy_bundled(&self, fallback: &BundledFallback) -> Result<PathBuf, RuntimeError> {
        info!(
            "Copying bundled {} {} from {}",
            self.layout.kind,
            fallback.major,
            fallback.path.display()
        );
        place_binary(&fallback.path, &self.layout.binary_path(&fallback.major)).await
    }
}

/// Copy `source` next to `target` under a name the scanner ignores, mark it
/// executable, then rename it over `target`.
async fn place_binary(source: &Path, target: &Path) -> Result<PathBuf, RuntimeError> {
    let parent = target.parent().ok_or_else(|| RuntimeError::Io {
        context: "binary path has no parent",
        kind: std::io::ErrorKind::InvalidInput,
        message: target.display().to_string(),
    })?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|error| RuntimeError::io("failed to create runtime directory", &error))?;

    let file_name = target
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("runtime");
    let partial = parent.join(format!(".{file_name}.partial"));
    remove_path(&partial).await?;

    if let Err(error) = tokio::fs::copy(source, &partial).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(RuntimeError::io("failed to copy runtime binary", &error));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&partial, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|error| RuntimeError::io("failed to mark binary executable", &error))?;
    }

    if let Err(error) = tokio::fs::rename(&partial, target).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(RuntimeError::io("failed to move runtime binary into place", &error));
    }

    debug!("Placed {}", target.display());
    Ok(target.to_path_buf())
}
