use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use runkit_backend::{
    ArchiveService, DownloadDescriptor, DownloadProgress, ExtractOptions, ProgressFn,
    RuntimeError,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

pub const DEFAULT_RETRY_DELAYS_SECS: [u64; 3] = [0, 2, 5];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to download {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("download failed with HTTP {status} for {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Zip {
        context: &'static str,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("archive has no entry '{name}'")]
    MissingEntry { name: String },
    #[error("{0}")]
    Invalid(String),
}

impl ArchiveError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    fn zip(context: &'static str, source: zip::result::ZipError) -> Self {
        Self::Zip { context, source }
    }

    fn io_with_path(context: &'static str, path: &Path, source: &std::io::Error) -> Self {
        Self::io(
            context,
            std::io::Error::new(source.kind(), format!("{}: {source}", path.display())),
        )
    }

    fn is_transient(&self) -> bool {
        matches!(self, Self::Request { .. } | Self::Status { .. } | Self::Io { .. })
    }

    fn into_download_error(self, url: &str) -> RuntimeError {
        match self {
            Self::ChecksumMismatch { expected, actual } => {
                RuntimeError::ChecksumMismatch { expected, actual }
            }
            other => RuntimeError::download_failed(url, other),
        }
    }
}

/// Downloads runtime archives over HTTP (or copies `file://` sources),
/// verifies them and unpacks zip archives.
#[derive(Debug, Clone)]
pub struct HttpArchiveService {
    client: reqwest::Client,
    retry_delays: Vec<Duration>,
}

impl HttpArchiveService {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            retry_delays: DEFAULT_RETRY_DELAYS_SECS
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
        }
    }

    /// Delay before each attempt; the number of entries is the attempt count.
    #[must_use]
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        if delays.is_empty() {
            self.retry_delays = vec![Duration::ZERO];
        } else {
            self.retry_delays = delays;
        }
        self
    }

    /// Download `url` into `dest_dir`, verify it and return the final path.
    ///
    /// # Errors
    /// Returns an error if every attempt fails, the checksum is missing or
    /// does not match, or the file cannot be moved into place.
    pub async fn download_verified(
        &self,
        url: &str,
        expected_sha256: &str,
        dest_dir: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<PathBuf, ArchiveError> {
        if expected_sha256.trim().is_empty() {
            return Err(ArchiveError::Invalid(format!(
                "no checksum published for {url}; refusing unverified download"
            )));
        }

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|error| ArchiveError::io_with_path("failed to create download directory", dest_dir, &error))?;

        let final_path = dest_dir.join(archive_file_name(url));
        let temp = self.download_with_retries(url, dest_dir, progress).await?;

        let actual = sha256_file(temp.path())?;
        if !actual.eq_ignore_ascii_case(expected_sha256.trim()) {
            warn!("Checksum mismatch for {url}");
            return Err(ArchiveError::ChecksumMismatch {
                expected: expected_sha256.trim().to_ascii_lowercase(),
                actual,
            });
        }

        temp.persist(&final_path).map_err(|error| {
            ArchiveError::io_with_path("failed to move download into place", &final_path, &error.error)
        })?;

        info!("Downloaded and verified {}", final_path.display());
        Ok(final_path)
    }

    async fn download_with_retries(
        &self,
        url: &str,
        dest_dir: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<tempfile::NamedTempFile, ArchiveError> {
        let mut last_error = None;

        for (attempt, delay) in self.retry_delays.iter().enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }

            match self.download_once(url, dest_dir, progress).await {
                Ok(file) => return Ok(file),
                Err(error) if error.is_transient() => {
                    warn!("Download attempt {} for {url} failed: {error}", attempt + 1);
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ArchiveError::Invalid(format!("no download attempts configured for {url}"))
        }))
    }

    async fn download_once(
        &self,
        url: &str,
        dest_dir: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<tempfile::NamedTempFile, ArchiveError> {
        use futures_util::StreamExt;

        let temp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(dest_dir)
            .map_err(|error| ArchiveError::io("failed to create download file", error))?;

        if let Some(source) = url.strip_prefix("file://") {
            let copied = tokio::fs::copy(source, temp.path())
                .await
                .map_err(|error| {
                    ArchiveError::Invalid(format!("failed to copy local archive {source}: {error}"))
                })?;
            progress(DownloadProgress {
                downloaded: copied,
                total: copied,
            });
            return Ok(temp);
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| ArchiveError::Request {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(ArchiveError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let total = response.content_length().unwrap_or(0);
        let mut downloaded: u64 = 0;

        let std_file = temp
            .reopen()
            .map_err(|error| ArchiveError::io("failed to open download file", error))?;
        let mut file = tokio::fs::File::from_std(std_file);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| ArchiveError::Request {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|error| ArchiveError::io("failed to write download data", error))?;
            downloaded += chunk.len() as u64;
            progress(DownloadProgress { downloaded, total });
        }

        file.flush()
            .await
            .map_err(|error| ArchiveError::io("failed to flush download file", error))?;

        debug!("Download complete: {downloaded} bytes from {url}");
        Ok(temp)
    }
}

#[async_trait]
impl ArchiveService for HttpArchiveService {
    async fn fetch(
        &self,
        descriptor: &DownloadDescriptor,
        checksum: &str,
        dest_dir: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<PathBuf, RuntimeError> {
        self.download_verified(&descriptor.url, checksum, dest_dir, progress)
            .await
            .map_err(|error| error.into_download_error(&descriptor.url))
    }

    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        options: &ExtractOptions,
    ) -> Result<(), RuntimeError> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        let options = options.clone();

        tokio::task::spawn_blocking(move || extract_zip(&archive, &dest, &options))
            .await
            .map_err(|error| RuntimeError::extraction_failed(format!("extraction task failed: {error}")))?
            .map_err(|error| RuntimeError::extraction_failed(error.to_string()))
    }
}

fn archive_file_name(url: &str) -> &str {
    let raw_name = url.rsplit('/').next().unwrap_or("runtime-download");
    Path::new(raw_name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && !n.contains(".."))
        .unwrap_or("runtime-download")
}

/// Compute the lowercase hex SHA-256 digest of a file.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn sha256_file(path: &Path) -> Result<String, ArchiveError> {
    let mut file = std::fs::File::open(path).map_err(|error| {
        ArchiveError::io_with_path("failed to open file for checksum", path, &error)
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];

    loop {
        let read = file.read(&mut buffer).map_err(|error| {
            ArchiveError::io_with_path("failed to read file for checksum", path, &error)
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Extract a zip archive into `dest`.
///
/// Leading path components are stripped per `options`, entries that become
/// empty after stripping are skipped, and entries matching a rename source
/// are written to `dest/<new name>`. Every rename source must be present.
///
/// # Errors
/// Returns an error when the archive cannot be read, a file cannot be
/// written, or a rename source is missing from the archive.
pub fn extract_zip(zip_path: &Path, dest: &Path, options: &ExtractOptions) -> Result<(), ArchiveError> {
    let file = std::fs::File::open(zip_path)
        .map_err(|error| ArchiveError::io_with_path("failed to open zip file", zip_path, &error))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|error| ArchiveError::zip("failed to read zip archive", error))?;
    let mut renamed = vec![false; options.renames.len()];

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|error| ArchiveError::zip("failed to read zip entry", error))?;
        let Some(name) = entry.enclosed_name() else {
            warn!("Skipping zip entry with unsafe path");
            continue;
        };
        let stripped: PathBuf = name.components().skip(options.strip_components).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }

        let rename = options
            .renames
            .iter()
            .position(|(source, _)| Path::new(source) == stripped);
        let out_path = match rename {
            Some(index) => {
                renamed[index] = true;
                dest.join(&options.renames[index].1)
            }
            None => dest.join(&stripped),
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|error| {
                ArchiveError::io_with_path("failed to create extraction directory", &out_path, &error)
            })?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                ArchiveError::io_with_path("failed to create extraction parent directory", parent, &error)
            })?;
        }
        let mut outfile = std::fs::File::create(&out_path).map_err(|error| {
            ArchiveError::io_with_path("failed to create extracted file", &out_path, &error)
        })?;
        std::io::copy(&mut entry, &mut outfile).map_err(|error| {
            ArchiveError::io_with_path("failed to extract archive entry", &out_path, &error)
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = match (entry.unix_mode(), rename.is_some()) {
                (Some(mode), true) => Some(mode | 0o755),
                (Some(mode), false) => Some(mode),
                (None, true) => Some(0o755),
                (None, false) => None,
            };
            if let Some(mode) = mode {
                let _ = std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode));
            }
        }
    }

    if let Some(index) = renamed.iter().position(|found| !found) {
        return Err(ArchiveError::MissingEntry {
            name: options.renames[index].0.clone(),
        });
    }

    debug!("Extraction complete to {}", dest.display());
    Ok(())
}
