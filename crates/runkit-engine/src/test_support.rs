use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use runkit_backend::{
    ArchiveService, DownloadDescriptor, DownloadProgress, ExtractOptions, FullVersion,
    MajorVersion, MetadataCatalog, ProgressFn, RemoteMetadataEntry, RuntimeError, RuntimeKind,
};

use crate::installer::BundledFallback;
use crate::layout::RuntimeLayout;
use crate::probe::FilesystemProbe;

pub(crate) fn probe_for(root: &Path, kind: RuntimeKind) -> FilesystemProbe {
    FilesystemProbe::new(RuntimeLayout::rooted(root, kind), Duration::from_secs(5))
}

/// Shell script that prints a version banner the way the real runtime does.
pub(crate) fn write_fake_binary(path: &Path, kind: RuntimeKind, version: &str) {
    let banner = match kind {
        RuntimeKind::Php => format!("PHP {version} (cli) (built: Jan 1 2025)"),
        RuntimeKind::Node => format!("v{version}"),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("binary parent should be created");
    }
    std::fs::write(path, format!("#!/bin/sh\necho '{banner}'\n"))
        .expect("fake binary should be written");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .expect("fake binary should be executable");
    }
}

pub(crate) fn fake_php(layout: &RuntimeLayout, version: &str) -> PathBuf {
    let full: FullVersion = version.parse().expect("valid version");
    let path = layout.binary_path(&RuntimeKind::Php.major_of(&full));
    write_fake_binary(&path, RuntimeKind::Php, version);
    path
}

pub(crate) fn bundled_php(root: &Path, version: &str) -> BundledFallback {
    let full: FullVersion = version.parse().expect("valid version");
    let path = root.join("bundled").join("php");
    write_fake_binary(&path, RuntimeKind::Php, version);
    BundledFallback {
        major: RuntimeKind::Php.major_of(&full),
        path,
    }
}

pub(crate) fn php_entry(version: &str) -> RemoteMetadataEntry {
    RemoteMetadataEntry {
        latest_version: version.parse().expect("valid version"),
        download: DownloadDescriptor {
            url: format!("https://downloads.example.test/php-{version}.zip"),
            strip_components: 1,
            binary_path: "bin/php".to_string(),
        },
        checksum: "ab".repeat(32),
        is_lts: false,
        is_eol: false,
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeCatalog {
    entries: Mutex<Vec<RemoteMetadataEntry>>,
    offline: AtomicBool,
}

impl FakeCatalog {
    pub(crate) fn with(entries: Vec<RemoteMetadataEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            offline: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataCatalog for FakeCatalog {
    async fn fetch(
        &self,
        kind: RuntimeKind,
    ) -> Result<BTreeMap<MajorVersion, RemoteMetadataEntry>, RuntimeError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RuntimeError::metadata_unavailable(kind, "offline"));
        }
        let entries = self.entries.lock().expect("catalog lock");
        Ok(entries
            .iter()
            .map(|entry| (kind.major_of(&entry.latest_version), entry.clone()))
            .collect())
    }
}

/// Archive service whose "archives" are text files holding a version; the
/// extracted binary is a fake runtime reporting that version.
#[derive(Debug, Default)]
pub(crate) struct FakeArchive {
    fail_downloads: AtomicBool,
}

impl FakeArchive {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArchiveService for FakeArchive {
    async fn fetch(
        &self,
        descriptor: &DownloadDescriptor,
        _checksum: &str,
        dest_dir: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<PathBuf, RuntimeError> {
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(RuntimeError::download_failed(&descriptor.url, "connection refused"));
        }
        let version = descriptor
            .url
            .rsplit('-')
            .next()
            .and_then(|tail| tail.strip_suffix(".zip"))
            .unwrap_or_default()
            .to_string();
        std::fs::create_dir_all(dest_dir).expect("download dir");
        let path = dest_dir.join(format!("archive-{version}.zip"));
        std::fs::write(&path, &version).expect("archive should be written");
        progress(DownloadProgress {
            downloaded: 1,
            total: 1,
        });
        Ok(path)
    }

    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        options: &ExtractOptions,
    ) -> Result<(), RuntimeError> {
        let version = std::fs::read_to_string(archive)
            .map_err(|error| RuntimeError::extraction_failed(error.to_string()))?;
        let (_, name) = options
            .renames
            .first()
            .ok_or_else(|| RuntimeError::extraction_failed("no binary rename"))?;
        let kind = if name.starts_with("php") {
            RuntimeKind::Php
        } else {
            RuntimeKind::Node
        };
        write_fake_binary(&dest.join(name), kind, version.trim());
        Ok(())
    }
}
