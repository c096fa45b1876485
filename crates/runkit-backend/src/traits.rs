use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::RuntimeError;
use crate::kind::RuntimeKind;
use crate::types::{DownloadDescriptor, DownloadProgress, MajorVersion, RemoteMetadataEntry};

pub type ProgressFn<'a> = &'a (dyn Fn(DownloadProgress) + Send + Sync);

/// Read-only source of latest-version and download information.
#[async_trait]
pub trait MetadataCatalog: Send + Sync {
    async fn fetch(
        &self,
        kind: RuntimeKind,
    ) -> Result<BTreeMap<MajorVersion, RemoteMetadataEntry>, RuntimeError>;

    async fn entry(
        &self,
        kind: RuntimeKind,
        major: &MajorVersion,
    ) -> Result<Option<RemoteMetadataEntry>, RuntimeError> {
        let mut entries = self.fetch(kind).await?;
        Ok(entries.remove(major))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    pub strip_components: usize,
    /// `(path inside the archive after stripping, new file name)` pairs.
    pub renames: Vec<(String, String)>,
}

impl ExtractOptions {
    /// Options that place the descriptor's binary at `dest/binary_name`.
    #[must_use]
    pub fn for_binary(descriptor: &DownloadDescriptor, binary_name: &str) -> Self {
        Self {
            strip_components: descriptor.strip_components,
            renames: vec![(descriptor.binary_path.clone(), binary_name.to_string())],
        }
    }
}

/// Fetches verified archives and unpacks them.
#[async_trait]
pub trait ArchiveService: Send + Sync {
    /// Download `descriptor` into `dest_dir` and verify it against `checksum`.
    async fn fetch(
        &self,
        descriptor: &DownloadDescriptor,
        checksum: &str,
        dest_dir: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<PathBuf, RuntimeError>;

    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        options: &ExtractOptions,
    ) -> Result<(), RuntimeError>;
}

/// An external object (for example a site) pinned to a runtime major.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub id: String,
    pub label: String,
}

#[async_trait]
pub trait DependentEntityStore: Send + Sync {
    async fn entities_using(
        &self,
        kind: RuntimeKind,
        major: &MajorVersion,
    ) -> Result<Vec<EntityRef>, RuntimeError>;

    /// Reset the entity to "use default".
    async fn clear_reference(
        &self,
        kind: RuntimeKind,
        entity: &EntityRef,
    ) -> Result<(), RuntimeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    InstalledChanged,
    DefaultChanged,
}

/// Writers that regenerate their own artifacts (proxy config, shell
/// integration, process supervisors) when runtime state changes.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn notify(&self, kind: RuntimeKind, event: ChangeEvent) -> Result<(), RuntimeError>;

    async fn refresh_shell_integration(&self, kind: RuntimeKind) -> Result<(), RuntimeError>;

    async fn restart_dependents(
        &self,
        kind: RuntimeKind,
        major: &MajorVersion,
    ) -> Result<(), RuntimeError>;
}
