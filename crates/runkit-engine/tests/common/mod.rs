#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use runkit_backend::{
    ArchiveService, ChangeEvent, ChangeNotifier, DependentEntityStore, DownloadDescriptor,
    DownloadProgress, EntityRef, ExtractOptions, FullVersion, MajorVersion, MetadataCatalog,
    ProgressFn, RemoteMetadataEntry, RuntimeError, RuntimeKind,
};
use runkit_engine::{
    BundledFallback, Collaborators, EngineConfig, MemoryRecordStore, OperationSnapshot,
    RuntimeLayout, RuntimeManager,
};
use tempfile::TempDir;
use tokio::sync::Notify;

pub fn write_fake_binary(path: &Path, kind: RuntimeKind, version: &str) {
    let banner = match kind {
        RuntimeKind::Php => format!("PHP {version} (cli) (built: Jan 1 2025) (NTS)"),
        RuntimeKind::Node => format!("v{version}"),
    };
    std::fs::create_dir_all(path.parent().expect("binary has a parent")).expect("create bin dir");
    std::fs::write(path, format!("#!/bin/sh\necho '{banner}'\n")).expect("write fake binary");

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("mark fake binary executable");
}

pub fn entry(kind: RuntimeKind, version: &str) -> RemoteMetadataEntry {
    let stem = kind.as_str();
    RemoteMetadataEntry {
        latest_version: version.parse().expect("valid version"),
        download: DownloadDescriptor {
            url: format!("https://downloads.example.test/{stem}-{version}.zip"),
            strip_components: 1,
            binary_path: format!("bin/{stem}"),
        },
        checksum: "cd".repeat(32),
        is_lts: false,
        is_eol: false,
    }
}

pub fn major(s: &str) -> MajorVersion {
    s.parse().expect("valid major")
}

pub fn version(s: &str) -> FullVersion {
    s.parse().expect("valid version")
}

#[derive(Debug, Default)]
pub struct Catalog {
    entries: Mutex<Vec<RemoteMetadataEntry>>,
}

impl Catalog {
    pub fn set(&self, entries: Vec<RemoteMetadataEntry>) {
        *self.entries.lock().expect("catalog lock") = entries;
    }
}

#[async_trait]
impl MetadataCatalog for Catalog {
    async fn fetch(
        &self,
        kind: RuntimeKind,
    ) -> Result<BTreeMap<MajorVersion, RemoteMetadataEntry>, RuntimeError> {
        Ok(self
            .entries
            .lock()
            .expect("catalog lock")
            .iter()
            .map(|entry| (kind.major_of(&entry.latest_version), entry.clone()))
            .collect())
    }
}

/// Archive service producing fake binaries. Downloads can be made to fail,
/// or to park until released so a test can observe an operation mid-flight.
#[derive(Debug, Default)]
pub struct Archive {
    fail: AtomicBool,
    gated: AtomicBool,
    pub started: Notify,
    pub release: Notify,
    fetched: Mutex<Vec<String>>,
}

impl Archive {
    pub fn fail_downloads(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn gate_downloads(&self, gated: bool) {
        self.gated.store(gated, Ordering::SeqCst);
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().expect("archive lock").clone()
    }
}

#[async_trait]
impl ArchiveService for Archive {
    async fn fetch(
        &self,
        descriptor: &DownloadDescriptor,
        _checksum: &str,
        dest_dir: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<PathBuf, RuntimeError> {
        if self.gated.load(Ordering::SeqCst) {
            self.started.notify_one();
            self.release.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(RuntimeError::download_failed(&descriptor.url, "connection reset"));
        }
        self.fetched
            .lock()
            .expect("archive lock")
            .push(descriptor.url.clone());

        let version = descriptor
            .url
            .rsplit('-')
            .next()
            .and_then(|tail| tail.strip_suffix(".zip"))
            .expect("fake url carries a version");
        std::fs::create_dir_all(dest_dir).expect("create download dir");
        let path = dest_dir.join(format!("fake-{version}.zip"));
        std::fs::write(&path, version).expect("write fake archive");
        progress(DownloadProgress {
            downloaded: 5,
            total: 10,
        });
        progress(DownloadProgress {
            downloaded: 10,
            total: 10,
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
            .ok_or_else(|| RuntimeError::extraction_failed("no rename"))?;
        let kind = if name.starts_with("node") {
            RuntimeKind::Node
        } else {
            RuntimeKind::Php
        };
        write_fake_binary(&dest.join(name), kind, &version);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Notifier {
    pub events: Mutex<Vec<ChangeEvent>>,
    pub restarts: Mutex<Vec<MajorVersion>>,
    pub shell_refreshes: Mutex<usize>,
}

impl Notifier {
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().expect("notifier lock").clone()
    }
}

#[async_trait]
impl ChangeNotifier for Notifier {
    async fn notify(&self, _kind: RuntimeKind, event: ChangeEvent) -> Result<(), RuntimeError> {
        self.events.lock().expect("notifier lock").push(event);
        Ok(())
    }

    async fn refresh_shell_integration(&self, _kind: RuntimeKind) -> Result<(), RuntimeError> {
        *self.shell_refreshes.lock().expect("notifier lock") += 1;
        Ok(())
    }

    async fn restart_dependents(
        &self,
        _kind: RuntimeKind,
        major: &MajorVersion,
    ) -> Result<(), RuntimeError> {
        self.restarts
            .lock()
            .expect("notifier lock")
            .push(major.clone());
        Ok(())
    }
}

/// Entities pinned to majors, e.g. sites using a specific PHP.
#[derive(Debug, Default)]
pub struct Sites {
    pins: Mutex<Vec<(MajorVersion, EntityRef)>>,
}

impl Sites {
    pub fn pin(&self, id: &str, major: MajorVersion) {
        self.pins.lock().expect("sites lock").push((
            major,
            EntityRef {
                id: id.to_string(),
                label: format!("{id}.test"),
            },
        ));
    }

    pub fn pinned_to(&self, major: &MajorVersion) -> Vec<String> {
        self.pins
            .lock()
            .expect("sites lock")
            .iter()
            .filter(|(pinned, _)| pinned == major)
            .map(|(_, entity)| entity.id.clone())
            .collect()
    }
}

#[async_trait]
impl DependentEntityStore for Sites {
    async fn entities_using(
        &self,
        _kind: RuntimeKind,
        major: &MajorVersion,
    ) -> Result<Vec<EntityRef>, RuntimeError> {
        Ok(self
            .pins
            .lock()
            .expect("sites lock")
            .iter()
            .filter(|(pinned, _)| pinned == major)
            .map(|(_, entity)| entity.clone())
            .collect())
    }

    async fn clear_reference(
        &self,
        _kind: RuntimeKind,
        entity: &EntityRef,
    ) -> Result<(), RuntimeError> {
        self.pins
            .lock()
            .expect("sites lock")
            .retain(|(_, pinned)| pinned != entity);
        Ok(())
    }
}

/// One runtime kind rooted in a temp directory with observable fakes.
pub struct Harness {
    pub temp: TempDir,
    pub layout: RuntimeLayout,
    pub catalog: Arc<Catalog>,
    pub archive: Arc<Archive>,
    pub store: Arc<MemoryRecordStore>,
    pub notifier: Arc<Notifier>,
    pub sites: Arc<Sites>,
}

impl Harness {
    pub fn new(kind: RuntimeKind) -> Self {
        Self::with_store(kind, MemoryRecordStore::new())
    }

    pub fn with_store(kind: RuntimeKind, store: MemoryRecordStore) -> Self {
        let temp = tempfile::tempdir().expect("create temp dir");
        let layout = RuntimeLayout::rooted(temp.path(), kind);
        Self {
            temp,
            layout,
            catalog: Arc::new(Catalog::default()),
            archive: Arc::new(Archive::default()),
            store: Arc::new(store),
            notifier: Arc::new(Notifier::default()),
            sites: Arc::new(Sites::default()),
        }
    }

    pub fn manager(&self) -> RuntimeManager {
        self.manager_with(None)
    }

    pub fn manager_with(&self, bundled: Option<BundledFallback>) -> RuntimeManager {
        let mut config = EngineConfig::new(self.layout.clone());
        if let Some(bundled) = bundled {
            config = config.with_bundled(bundled);
        }
        RuntimeManager::new(
            config,
            Collaborators::new(self.catalog.clone(), self.archive.clone(), self.store.clone())
                .with_entities(self.sites.clone())
                .with_notifier(self.notifier.clone()),
        )
    }

    /// Put a runtime binary straight into the binary directory.
    pub fn place(&self, full: &str) -> PathBuf {
        let kind = self.layout.kind;
        let path = self.layout.binary_path(&kind.major_of(&version(full)));
        write_fake_binary(&path, kind, full);
        path
    }

    pub fn bundled(&self, full: &str) -> BundledFallback {
        let kind = self.layout.kind;
        let path = self.temp.path().join("bundled").join(kind.as_str());
        write_fake_binary(&path, kind, full);
        BundledFallback {
            major: kind.major_of(&version(full)),
            path,
        }
    }

    pub fn pointer_target(&self) -> Option<String> {
        std::fs::read_link(self.layout.pointer_path())
            .ok()
            .map(|target| target.to_string_lossy().into_owned())
    }

    pub fn wrappers_present(&self) -> bool {
        self.layout.wrapper_paths().iter().all(|path| path.exists())
    }
}

/// Wait until no operation holds the guard.
pub async fn idle(manager: &RuntimeManager) -> OperationSnapshot {
    let mut updates = manager.subscribe();
    loop {
        let snapshot = updates.borrow_and_update().clone();
        if snapshot.in_flight.is_none() {
            return snapshot;
        }
        updates.changed().await.expect("tracker alive");
    }
}
