use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use runkit_backend::{
    ArchiveService, ChangeEvent, ChangeNotifier, DependentEntityStore, DownloadProgress,
    FullVersion, MajorVersion, MetadataCatalog, OperationKind, RecordSet, RuntimeError,
    RuntimeKind, VersionRecord,
};
use runkit_core::update_available;
use tokio::sync::{RwLock, watch};

use crate::artifacts::ArtifactWriter;
use crate::collab::NoopCollaborators;
use crate::installer::{BundledFallback, Installer};
use crate::layout::RuntimeLayout;
use crate::probe::FilesystemProbe;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::store::RecordStore;
use crate::tracker::{OperationGuard, OperationSnapshot, OperationTracker};

pub const DEFAULT_VERSION_TIMEOUT: Duration = Duration::from_secs(10);

const DOWNLOAD_START: f64 = 0.10;
const DOWNLOAD_SPAN: f64 = 0.50;

/// Per-kind settings the manager needs; built by the caller from its own
/// configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub layout: RuntimeLayout,
    pub version_timeout: Duration,
    pub bundled: Option<BundledFallback>,
}

impl EngineConfig {
    #[must_use]
    pub fn new(layout: RuntimeLayout) -> Self {
        Self {
            layout,
            version_timeout: DEFAULT_VERSION_TIMEOUT,
            bundled: None,
        }
    }

    #[must_use]
    pub fn with_bundled(mut self, bundled: BundledFallback) -> Self {
        self.bundled = Some(bundled);
        self
    }

    #[must_use]
    pub fn with_version_timeout(mut self, timeout: Duration) -> Self {
        self.version_timeout = timeout;
        self
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn MetadataCatalog>,
    pub archive: Arc<dyn ArchiveService>,
    pub store: Arc<dyn RecordStore>,
    pub entities: Arc<dyn DependentEntityStore>,
    pub notifier: Arc<dyn ChangeNotifier>,
}

impl Collaborators {
    /// Collaborators with no dependent entities and log-only notifications.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn MetadataCatalog>,
        archive: Arc<dyn ArchiveService>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            catalog,
            archive,
            store,
            entities: Arc::new(NoopCollaborators),
            notifier: Arc::new(NoopCollaborators),
        }
    }

    #[must_use]
    pub fn with_entities(mut self, entities: Arc<dyn DependentEntityStore>) -> Self {
        self.entities = entities;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableUpdate {
    pub major: MajorVersion,
    pub installed: FullVersion,
    pub latest: FullVersion,
    pub is_lts: bool,
    pub is_eol: bool,
}

/// Lifecycle operations for one runtime kind.
///
/// Every mutating call, reconciliation included, holds the kind's
/// single-flight guard for its whole duration; a call made while the guard is
/// held fails with [`RuntimeError::AnotherOperationInProgress`] without
/// waiting.
pub struct RuntimeManager {
    kind: RuntimeKind,
    probe: FilesystemProbe,
    artifacts: ArtifactWriter,
    installer: Installer,
    bundled: Option<BundledFallback>,
    catalog: Arc<dyn MetadataCatalog>,
    store: Arc<dyn RecordStore>,
    entities: Arc<dyn DependentEntityStore>,
    notifier: Arc<dyn ChangeNotifier>,
    tracker: OperationTracker,
    records: RwLock<RecordSet>,
}

impl std::fmt::Debug for RuntimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeManager")
            .field("kind", &self.kind)
            .field("layout", self.probe.layout())
            .finish_non_exhaustive()
    }
}

impl RuntimeManager {
    /// Must be called inside a Tokio runtime; the operation tracker task is
    /// spawned here.
    #[must_use]
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let kind = config.layout.kind;
        Self {
            kind,
            probe: FilesystemProbe::new(config.layout.clone(), config.version_timeout),
            artifacts: ArtifactWriter::new(config.layout.clone()),
            installer: Installer::new(
                config.layout,
                collaborators.catalog.clone(),
                collaborators.archive,
            ),
            bundled: config.bundled,
            catalog: collaborators.catalog,
            store: collaborators.store,
            entities: collaborators.entities,
            notifier: collaborators.notifier,
            tracker: OperationTracker::spawn(kind),
            records: RwLock::new(RecordSet::new()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    #[must_use]
    pub fn layout(&self) -> &RuntimeLayout {
        self.probe.layout()
    }

    /// Records as of the last completed operation.
    pub async fn records(&self) -> Vec<VersionRecord> {
        self.records.read().await.records().to_vec()
    }

    pub async fn default_major(&self) -> Option<MajorVersion> {
        self.records
            .read()
            .await
            .default_record()
            .map(|record| record.major.clone())
    }

    #[must_use]
    pub fn snapshot(&self) -> OperationSnapshot {
        self.tracker.snapshot()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<OperationSnapshot> {
        self.tracker.subscribe()
    }

    /// Reconcile at startup. A kind that needs at least one installation and
    /// has none gets the bundled fallback copied in and reconciled again.
    ///
    /// # Errors
    /// Returns [`RuntimeError::NoRuntimeAvailable`] when such a kind ends up
    /// with nothing usable, or the record store's error.
    pub async fn initialize(&self) -> Result<ReconcileReport, RuntimeError> {
        let guard = self.tracker.begin(OperationKind::Reconcile, None).await?;
        let result = self.bootstrap().await;
        settle(guard, result)
    }

    /// Run one reconciliation pass and persist its outcome.
    ///
    /// # Errors
    /// Returns an error if the guard is held, the binary directory cannot be
    /// listed, or the record store fails.
    pub async fn reconcile(&self) -> Result<ReconcileReport, RuntimeError> {
        let guard = self.tracker.begin(OperationKind::Reconcile, None).await?;
        let result = self.reconcile_pass().await;
        settle(guard, result)
    }

    /// Download and install the catalog's latest release of `major`.
    ///
    /// # Errors
    /// Precondition errors (`AlreadyInstalled`, `VersionNotAvailable`,
    /// `AnotherOperationInProgress`) or install errors from the download,
    /// verification and placement steps.
    pub async fn install(&self, major: &MajorVersion) -> Result<VersionRecord, RuntimeError> {
        self.check_family(major)?;
        let guard = self
            .tracker
            .begin(OperationKind::Install, Some(major.clone()))
            .await?;
        let result = self.run_install(major, &guard).await;
        settle(guard, result)
    }

    /// Replace the installed binary of `major` with the catalog's latest.
    ///
    /// # Errors
    /// `VersionNotInstalled`, `VersionNotAvailable`, `NoUpdateAvailable`,
    /// `AnotherOperationInProgress`, or an install error.
    pub async fn update(&self, major: &MajorVersion) -> Result<VersionRecord, RuntimeError> {
        self.check_family(major)?;
        let guard = self
            .tracker
            .begin(OperationKind::Update, Some(major.clone()))
            .await?;
        let result = self.run_update(major, &guard).await;
        settle(guard, result)
    }

    /// Uninstall `major`, resetting any entity pinned to it.
    ///
    /// # Errors
    /// `VersionNotInstalled`, `CannotRemoveLastVersion`,
    /// `CannotRemoveDefaultVersion`, `AnotherOperationInProgress`, or a
    /// filesystem, entity-store or record-store error.
    pub async fn remove(&self, major: &MajorVersion) -> Result<(), RuntimeError> {
        self.check_family(major)?;
        let guard = self
            .tracker
            .begin(OperationKind::Remove, Some(major.clone()))
            .await?;
        let result = self.run_remove(major, &guard).await;
        settle(guard, result)
    }

    /// Make `major` the only default and repoint `{kind}.default`.
    ///
    /// # Errors
    /// `VersionNotInstalled`, `AnotherOperationInProgress`, or a pointer or
    /// record-store error.
    pub async fn set_default(&self, major: &MajorVersion) -> Result<(), RuntimeError> {
        self.check_family(major)?;
        let guard = self
            .tracker
            .begin(OperationKind::SetDefault, Some(major.clone()))
            .await?;
        let result = self.run_set_default(major).await;
        settle(guard, result)
    }

    /// Installed majors whose catalog entry is newer than the record.
    ///
    /// # Errors
    /// Returns [`RuntimeError::MetadataUnavailable`] if the catalog fails.
    pub async fn check_updates(&self) -> Result<Vec<AvailableUpdate>, RuntimeError> {
        let catalog = self.catalog.fetch(self.kind).await?;
        let records = self.records.read().await;
        Ok(records
            .records()
            .iter()
            .filter_map(|record| {
                let entry = catalog.get(&record.major)?;
                update_available(&record.full_version, entry).then(|| AvailableUpdate {
                    major: record.major.clone(),
                    installed: record.full_version.clone(),
                    latest: entry.latest_version.clone(),
                    is_lts: entry.is_lts,
                    is_eol: entry.is_eol,
                })
            })
            .collect())
    }

    async fn bootstrap(&self) -> Result<ReconcileReport, RuntimeError> {
        let mut report = self.reconcile_pass().await?;
        if !self.kind.requires_installation() || !self.records.read().await.is_empty() {
            return Ok(report);
        }

        let Some(bundled) = &self.bundled else {
            error!("No {} installed and no bundled fallback configured", self.kind);
            return Err(RuntimeError::NoRuntimeAvailable { kind: self.kind });
        };
        warn!(
            "No {} installed; falling back to bundled {}",
            self.kind, bundled.major
        );
        if let Err(copy_error) = self.installer.copy_bundled(bundled).await {
            error!("Failed to copy bundled {}: {copy_error}", self.kind);
            return Err(RuntimeError::NoRuntimeAvailable { kind: self.kind });
        }

        report.extend(self.reconcile_pass().await?);
        if self.records.read().await.is_empty() {
            return Err(RuntimeError::NoRuntimeAvailable { kind: self.kind });
        }
        Ok(report)
    }

    async fn reconcile_pass(&self) -> Result<ReconcileReport, RuntimeError> {
        let mut records = self.load_records().await?;
        let report = Reconciler {
            probe: &self.probe,
            artifacts: &self.artifacts,
            installer: &self.installer,
            bundled: self.bundled.as_ref(),
        }
        .run(&mut records)
        .await?;

        if report.is_clean() {
            *self.records.write().await = records;
            return Ok(report);
        }

        self.commit(records).await?;
        if report.installed_changed() {
            self.refresh_shell().await;
            self.notify(ChangeEvent::InstalledChanged).await;
        }
        if report.default_changed() {
            self.notify(ChangeEvent::DefaultChanged).await;
        }
        Ok(report)
    }

    async fn run_install(
        &self,
        major: &MajorVersion,
        guard: &OperationGuard,
    ) -> Result<VersionRecord, RuntimeError> {
        let entry = self.installer.metadata(major).await?;
        guard.progress(0.05);

        let mut records = self.load_records().await?;
        if records.contains(major) {
            return Err(RuntimeError::AlreadyInstalled {
                kind: self.kind,
                major: major.clone(),
            });
        }
        guard.progress(0.10);

        let binary = self.layout().binary_path(major);
        let version = match self.reusable_binary(major, &binary).await {
            Some(version) => {
                info!("Reusing {} {version} already on disk", self.kind);
                version
            }
            None => {
                let archive = self
                    .installer
                    .download(&entry, &|progress: DownloadProgress| {
                        guard.progress(DOWNLOAD_START + DOWNLOAD_SPAN * progress.fraction());
                    })
                    .await?;
                self.installer
                    .extract_and_place(major, &entry, &archive)
                    .await?;
                guard.progress(0.70);
                self.verify_installed(major, &binary, None).await?
            }
        };

        self.write_config(major).await?;
        guard.progress(0.80);

        let first = records.is_empty();
        let record = records.insert(major.clone(), version, first).clone();
        guard.progress(0.90);
        if first {
            self.probe.update_default_pointer(major).await?;
            self.artifacts.install_wrappers().await?;
        }

        self.commit(records).await?;
        self.refresh_shell().await;
        guard.progress(0.95);

        self.notify(ChangeEvent::InstalledChanged).await;
        if first {
            self.notify(ChangeEvent::DefaultChanged).await;
        }
        guard.progress(1.0);
        info!("Installed {} {}", self.kind, record.full_version);
        Ok(record)
    }

    async fn run_update(
        &self,
        major: &MajorVersion,
        guard: &OperationGuard,
    ) -> Result<VersionRecord, RuntimeError> {
        let mut records = self.load_records().await?;
        let current = records
            .get(major)
            .cloned()
            .ok_or_else(|| self.not_installed(major))?;
        let entry = self.installer.metadata(major).await?;
        if entry.latest_version == current.full_version {
            return Err(RuntimeError::NoUpdateAvailable {
                kind: self.kind,
                major: major.clone(),
                version: current.full_version,
            });
        }
        guard.progress(DOWNLOAD_START);

        let archive = self
            .installer
            .download(&entry, &|progress: DownloadProgress| {
                guard.progress(DOWNLOAD_START + DOWNLOAD_SPAN * progress.fraction());
            })
            .await?;
        self.probe.delete_installation(major).await?;
        self.installer
            .extract_and_place(major, &entry, &archive)
            .await?;
        guard.progress(0.70);

        let binary = self.layout().binary_path(major);
        let version = self
            .verify_installed(major, &binary, Some(&entry.latest_version))
            .await?;
        self.write_config(major).await?;
        guard.progress(0.80);

        let record = match records.get_mut(major) {
            Some(record) => {
                record.full_version = version;
                record.clone()
            }
            None => return Err(self.not_installed(major)),
        };
        guard.progress(0.90);
        if record.is_default {
            self.probe.update_default_pointer(major).await?;
        }

        self.commit(records).await?;
        self.refresh_shell().await;
        guard.progress(0.95);

        if let Err(restart_error) = self.notifier.restart_dependents(self.kind, major).await {
            warn!("Failed to restart {} {major} dependents: {restart_error}", self.kind);
        }
        self.notify(ChangeEvent::InstalledChanged).await;
        guard.progress(1.0);
        info!(
            "Updated {} {major} from {} to {}",
            self.kind, current.full_version, record.full_version
        );
        Ok(record)
    }

    async fn run_remove(
        &self,
        major: &MajorVersion,
        guard: &OperationGuard,
    ) -> Result<(), RuntimeError> {
        let mut records = self.load_records().await?;
        let target = records
            .get(major)
            .cloned()
            .ok_or_else(|| self.not_installed(major))?;
        if records.len() == 1 {
            return Err(RuntimeError::CannotRemoveLastVersion {
                kind: self.kind,
                major: major.clone(),
            });
        }
        if target.is_default {
            return Err(RuntimeError::CannotRemoveDefaultVersion {
                kind: self.kind,
                major: major.clone(),
            });
        }

        let entities = self.entities.entities_using(self.kind, major).await?;
        for entity in &entities {
            info!("Resetting {} ({}) to the default {}", entity.label, entity.id, self.kind);
            self.entities.clear_reference(self.kind, entity).await?;
        }
        guard.progress(0.2);

        self.probe.delete_installation(major).await?;
        self.probe.delete_config_directory(major).await?;
        guard.progress(0.6);

        records.remove(major);
        self.commit(records).await?;
        guard.progress(0.9);

        self.refresh_shell().await;
        if !entities.is_empty() {
            self.notify(ChangeEvent::InstalledChanged).await;
        }
        guard.progress(1.0);
        info!("Removed {} {major}", self.kind);
        Ok(())
    }

    async fn run_set_default(&self, major: &MajorVersion) -> Result<(), RuntimeError> {
        let mut records = self.load_records().await?;
        if !records.set_default(major) {
            return Err(self.not_installed(major));
        }
        self.probe.update_default_pointer(major).await?;
        self.commit(records).await?;
        self.notify(ChangeEvent::DefaultChanged).await;
        info!("{} default is now {major}", self.kind);
        Ok(())
    }

    async fn write_config(&self, major: &MajorVersion) -> Result<(), RuntimeError> {
        let dir = self.probe.create_config_directory(major).await?;
        self.artifacts.ensure_config_files(major, &dir).await?;
        Ok(())
    }

    fn check_family(&self, major: &MajorVersion) -> Result<(), RuntimeError> {
        if self.kind.accepts(major) {
            Ok(())
        } else {
            Err(RuntimeError::VersionNotAvailable {
                kind: self.kind,
                major: major.clone(),
            })
        }
    }

    fn not_installed(&self, major: &MajorVersion) -> RuntimeError {
        RuntimeError::VersionNotInstalled {
            kind: self.kind,
            major: major.clone(),
        }
    }

    async fn reusable_binary(&self, major: &MajorVersion, binary: &Path) -> Option<FullVersion> {
        self.probe
            .check_integrity(binary)
            .await
            .ok()
            .filter(|version| major.contains(version))
    }

    /// Check the freshly placed binary; a binary that fails is deleted.
    async fn verify_installed(
        &self,
        major: &MajorVersion,
        binary: &Path,
        expected: Option<&FullVersion>,
    ) -> Result<FullVersion, RuntimeError> {
        let failure = match self.probe.check_integrity(binary).await {
            Ok(version)
                if major.contains(&version)
                    && expected.is_none_or(|expected| *expected == version) =>
            {
                return Ok(version);
            }
            Ok(version) => format!("installed binary reports {version}, expected {major}"),
            Err(integrity) => format!("installed binary failed verification: {integrity}"),
        };
        if let Err(delete_error) = self.probe.delete_installation(major).await {
            warn!("Failed to delete rejected binary for {major}: {delete_error}");
        }
        Err(RuntimeError::extraction_failed(failure))
    }

    async fn load_records(&self) -> Result<RecordSet, RuntimeError> {
        Ok(self.store.load(self.kind).await?)
    }

    async fn commit(&self, records: RecordSet) -> Result<(), RuntimeError> {
        self.store.save(self.kind, &records).await?;
        *self.records.write().await = records;
        Ok(())
    }

    async fn notify(&self, event: ChangeEvent) {
        if let Err(notify_error) = self.notifier.notify(self.kind, event).await {
            warn!("Failed to deliver {} {event:?}: {notify_error}", self.kind);
        }
    }

    async fn refresh_shell(&self) {
        if let Err(refresh_error) = self.notifier.refresh_shell_integration(self.kind).await {
            warn!("Failed to refresh {} shell integration: {refresh_error}", self.kind);
        }
    }
}

fn settle<T>(guard: OperationGuard, result: Result<T, RuntimeError>) -> Result<T, RuntimeError> {
    match &result {
        Ok(_) => guard.succeed(),
        Err(failure) => {
            error!("{failure}");
            guard.fail(failure);
        }
    }
    result
}
