//! Reconciliation of the record set with the binaries on disk.
//!
//! One pass runs five ordered stages:
//!
//! 1. drop duplicate records for the same major,
//! 2. validate every binary on disk and upsert its record,
//! 3. recover records whose binary is missing or broken, or drop them,
//! 4. restore the single-default invariant and the default pointer,
//! 5. regenerate dependent artifacts (config files, wrapper scripts).
//!
//! A pass over an already consistent state makes no mutations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use log::{debug, info, warn};
use runkit_backend::{FullVersion, MajorVersion, RecordSet, RuntimeError};

use crate::artifacts::ArtifactWriter;
use crate::installer::{BundledFallback, Installer};
use crate::probe::FilesystemProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    Bundled,
    Catalog,
}

impl fmt::Display for RecoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bundled => write!(f, "bundled fallback"),
            Self::Catalog => write!(f, "catalog download"),
        }
    }
}

/// One change made by a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    DuplicateRemoved {
        major: MajorVersion,
        full_version: FullVersion,
    },
    BrokenBinaryDeleted {
        major: MajorVersion,
        reason: String,
    },
    RecordCreated {
        major: MajorVersion,
        full_version: FullVersion,
    },
    VersionChanged {
        major: MajorVersion,
        from: FullVersion,
        to: FullVersion,
    },
    DefaultFlagChanged {
        major: MajorVersion,
        is_default: bool,
    },
    Recovered {
        major: MajorVersion,
        source: RecoverySource,
    },
    RecordDeleted {
        major: MajorVersion,
    },
    PointerUpdated {
        major: MajorVersion,
    },
    PointerCleared,
    ConfigWritten {
        major: MajorVersion,
        files: usize,
    },
    WrappersInstalled,
    WrappersRemoved,
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateRemoved {
                major,
                full_version,
            } => write!(f, "removed duplicate record {major} ({full_version})"),
            Self::BrokenBinaryDeleted { major, reason } => {
                write!(f, "deleted broken binary for {major}: {reason}")
            }
            Self::RecordCreated {
                major,
                full_version,
            } => write!(f, "created record {major} ({full_version})"),
            Self::VersionChanged { major, from, to } => {
                write!(f, "updated {major} from {from} to {to}")
            }
            Self::DefaultFlagChanged { major, is_default } => {
                write!(f, "set {major} default={is_default}")
            }
            Self::Recovered { major, source } => write!(f, "recovered {major} from {source}"),
            Self::RecordDeleted { major } => write!(f, "deleted unrecoverable record {major}"),
            Self::PointerUpdated { major } => write!(f, "pointed default at {major}"),
            Self::PointerCleared => write!(f, "cleared default pointer"),
            Self::ConfigWritten { major, files } => {
                write!(f, "wrote {files} config files for {major}")
            }
            Self::WrappersInstalled => write!(f, "installed wrapper scripts"),
            Self::WrappersRemoved => write!(f, "removed wrapper scripts"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub mutations: Vec<Mutation>,
}

impl ReconcileReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Whether records were added or removed.
    #[must_use]
    pub fn installed_changed(&self) -> bool {
        self.mutations.iter().any(|mutation| {
            matches!(
                mutation,
                Mutation::RecordCreated { .. }
                    | Mutation::RecordDeleted { .. }
                    | Mutation::VersionChanged { .. }
                    | Mutation::Recovered { .. }
            )
        })
    }

    #[must_use]
    pub fn default_changed(&self) -> bool {
        self.mutations.iter().any(|mutation| {
            matches!(
                mutation,
                Mutation::PointerUpdated { .. } | Mutation::PointerCleared
            )
        })
    }

    pub fn extend(&mut self, other: ReconcileReport) {
        self.mutations.extend(other.mutations);
    }

    fn push(&mut self, mutation: Mutation) {
        debug!("Reconcile: {mutation}");
        self.mutations.push(mutation);
    }
}

/// Borrowed view of everything one pass needs.
pub struct Reconciler<'a> {
    pub probe: &'a FilesystemProbe,
    pub artifacts: &'a ArtifactWriter,
    pub installer: &'a Installer,
    pub bundled: Option<&'a BundledFallback>,
}

impl Reconciler<'_> {
    /// Run all five stages against `records`.
    ///
    /// # Errors
    /// Only a failure to list the binary directory aborts the pass; every
    /// per-record failure is logged and routed into recovery or deletion.
    pub async fn run(&self, records: &mut RecordSet) -> Result<ReconcileReport, RuntimeError> {
        let kind = self.probe.kind();
        let installed = self.probe.scan_installed().await?;
        let mut report = ReconcileReport::default();

        self.deduplicate(records, &mut report);
        let validated = self.forward_pass(records, &installed, &mut report).await;
        self.backward_pass(records, &validated, &mut report).await;
        self.enforce_default(records, &mut report).await;
        self.sync_artifacts(records, &mut report).await;

        debug_assert!(records.is_empty() || records.default_count() == 1);
        if report.is_clean() {
            debug!("{kind} reconciliation found nothing to do");
        } else {
            info!(
                "{kind} reconciliation made {} changes",
                report.mutations.len()
            );
        }
        Ok(report)
    }

    /// Stage 1: keep the highest `full_version` per major; the first record
    /// in set order wins ties. A default flag on a dropped duplicate moves
    /// to the survivor.
    fn deduplicate(&self, records: &mut RecordSet, report: &mut ReconcileReport) {
        let mut best: BTreeMap<MajorVersion, (usize, FullVersion)> = BTreeMap::new();
        for (index, record) in records.records().iter().enumerate() {
            match best.get(&record.major) {
                Some((_, kept)) if *kept >= record.full_version => {}
                _ => {
                    best.insert(record.major.clone(), (index, record.full_version.clone()));
                }
            }
        }

        let losers: Vec<usize> = records
            .records()
            .iter()
            .enumerate()
            .filter(|(index, record)| {
                best.get(&record.major)
                    .is_some_and(|(kept, _)| kept != index)
            })
            .map(|(index, _)| index)
            .collect();

        let mut removed: Vec<_> = losers
            .into_iter()
            .rev()
            .filter_map(|index| records.remove_at(index))
            .collect();
        removed.reverse();

        for removed in removed {
            if removed.is_default
                && let Some(survivor) = records.get_mut(&removed.major)
            {
                survivor.is_default = true;
            }
            warn!(
                "Dropping duplicate {} record {} ({})",
                self.probe.kind(),
                removed.major,
                removed.full_version
            );
            report.push(Mutation::DuplicateRemoved {
                major: removed.major,
                full_version: removed.full_version,
            });
        }
    }

    /// Stage 2: validate each binary; delete broken ones and upsert records
    /// for the rest. Returns the majors that passed validation.
    async fn forward_pass(
        &self,
        records: &mut RecordSet,
        installed: &BTreeMap<MajorVersion, PathBuf>,
        report: &mut ReconcileReport,
    ) -> BTreeSet<MajorVersion> {
        let pointer = self.probe.detect_default_pointer().await;
        let mut validated = BTreeSet::new();

        for (major, path) in installed {
            let version = match self.probe.check_integrity(path).await {
                Ok(version) if major.contains(&version) => version,
                Ok(version) => {
                    let reason = format!("reports foreign version {version}");
                    self.delete_broken(major, reason, report).await;
                    continue;
                }
                Err(error) => {
                    self.delete_broken(major, error.to_string(), report).await;
                    continue;
                }
            };
            validated.insert(major.clone());

            let pointer_default = pointer.as_ref().map(|pointer| pointer == major);
            match records.get_mut(major) {
                Some(record) => {
                    if record.full_version != version {
                        report.push(Mutation::VersionChanged {
                            major: major.clone(),
                            from: record.full_version.clone(),
                            to: version.clone(),
                        });
                        record.full_version = version;
                    }
                    if let Some(is_default) = pointer_default
                        && record.is_default != is_default
                    {
                        record.is_default = is_default;
                        report.push(Mutation::DefaultFlagChanged {
                            major: major.clone(),
                            is_default,
                        });
                    }
                }
                None => {
                    info!("Adopting {} {version} found on disk", self.probe.kind());
                    let is_default = pointer_default.unwrap_or(false);
                    records.insert(major.clone(), version.clone(), is_default);
                    report.push(Mutation::RecordCreated {
                        major: major.clone(),
                        full_version: version,
                    });
                }
            }
        }

        validated
    }

    async fn delete_broken(
        &self,
        major: &MajorVersion,
        reason: String,
        report: &mut ReconcileReport,
    ) {
        warn!("{} {major} binary is unusable: {reason}", self.probe.kind());
        if let Err(error) = self.probe.delete_installation(major).await {
            warn!("Failed to delete unusable binary for {major}: {error}");
        }
        report.push(Mutation::BrokenBinaryDeleted {
            major: major.clone(),
            reason,
        });
    }

    /// Stage 3: every record without a validated binary is recovered from
    /// the bundled fallback or the catalog, or deleted.
    async fn backward_pass(
        &self,
        records: &mut RecordSet,
        validated: &BTreeSet<MajorVersion>,
        report: &mut ReconcileReport,
    ) {
        let orphans: Vec<MajorVersion> = records
            .majors()
            .into_iter()
            .filter(|major| !validated.contains(major))
            .collect();

        for major in orphans {
            match self.recover(&major).await {
                Some((version, source)) => {
                    info!("Recovered {} {major} from {source}", self.probe.kind());
                    if let Some(record) = records.get_mut(&major) {
                        if record.full_version != version {
                            report.push(Mutation::VersionChanged {
                                major: major.clone(),
                                from: record.full_version.clone(),
                                to: version.clone(),
                            });
                            record.full_version = version;
                        }
                        if record.is_default
                            && let Err(error) = self.probe.update_default_pointer(&major).await
                        {
                            warn!("Failed to refresh default pointer for {major}: {error}");
                        }
                    }
                    if let Err(error) = self.write_config(&major).await {
                        warn!("Failed to regenerate config for {major}: {error}");
                    }
                    report.push(Mutation::Recovered { major, source });
                }
                None => {
                    warn!(
                        "Dropping {} {major}: binary missing and no recovery source worked",
                        self.probe.kind()
                    );
                    records.remove(&major);
                    report.push(Mutation::RecordDeleted { major });
                }
            }
        }
    }

    async fn recover(&self, major: &MajorVersion) -> Option<(FullVersion, RecoverySource)> {
        if let Some(bundled) = self.bundled.filter(|bundled| &bundled.major == major) {
            match self.installer.copy_bundled(bundled).await {
                Ok(path) => match self.verified(major, &path).await {
                    Ok(version) => return Some((version, RecoverySource::Bundled)),
                    Err(error) => warn!("Bundled {major} is unusable: {error}"),
                },
                Err(error) => warn!("Failed to copy bundled {major}: {error}"),
            }
        }

        match self.installer.install_from_catalog(major).await {
            Ok(path) => match self.verified(major, &path).await {
                Ok(version) => Some((version, RecoverySource::Catalog)),
                Err(error) => {
                    warn!("Downloaded {major} is unusable: {error}");
                    None
                }
            },
            Err(error) => {
                warn!("Failed to download {major}: {error}");
                None
            }
        }
    }

    /// Integrity check that also deletes a binary that failed it.
    async fn verified(
        &self,
        major: &MajorVersion,
        path: &std::path::Path,
    ) -> Result<FullVersion, RuntimeError> {
        let result = match self.probe.check_integrity(path).await {
            Ok(version) if major.contains(&version) => Ok(version),
            Ok(version) => Err(RuntimeError::VersionParsingFailed {
                path: path.to_path_buf(),
                output: format!("{version} is not a {major} release"),
            }),
            Err(error) => Err(error),
        };
        if result.is_err()
            && let Err(error) = self.probe.delete_installation(major).await
        {
            warn!("Failed to delete rejected binary for {major}: {error}");
        }
        result
    }

    /// Stage 4: exactly one default when non-empty, with the pointer naming
    /// it; no pointer when empty.
    async fn enforce_default(&self, records: &mut RecordSet, report: &mut ReconcileReport) {
        let pointer = self.probe.detect_default_pointer().await;

        if records.is_empty() {
            let pointer_path = self.probe.layout().pointer_path();
            if tokio::fs::symlink_metadata(&pointer_path).await.is_ok() {
                match self.probe.clear_default_pointer().await {
                    Ok(()) => report.push(Mutation::PointerCleared),
                    Err(error) => warn!("Failed to clear default pointer: {error}"),
                }
            }
            return;
        }

        let chosen = match records.default_count() {
            1 => records.default_record().map(|record| record.major.clone()),
            0 => records.records().first().map(|record| record.major.clone()),
            _ => pointer
                .clone()
                .filter(|major| records.contains(major))
                .or_else(|| records.records().first().map(|record| record.major.clone())),
        };
        let Some(chosen) = chosen else {
            return;
        };

        let before: Vec<(MajorVersion, bool)> = records
            .records()
            .iter()
            .map(|record| (record.major.clone(), record.is_default))
            .collect();
        records.set_default(&chosen);
        for (major, was_default) in before {
            let is_default = major == chosen;
            if was_default != is_default {
                report.push(Mutation::DefaultFlagChanged { major, is_default });
            }
        }

        if pointer.as_ref() != Some(&chosen) {
            match self.probe.update_default_pointer(&chosen).await {
                Ok(()) => report.push(Mutation::PointerUpdated { major: chosen }),
                Err(error) => warn!("Failed to update default pointer: {error}"),
            }
        }
    }

    async fn write_config(&self, major: &MajorVersion) -> Result<Vec<PathBuf>, RuntimeError> {
        let dir = self.probe.create_config_directory(major).await?;
        self.artifacts.ensure_config_files(major, &dir).await
    }

    /// Stage 5: config files for every record; wrapper scripts iff any record
    /// exists.
    async fn sync_artifacts(&self, records: &RecordSet, report: &mut ReconcileReport) {
        for major in records.majors() {
            match self.write_config(&major).await {
                Ok(written) if !written.is_empty() => report.push(Mutation::ConfigWritten {
                    major,
                    files: written.len(),
                }),
                Ok(_) => {}
                Err(error) => warn!("Failed to write config for {major}: {error}"),
            }
        }

        if records.is_empty() {
            match self.artifacts.remove_wrappers().await {
                Ok(0) => {}
                Ok(_) => report.push(Mutation::WrappersRemoved),
                Err(error) => warn!("Failed to remove wrapper scripts: {error}"),
            }
        } else {
            match self.artifacts.install_wrappers().await {
                Ok(0) => {}
                Ok(_) => report.push(Mutation::WrappersInstalled),
                Err(error) => warn!("Failed to install wrapper scripts: {error}"),
            }
        }
    }
}
