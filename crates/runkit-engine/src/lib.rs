//! Runtime version reconciliation and lifecycle engine.
//!
//! A [`RuntimeManager`] per runtime kind keeps the persisted records, the
//! binaries on disk, the `{kind}.default` pointer and the generated
//! artifacts consistent, and serializes install, update, remove and
//! default changes behind a single-flight guard.

mod artifacts;
mod collab;
mod installer;
mod layout;
mod manager;
mod probe;
mod reconcile;
mod store;
mod tracker;

#[cfg(test)]
mod test_support;

pub use artifacts::ArtifactWriter;
pub use collab::NoopCollaborators;
pub use installer::{BundledFallback, Installer};
pub use layout::RuntimeLayout;
pub use manager::{
    AvailableUpdate, Collaborators, DEFAULT_VERSION_TIMEOUT, EngineConfig, RuntimeManager,
};
pub use probe::{FilesystemProbe, parse_version_output};
pub use reconcile::{Mutation, ReconcileReport, Reconciler, RecoverySource};
pub use store::{JsonRecordStore, MemoryRecordStore, RecordStore, StoreError};
pub use tracker::{OperationGuard, OperationSnapshot, OperationTracker};
