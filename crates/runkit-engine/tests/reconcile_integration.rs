#![cfg(unix)]

mod common;

use chrono::Utc;
use common::{Harness, entry, idle, major, version};
use runkit_backend::{RuntimeError, RuntimeKind, VersionRecord};
use runkit_engine::{MemoryRecordStore, Mutation, RecoverySource};

fn raw(seq: u64, m: &str, full: &str, is_default: bool) -> VersionRecord {
    VersionRecord {
        seq,
        major: major(m),
        full_version: version(full),
        is_default,
        installed_at: Utc::now(),
    }
}

#[tokio::test]
async fn second_pass_is_a_no_op() {
    let harness = Harness::new(RuntimeKind::Php);
    harness.place("8.3.12");
    harness.place("8.1.31");
    let manager = harness.manager();

    let first = manager.reconcile().await.expect("first pass");
    let second = manager.reconcile().await.expect("second pass");

    assert!(!first.is_clean());
    assert!(second.is_clean(), "unexpected mutations: {:?}", second.mutations);
    let stored = harness.store.snapshot(RuntimeKind::Php).expect("store");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored.default_count(), 1);
}

#[tokio::test]
async fn replicated_duplicates_collapse_to_one_default_per_set() {
    let store = MemoryRecordStore::seeded(
        RuntimeKind::Php,
        vec![
            raw(0, "8.3", "8.3.10", false),
            raw(1, "8.3", "8.3.12", true),
            raw(2, "8.2", "8.2.27", true),
        ],
    );
    let harness = Harness::with_store(RuntimeKind::Php, store);
    harness.place("8.3.12");
    harness.place("8.2.27");
    let manager = harness.manager();

    let report = manager.reconcile().await.expect("reconcile");

    assert!(report.mutations.contains(&Mutation::DuplicateRemoved {
        major: major("8.3"),
        full_version: version("8.3.10"),
    }));
    let stored = harness.store.snapshot(RuntimeKind::Php).expect("store");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored.default_count(), 1);
    let default = stored.default_record().expect("one default");
    assert_eq!(
        harness.pointer_target(),
        Some(RuntimeKind::Php.binary_name(&default.major))
    );
}

#[tokio::test]
async fn identical_replicas_sharing_a_sequence_number_collapse() {
    let store = MemoryRecordStore::seeded(
        RuntimeKind::Php,
        vec![
            raw(0, "8.3", "8.3.12", true),
            raw(0, "8.3", "8.3.12", true),
        ],
    );
    let harness = Harness::with_store(RuntimeKind::Php, store);
    harness.place("8.3.12");
    let manager = harness.manager();

    let report = manager.reconcile().await.expect("reconcile");
    let second = manager.reconcile().await.expect("second pass");

    assert!(report.mutations.contains(&Mutation::DuplicateRemoved {
        major: major("8.3"),
        full_version: version("8.3.12"),
    }));
    assert!(second.is_clean(), "unexpected mutations: {:?}", second.mutations);
    let stored = harness.store.snapshot(RuntimeKind::Php).expect("store");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored.default_count(), 1);
    assert_eq!(harness.pointer_target(), Some("php83".to_string()));
}

#[tokio::test]
async fn conflicting_defaults_resolve_to_the_pointer() {
    let store = MemoryRecordStore::seeded(
        RuntimeKind::Php,
        vec![raw(0, "8.3", "8.3.12", true), raw(1, "8.2", "8.2.27", true)],
    );
    let harness = Harness::with_store(RuntimeKind::Php, store);
    harness.place("8.3.12");
    harness.place("8.2.27");
    std::os::unix::fs::symlink("php82", harness.layout.pointer_path()).expect("seed pointer");
    let manager = harness.manager();

    manager.reconcile().await.expect("reconcile");

    assert_eq!(manager.default_major().await, Some(major("8.2")));
    assert_eq!(harness.pointer_target().as_deref(), Some("php82"));
}

#[tokio::test]
async fn missing_binary_is_downloaded_again() {
    let store = MemoryRecordStore::seeded(RuntimeKind::Php, vec![raw(0, "8.3", "8.3.11", true)]);
    let harness = Harness::with_store(RuntimeKind::Php, store);
    harness.catalog.set(vec![entry(RuntimeKind::Php, "8.3.12")]);
    let manager = harness.manager();

    let report = manager.reconcile().await.expect("reconcile");

    assert!(report.mutations.contains(&Mutation::Recovered {
        major: major("8.3"),
        source: RecoverySource::Catalog,
    }));
    let records = manager.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].full_version, version("8.3.12"));
    assert!(harness.layout.binary_path(&major("8.3")).exists());
    assert_eq!(harness.pointer_target().as_deref(), Some("php83"));
}

#[tokio::test]
async fn unrecoverable_record_is_dropped() {
    let store = MemoryRecordStore::seeded(
        RuntimeKind::Php,
        vec![raw(0, "8.1", "8.1.31", true), raw(1, "8.3", "8.3.12", false)],
    );
    let harness = Harness::with_store(RuntimeKind::Php, store);
    harness.place("8.3.12");
    harness.archive.fail_downloads(true);
    let manager = harness.manager();

    let report = manager.reconcile().await.expect("reconcile swallows recovery errors");

    assert!(report.mutations.contains(&Mutation::RecordDeleted { major: major("8.1") }));
    assert_eq!(manager.default_major().await, Some(major("8.3")));
    assert_eq!(harness.pointer_target().as_deref(), Some("php83"));
}

#[tokio::test]
async fn initialize_falls_back_to_bundled_runtime() {
    let harness = Harness::new(RuntimeKind::Php);
    let bundled = harness.bundled("8.3.12");
    let manager = harness.manager_with(Some(bundled));

    manager.initialize().await.expect("bootstrap succeeds");

    let records = manager.records().await;
    assert_eq!(records.len(), 1);
    assert!(records[0].is_default);
    assert_eq!(records[0].full_version, version("8.3.12"));
    assert_eq!(harness.pointer_target().as_deref(), Some("php83"));
    assert!(harness.wrappers_present());
}

#[tokio::test]
async fn orphaned_bundled_major_is_restored_from_bundle() {
    let store = MemoryRecordStore::seeded(RuntimeKind::Php, vec![raw(0, "8.3", "8.3.12", true)]);
    let harness = Harness::with_store(RuntimeKind::Php, store);
    harness.archive.fail_downloads(true);
    let bundled = harness.bundled("8.3.12");
    let manager = harness.manager_with(Some(bundled));

    let report = manager.reconcile().await.expect("reconcile");

    assert!(report.mutations.contains(&Mutation::Recovered {
        major: major("8.3"),
        source: RecoverySource::Bundled,
    }));
    assert!(harness.archive.fetched().is_empty());
}

#[tokio::test]
async fn php_without_any_runtime_is_fatal() {
    let harness = Harness::new(RuntimeKind::Php);
    let manager = harness.manager();

    let error = manager.initialize().await.expect_err("nothing to run");

    assert!(matches!(error, RuntimeError::NoRuntimeAvailable { .. }));
}

#[tokio::test]
async fn node_may_start_empty() {
    let harness = Harness::new(RuntimeKind::Node);
    let manager = harness.manager();

    let report = manager.initialize().await.expect("empty node is fine");

    assert!(report.is_clean());
    assert!(manager.records().await.is_empty());
}

#[tokio::test]
async fn dropping_the_last_node_record_clears_pointer_and_wrappers() {
    let harness = Harness::new(RuntimeKind::Node);
    harness.catalog.set(vec![entry(RuntimeKind::Node, "22.11.0")]);
    let manager = harness.manager();
    manager.install(&major("22")).await.expect("install node 22");
    idle(&manager).await;
    std::fs::remove_file(harness.layout.binary_path(&major("22"))).expect("binary removed");
    harness.archive.fail_downloads(true);

    let report = manager.reconcile().await.expect("reconcile");

    assert!(report.mutations.contains(&Mutation::RecordDeleted { major: major("22") }));
    assert!(report.mutations.contains(&Mutation::PointerCleared));
    assert!(report.mutations.contains(&Mutation::WrappersRemoved));
    assert!(manager.records().await.is_empty());
    assert!(harness.pointer_target().is_none());
    assert!(!harness.wrappers_present());
}
