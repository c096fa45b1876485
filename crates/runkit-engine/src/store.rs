use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;
use runkit_backend::{RecordSet, RuntimeError, RuntimeKind, VersionRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt record file {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {kind} records: {source}")]
    Encode {
        kind: RuntimeKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("record store lock poisoned")]
    Poisoned,
}

impl From<StoreError> for RuntimeError {
    fn from(error: StoreError) -> Self {
        RuntimeError::Store {
            details: error.to_string(),
        }
    }
}

/// Persistence for per-kind record sets.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self, kind: RuntimeKind) -> Result<RecordSet, StoreError>;

    async fn save(&self, kind: RuntimeKind, records: &RecordSet) -> Result<(), StoreError>;
}

/// One `<kind>.json` file per kind, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonRecordStore {
    dir: PathBuf,
}

impl JsonRecordStore {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    #[must_use]
    pub fn path_for(&self, kind: RuntimeKind) -> PathBuf {
        self.dir.join(format!("{kind}.json"))
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn load(&self, kind: RuntimeKind) -> Result<RecordSet, StoreError> {
        let path = self.path_for(kind);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RecordSet::new());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    context: "failed to read record file",
                    path,
                    source,
                });
            }
        };

        serde_json::from_str(&data).map_err(|source| StoreError::Corrupt { path, source })
    }

    async fn save(&self, kind: RuntimeKind, records: &RecordSet) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(records)
            .map_err(|source| StoreError::Encode { kind, source })?;
        let path = self.path_for(kind);

        let dir = self.dir.clone();
        let target = path.clone();
        let result = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            write_atomic(&target, &data)
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|result| result);

        result.map_err(|source| StoreError::Io {
            context: "failed to write record file",
            path: path.clone(),
            source,
        })?;
        debug!("Saved {} {kind} records to {}", records.len(), path.display());
        Ok(())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "record path has no parent")
    })?;

    let file_name = path
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("records");
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    let pid = std::process::id();

    let mut tmp_path = None;
    for attempt in 0..16_u8 {
        let candidate = parent.join(format!(".{file_name}.{pid}.{timestamp}.{attempt}.tmp"));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut file) => {
                file.write_all(data)?;
                file.sync_all()?;
                tmp_path = Some(candidate);
                break;
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(error) => return Err(error),
        }
    }

    let Some(tmp_path) = tmp_path else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "failed to create unique record temp file",
        ));
    };

    if let Err(error) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(error);
    }

    Ok(())
}

/// In-process store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    sets: Mutex<BTreeMap<RuntimeKind, RecordSet>>,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a kind with raw records, duplicates included.
    #[must_use]
    pub fn seeded(kind: RuntimeKind, records: Vec<VersionRecord>) -> Self {
        let store = Self::new();
        if let Ok(mut sets) = store.sets.lock() {
            sets.insert(kind, RecordSet::from_records(records));
        }
        store
    }

    /// Current contents without going through the async trait.
    ///
    /// # Errors
    /// Returns [`StoreError::Poisoned`] if a writer panicked.
    pub fn snapshot(&self, kind: RuntimeKind) -> Result<RecordSet, StoreError> {
        let sets = self.sets.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(sets.get(&kind).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load(&self, kind: RuntimeKind) -> Result<RecordSet, StoreError> {
        self.snapshot(kind)
    }

    async fn save(&self, kind: RuntimeKind, records: &RecordSet) -> Result<(), StoreError> {
        let mut sets = self.sets.lock().map_err(|_| StoreError::Poisoned)?;
        sets.insert(kind, records.clone());
        Ok(())
    }
}
