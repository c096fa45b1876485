use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{FullVersion, MajorVersion};

/// One installed runtime version as known to the persisted store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Monotonic insertion sequence; lower means inserted earlier.
    pub seq: u64,
    pub major: MajorVersion,
    pub full_version: FullVersion,
    pub is_default: bool,
    pub installed_at: DateTime<Utc>,
}

/// The persisted record set for one runtime kind.
///
/// Records are kept ordered by unique `seq`, so "first record" always means
/// the earliest inserted one. Deserializing normalizes whatever was stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredRecordSet")]
pub struct RecordSet {
    next_seq: u64,
    records: Vec<VersionRecord>,
}

#[derive(Deserialize)]
struct StoredRecordSet {
    #[serde(default)]
    next_seq: u64,
    #[serde(default)]
    records: Vec<VersionRecord>,
}

impl From<StoredRecordSet> for RecordSet {
    fn from(stored: StoredRecordSet) -> Self {
        let mut set = Self {
            next_seq: stored.next_seq,
            records: stored.records,
        };
        set.normalize();
        set
    }
}

impl RecordSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from raw records, possibly containing duplicates.
    #[must_use]
    pub fn from_records(records: Vec<VersionRecord>) -> Self {
        let mut set = Self {
            next_seq: 0,
            records,
        };
        set.normalize();
        set
    }

    /// Order records by `seq`, renumber colliding sequence numbers and move
    /// `next_seq` past the highest one. Duplicate majors are kept.
    fn normalize(&mut self) {
        self.records.sort_by_key(|record| record.seq);
        let mut previous: Option<u64> = None;
        for record in &mut self.records {
            if let Some(previous) = previous
                && record.seq <= previous
            {
                record.seq = previous.saturating_add(1);
            }
            previous = Some(record.seq);
        }
        if let Some(last) = previous {
            self.next_seq = self.next_seq.max(last.saturating_add(1));
        }
    }

    pub fn insert(
        &mut self,
        major: MajorVersion,
        full_version: FullVersion,
        is_default: bool,
    ) -> &VersionRecord {
        let seq = self.next_seq;
        self.next_seq = seq.saturating_add(1);
        self.records.push(VersionRecord {
            seq,
            major,
            full_version,
            is_default,
            installed_at: Utc::now(),
        });
        let last = self.records.len() - 1;
        &self.records[last]
    }

    #[must_use]
    pub fn records(&self) -> &[VersionRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, major: &MajorVersion) -> Option<&VersionRecord> {
        self.records.iter().find(|r| &r.major == major)
    }

    pub fn get_mut(&mut self, major: &MajorVersion) -> Option<&mut VersionRecord> {
        self.records.iter_mut().find(|r| &r.major == major)
    }

    #[must_use]
    pub fn contains(&self, major: &MajorVersion) -> bool {
        self.get(major).is_some()
    }

    #[must_use]
    pub fn default_record(&self) -> Option<&VersionRecord> {
        self.records.iter().find(|r| r.is_default)
    }

    #[must_use]
    pub fn default_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_default).count()
    }

    #[must_use]
    pub fn majors(&self) -> Vec<MajorVersion> {
        self.records.iter().map(|r| r.major.clone()).collect()
    }

    /// Remove the record at `index` in `records()` order.
    pub fn remove_at(&mut self, index: usize) -> Option<VersionRecord> {
        (index < self.records.len()).then(|| self.records.remove(index))
    }

    /// Remove every record for `major`, returning what was removed.
    pub fn remove(&mut self, major: &MajorVersion) -> Vec<VersionRecord> {
        let (removed, kept) = std::mem::take(&mut self.records)
            .into_iter()
            .partition(|r| &r.major == major);
        self.records = kept;
        removed
    }

    /// Mark `major` as the only default. Returns `false` if it has no record.
    pub fn set_default(&mut self, major: &MajorVersion) -> bool {
        if !self.contains(major) {
            return false;
        }
        for record in &mut self.records {
            record.is_default = &record.major == major;
        }
        true
    }
}
