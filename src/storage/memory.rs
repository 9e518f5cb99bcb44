use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::traits::{ScanCursor, ScanPage, ScanSlice, StorageError, SyncStore, WriteOp, WriteOutcome};
use crate::changelog::{identity_hash, ChangeCursor, ChangeLogEntry, ChangeLogWriter, ChangePage, ShardKey, TimeWindow};
use crate::record::{Document, FieldValue, Record, RecordSchema};

#[derive(Debug, Clone)]
struct StoredRow {
    /// `None` once deleted; the version is kept so older writes cannot resurrect it
    document: Option<Document>,
    version: i64,
}

/// In-process store with version-guarded writes and its own change-log.
///
/// Models both sides of a deployment: application writes go through
/// [`write_local`](Self::write_local) / [`delete_local`](Self::delete_local)
/// and append change-log entries; sync writes go through [`SyncStore::write_batch`]
/// and do not.
pub struct InMemoryStore {
    name: String,
    schema: RecordSchema,
    rows: DashMap<String, StoredRow>,
    changes: RwLock<BTreeMap<ShardKey, BTreeSet<ChangeCursor>>>,
    changelog: ChangeLogWriter,
}

impl InMemoryStore {
    #[must_use]
    pub fn new(name: impl Into<String>, schema: RecordSchema, cluster_shards: u32) -> Self {
        Self {
            name: name.into(),
            schema,
            rows: DashMap::new(),
            changes: RwLock::new(BTreeMap::new()),
            changelog: ChangeLogWriter::new(cluster_shards),
        }
    }

    /// Application write at time `at`. Returns whether the store accepted it.
    pub fn write_local(&self, record: Record, at: i64) -> bool {
        let id = record.id.clone();
        let version = record.version;
        let document = self.schema.to_document(&record);
        self.put_local(id, version, Some(document), at)
    }

    /// Application delete at time `at`, leaving a tombstone at `version`.
    pub fn delete_local(&self, id: &str, version: i64, at: i64) -> bool {
        self.put_local(id.to_string(), version, None, at)
    }

    /// Store an arbitrary document without validation (and log it).
    pub fn insert_raw(&self, id: &str, document: Document, at: i64) {
        let version = match document.get(&self.schema.version_field) {
            Some(FieldValue::Int(v)) => *v,
            _ => 0,
        };
        self.rows.insert(
            id.to_string(),
            StoredRow {
                document: Some(document),
                version,
            },
        );
        self.append_change(self.changelog.entry_for(id, version, at));
    }

    /// Write a row and log it in an explicit cluster shard.
    pub fn write_local_in_shard(&self, record: Record, cluster_shard: u32, at: i64) -> bool {
        let entry = self.changelog.entry_in(cluster_shard, &record.id, record.version, at);
        let document = self.schema.to_document(&record);
        let applied = apply_row(&self.rows, record.id, record.version, Some(document));
        if applied {
            self.append_change(entry);
        }
        applied
    }

    fn put_local(&self, id: String, version: i64, document: Option<Document>, at: i64) -> bool {
        let entry = self.changelog.entry_for(&id, version, at);
        let applied = apply_row(&self.rows, id, version, document);
        if applied {
            self.append_change(entry);
        }
        applied
    }

    /// Append a raw change-log entry (at-least-once delivery, duplicates welcome).
    pub fn append_change(&self, entry: ChangeLogEntry) {
        let cursor = entry.cursor();
        self.changes.write().entry(entry.key).or_default().insert(cursor);
    }

    /// Drop change-log entries at or before `timestamp`, as TTL expiry would.
    pub fn expire_changes_before(&self, timestamp: i64) {
        let mut changes = self.changes.write();
        for entries in changes.values_mut() {
            entries.retain(|c| c.timestamp > timestamp);
        }
        changes.retain(|_, entries| !entries.is_empty());
    }

    #[must_use]
    pub fn change_count(&self) -> usize {
        self.changes.read().values().map(BTreeSet::len).sum()
    }

    /// Live record for `id`, if present and well-formed.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Record> {
        let row = self.rows.get(id)?;
        let document = row.document.as_ref()?;
        self.schema.extract(document).ok()
    }

    /// Version held for `id`, including tombstones.
    #[must_use]
    pub fn version_of(&self, id: &str) -> Option<i64> {
        self.rows.get(id).map(|row| row.version)
    }

    #[must_use]
    pub fn is_deleted(&self, id: &str) -> bool {
        self.rows.get(id).map_or(false, |row| row.document.is_none())
    }

    /// Live (non-deleted) records, sorted by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .rows
            .iter()
            .filter_map(|row| row.document.as_ref().and_then(|d| self.schema.extract(d).ok()))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Live row count
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.iter().filter(|row| row.document.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn apply_row(rows: &DashMap<String, StoredRow>, id: String, version: i64, document: Option<Document>) -> bool {
    match rows.entry(id) {
        Entry::Occupied(mut existing) => {
            if version > existing.get().version {
                existing.insert(StoredRow { document, version });
                true
            } else {
                false
            }
        }
        Entry::Vacant(slot) => {
            slot.insert(StoredRow { document, version });
            true
        }
    }
}

#[async_trait]
impl SyncStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan_page(
        &self,
        slice: ScanSlice,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> Result<ScanPage, StorageError> {
        let after = cursor.map(ScanCursor::as_str);
        let mut ids: Vec<String> = self
            .rows
            .iter()
            .filter(|row| row.document.is_some())
            .filter(|row| identity_hash(row.key()) % u64::from(slice.count) == u64::from(slice.index))
            .filter(|row| after.map_or(true, |a| row.key().as_str() > a))
            .map(|row| row.key().clone())
            .collect();
        ids.sort();

        let more = ids.len() > limit;
        ids.truncate(limit);
        let next = if more { ids.last().cloned().map(ScanCursor) } else { None };

        let documents = ids
            .iter()
            .filter_map(|id| self.rows.get(id).and_then(|row| row.document.clone()))
            .collect();
        Ok(ScanPage { documents, next })
    }

    async fn read_changes(
        &self,
        key: ShardKey,
        window: TimeWindow,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> Result<ChangePage, StorageError> {
        let changes = self.changes.read();
        let Some(partition) = changes.get(&key) else {
            return Ok(ChangePage::default());
        };

        let window_start = ChangeCursor {
            timestamp: window.after,
            id: String::new(),
            version: i64::MAX,
        };
        let lower = match after {
            Some(cursor) if *cursor > window_start => Bound::Excluded(cursor.clone()),
            _ => Bound::Excluded(window_start),
        };

        let mut rows: Vec<ChangeLogEntry> = partition
            .range((lower, Bound::Unbounded))
            .filter(|c| c.timestamp > window.after)
            .take_while(|c| c.timestamp <= window.upto)
            .take(limit + 1)
            .map(|c| ChangeLogEntry {
                key,
                timestamp: c.timestamp,
                id: c.id.clone(),
                version: c.version,
            })
            .collect();

        let more = rows.len() > limit;
        rows.truncate(limit);
        Ok(ChangePage::from_rows(rows, more))
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Document>, StorageError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.rows.get(id).and_then(|row| row.document.clone()))
            .collect())
    }

    async fn write_batch(&self, ops: &[WriteOp]) -> Result<Vec<WriteOutcome>, StorageError> {
        Ok(ops
            .iter()
            .map(|op| {
                let applied = match op {
                    WriteOp::Upsert(record) => apply_row(
                        &self.rows,
                        record.id.clone(),
                        record.version,
                        Some(self.schema.to_document(record)),
                    ),
                    WriteOp::Delete { id, version } => apply_row(&self.rows, id.clone(), *version, None),
                };
                if applied {
                    WriteOutcome::Applied
                } else {
                    WriteOutcome::RejectedStale
                }
            })
            .collect())
    }
}
