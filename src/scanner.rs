//! Store Scanner.
//!
//! Produces candidate records from one store, either by walking the primary
//! dataset ([`FullScan`]) or by reading the change-log partitions a worker
//! owns ([`StoreScanner::collect_changes`]) and then lazily resolving the
//! payloads ([`StoreScanner::resolve`]).
//!
//! ```text
//! full:         scan_page(slice, cursor) ──► documents ──► Reconciler
//!
//! incremental:  read_changes(shard, (checkpoint, scan_start]) ──► ChangeCollapser
//!                    ──► ordered CollapsedChange ──► fetch(ids) ──► Candidate
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::changelog::{ChangeCollapser, CollapsedChange, ShardKey, TimeWindow};
use crate::reconciler::Candidate;
use crate::record::{Document, FieldValue, RecordSchema};
use crate::resilience::retry::{retry_store_call, RetryConfig};
use crate::storage::traits::{ScanCursor, ScanSlice, StorageError, SyncStore};

/// Which store call failed, for error context.
#[derive(Debug)]
pub struct ScanError {
    pub operation: &'static str,
    pub source: StorageError,
}

/// Outcome of reading a pass's change-log window.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// One entry per identity, ordered by `(first_seen, id)`
    pub changes: Vec<CollapsedChange>,
    /// Raw change-log entries read
    pub entries_read: usize,
    /// Change-log rows dropped for a blank identity or negative version
    pub malformed: usize,
}

/// A collapsed change matched against the source's current state.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Candidate { change: CollapsedChange, candidate: Candidate },
    /// The source still holds an older version than its own change-log claims.
    Lagging { change: CollapsedChange, found: i64 },
}

pub struct StoreScanner {
    store: Arc<dyn SyncStore>,
    schema: RecordSchema,
    retry: RetryConfig,
    page_size: usize,
}

impl StoreScanner {
    pub fn new(store: Arc<dyn SyncStore>, schema: RecordSchema, retry: RetryConfig, page_size: usize) -> Self {
        Self {
            store,
            schema,
            retry,
            page_size: page_size.max(1),
        }
    }

    #[must_use]
    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Full scan of `slice`, optionally resuming after `start`.
    #[must_use]
    pub fn full(&self, slice: ScanSlice, start: Option<ScanCursor>) -> FullScan<'_> {
        FullScan {
            scanner: self,
            slice,
            cursor: start,
            done: false,
        }
    }

    /// Read every `(cluster_shard, window)` partition across the time buckets the
    /// window overlaps, collapsing to the latest version per identity.
    ///
    /// Returns `Ok(None)` if cancelled before the window was fully read.
    pub async fn collect_changes(
        &self,
        windows: &[(u32, TimeWindow)],
        cancel: &CancellationToken,
    ) -> Result<Option<ChangeSet>, ScanError> {
        let mut collapser = ChangeCollapser::new();
        let mut malformed = 0;

        for (cluster_shard, window) in windows {
            for time_shard in window.time_shards() {
                let key = ShardKey {
                    time_shard,
                    cluster_shard: *cluster_shard,
                };
                let mut after = None;
                loop {
                    if cancel.is_cancelled() {
                        return Ok(None);
                    }
                    let page = retry_store_call("read_changes", &self.retry, || {
                        self.store.read_changes(key, *window, after.as_ref(), self.page_size)
                    })
                    .await
                    .map_err(|source| ScanError {
                        operation: "read_changes",
                        source,
                    })?;

                    if page.malformed > 0 {
                        warn!(
                            store = self.store.name(),
                            ?key,
                            skipped = page.malformed,
                            "Skipping malformed change-log rows"
                        );
                        malformed += page.malformed;
                    }
                    for entry in page.entries {
                        // Partitions are keyed by day of week; drop anything a wrapped bucket returns.
                        if window.contains(entry.timestamp) {
                            collapser.push(entry);
                        }
                    }
                    match page.next {
                        Some(next) => after = Some(next),
                        None => break,
                    }
                }
            }
        }

        let entries_read = collapser.total_entries();
        let changes = collapser.into_ordered();
        debug!(store = self.store.name(), entries_read, identities = changes.len(), "Change-log window collapsed");
        Ok(Some(ChangeSet {
            changes,
            entries_read,
            malformed,
        }))
    }

    /// Fetch current payloads for a chunk of collapsed changes.
    pub async fn resolve(&self, chunk: &[CollapsedChange]) -> Result<Vec<Resolved>, ScanError> {
        let ids: Vec<String> = chunk.iter().map(|c| c.id.clone()).collect();
        let documents = retry_store_call("fetch", &self.retry, || self.store.fetch(&ids))
            .await
            .map_err(|source| ScanError {
                operation: "fetch",
                source,
            })?;

        let mut by_id: HashMap<String, Document> = documents
            .into_iter()
            .filter_map(|doc| identity_of(&self.schema, &doc).map(|id| (id, doc)))
            .collect();

        Ok(chunk
            .iter()
            .map(|change| match by_id.remove(&change.id) {
                None => Resolved::Candidate {
                    change: change.clone(),
                    candidate: Candidate::Missing {
                        id: change.id.clone(),
                        version: change.version,
                    },
                },
                Some(doc) => match doc.get(&self.schema.version_field) {
                    Some(FieldValue::Int(found)) if *found < change.version => Resolved::Lagging {
                        change: change.clone(),
                        found: *found,
                    },
                    _ => Resolved::Candidate {
                        change: change.clone(),
                        candidate: Candidate::Present(doc),
                    },
                },
            })
            .collect())
    }
}

/// Identity of a raw document, without validating the rest of it.
fn identity_of(schema: &RecordSchema, doc: &Document) -> Option<String> {
    match doc.get(&schema.id_field) {
        Some(FieldValue::Str(s)) => Some(s.clone()),
        Some(FieldValue::Int(i)) => Some(i.to_string()),
        _ => None,
    }
}

/// Resumable page-by-page walk over one slice of the primary dataset.
pub struct FullScan<'a> {
    scanner: &'a StoreScanner,
    slice: ScanSlice,
    cursor: Option<ScanCursor>,
    done: bool,
}

impl FullScan<'_> {
    /// Next page of documents, or `None` once the slice is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Document>>, ScanError> {
        if self.done {
            return Ok(None);
        }
        let store = &self.scanner.store;
        let (slice, limit) = (self.slice, self.scanner.page_size);
        let cursor = self.cursor.as_ref();
        let page = retry_store_call("scan_page", &self.scanner.retry, || store.scan_page(slice, cursor, limit))
            .await
            .map_err(|source| ScanError {
                operation: "scan_page",
                source,
            })?;

        match page.next {
            Some(next) => self.cursor = Some(next),
            None => self.done = true,
        }
        if page.documents.is_empty() && self.done {
            return Ok(None);
        }
        Ok(Some(page.documents))
    }

    /// Position to resume from after the last page returned.
    #[must_use]
    pub fn position(&self) -> Option<&ScanCursor> {
        self.cursor.as_ref()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }
}
