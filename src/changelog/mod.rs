// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sharded change-log support.
//!
//! Every application write also appends "identity reached version V at time
//! T" to a change-log partition. Partitions are keyed by a coarse time bucket
//! and a random cluster shard so no single partition runs hot and each one
//! ages out with the entry TTL.
//!
//! # Partition Layout
//!
//! ```text
//! PRIMARY KEY ((time_shard, cluster_shard), timestamp, id, version)
//!
//!   time_shard     day of week of `timestamp` (0 = Monday .. 6 = Sunday)
//!   cluster_shard  uniform random in [0, cluster_shards)
//!   timestamp      epoch millis, clustering order ASC
//! ```
//!
//! An incremental pass over `(checkpoint, scan_start]` only touches the day
//! buckets that window overlaps, and only the cluster shards its worker owns.
//!
//! # Collapse
//!
//! A busy identity can appear many times in one window. [`ChangeCollapser`]
//! keeps only the highest version per identity (and remembers the earliest
//! timestamp it was seen at, which is what bounds a safe checkpoint).

use std::collections::HashMap;
use std::ops::Range;

use chrono::{DateTime, Datelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Number of coarse time buckets (days of the week).
pub const TIME_SHARDS: u8 = 7;

const MILLIS_PER_DAY: i64 = 24 * 3600 * 1000;

/// Current wall-clock time in epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Change-log partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardKey {
    pub time_shard: u8,
    pub cluster_shard: u32,
}

/// Day-of-week bucket for an epoch-millis timestamp.
#[must_use]
pub fn time_shard_for(timestamp_ms: i64) -> u8 {
    match DateTime::from_timestamp_millis(timestamp_ms) {
        Some(dt) => dt.weekday().num_days_from_monday() as u8,
        // Out of chrono's range; fall back to plain day arithmetic (epoch was a Thursday).
        None => ((timestamp_ms.div_euclid(MILLIS_PER_DAY) + 3).rem_euclid(7)) as u8,
    }
}

/// Half-open-on-the-left time window `(after, upto]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub after: i64,
    pub upto: i64,
}

impl TimeWindow {
    #[must_use]
    pub fn new(after: i64, upto: i64) -> Self {
        Self { after, upto }
    }

    #[must_use]
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp > self.after && timestamp <= self.upto
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upto <= self.after
    }

    /// Time buckets that can hold entries inside this window.
    #[must_use]
    pub fn time_shards(&self) -> Vec<u8> {
        if self.is_empty() {
            return Vec::new();
        }
        let first_day = (self.after + 1).div_euclid(MILLIS_PER_DAY);
        let last_day = self.upto.div_euclid(MILLIS_PER_DAY);
        if last_day - first_day + 1 >= i64::from(TIME_SHARDS) {
            return (0..TIME_SHARDS).collect();
        }
        let mut shards: Vec<u8> = (first_day..=last_day)
            .map(|day| time_shard_for(day * MILLIS_PER_DAY))
            .collect();
        shards.sort_unstable();
        shards.dedup();
        shards
    }
}

/// "Identity `id` reached `version` at `timestamp`", stored under `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub key: ShardKey,
    pub timestamp: i64,
    pub id: String,
    pub version: i64,
}

impl ChangeLogEntry {
    /// Entries without an identity or with a negative version cannot be synced.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_empty() && self.version >= 0
    }

    /// Position of this entry within its partition.
    #[must_use]
    pub fn cursor(&self) -> ChangeCursor {
        ChangeCursor {
            timestamp: self.timestamp,
            id: self.id.clone(),
            version: self.version,
        }
    }
}

/// Resume position inside one change-log partition; entries strictly after it are returned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeCursor {
    pub timestamp: i64,
    pub id: String,
    pub version: i64,
}

/// One page of a change-log partition, in (timestamp, id, version) order.
#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub entries: Vec<ChangeLogEntry>,
    /// `None` once the window is exhausted
    pub next: Option<ChangeCursor>,
    /// Rows on this page that were dropped as malformed
    pub malformed: usize,
}

impl ChangePage {
    /// Page from the rows a partition read returned, in partition order.
    ///
    /// Malformed rows are dropped but still move the cursor, so a page made
    /// only of them does not end the partition early.
    #[must_use]
    pub fn from_rows(rows: Vec<ChangeLogEntry>, more: bool) -> Self {
        let next = if more { rows.last().map(ChangeLogEntry::cursor) } else { None };
        let total = rows.len();
        let entries: Vec<ChangeLogEntry> = rows.into_iter().filter(ChangeLogEntry::is_well_formed).collect();
        Self {
            malformed: total - entries.len(),
            entries,
            next,
        }
    }
}

/// Write-path helper that picks partition keys for new entries.
///
/// The sync engine never writes change-log entries itself; this is what the
/// application write path (and the in-memory store) uses.
#[derive(Debug, Clone)]
pub struct ChangeLogWriter {
    cluster_shards: u32,
}

impl ChangeLogWriter {
    #[must_use]
    pub fn new(cluster_shards: u32) -> Self {
        Self {
            cluster_shards: cluster_shards.max(1),
        }
    }

    #[must_use]
    pub fn cluster_shards(&self) -> u32 {
        self.cluster_shards
    }

    /// Entry for a write, spread to a uniformly random cluster shard.
    #[must_use]
    pub fn entry_for(&self, id: &str, version: i64, timestamp: i64) -> ChangeLogEntry {
        let cluster_shard = rand::thread_rng().gen_range(0..self.cluster_shards);
        self.entry_in(cluster_shard, id, version, timestamp)
    }

    /// Entry pinned to a given cluster shard.
    #[must_use]
    pub fn entry_in(&self, cluster_shard: u32, id: &str, version: i64, timestamp: i64) -> ChangeLogEntry {
        ChangeLogEntry {
            key: ShardKey {
                time_shard: time_shard_for(timestamp),
                cluster_shard: cluster_shard % self.cluster_shards,
            },
            timestamp,
            id: id.to_string(),
            version,
        }
    }
}

/// Contiguous run of cluster shards owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardRange {
    pub start: u32,
    pub end: u32,
}

impl ShardRange {
    #[must_use]
    pub fn shards(&self) -> Range<u32> {
        self.start..self.end
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl std::fmt::Display for ShardRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Split `[0, cluster_shards)` evenly across `workers`; earlier workers take the remainder.
#[must_use]
pub fn partition_shards(cluster_shards: u32, workers: u32) -> Vec<ShardRange> {
    let workers = workers.max(1);
    let base = cluster_shards / workers;
    let extra = cluster_shards % workers;
    let mut start = 0;
    (0..workers)
        .map(|w| {
            let len = base + u32::from(w < extra);
            let range = ShardRange { start, end: start + len };
            start += len;
            range
        })
        .collect()
}

/// Stable FNV-1a hash used to slice identities across full-scan workers.
#[must_use]
pub fn identity_hash(id: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Latest change seen for one identity within a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollapsedChange {
    pub id: String,
    pub version: i64,
    /// Timestamp of the entry carrying `version`
    pub timestamp: i64,
    /// Earliest timestamp of any entry for this identity in the pass
    pub first_seen: i64,
    /// Entries folded into this one
    pub entries: usize,
}

/// Folds a pass's change-log entries down to one per identity.
#[derive(Debug, Default)]
pub struct ChangeCollapser {
    latest: HashMap<String, CollapsedChange>,
    total_entries: usize,
}

impl ChangeCollapser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ChangeLogEntry) {
        self.total_entries += 1;
        match self.latest.get_mut(&entry.id) {
            Some(current) => {
                current.entries += 1;
                current.first_seen = current.first_seen.min(entry.timestamp);
                let newer = entry.version > current.version
                    || (entry.version == current.version && entry.timestamp > current.timestamp);
                if newer {
                    current.version = entry.version;
                    current.timestamp = entry.timestamp;
                }
            }
            None => {
                self.latest.insert(
                    entry.id.clone(),
                    CollapsedChange {
                        id: entry.id,
                        version: entry.version,
                        timestamp: entry.timestamp,
                        first_seen: entry.timestamp,
                        entries: 1,
                    },
                );
            }
        }
    }

    #[must_use]
    pub fn total_entries(&self) -> usize {
        self.total_entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Collapsed changes ordered by `(first_seen, id)`.
    #[must_use]
    pub fn into_ordered(self) -> Vec<CollapsedChange> {
        let mut changes: Vec<CollapsedChange> = self.latest.into_values().collect();
        changes.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then_with(|| a.id.cmp(&b.id)));
        changes
    }
}
