// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Count/size batching for bulk writes.
//!
//! The [`HybridBatcher`] collects items and hands them out in batches once
//! either threshold is reached: item count or total bytes. Passes force a
//! flush at the end of every unit of work, so there is no time trigger.
//!
//! # Example
//!
//! ```
//! use sync_bridge::{HybridBatcher, BatchConfig, SizedItem};
//!
//! #[derive(Clone)]
//! struct Item { data: String }
//! impl SizedItem for Item {
//!     fn size_bytes(&self) -> usize { self.data.len() }
//! }
//!
//! let config = BatchConfig {
//!     docs_per_batch: 10,
//!     max_batch_bytes: 1024,
//! };
//!
//! let mut batcher: HybridBatcher<Item> = HybridBatcher::new(config);
//! assert!(batcher.is_empty());
//!
//! batcher.add(Item { data: "hello".into() });
//! assert!(!batcher.is_empty());
//! ```

use tracing::debug;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Item count threshold reached
    Count,
    /// Byte size threshold reached
    Size,
    /// End of a page, chunk or pass
    Manual,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Size => "size",
            Self::Manual => "manual",
        }
    }
}

/// Configuration for hybrid batching
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush after this many items
    pub docs_per_batch: usize,
    /// Flush after this many bytes
    pub max_batch_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            docs_per_batch: 500,
            max_batch_bytes: 5 * 1024 * 1024, // 5 MB
        }
    }
}

/// Items whose encoded size can be estimated up front.
pub trait SizedItem {
    fn size_bytes(&self) -> usize;
}

/// A batch of items ready for flush
#[derive(Debug)]
pub struct FlushBatch<T> {
    pub items: Vec<T>,
    pub total_bytes: usize,
    pub reason: FlushReason,
}

/// A batch of items pending flush
#[derive(Debug)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub total_bytes: usize,
}

impl<T> Batch<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            total_bytes: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn push(&mut self, item: T, size_bytes: usize) {
        self.items.push(item);
        self.total_bytes += size_bytes;
    }

    pub fn take(&mut self) -> Vec<T> {
        self.total_bytes = 0;
        std::mem::take(&mut self.items)
    }
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Batcher that flushes on whichever of the count or size thresholds is hit first.
pub struct HybridBatcher<T> {
    config: BatchConfig,
    batch: Batch<T>,
}

impl<T: SizedItem> HybridBatcher<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            batch: Batch::new(),
        }
    }

    /// Add an item using its intrinsic size, returns flush reason if a threshold is hit
    pub fn add(&mut self, item: T) -> Option<FlushReason> {
        let size = item.size_bytes();
        self.batch.push(item, size);
        self.ready_reason()
    }

    fn ready_reason(&self) -> Option<FlushReason> {
        // Count is checked first
        if self.batch.len() >= self.config.docs_per_batch.max(1) {
            Some(FlushReason::Count)
        } else if self.batch.total_bytes >= self.config.max_batch_bytes {
            Some(FlushReason::Size)
        } else {
            None
        }
    }

    /// Take the batch if any threshold is ready
    pub fn take_if_ready(&mut self) -> Option<FlushBatch<T>> {
        let reason = self.ready_reason()?;
        Some(self.take_with_reason(reason))
    }

    /// Take whatever is buffered regardless of thresholds
    pub fn force_flush(&mut self) -> Option<FlushBatch<T>> {
        if self.batch.is_empty() {
            return None;
        }
        Some(self.take_with_reason(FlushReason::Manual))
    }

    fn take_with_reason(&mut self, reason: FlushReason) -> FlushBatch<T> {
        // Capture bytes BEFORE take() resets it
        let total_bytes = self.batch.total_bytes;
        let items = self.batch.take();
        debug!(count = items.len(), bytes = total_bytes, reason = reason.as_str(), "Batch taken for flush");
        FlushBatch { items, total_bytes, reason }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// Current (count, bytes)
    #[must_use]
    pub fn stats(&self) -> (usize, usize) {
        (self.batch.len(), self.batch.total_bytes)
    }
}
