//! Live allocation table and aggregate counters
//!
//! The consumer's view of every outstanding allocation. Records are keyed
//! by address and the same address may carry several records at once: a
//! producer's allocator can hand a freed address out again before the
//! consumer has seen the corresponding free. A free removes only the
//! oldest record for its address.

use crate::event::{Address, AllocationEvent, EventKind};
use fnv::FnvHashMap;
use std::collections::VecDeque;
use std::time::Instant;

/// Number of size buckets
pub const NUM_SIZE_BINS: usize = 12;

/// Map a size to its bucket: `floor(log2(size)) - 1` clamped to `[0, 11]`
///
/// Bucket 0 holds sizes below 4 bytes, bucket 11 everything from 4096 up.
pub fn size_bin(size: u64) -> usize {
    if size < 4 {
        return 0;
    }
    let log2 = (u64::BITS - 1 - size.leading_zeros()) as usize;
    (log2 - 1).min(NUM_SIZE_BINS - 1)
}

/// One outstanding allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRecord {
    pub size: u64,
    /// Bucket computed once at insertion so removal never recomputes it
    pub size_bin: usize,
    pub created_at: Instant,
}

/// Process-wide counters, zeroed at startup and never persisted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateCounters {
    /// Allocate events processed since start, never decremented
    pub overall_allocations: u64,
    /// Sum of sizes of all live records
    pub total_current_size: u64,
    /// Live records per size bucket
    pub size_bin_counts: [u64; NUM_SIZE_BINS],
}

/// Outstanding allocations plus their counters
#[derive(Debug, Default)]
pub struct LiveTable {
    records: FnvHashMap<Address, VecDeque<LiveRecord>>,
    live: usize,
    counters: AggregateCounters,
}

impl LiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one channel event, timestamping allocations with `now`
    pub fn apply(&mut self, event: &AllocationEvent, now: Instant) {
        match event.kind() {
            EventKind::Allocate => self.handle_allocate_at(event.address(), event.size(), now),
            EventKind::Free => {
                self.handle_free(event.address());
            }
        }
    }

    /// Record a new allocation created now
    pub fn handle_allocate(&mut self, address: Address, size: u64) {
        self.handle_allocate_at(address, size, Instant::now());
    }

    /// Record a new allocation created at `created_at`
    ///
    /// Zero sizes are ignored.
    pub fn handle_allocate_at(&mut self, address: Address, size: u64, created_at: Instant) {
        if size == 0 {
            return;
        }

        let record = LiveRecord {
            size,
            size_bin: size_bin(size),
            created_at,
        };

        self.records.entry(address).or_default().push_back(record);
        self.live += 1;
        self.counters.overall_allocations += 1;
        // Wrapping: each free exactly undoes what its allocate added.
        self.counters.total_current_size = self.counters.total_current_size.wrapping_add(size);
        self.counters.size_bin_counts[record.size_bin] += 1;
    }

    /// Drop the oldest live record for `address`
    ///
    /// Returns the removed record, or `None` when the address is unknown
    /// (allocated before tracking began, or by an untracked producer).
    pub fn handle_free(&mut self, address: Address) -> Option<LiveRecord> {
        let Some(records) = self.records.get_mut(&address) else {
            tracing::trace!("Free of untracked address {}", address);
            return None;
        };

        let record = records.pop_front()?;
        if records.is_empty() {
            self.records.remove(&address);
        }

        self.live -= 1;
        self.counters.total_current_size =
            self.counters.total_current_size.wrapping_sub(record.size);
        self.counters.size_bin_counts[record.size_bin] -= 1;
        Some(record)
    }

    pub fn counters(&self) -> &AggregateCounters {
        &self.counters
    }

    /// Number of live records, duplicates included
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live records for one address, oldest first
    pub fn records_for(&self, address: Address) -> impl Iterator<Item = &LiveRecord> {
        self.records.get(&address).into_iter().flatten()
    }

    /// Every live record, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &LiveRecord> {
        self.records.values().flatten()
    }
}
