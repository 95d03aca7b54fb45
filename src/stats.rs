//! Disk-usage and aggregate storage statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Total/free bytes for one registered drive, as reported by the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriveUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DriveUsage {
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    /// Percentage of capacity in use, `0` for a zero-capacity drive.
    #[must_use]
    pub fn percent_used(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let pct = (self.used_bytes() * 100) / self.total_bytes;
        u8::try_from(pct.min(100)).unwrap_or(100)
    }
}

/// Aggregate storage info across every registered drive, returned by
/// [`crate::coordinator::CacheCoordinator::storage_info`].
///
/// A drive that failed to report usage (offline, I/O error) contributes zero to both totals;
/// the failure is logged, not surfaced, per the coordinator's `storage_info` semantics.
#[derive(Debug, Clone, Default)]
pub struct StorageInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub per_drive: Vec<DriveUsage>,
}

impl StorageInfo {
    pub fn push(&mut self, usage: DriveUsage) {
        self.total_bytes += usage.total_bytes;
        self.free_bytes += usage.free_bytes;
        self.per_drive.push(usage);
    }
}

/// Lock-free running counters for one drive, used by the purger to decide whether a pass is
/// needed without re-stating the filesystem on every coordinator request.
#[derive(Debug, Default)]
pub struct DriveCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    fills: AtomicU64,
    evictions: AtomicU64,
    io_errors: AtomicU64,
}

impl DriveCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fill(&self) {
        self.fills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_io_error(&self) {
        self.io_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn io_error_count(&self) -> u64 {
        self.io_errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> DriveCountersSnapshot {
        DriveCountersSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fills: self.fills.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`DriveCounters`], cheap to log or expose.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriveCountersSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub fills: u64,
    pub evictions: u64,
    pub io_errors: u64,
}
