use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Trait for tracking cursor engine activity.
///
/// Implementations collect statistics about cursor reuse, store lookups, security
/// rejections and lock-verify retries for monitoring and profiling.
pub trait CursorMetrics: Send + Sync {
    /// Records a cursor handed out by a pool; `reused` is true when it came off a free list.
    fn cursor_acquired(&self, reused: bool);

    /// Records a cursor returned to its pool.
    fn cursor_released(&self);

    /// Records one store pass made to fill index values.
    fn store_lookup(&self);

    /// Records an entity rejected by a security check.
    fn security_rejection(&self);

    /// Records an entity served from transaction state.
    fn overlay_hit(&self);

    /// Records a partition or batch reservation.
    fn partition_reserved(&self);

    /// Records a snapshot-lock-verify cycle that had to start over.
    fn lock_retry(&self);
}

/// A no-op implementation of [`CursorMetrics`].
#[derive(Default)]
pub struct NoopMetrics;

impl CursorMetrics for NoopMetrics {
    fn cursor_acquired(&self, _reused: bool) {}
    fn cursor_released(&self) {}
    fn store_lookup(&self) {}
    fn security_rejection(&self) {}
    fn overlay_hit(&self) {}
    fn partition_reserved(&self) {}
    fn lock_retry(&self) {}
}

/// A thread-safe counter-based implementation of [`CursorMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Cursors handed out by pools.
    pub cursors_acquired: AtomicU64,
    /// Cursors handed out from a free list instead of being allocated.
    pub cursors_reused: AtomicU64,
    /// Cursors returned to pools.
    pub cursors_released: AtomicU64,
    /// Store passes performed to fill unknown index values.
    pub store_lookups: AtomicU64,
    /// Entities rejected by security filtering.
    pub security_rejections: AtomicU64,
    /// Entities served from transaction state.
    pub overlay_hits: AtomicU64,
    /// Partitions or batches reserved.
    pub partitions_reserved: AtomicU64,
    /// Snapshot-lock-verify retries.
    pub lock_retries: AtomicU64,
}

/// Point-in-time copy of [`CounterMetrics`].
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Cursors handed out by pools.
    pub cursors_acquired: u64,
    /// Cursors reused from a free list.
    pub cursors_reused: u64,
    /// Cursors returned to pools.
    pub cursors_released: u64,
    /// Store passes performed to fill unknown index values.
    pub store_lookups: u64,
    /// Entities rejected by security filtering.
    pub security_rejections: u64,
    /// Entities served from transaction state.
    pub overlay_hits: u64,
    /// Partitions or batches reserved.
    pub partitions_reserved: u64,
    /// Snapshot-lock-verify retries.
    pub lock_retries: u64,
}

impl CounterMetrics {
    /// Copies all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cursors_acquired: self.cursors_acquired.load(Ordering::Relaxed),
            cursors_reused: self.cursors_reused.load(Ordering::Relaxed),
            cursors_released: self.cursors_released.load(Ordering::Relaxed),
            store_lookups: self.store_lookups.load(Ordering::Relaxed),
            security_rejections: self.security_rejections.load(Ordering::Relaxed),
            overlay_hits: self.overlay_hits.load(Ordering::Relaxed),
            partitions_reserved: self.partitions_reserved.load(Ordering::Relaxed),
            lock_retries: self.lock_retries.load(Ordering::Relaxed),
        }
    }
}

impl CursorMetrics for CounterMetrics {
    fn cursor_acquired(&self, reused: bool) {
        self.cursors_acquired.fetch_add(1, Ordering::Relaxed);
        if reused {
            self.cursors_reused.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn cursor_released(&self) {
        self.cursors_released.fetch_add(1, Ordering::Relaxed);
    }

    fn store_lookup(&self) {
        self.store_lookups.fetch_add(1, Ordering::Relaxed);
    }

    fn security_rejection(&self) {
        self.security_rejections.fetch_add(1, Ordering::Relaxed);
    }

    fn overlay_hit(&self) {
        self.overlay_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn partition_reserved(&self) {
        self.partitions_reserved.fetch_add(1, Ordering::Relaxed);
    }

    fn lock_retry(&self) {
        self.lock_retries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the shared no-op metrics sink.
pub fn default_metrics() -> Arc<dyn CursorMetrics> {
    Arc::new(NoopMetrics)
}
