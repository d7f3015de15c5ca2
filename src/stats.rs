//! Performance accounting for a factorization.
//!
//! A [`FactorStats`] is created by the caller and passed by reference into a driver. The
//! drivers (and the batched update builder) bump its counters as they go. All counters
//! are atomic so that tasks running on different worker threads can record into the same
//! accumulator without locking. Once the call returns, [`FactorStats::snapshot`] gives a
//! plain, serializable copy for reporting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Caller-supplied accumulator of flop, traffic and compression counters.
#[derive(Debug, Default)]
pub struct FactorStats {
    flops: AtomicU64,
    bytes_transferred: AtomicU64,
    tiles_compressed: AtomicU64,
    tiles_rejected: AtomicU64,
    tiles_skipped: AtomicU64,
    batched_calls: AtomicU64,
    batched_products: AtomicU64,
}

/// A plain copy of the counters of a [`FactorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub flops: u64,
    pub bytes_transferred: u64,
    pub tiles_compressed: u64,
    pub tiles_rejected: u64,
    pub tiles_skipped: u64,
    pub batched_calls: u64,
    pub batched_products: u64,
}

impl FactorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_flops(&self, flops: u64) {
        self.flops.fetch_add(flops, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn tile_compressed(&self) {
        self.tiles_compressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tile_rejected(&self) {
        self.tiles_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tile_skipped(&self) {
        self.tiles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one batched call carrying `products` matrix products.
    pub fn batched_call(&self, products: usize) {
        self.batched_calls.fetch_add(1, Ordering::Relaxed);
        self.batched_products
            .fetch_add(products as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            flops: self.flops.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            tiles_compressed: self.tiles_compressed.load(Ordering::Relaxed),
            tiles_rejected: self.tiles_rejected.load(Ordering::Relaxed),
            tiles_skipped: self.tiles_skipped.load(Ordering::Relaxed),
            batched_calls: self.batched_calls.load(Ordering::Relaxed),
            batched_products: self.batched_products.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = FactorStats::new();
        stats.add_flops(240);
        stats.add_flops(10);
        stats.tile_compressed();
        stats.tile_compressed();
        stats.tile_rejected();
        stats.batched_call(7);
        let snap = stats.snapshot();
        assert_eq!(snap.flops, 250);
        assert_eq!(snap.tiles_compressed, 2);
        assert_eq!(snap.tiles_rejected, 1);
        assert_eq!(snap.tiles_skipped, 0);
        assert_eq!(snap.batched_calls, 1);
        assert_eq!(snap.batched_products, 7);
    }
}
