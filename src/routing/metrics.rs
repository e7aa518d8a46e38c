//! Routing counters.
//!
//! Relaxed atomics are enough here; consumers only want monotonic
//! snapshots for logs and operator tooling.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RouterMetrics {
    /// Datagrams that made it through `process`.
    pub datagrams_routed: AtomicU64,
    /// Datagrams dropped before fan-out (truncated header, bad control).
    pub datagrams_dropped: AtomicU64,
    /// Individual deliveries that failed and were isolated.
    pub delivery_errors: AtomicU64,
    /// Payload bytes carried by routed datagrams.
    pub bytes_routed: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub datagrams_routed: u64,
    pub datagrams_dropped: u64,
    pub delivery_errors: u64,
    pub bytes_routed: u64,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_routed(&self, bytes: usize) {
        self.datagrams_routed.fetch_add(1, Ordering::Relaxed);
        self.bytes_routed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_error(&self) {
        self.delivery_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RouterStats {
        RouterStats {
            datagrams_routed: self.datagrams_routed.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
            bytes_routed: self.bytes_routed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = RouterMetrics::new();
        metrics.record_routed(100);
        metrics.record_routed(50);
        metrics.record_dropped();
        metrics.record_delivery_error();

        let snap = metrics.snapshot();
        assert_eq!(snap.datagrams_routed, 2);
        assert_eq!(snap.bytes_routed, 150);
        assert_eq!(snap.datagrams_dropped, 1);
        assert_eq!(snap.delivery_errors, 1);
    }
}
