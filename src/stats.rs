use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters updated on map operations.
pub(crate) struct StatsCounter {
    creations: AtomicU64,
    reclamations: AtomicU64,
    finalize_errors: AtomicU64,
}

impl StatsCounter {
    pub fn new() -> Self {
        StatsCounter {
            creations: AtomicU64::new(0),
            reclamations: AtomicU64::new(0),
            finalize_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_creation(&self) {
        self.creations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reclamation(&self) {
        self.reclamations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_finalize_error(&self) {
        self.finalize_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of the statistics.
    pub fn snapshot(&self) -> Metrics {
        Metrics {
            creations: self.creations.load(Ordering::Relaxed),
            reclamations: self.reclamations.load(Ordering::Relaxed),
            finalize_errors: self.finalize_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for StatsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of map statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metrics {
    /// Number of entry instances built by a creator callback.
    pub creations: u64,
    /// Number of entry instances torn down after going idle.
    pub reclamations: u64,
    /// Number of finalizers that returned an error.  The errors themselves
    /// are discarded; destruction proceeds regardless.
    pub finalize_errors: u64,
}

impl Metrics {
    /// Entry instances built but not yet torn down.
    pub fn live(&self) -> u64 {
        self.creations.saturating_sub(self.reclamations)
    }
}
