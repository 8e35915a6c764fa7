use prometheus_client::metrics::gauge::Gauge;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes reserved by all index arenas in the process.
static ALLOCATED: AtomicU64 = AtomicU64::new(0);

/// Returns the number of bytes currently reserved by all index arenas in the process.
pub fn allocated_bytes() -> u64 {
    ALLOCATED.load(Ordering::Acquire)
}

/// A gauge reporting a memory reservation in megabytes.
pub type MemoryGauge = Gauge<f64, AtomicU64>;

pub(super) fn to_megabytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Tracks the memory reserved by the index arenas of one table.
#[derive(Default)]
pub struct MemoryTracker {
    reserved: AtomicU64,
    gauge: MemoryGauge,
}

impl MemoryTracker {
    /// Create a tracker that reports its reservation to `gauge`.
    pub fn new(gauge: MemoryGauge) -> Self {
        Self {
            reserved: AtomicU64::new(0),
            gauge,
        }
    }

    /// Bytes currently reserved.
    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    pub(super) fn reserve(&self, bytes: u64) {
        ALLOCATED.fetch_add(bytes, Ordering::AcqRel);
        let reserved = self.reserved.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.gauge.set(to_megabytes(reserved));
    }

    pub(super) fn release(&self, bytes: u64) {
        ALLOCATED.fetch_sub(bytes, Ordering::AcqRel);
        let reserved = self.reserved.fetch_sub(bytes, Ordering::AcqRel) - bytes;
        self.gauge.set(to_megabytes(reserved));
    }
}
