//! Per-direction byte accounting and rate limiting.
//!
//! Bytes are accumulated during a one-second window; the counter worker
//! calls [`BandwidthMeter::roll`] to move the accumulator into the published
//! rate. With a cap set, the accumulator doubles as the window budget.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct BandwidthMeter {
    accumulated: AtomicU64,
    rate: AtomicU64,
    limit: Option<u64>,
}

impl BandwidthMeter {
    /// `limit` in bytes per second; `None` or `Some(0)` means unlimited.
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            accumulated: AtomicU64::new(0),
            rate: AtomicU64::new(0),
            limit: limit.filter(|l| *l > 0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Whether `len` more bytes fit in the current window.
    ///
    /// An empty window always admits one unit so a frame larger than the
    /// whole budget cannot stall forever.
    pub fn allows(&self, len: usize) -> bool {
        match self.limit {
            None => true,
            Some(limit) => {
                let used = self.accumulated.load(Ordering::Acquire);
                used == 0 || used.saturating_add(len as u64) <= limit
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        match self.limit {
            None => false,
            Some(limit) => self.accumulated.load(Ordering::Acquire) >= limit,
        }
    }

    pub fn record(&self, len: usize) {
        self.accumulated.fetch_add(len as u64, Ordering::AcqRel);
    }

    /// Close the window: publish the accumulated bytes as the rate.
    pub fn roll(&self) -> u64 {
        let bytes = self.accumulated.swap(0, Ordering::AcqRel);
        self.rate.store(bytes, Ordering::Release);
        bytes
    }

    /// Bytes moved in the last completed window.
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Acquire)
    }

    /// Bytes moved so far in the current window.
    pub fn pending(&self) -> u64 {
        self.accumulated.load(Ordering::Acquire)
    }
}

impl Default for BandwidthMeter {
    fn default() -> Self {
        Self::unlimited()
    }
}
