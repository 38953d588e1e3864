//! Gateway traffic counters.
//!
//! Shared between the event loop (which increments) and the periodic stats
//! flush (which logs and resets the interval view).

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Counter set for one stats interval.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntervalCounters {
    pub tx_from_relay: u64,
    pub tx_compact_from_relay: u64,
    pub tx_duplicate_from_relay: u64,
    pub tx_redundant_content: u64,
    pub tx_forwarded_to_node: u64,
    pub tx_from_node: u64,
    pub blocks_compressed: u64,
    pub blocks_decompressed: u64,
    pub blocks_duplicate: u64,
    pub blocks_recovery_started: u64,
    pub blocks_recovery_completed: u64,
    pub blocks_recovery_exhausted: u64,
}

/// Shared counter handle.
#[derive(Clone, Default)]
pub struct GatewayStats {
    inner: Arc<Mutex<IntervalCounters>>,
}

impl GatewayStats {
    /// Creates a zeroed handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `f` to the counters.
    pub fn record(&self, f: impl FnOnce(&mut IntervalCounters)) {
        f(&mut self.inner.lock());
    }

    /// Snapshot of the current interval.
    pub fn snapshot(&self) -> IntervalCounters {
        *self.inner.lock()
    }

    /// Logs the interval line and resets the counters.
    pub fn flush(&self) {
        let counters = {
            let mut guard = self.inner.lock();
            std::mem::take(&mut *guard)
        };
        info!(
            tx_from_relay = counters.tx_from_relay,
            tx_compact = counters.tx_compact_from_relay,
            tx_duplicate = counters.tx_duplicate_from_relay,
            tx_redundant_content = counters.tx_redundant_content,
            tx_forwarded = counters.tx_forwarded_to_node,
            tx_from_node = counters.tx_from_node,
            blocks_compressed = counters.blocks_compressed,
            blocks_decompressed = counters.blocks_decompressed,
            blocks_duplicate = counters.blocks_duplicate,
            recoveries_started = counters.blocks_recovery_started,
            recoveries_completed = counters.blocks_recovery_completed,
            recoveries_exhausted = counters.blocks_recovery_exhausted,
            "gateway transaction stats"
        );
    }
}
