//! Process-wide traffic counters
//!
//! Totals plus a one-second rolling window for instantaneous speed. All
//! updates are atomic; the window roll is best-effort under races, which is
//! fine for an observability-only surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_total: u64,
    pub rx_total: u64,
    /// Bytes sent during the last full one-second window.
    pub tx_per_sec: u64,
    /// Bytes received during the last full one-second window.
    pub rx_per_sec: u64,
}

/// Global transmit/receive accounting for the whole process.
pub struct TrafficStats {
    started: Instant,
    tx_total: AtomicU64,
    rx_total: AtomicU64,
    epoch: AtomicU64,
    window_tx: AtomicU64,
    window_rx: AtomicU64,
    last_tx: AtomicU64,
    last_rx: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            tx_total: AtomicU64::new(0),
            rx_total: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            window_tx: AtomicU64::new(0),
            window_rx: AtomicU64::new(0),
            last_tx: AtomicU64::new(0),
            last_rx: AtomicU64::new(0),
        }
    }

    pub fn add_tx(&self, n: u64) {
        self.roll();
        self.tx_total.fetch_add(n, Ordering::Relaxed);
        self.window_tx.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rx(&self, n: u64) {
        self.roll();
        self.rx_total.fetch_add(n, Ordering::Relaxed);
        self.window_rx.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.roll();
        StatsSnapshot {
            tx_total: self.tx_total.load(Ordering::Relaxed),
            rx_total: self.rx_total.load(Ordering::Relaxed),
            tx_per_sec: self.last_tx.load(Ordering::Relaxed),
            rx_per_sec: self.last_rx.load(Ordering::Relaxed),
        }
    }

    /// Rotate the one-second window when the epoch second changes. A gap of
    /// more than one second means the previous window carried no traffic.
    fn roll(&self) {
        let now = self.started.elapsed().as_secs();
        let seen = self.epoch.load(Ordering::Relaxed);
        if now == seen {
            return;
        }
        if self
            .epoch
            .compare_exchange(seen, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let tx = self.window_tx.swap(0, Ordering::Relaxed);
            let rx = self.window_rx.swap(0, Ordering::Relaxed);
            if now == seen + 1 {
                self.last_tx.store(tx, Ordering::Relaxed);
                self.last_rx.store(rx, Ordering::Relaxed);
            } else {
                self.last_tx.store(0, Ordering::Relaxed);
                self.last_rx.store(0, Ordering::Relaxed);
            }
        }
    }
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}
