//! Atomic scan-wide counters, sampled by the monitor thread for the live
//! dashboard and the final summary (§4.7).
//!
//! All atomic writes use Relaxed ordering — these are sampling metrics, not
//! synchronisation.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Instant;

/// Atomic scan-wide counters. One instance shared across every sender,
/// the receiver, and the monitor via `Arc`.
pub struct ScanStats {
    start: Instant,

    // Send side
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub send_blocked: AtomicU64,
    /// Targets skipped by the blocklist oracle before a packet was built.
    pub targets_blocklisted: AtomicU64,

    // Receive side
    pub packets_received: AtomicU64,
    pub responses_validated: AtomicU64,
    pub responses_unvalidated: AtomicU64,
    pub duplicate_responses: AtomicU64,

    // Classification (probe-module defined categories, tracked generically)
    pub successes: AtomicU64,
    pub failures: AtomicU64,

    /// Current rate controller target, packets/sec. Updated by the rate
    /// controller, read by the dashboard and by SIGUSR1/2 handlers.
    pub current_rate_pps: AtomicU64,
    /// Cumulative microseconds the rate controller has slept, for
    /// diagnosing whether the scan is rate-bound or NIC-bound.
    pub sleep_us_total: AtomicI64,
}

/// Plain-struct snapshot of [`ScanStats`] for display (no atomics).
#[derive(Debug, Clone)]
pub struct ScanStatsSnapshot {
    pub elapsed_secs: f64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub send_blocked: u64,
    pub targets_blocklisted: u64,
    pub packets_received: u64,
    pub responses_validated: u64,
    pub responses_unvalidated: u64,
    pub duplicate_responses: u64,
    pub successes: u64,
    pub failures: u64,
    pub current_rate_pps: u64,
    pub send_rate_pps: f64,
    pub recv_rate_pps: f64,
}

impl ScanStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            send_blocked: AtomicU64::new(0),
            targets_blocklisted: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            responses_validated: AtomicU64::new(0),
            responses_unvalidated: AtomicU64::new(0),
            duplicate_responses: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            current_rate_pps: AtomicU64::new(0),
            sleep_us_total: AtomicI64::new(0),
        })
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn snapshot(&self) -> ScanStatsSnapshot {
        let elapsed_secs = self.elapsed().as_secs_f64().max(1e-6);
        let packets_sent = self.packets_sent.load(Relaxed);
        let packets_received = self.packets_received.load(Relaxed);
        ScanStatsSnapshot {
            elapsed_secs,
            packets_sent,
            bytes_sent: self.bytes_sent.load(Relaxed),
            send_errors: self.send_errors.load(Relaxed),
            send_blocked: self.send_blocked.load(Relaxed),
            targets_blocklisted: self.targets_blocklisted.load(Relaxed),
            packets_received,
            responses_validated: self.responses_validated.load(Relaxed),
            responses_unvalidated: self.responses_unvalidated.load(Relaxed),
            duplicate_responses: self.duplicate_responses.load(Relaxed),
            successes: self.successes.load(Relaxed),
            failures: self.failures.load(Relaxed),
            current_rate_pps: self.current_rate_pps.load(Relaxed),
            send_rate_pps: packets_sent as f64 / elapsed_secs,
            recv_rate_pps: packets_received as f64 / elapsed_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = ScanStats::new();
        stats.packets_sent.fetch_add(100, Relaxed);
        stats.packets_received.fetch_add(40, Relaxed);
        stats.successes.fetch_add(10, Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.packets_sent, 100);
        assert_eq!(snap.packets_received, 40);
        assert_eq!(snap.successes, 10);
        assert!(snap.send_rate_pps >= 0.0);
    }
}
