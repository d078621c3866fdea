//! A shard owns one disjoint track of the scan's target space and is driven
//! exclusively by one sender thread (§3, §4.3). Multiple packet streams
//! within a shard further subdivide the track by destination port/probe
//! variant, handled by the caller; `Shard` itself only tracks position and
//! completion within its index range.

use crate::iterator::CyclicIterator;
use crate::oracle::BlocklistOracle;
use crate::target_space::TargetSpace;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome of asking a shard for its next target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    /// A target was produced; the sender should probe it.
    Target,
    /// This shard has completed its track: every index has been visited,
    /// or a configured `max_targets`/`max_packets` ceiling was reached.
    Complete,
}

/// One sender thread's disjoint slice of the address space (§3 "Shard",
/// §4.3).
///
/// `Shard` is driven by exactly one sender thread for its whole lifetime
/// and holds no internal locking; counters are plain atomics only so a
/// monitor thread can sample per-shard progress without a lock, not
/// because of concurrent writers.
pub struct Shard {
    shard_idx: u64,
    num_shards: u64,
    iter: CyclicIterator,
    /// Estimated number of *valid* (non-hole) targets this track will
    /// ultimately emit, for progress/ETA display only. The iterator itself
    /// is the sole source of truth for when the track is actually done —
    /// see `CyclicIterator`'s doc comment for why a flat `n/num_shards`
    /// count can't be used as a termination bound.
    estimated_targets: u64,
    emitted: u64,

    targets_scanned: AtomicU64,
    packets_sent: AtomicU64,
    packets_failed: AtomicU64,
    /// Epoch microseconds of the first/last `mark_scanned` call, 0 if unset.
    first_scanned_us: AtomicU64,
    last_scanned_us: AtomicU64,

    max_targets: Option<u64>,
    max_packets: Option<u64>,
}

fn now_epoch_us() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as u64).unwrap_or(0)
}

impl Shard {
    /// Build the `shard_idx`-th of `num_shards` shards over `space`, with
    /// optional per-shard `max_targets`/`max_packets` ceilings (§3, §6
    /// `--max-targets`/`--max-packets`).
    pub fn new(space: &TargetSpace, shard_idx: u64, num_shards: u64) -> Self {
        Self::with_limits(space, shard_idx, num_shards, None, None)
    }

    pub fn with_limits(
        space: &TargetSpace,
        shard_idx: u64,
        num_shards: u64,
        max_targets: Option<u64>,
        max_packets: Option<u64>,
    ) -> Self {
        Self::with_limits_seeded(space, shard_idx, num_shards, max_targets, max_packets, 0)
    }

    /// Same as [`with_limits`](Self::with_limits), but starting the
    /// underlying iterator from the scan-wide random exponent `e0` (§3)
    /// instead of a fixed offset. The orchestrator generates `e0` once per
    /// scan and passes the same value to every shard.
    pub fn with_limits_seeded(
        space: &TargetSpace,
        shard_idx: u64,
        num_shards: u64,
        max_targets: Option<u64>,
        max_packets: Option<u64>,
        e0: u64,
    ) -> Self {
        let n = space.size();
        let iter = CyclicIterator::for_shard_seeded(n, shard_idx, num_shards, e0);
        // Display-only estimate: ceil(n / num_shards) or floor, depending on
        // whether shard_idx falls in the remainder band. The iterator's own
        // raw-position budget (not this) is what actually decides when the
        // track is done, since holes distribute unevenly across shards.
        let estimated_targets = n / num_shards + if shard_idx < n % num_shards { 1 } else { 0 };
        Self {
            shard_idx,
            num_shards,
            iter,
            estimated_targets,
            emitted: 0,
            targets_scanned: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_failed: AtomicU64::new(0),
            first_scanned_us: AtomicU64::new(0),
            last_scanned_us: AtomicU64::new(0),
            max_targets,
            max_packets,
        }
    }

    pub fn shard_idx(&self) -> u64 {
        self.shard_idx
    }

    pub fn num_shards(&self) -> u64 {
        self.num_shards
    }

    /// Estimated valid-target count for this track, for progress display
    /// only — see the field doc on `estimated_targets`.
    pub fn track_len(&self) -> u64 {
        self.estimated_targets
    }

    /// Number of targets sent so far in this shard. Sampling read only.
    pub fn sent(&self) -> u64 {
        self.targets_scanned.load(Relaxed)
    }

    pub fn targets_scanned(&self) -> u64 {
        self.targets_scanned.load(Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Relaxed)
    }

    pub fn packets_failed(&self) -> u64 {
        self.packets_failed.load(Relaxed)
    }

    pub fn first_scanned_epoch_us(&self) -> Option<u64> {
        match self.first_scanned_us.load(Relaxed) {
            0 => None,
            us => Some(us),
        }
    }

    pub fn last_scanned_epoch_us(&self) -> Option<u64> {
        match self.last_scanned_us.load(Relaxed) {
            0 => None,
            us => Some(us),
        }
    }

    /// Whether a configured ceiling has been reached, independent of
    /// whether the iterator track itself is exhausted.
    fn limit_reached(&self) -> bool {
        if let Some(max) = self.max_targets {
            if self.targets_scanned.load(Relaxed) >= max {
                return true;
            }
        }
        if let Some(max) = self.max_packets {
            if self.packets_sent.load(Relaxed) >= max {
                return true;
            }
        }
        false
    }

    /// Decode the iterator's current index through `space`'s oracle into an
    /// addressable target and advance, reporting whether the shard still
    /// has targets left. `oracle` is threaded explicitly (rather than
    /// stored) so callers can share one oracle across shards without an
    /// `Arc` cycle in this type.
    pub fn next_target(&mut self, space: &TargetSpace, oracle: &dyn BlocklistOracle) -> (ShardStatus, Option<SocketAddr>) {
        if self.limit_reached() {
            return (ShardStatus::Complete, None);
        }
        let Some(idx) = self.iter.current() else {
            return (ShardStatus::Complete, None);
        };
        self.emitted += 1;
        let target = space.decode(idx, oracle);
        self.iter.advance(1);
        (ShardStatus::Target, target)
    }

    /// Record that a packet was submitted for the current target (§4.3
    /// `mark_sent`); `ok` is false if the transport ultimately failed to
    /// transmit it (§7 "Transient send failure").
    pub fn mark_sent(&self, ok: bool) {
        self.packets_sent.fetch_add(1, Relaxed);
        if !ok {
            self.packets_failed.fetch_add(1, Relaxed);
        }
    }

    /// Record that the current target has been fully handled — all
    /// `packet_streams` probes issued for it (§4.3 `mark_scanned`).
    pub fn mark_scanned(&self) {
        self.targets_scanned.fetch_add(1, Relaxed);
        let now = now_epoch_us();
        self.first_scanned_us.compare_exchange(0, now, Relaxed, Relaxed).ok();
        self.last_scanned_us.store(now, Relaxed);
    }

    /// Fraction of this shard's track consumed, in `[0.0, 1.0]`. Based on
    /// the display-only estimate, so it can slightly overshoot 1.0 if this
    /// track's actual valid-target count exceeds the even-split estimate;
    /// clamped so progress bars don't visibly misbehave.
    pub fn progress(&self) -> f64 {
        if self.estimated_targets == 0 {
            return 1.0;
        }
        (self.emitted as f64 / self.estimated_targets as f64).min(1.0)
    }

    /// True once `next_target` would return `Complete`, without consuming
    /// anything — used by the sender loop's outer stop check.
    pub fn is_done(&self) -> bool {
        self.iter.current().is_none() || self.limit_reached()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::RangeSetOracle;

    fn space(n: u64) -> TargetSpace {
        TargetSpace::new_single_port(RangeSetOracle::from_ranges(vec![crate::oracle::AddrRange {
            start: 0,
            end: n as u32,
        }]), 80)
    }

    #[test]
    fn shard_terminates_and_tracks_scanned_count() {
        let space = space(1000);
        let mut shard = Shard::new(&space, 0, 4);
        let mut count = 0;
        loop {
            let (status, target) = shard.next_target(&space, space.oracle());
            match status {
                ShardStatus::Target => {
                    assert!(target.is_some());
                    count += 1;
                    shard.mark_sent(true);
                    shard.mark_scanned();
                }
                ShardStatus::Complete => break,
            }
            assert!(count <= 1000, "shard did not terminate");
        }
        // The estimate is a display-only even split; holes distribute
        // unevenly across shards so the true count need not match it
        // exactly, but it should be in the same ballpark.
        let estimate = shard.track_len() as i64;
        assert!((count as i64 - estimate).abs() <= estimate.max(8), "count {} far from estimate {}", count, estimate);
        assert_eq!(shard.targets_scanned(), count);
    }

    #[test]
    fn all_shards_jointly_cover_space_without_overlap() {
        let n = 2000u64;
        let space = space(n);
        let num_shards = 3;
        let mut seen = std::collections::HashSet::new();
        for s in 0..num_shards {
            let mut shard = Shard::new(&space, s, num_shards);
            loop {
                let (status, target) = shard.next_target(&space, space.oracle());
                match (status, target) {
                    (ShardStatus::Target, Some(addr)) => {
                        assert!(seen.insert(addr), "target {} produced by more than one shard", addr);
                    }
                    (ShardStatus::Target, None) => {}
                    (ShardStatus::Complete, _) => break,
                }
            }
        }
        assert_eq!(seen.len() as u64, n);
    }

    #[test]
    fn max_targets_stops_shard_early() {
        let space = space(1000);
        let mut shard = Shard::with_limits(&space, 0, 1, Some(10), None);
        let mut count = 0;
        loop {
            let (status, _) = shard.next_target(&space, space.oracle());
            match status {
                ShardStatus::Target => {
                    shard.mark_sent(true);
                    shard.mark_scanned();
                    count += 1;
                }
                ShardStatus::Complete => break,
            }
            assert!(count <= 20, "max_targets did not stop the shard");
        }
        assert_eq!(count, 10);
    }

    #[test]
    fn max_packets_stops_shard_early() {
        let space = space(1000);
        let mut shard = Shard::with_limits(&space, 0, 1, None, Some(5));
        let mut packets = 0;
        loop {
            let (status, _) = shard.next_target(&space, space.oracle());
            match status {
                ShardStatus::Target => {
                    // 2 probes per target.
                    shard.mark_sent(true);
                    shard.mark_sent(true);
                    shard.mark_scanned();
                    packets += 2;
                }
                ShardStatus::Complete => break,
            }
            assert!(packets <= 20, "max_packets did not stop the shard");
        }
        assert!(shard.packets_sent() >= 5);
    }

    #[test]
    fn mark_sent_tracks_failures() {
        let space = space(10);
        let shard = Shard::new(&space, 0, 1);
        shard.mark_sent(true);
        shard.mark_sent(false);
        shard.mark_sent(false);
        assert_eq!(shard.packets_sent(), 3);
        assert_eq!(shard.packets_failed(), 2);
    }

    #[test]
    fn first_and_last_scanned_bracket_activity() {
        let space = space(10);
        let shard = Shard::new(&space, 0, 1);
        assert!(shard.first_scanned_epoch_us().is_none());
        shard.mark_scanned();
        let first = shard.first_scanned_epoch_us().unwrap();
        shard.mark_scanned();
        let last = shard.last_scanned_epoch_us().unwrap();
        assert!(last >= first);
    }
}
