//! Blocklist/allowlist oracle contract and the seen-set dedup structure.
//!
//! Parsing blocklist/allowlist files is explicitly out of scope for this
//! crate (§1) — that's the bin crate's job. What the core needs is the
//! queryable predicate §6 describes: `allowed(ip)`, `count_allowed()`,
//! `rank(ordinal)`. [`RangeSetOracle`] is a generic, file-format-agnostic
//! implementation over sorted address ranges, suitable both for tests here
//! and for the bin crate to build from whatever blocklist/allowlist files
//! it parses.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// The queryable predicate the iterator consults when decoding a target
/// index into an address. Implementors must be deterministic and
/// `rank`/`allowed`/`count_allowed` must stay mutually consistent for the
/// lifetime of a scan — the core never mutates the oracle mid-scan.
pub trait BlocklistOracle: Send + Sync {
    /// True if `ip` is eligible to be scanned.
    fn allowed(&self, ip: Ipv4Addr) -> bool;
    /// Total number of allowed addresses. Defines `|A|` in §3.
    fn count_allowed(&self) -> u64;
    /// The `ordinal`-th allowed address in canonical (ascending) order,
    /// 0-indexed. Must satisfy `rank(i)` strictly increasing in `i`.
    fn rank(&self, ordinal: u64) -> Ipv4Addr;
    /// Inverse of [`rank`](Self::rank): the ordinal of `ip` if it is
    /// allowed. The receiver needs this to map a captured response back
    /// to the seen-set bit its outgoing probe originally occupied,
    /// without keeping any per-probe state.
    fn ordinal_of(&self, ip: Ipv4Addr) -> Option<u64>;
}

/// A half-open `[start, end)` range of allowed IPv4 addresses, as `u32`
/// host-order values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRange {
    pub start: u32,
    pub end: u32,
}

impl AddrRange {
    pub fn len(&self) -> u64 {
        (self.end - self.start) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// A [`BlocklistOracle`] backed by a sorted, non-overlapping, coalesced list
/// of allowed address ranges. Construct via [`RangeSetOracle::from_ranges`]
/// after computing allow-minus-block set arithmetic (the bin crate's job);
/// this type only needs the final result.
pub struct RangeSetOracle {
    ranges: Vec<AddrRange>,
    /// Cumulative count of addresses strictly before each range, i.e.
    /// `prefix[i]` = number of allowed addresses in ranges `[0, i)`.
    /// Parallel to `ranges`, same length. Enables O(log n) rank lookups.
    prefix: Vec<u64>,
    total: u64,
}

impl RangeSetOracle {
    /// Build from an arbitrary, possibly overlapping/unsorted set of
    /// `[start, end)` ranges. Ranges are sorted, merged where they overlap
    /// or touch, and empty ranges are dropped.
    pub fn from_ranges(mut ranges: Vec<AddrRange>) -> Self {
        ranges.retain(|r| !r.is_empty());
        ranges.sort_by_key(|r| r.start);

        let mut merged: Vec<AddrRange> = Vec::with_capacity(ranges.len());
        for r in ranges {
            if let Some(last) = merged.last_mut() {
                if r.start <= last.end {
                    last.end = last.end.max(r.end);
                    continue;
                }
            }
            merged.push(r);
        }

        let mut prefix = Vec::with_capacity(merged.len());
        let mut total = 0u64;
        for r in &merged {
            prefix.push(total);
            total += r.len();
        }

        Self { ranges: merged, prefix, total }
    }

    /// The universe `0.0.0.0/0` minus nothing — every address is allowed.
    /// Used by tests and by `--target 0.0.0.0/0`-style full-Internet scans.
    pub fn full_ipv4_space() -> Self {
        Self::from_ranges(vec![AddrRange { start: 0, end: u32::MAX }])
    }
}

impl BlocklistOracle for RangeSetOracle {
    fn allowed(&self, ip: Ipv4Addr) -> bool {
        let v = u32::from(ip);
        // Binary search for the range whose start is <= v.
        match self.ranges.binary_search_by_key(&v, |r| r.start) {
            Ok(_) => true,
            Err(0) => false,
            Err(idx) => v < self.ranges[idx - 1].end,
        }
    }

    fn count_allowed(&self) -> u64 {
        self.total
    }

    fn rank(&self, ordinal: u64) -> Ipv4Addr {
        assert!(ordinal < self.total, "rank index out of bounds");
        // Binary search prefix sums for the range containing `ordinal`.
        let idx = match self.prefix.binary_search(&ordinal) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let offset = ordinal - self.prefix[idx];
        Ipv4Addr::from(self.ranges[idx].start + offset as u32)
    }

    fn ordinal_of(&self, ip: Ipv4Addr) -> Option<u64> {
        let v = u32::from(ip);
        let idx = match self.ranges.binary_search_by_key(&v, |r| r.start) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let range = &self.ranges[idx];
        if v >= range.start && v < range.end {
            Some(self.prefix[idx] + (v - range.start) as u64)
        } else {
            None
        }
    }
}

/// At-most-once-per-target dedup for the receiver thread (§3 "Seen-set").
///
/// Written only by the receiver thread; other threads (e.g. the monitor,
/// for a live hit-count) may only read counts via [`SeenSet::count`], which
/// is why the underlying words are atomics even though there is exactly one
/// writer — the same "Relaxed everywhere, these are sampling reads" posture
/// the teacher crate uses for its atomic metrics.
pub struct SeenSet {
    words: Vec<AtomicU64>,
    count: AtomicU64,
}

impl SeenSet {
    /// `bits` must be at least `count_allowed()` — one bit per allowed
    /// address ordinal.
    pub fn new(bits: u64) -> Self {
        let words = (bits / 64 + 1) as usize;
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
        }
    }

    /// Mark `ordinal` as seen. Returns `true` if this is the first time
    /// (the caller should emit `repeat=false`), `false` if already set
    /// (`repeat=true`). Single-writer (the receiver thread) by contract;
    /// the read-modify-write here is not required to be atomic across
    /// concurrent writers, only visible to concurrent *readers*.
    pub fn mark_and_check(&self, ordinal: u64) -> bool {
        let word_idx = (ordinal / 64) as usize;
        let bit = 1u64 << (ordinal % 64);
        let word = &self.words[word_idx];
        let prev = word.load(Relaxed);
        if prev & bit != 0 {
            return false;
        }
        word.store(prev | bit, Relaxed);
        self.count.fetch_add(1, Relaxed);
        true
    }

    pub fn is_set(&self, ordinal: u64) -> bool {
        let word_idx = (ordinal / 64) as usize;
        let bit = 1u64 << (ordinal % 64);
        self.words[word_idx].load(Relaxed) & bit != 0
    }

    /// Number of distinct targets marked seen so far.
    pub fn count(&self) -> u64 {
        self.count.load(Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_oracle_merges_overlaps() {
        let oracle = RangeSetOracle::from_ranges(vec![
            AddrRange { start: 10, end: 20 },
            AddrRange { start: 15, end: 25 },
            AddrRange { start: 100, end: 110 },
        ]);
        assert_eq!(oracle.count_allowed(), 25);
        assert!(oracle.allowed(Ipv4Addr::from(10)));
        assert!(oracle.allowed(Ipv4Addr::from(24)));
        assert!(!oracle.allowed(Ipv4Addr::from(25)));
        assert!(!oracle.allowed(Ipv4Addr::from(50)));
        assert!(oracle.allowed(Ipv4Addr::from(100)));
    }

    #[test]
    fn range_oracle_rank_round_trips() {
        let oracle = RangeSetOracle::from_ranges(vec![
            AddrRange { start: 10, end: 13 },
            AddrRange { start: 50, end: 52 },
        ]);
        assert_eq!(oracle.count_allowed(), 5);
        let addrs: Vec<Ipv4Addr> = (0..5).map(|i| oracle.rank(i)).collect();
        assert_eq!(
            addrs,
            vec![10, 11, 12, 50, 51]
                .into_iter()
                .map(Ipv4Addr::from)
                .collect::<Vec<_>>()
        );
        for a in &addrs {
            assert!(oracle.allowed(*a));
        }
    }

    #[test]
    fn ordinal_of_inverts_rank() {
        let oracle = RangeSetOracle::from_ranges(vec![
            AddrRange { start: 10, end: 13 },
            AddrRange { start: 50, end: 52 },
        ]);
        for i in 0..oracle.count_allowed() {
            let addr = oracle.rank(i);
            assert_eq!(oracle.ordinal_of(addr), Some(i));
        }
        assert_eq!(oracle.ordinal_of(Ipv4Addr::from(9)), None);
        assert_eq!(oracle.ordinal_of(Ipv4Addr::from(13)), None);
        assert_eq!(oracle.ordinal_of(Ipv4Addr::from(51)), Some(4));
    }

    #[test]
    fn seen_set_dedups() {
        let seen = SeenSet::new(128);
        assert!(seen.mark_and_check(5));
        assert!(!seen.mark_and_check(5));
        assert!(seen.mark_and_check(6));
        assert_eq!(seen.count(), 2);
        assert!(seen.is_set(5));
        assert!(!seen.is_set(7));
    }

    #[test]
    fn seen_set_handles_word_boundary() {
        let seen = SeenSet::new(200);
        assert!(seen.mark_and_check(63));
        assert!(seen.mark_and_check(64));
        assert!(!seen.mark_and_check(63));
        assert!(!seen.mark_and_check(64));
        assert_eq!(seen.count(), 2);
    }
}
