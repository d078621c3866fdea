//! Cyclic multiplicative-group iterator over `[0, N)`.
//!
//! `CyclicIterator` walks the cycle generated by `g` in `(Z/pZ)*`, filtering
//! out elements above `N`, so every index in `[0, N)` is visited exactly
//! once per period with no per-target storage — the only state is the
//! current group element.
//!
//! Sharding splits the single length-`(p-1)` cycle into `D` round-robin
//! tracks: conceptually, number the cycle's raw positions `0..p-1` (one raw
//! position per exponent, whether or not its value is a hole) and give
//! track `s` every raw position `k` with `k mod D == s`. A track's length
//! is therefore `ceil((p-1-s)/D)` raw positions — fixed and computable up
//! front from `s`, `D`, and `p` alone, independent of where the holes fall.
//!
//! This is *not* the same thing as repeatedly multiplying by `g^D` until the
//! value returns to its own start: when `gcd(D, p-1) > 1`, that walk cycles
//! back early, after only `(p-1)/gcd(D, p-1)` multiplications, and two
//! different tracks whose starting exponents share a residue mod
//! `gcd(D, p-1)` land on the exact same set of raw positions — aliasing two
//! "shards" onto identical target sets while some other residue's positions
//! go completely unvisited by anyone. The raw-position budget below is what
//! actually partitions `0..p-1` disjointly into `D` parts regardless of
//! `gcd(D, p-1)`; each track still *advances* by multiplying by `g^D` per
//! raw step (that part is unaffected by the aliasing issue — it's only the
//! termination condition that must not be "until I'm back where I started").

use crate::numtheory::{derive_group_params, mulmod, powmod};

/// Walks `[0, N)` in a pseudo-random, storage-free permutation.
///
/// Construct the unsharded form with [`CyclicIterator::new`], or a single
/// shard's track with [`CyclicIterator::for_shard`] (see `shard.rs`, which
/// owns one of these per sender thread).
#[derive(Debug, Clone)]
pub struct CyclicIterator {
    n: u64,
    p: u64,
    /// Per-step multiplier: `g` for the unsharded case, `g^D` for a shard
    /// of `D` tracks.
    step: u64,
    /// Current group element in `[1, p-1]`. Meaningless once exhausted.
    x: u64,
    /// Raw positions (holes included) left to visit in this track,
    /// counting the one `x` currently holds. Zero means exhausted.
    remaining_raw: u64,
}

impl CyclicIterator {
    /// Build an iterator over the full `[0, n)` space, single track.
    pub fn new(n: u64) -> Self {
        Self::for_shard(n, 0, 1)
    }

    /// Build the `shard_idx`-th of `num_shards` disjoint tracks over
    /// `[0, n)`. `shard_idx` must be `< num_shards`. Starts from a fixed
    /// exponent offset (e0=0) — deterministic, suitable for tests and for
    /// the unsharded convenience constructors above.
    pub fn for_shard(n: u64, shard_idx: u64, num_shards: u64) -> Self {
        Self::for_shard_seeded(n, shard_idx, num_shards, 0)
    }

    /// Same as [`for_shard`](Self::for_shard) but starting from exponent
    /// `e0 + shard_idx + 1` instead of a fixed offset (§3 "random starting
    /// exponent `e₀`"). `e0` must be identical across every shard of one
    /// scan — it only randomizes *where* the shared cycle begins, not the
    /// partitioning into tracks — so the orchestrator generates it once per
    /// scan and passes it to every `Shard`.
    pub fn for_shard_seeded(n: u64, shard_idx: u64, num_shards: u64, e0: u64) -> Self {
        assert!(n >= 1, "iterator requires a non-empty target space");
        assert!(num_shards >= 1, "num_shards must be at least 1");
        assert!(shard_idx < num_shards, "shard_idx must be < num_shards");
        let (p, g) = derive_group_params(n);
        let phi = p - 1;
        let step = powmod(g, num_shards, p);
        // Shard s starts at exponent (e0+s+1), i.e. g^(e0+s+1) mod p:
        // exponent 0 (x=1) is reserved as the canonical start of track 0
        // after its first step, matching the unsharded sequence's start.
        let start_exp = (e0 % phi) + shard_idx + 1;
        let x = powmod(g, start_exp, p);
        // Number of raw positions (k = shard_idx, shard_idx+D, ...) that
        // fall within one pass of the single length-phi cycle. This is the
        // track's true, alias-free length; see the module doc comment.
        let remaining_raw = if shard_idx >= phi { 0 } else { (phi - shard_idx).div_ceil(num_shards) };
        let mut iter = Self { n, p, step, x, remaining_raw };
        iter.skip_holes();
        iter
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    /// The index (`[0, n)`) the iterator currently points at, or `None` if
    /// this track's raw-position budget is exhausted.
    pub fn current(&self) -> Option<u64> {
        if self.remaining_raw == 0 {
            None
        } else {
            Some(self.x - 1)
        }
    }

    /// Consume raw positions (multiplying `x` by `step` each time) until
    /// `x` lands on a valid, in-range value, or the budget runs out first.
    /// Each raw position — hole or not — spends exactly one unit of
    /// `remaining_raw`, since every one of them is a position this track
    /// legitimately owns.
    fn skip_holes(&mut self) {
        while self.remaining_raw > 0 && (self.x == 0 || self.x > self.n) {
            self.remaining_raw -= 1;
            if self.remaining_raw == 0 {
                return;
            }
            self.x = mulmod(self.x, self.step, self.p);
        }
    }

    /// Advance past the current raw position to the next one this track
    /// owns, skipping holes along the way.
    fn step_once(&mut self) {
        if self.remaining_raw == 0 {
            return;
        }
        self.remaining_raw -= 1;
        if self.remaining_raw == 0 {
            return;
        }
        self.x = mulmod(self.x, self.step, self.p);
        self.skip_holes();
    }

    /// Advance by `count` logical indices, returning the new current index
    /// (`None` once exhausted).
    pub fn advance(&mut self, count: u64) -> Option<u64> {
        for _ in 0..count {
            self.step_once();
        }
        self.current()
    }
}

impl Iterator for CyclicIterator {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let current = self.current()?;
        self.step_once();
        Some(current)
    }
}
