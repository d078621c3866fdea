//! Rate controller: paces sender threads to a target aggregate packets/sec
//! or bits/sec (§4.4).
//!
//! Each sender thread owns one [`Pacer`]; there is no shared token bucket
//! (§5 "Rate discipline") — every pacer converges independently on its
//! even share `r = R / (S · packet_streams)` of the global target `R`, so
//! the aggregate observed rate converges to `R` even though no two threads
//! coordinate directly.
//!
//! Below `SLOW_THRESHOLD` pps per thread, `nanosleep`-based delay is precise
//! enough; above it the OS scheduler's wakeup jitter would overshoot, so the
//! pacer switches to a counted busy-wait instead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-thread target rate below which sleep-mode pacing is accurate enough.
const SLOW_THRESHOLD_PPS: f64 = 1000.0;

/// Process-wide rate state, shared by every sender thread via `Arc`.
/// `target_pps` is mutable at runtime: SIGUSR1/SIGUSR2 nudge it by ±5%
/// (§6), converging controllers on their next measurement cycle.
pub struct RateController {
    target_pps: AtomicU64,
    per_thread_denominator: u64,
    paused: AtomicBool,
}

impl RateController {
    /// `per_thread_denominator` is `S · packet_streams` from §4.4's
    /// `r = R / (S · packet_streams)`.
    pub fn new(target_pps: u64, per_thread_denominator: u64) -> Arc<Self> {
        assert!(target_pps > 0, "target rate must be positive");
        assert!(per_thread_denominator > 0, "denominator must be positive");
        Arc::new(Self {
            target_pps: AtomicU64::new(target_pps),
            per_thread_denominator,
            paused: AtomicBool::new(false),
        })
    }

    /// Each sender thread's even share of the aggregate target, in pps.
    fn per_thread_target(&self) -> f64 {
        self.target_pps.load(Relaxed) as f64 / self.per_thread_denominator as f64
    }

    /// Bump the aggregate target rate by `pct` (e.g. `0.05` for +5%,
    /// `-0.05` for -5%), clamped to stay positive. SIGUSR1/SIGUSR2 call
    /// this directly from the signal-handling thread.
    pub fn nudge_percent(&self, pct: f64) {
        let current = self.target_pps.load(Relaxed) as f64;
        let next = (current * (1.0 + pct)).max(1.0).round() as u64;
        self.target_pps.store(next, Relaxed);
    }

    pub fn target_pps(&self) -> u64 {
        self.target_pps.load(Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Relaxed)
    }

    /// Build a fresh per-sender pacer, choosing sleep vs. spin-delay mode
    /// from this controller's current per-thread target.
    pub fn pacer(self: &Arc<Self>) -> Pacer {
        let r = self.per_thread_target();
        let now = Instant::now();
        if r < SLOW_THRESHOLD_PPS {
            Pacer::Sleep(SleepPacer {
                controller: self.clone(),
                sleep_ns: (1_000_000_000.0 / r.max(1.0)) as u64,
                last_tick: now,
            })
        } else {
            Pacer::Spin(SpinPacer {
                controller: self.clone(),
                delay: 1,
                interval: ((r / 20.0).max(1.0)) as u64,
                count_in_interval: 0,
                window_start: now,
            })
        }
    }
}

/// Either pacing strategy, selected once at construction from the
/// per-thread target rate and never switched mid-run (a rate nudge can
/// shift the per-thread target across the threshold, but re-deriving the
/// mode mid-scan would discard convergence state for no benefit — the
/// existing mode keeps converging toward the new target either way).
pub enum Pacer {
    Sleep(SleepPacer),
    Spin(SpinPacer),
}

impl Pacer {
    /// Call once per packet sent, after the send completes.
    pub fn pace(&mut self) {
        match self {
            Pacer::Sleep(p) => p.pace(),
            Pacer::Spin(p) => p.pace(),
        }
    }
}

/// Sleep-mode pacer (§4.4): maintains `sleep_ns` such that after each
/// packet the thread sleeps for `sleep_ns`, updated every packet via
/// `sleep_ns ← sleep_ns · ((last_rate / r) + 1) / 2`.
pub struct SleepPacer {
    controller: Arc<RateController>,
    sleep_ns: u64,
    last_tick: Instant,
}

impl SleepPacer {
    fn pace(&mut self) {
        while self.controller.is_paused() {
            std::thread::sleep(Duration::from_millis(50));
        }
        if self.sleep_ns > 0 {
            std::thread::sleep(Duration::from_nanos(self.sleep_ns));
        }

        let now = Instant::now();
        let dt = now.duration_since(self.last_tick).as_secs_f64().max(1e-9);
        let last_rate = 1.0 / dt;
        let r = self.controller.per_thread_target().max(1e-9);
        let sleep_ns = self.sleep_ns as f64 * ((last_rate / r) + 1.0) / 2.0;
        self.sleep_ns = sleep_ns.max(1.0) as u64;
        self.last_tick = now;
    }

    pub fn sleep_ns(&self) -> u64 {
        self.sleep_ns
    }
}

/// Spin-delay pacer (§4.4): maintains an integer `delay` of busy-wait
/// iterations per packet, recalibrated every `interval = r/20` packets
/// against the observed rate. Clamped to `delay >= 1`.
pub struct SpinPacer {
    controller: Arc<RateController>,
    delay: u64,
    interval: u64,
    count_in_interval: u64,
    window_start: Instant,
}

impl SpinPacer {
    fn pace(&mut self) {
        while self.controller.is_paused() {
            std::thread::sleep(Duration::from_millis(50));
        }
        for _ in 0..self.delay {
            std::hint::spin_loop();
        }

        self.count_in_interval += 1;
        if self.count_in_interval >= self.interval {
            self.recalibrate();
        }
    }

    fn recalibrate(&mut self) {
        let elapsed = self.window_start.elapsed().as_secs_f64().max(1e-9);
        let r_obs = self.count_in_interval as f64 / elapsed;
        let r = self.controller.per_thread_target().max(1e-9);
        let mult = r_obs / r;

        let proposed = ((self.delay as f64) * mult).max(1.0) as u64;
        self.delay = if proposed == self.delay {
            // No change from the multiplicative update: nudge explicitly so
            // the loop doesn't stall at a stale delay.
            if mult > 1.0 {
                (self.delay * 2).max(1)
            } else {
                (self.delay / 2).max(1)
            }
        } else {
            proposed.max(1)
        };

        self.interval = ((r / 20.0).max(1.0)) as u64;
        self.count_in_interval = 0;
        self.window_start = Instant::now();
    }

    pub fn delay(&self) -> u64 {
        self.delay
    }
}

/// Convert a target bandwidth (bits/sec) into packets/sec (§6's
/// `--bandwidth`), given the active probe module's `max_packet_length`.
/// Frame size is the packet floored at the Ethernet minimum of 84 bytes,
/// plus 24 bytes of framing overhead (preamble/SFD/IFG), all in bits.
pub fn bandwidth_to_pps(bits_per_sec: u64, max_packet_length: u64) -> u64 {
    let frame_bits = max_packet_length.max(84) * 8 + 24 * 8;
    bits_per_sec / frame_bits
}
