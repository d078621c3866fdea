//! Monitor thread (§4.7): periodic progress sampling plus the scan's
//! completion/cooldown state machine.
//!
//! The monitor is the only thread that decides when a scan is "done" — it
//! watches per-shard completion flags the orchestrator hands it, opens a
//! cooldown window once every shard is done, and flips
//! `RuntimeKnobs::receiver_complete` when that window closes. Senders only
//! know about their own shard; the receiver only knows about
//! `receiver_complete`. This keeps that decision in one place.

use crate::config::RuntimeKnobs;
use crate::stats::{ScanStats, ScanStatsSnapshot};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared count of sender threads that have finished their shard,
/// incremented by each sender's completion callback (§4.3 "Completion
/// callback") and read by the monitor every tick.
pub struct CompletionTracker {
    total_senders: usize,
    done: AtomicUsize,
    /// Epoch-ish monotonic instant (as nanos since an arbitrary origin) of
    /// the most recent sender completion, used to anchor the cooldown
    /// window. 0 until the first completion.
    last_done_at_ns: AtomicU64,
    origin: Instant,
}

impl CompletionTracker {
    pub fn new(total_senders: usize) -> Arc<Self> {
        Arc::new(Self {
            total_senders,
            done: AtomicUsize::new(0),
            last_done_at_ns: AtomicU64::new(0),
            origin: Instant::now(),
        })
    }

    /// Invoked once per sender thread, exactly when it returns from
    /// `run_sender` (§4.3's per-shard completion callback, generalized
    /// to scan-wide tracking rather than a per-thread `(thread_id, arg)`
    /// callback — the monitor doesn't need to distinguish which thread
    /// finished, only how many have).
    pub fn mark_sender_done(&self) {
        self.done.fetch_add(1, Relaxed);
        let now_ns = self.origin.elapsed().as_nanos() as u64;
        self.last_done_at_ns.store(now_ns, Relaxed);
    }

    pub fn senders_done(&self) -> usize {
        self.done.load(Relaxed)
    }

    pub fn all_senders_done(&self) -> bool {
        self.done.load(Relaxed) >= self.total_senders
    }

    /// `None` until the first sender finishes.
    fn last_done_elapsed(&self) -> Option<Duration> {
        let ns = self.last_done_at_ns.load(Relaxed);
        if ns == 0 {
            return None;
        }
        let now_ns = self.origin.elapsed().as_nanos() as u64;
        Some(Duration::from_nanos(now_ns.saturating_sub(ns)))
    }
}

/// One aggregate stats sample plus whatever completion-state transition
/// happened this tick, handed to the bin crate's dashboard renderer.
#[derive(Debug, Clone)]
pub struct MonitorTick {
    pub stats: ScanStatsSnapshot,
    pub senders_done: usize,
    pub senders_total: usize,
    pub cooldown_open: bool,
    pub complete: bool,
}

/// Run the monitor loop until the cooldown window closes, sampling at
/// `tick_interval` (§4.7 "≈ 1 Hz") and invoking `on_tick` with each sample.
/// Sets `knobs.receiver_complete()` exactly once, after which the receiver
/// breaks out and the orchestrator joins every thread.
///
/// `max_runtime`, if set, requests an early stop of the senders (via
/// `knobs.request_stop()`) once elapsed, independent of whether every
/// shard would otherwise still have work — the receiver still honors the
/// cooldown afterwards (§4.7 "Max-runtime").
pub fn run_monitor(
    completion: &CompletionTracker,
    knobs: &RuntimeKnobs,
    stats: &ScanStats,
    cooldown: Duration,
    max_runtime: Option<Duration>,
    tick_interval: Duration,
    mut on_tick: impl FnMut(MonitorTick),
) {
    let mut cooldown_deadline: Option<Instant> = None;
    let mut runtime_stop_sent = false;

    loop {
        std::thread::sleep(tick_interval);

        if let Some(max_runtime) = max_runtime {
            if !runtime_stop_sent && stats.elapsed() >= max_runtime {
                knobs.request_stop();
                runtime_stop_sent = true;
            }
        }

        if cooldown_deadline.is_none() && completion.all_senders_done() {
            // Anchor the deadline to the last sender's actual finish time
            // rather than "now", so a slow monitor tick doesn't silently
            // extend the cooldown window.
            let since_last = completion.last_done_elapsed().unwrap_or(Duration::ZERO);
            cooldown_deadline = Some(Instant::now() - since_last + cooldown);
            knobs.mark_cooldown_open();
        }

        let cooldown_open = cooldown_deadline.is_some();
        let complete = cooldown_deadline.is_some_and(|d| Instant::now() >= d);

        on_tick(MonitorTick {
            stats: stats.snapshot(),
            senders_done: completion.senders_done(),
            senders_total: completion.total_senders,
            cooldown_open,
            complete,
        });

        if complete {
            knobs.mark_receiver_complete();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_tracker_reaches_all_done_only_after_every_sender() {
        let tracker = CompletionTracker::new(3);
        assert!(!tracker.all_senders_done());
        tracker.mark_sender_done();
        tracker.mark_sender_done();
        assert!(!tracker.all_senders_done());
        tracker.mark_sender_done();
        assert!(tracker.all_senders_done());
        assert_eq!(tracker.senders_done(), 3);
    }

    #[test]
    fn monitor_marks_receiver_complete_only_after_cooldown_elapses() {
        let completion = CompletionTracker::new(1);
        completion.mark_sender_done();
        let knobs = RuntimeKnobs::new();
        let stats = ScanStats::new();
        let mut ticks = Vec::new();

        run_monitor(
            &completion,
            &knobs,
            &stats,
            Duration::from_millis(30),
            None,
            Duration::from_millis(10),
            |tick| ticks.push(tick),
        );

        assert!(knobs.receiver_complete());
        assert!(knobs.cooldown_open());
        assert!(ticks.len() >= 2, "expected at least one cooldown-open tick before completion");
        assert!(ticks.iter().rev().skip(1).all(|t| t.cooldown_open));
        assert!(!ticks.first().unwrap().complete || ticks.len() == 1);
        assert!(ticks.last().unwrap().complete);
    }

    #[test]
    fn completion_tracker_with_unfinished_senders_never_reports_done() {
        let completion = CompletionTracker::new(2);
        completion.mark_sender_done(); // only one of two
        assert!(!completion.all_senders_done());
    }

    #[test]
    fn max_runtime_requests_stop_once_elapsed() {
        // Senders finish immediately so the cooldown (also near-zero)
        // closes on the same tick max_runtime elapses, keeping the test fast
        // while still exercising both signals together.
        let completion = CompletionTracker::new(1);
        completion.mark_sender_done();
        let knobs = RuntimeKnobs::new();
        let stats = ScanStats::new();
        let mut ticks = Vec::new();

        run_monitor(&completion, &knobs, &stats, Duration::from_millis(1), Some(Duration::from_nanos(1)), Duration::from_millis(5), |tick| {
            ticks.push(tick);
        });

        assert!(knobs.should_stop(), "max_runtime should have requested a stop");
        assert!(knobs.receiver_complete());
    }
}
