//! Lifecycle orchestrator (§2 "Lifecycle Orchestrator", §4.4-§4.7): wires
//! shards to sender threads, starts the single receiver and monitor
//! threads, and enforces the start/stop/cooldown protocol described
//! throughout §4.
//!
//! `xscan-core` never spawns a thread for its own sake elsewhere — this is
//! the one place `std::thread` appears outside test code. Everything here
//! is scoped (`std::thread::scope`) rather than `'static`-bounded, so the
//! bin crate can hand the orchestrator borrowed configuration, an owned
//! but non-`'static` probe module, etc. without extra `Arc` wrapping, and
//! every thread is guaranteed joined before `run_scan` returns.

use crate::config::{RuntimeKnobs, ScanConfig};
use crate::monitor::{run_monitor, CompletionTracker, MonitorTick};
use crate::prf::PrfKey;
use crate::probe::ProbeModule;
use crate::rate::RateController;
use crate::receiver::{run_receiver, ReceiverContext};
use crate::record::OutputSink;
use crate::sender::run_sender;
use crate::shard::Shard;
use crate::stats::{ScanStats, ScanStatsSnapshot};
use crate::target_space::TargetSpace;
use crate::transport::{CaptureSink, NullCaptureSink, Transport};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Everything the orchestrator needs beyond `ScanConfig`/`ScanStats`/
/// `RuntimeKnobs` to actually run a scan: the things the bin crate
/// supplies per §1's "external collaborators" split (raw transports,
/// optional capture sinks, output encoder) plus the already-validated
/// target space and probe module.
pub struct ScanInputs<'a> {
    pub config: &'a ScanConfig,
    pub space: &'a TargetSpace,
    pub probe: &'a dyn ProbeModule,
    pub prf_key: &'a PrfKey,
    /// Random starting exponent `e0` for the cyclic iterator (§3). The
    /// caller generates this once per scan (e.g. from the same CSPRNG
    /// used for `prf_key`) so every shard agrees on where the shared
    /// cycle begins.
    pub iterator_seed: u64,
    pub rate: Arc<RateController>,
    /// One transport per sender thread, `config.senders` long — each
    /// sender thread owns its transport exclusively for its lifetime
    /// (§5 "Ownership").
    pub sender_transports: Vec<Box<dyn Transport>>,
    pub receiver_transport: Box<dyn Transport>,
    /// Optional per-sender capture sinks, same length as
    /// `sender_transports`, or empty to disable send-side capture
    /// entirely (every sender then gets a `NullCaptureSink`).
    pub sender_captures: Vec<Box<dyn CaptureSink>>,
    pub receiver_capture: Box<dyn CaptureSink>,
    pub output_sink: Box<dyn OutputSink>,
    /// How long the receiver blocks per `capture_next` poll before
    /// re-checking `receiver_complete` (§5 "poll-deadline").
    pub poll_timeout_ms: u64,
    /// Monitor sampling cadence (§4.7 "≈ 1 Hz"); exposed so tests don't
    /// have to wait a full second per tick.
    pub tick_interval: Duration,
    /// Caller-owned stop request, e.g. a SIGINT/SIGTERM handler's flag
    /// (§6 "SIGINT/TERM — orderly shutdown through the monitor"). Polled
    /// alongside `max_runtime` and folded into the same
    /// `RuntimeKnobs::request_stop` path, so an external signal gets the
    /// same cooldown-then-join treatment as every other stop trigger.
    pub external_stop: Option<Arc<AtomicBool>>,
}

/// Run one full scan to completion: spawn `config.senders` sender
/// threads and one monitor thread, run the receiver loop on the calling
/// thread, and return once the cooldown window has closed and every
/// thread has joined (§4.7).
///
/// `on_tick` is invoked once per monitor tick with an aggregate stats
/// snapshot — the bin crate's dashboard renderer hangs off this.
pub fn run_scan(inputs: ScanInputs, mut on_tick: impl FnMut(MonitorTick) + Send) -> anyhow::Result<ScanStatsSnapshot> {
    let ScanInputs {
        config,
        space,
        probe,
        prf_key,
        iterator_seed,
        rate,
        mut sender_transports,
        mut receiver_transport,
        mut sender_captures,
        mut receiver_capture,
        mut output_sink,
        poll_timeout_ms,
        tick_interval,
        external_stop,
    } = inputs;

    anyhow::ensure!(
        sender_transports.len() as u64 == config.senders,
        "lifecycle error: expected {} sender transports, got {}",
        config.senders,
        sender_transports.len()
    );
    if !sender_captures.is_empty() {
        anyhow::ensure!(
            sender_captures.len() as u64 == config.senders,
            "lifecycle error: expected {} sender capture sinks (or zero to disable), got {}",
            config.senders,
            sender_captures.len()
        );
    }
    while (sender_captures.len() as u64) < config.senders {
        sender_captures.push(Box::new(NullCaptureSink));
    }

    let stats = ScanStats::new();
    let knobs = RuntimeKnobs::new();
    let seen = crate::oracle::SeenSet::new(space.size());
    let completion = CompletionTracker::new(config.senders as usize);

    // Global iterator shard count: S sender threads per machine times T
    // total machine-level shards (§3 "Shard": stride `D = S*T`).
    let num_shards_global = config.senders * config.total_shards;

    let mut shards: Vec<Shard> = (0..config.senders)
        .map(|thread_id| {
            let shard_offset = thread_id + config.senders * config.shard_num;
            Shard::with_limits_seeded(
                space,
                shard_offset,
                num_shards_global,
                config.max_targets,
                config.max_packets,
                iterator_seed,
            )
        })
        .collect();

    let receiver_ctx = ReceiverContext {
        config,
        probe,
        prf_key,
        space,
        seen: &seen,
        stats: &stats,
        knobs: &knobs,
    };

    std::thread::scope(|s| {
        for ((shard, transport), capture) in shards.iter_mut().zip(sender_transports.iter_mut()).zip(sender_captures.iter_mut()) {
            let config = &config;
            let knobs = &knobs;
            let stats = &stats;
            let prf_key = &prf_key;
            let probe = &probe;
            let rate = &rate;
            let completion = &completion;
            s.spawn(move || {
                run_sender(shard, space, config, knobs, stats, prf_key, *probe, rate, transport.as_mut(), capture.as_mut());
                completion.mark_sender_done();
            });
        }

        s.spawn(|| {
            run_monitor(&completion, &knobs, &stats, config.cooldown, config.max_runtime, tick_interval, |tick| on_tick(tick));
        });

        if let Some(flag) = &external_stop {
            let knobs = &knobs;
            s.spawn(move || {
                while !knobs.should_stop() && !knobs.receiver_complete() {
                    if flag.load(Relaxed) {
                        knobs.request_stop();
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            });
        }

        run_receiver(&receiver_ctx, &knobs, receiver_transport.as_mut(), receiver_capture.as_mut(), output_sink.as_mut(), poll_timeout_ms)
    })?;

    Ok(stats.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{AddrRange, RangeSetOracle};
    use crate::probe::tcp_syn::TcpSynModule;
    use crate::record::VecOutputSink;
    use crate::transport::{DryRunTransport, NullCaptureSink};

    fn test_config(senders: u64, cooldown_ms: u64) -> ScanConfig {
        ScanConfig {
            senders,
            shard_num: 0,
            total_shards: 1,
            packet_streams: 1,
            max_targets: None,
            max_packets: None,
            max_runtime: None,
            cooldown: Duration::from_millis(cooldown_ms),
            retries: 1,
            batch_size: 8,
            probe_module: "tcp_syn".into(),
            source_ips: vec!["10.0.0.1".parse().unwrap()],
            source_port_first: 40000,
            source_port_last: 40100,
            target_ports: vec![443],
            interface: "eth0".into(),
            gateway_mac: [0xaa; 6],
            source_mac: [0xbb; 6],
            probe_ttl: 64,
            dryrun: true,
            validate_source_port_override: None,
        }
    }

    #[test]
    fn full_scan_completes_and_drives_every_target_through_the_sink() {
        let config = test_config(2, 20);
        let space = TargetSpace::new_single_port(RangeSetOracle::from_ranges(vec![AddrRange { start: 0, end: 50 }]), 443);
        let probe = TcpSynModule::default();
        let key = PrfKey::from_bytes([11; 16]);
        let rate = RateController::new(50_000, config.senders * config.packet_streams);

        let sender_transports: Vec<Box<dyn Transport>> = (0..config.senders).map(|_| Box::new(DryRunTransport::new()) as Box<dyn Transport>).collect();
        let receiver_transport: Box<dyn Transport> = Box::new(DryRunTransport::new());
        let mut ticks = Vec::new();

        let inputs = ScanInputs {
            config: &config,
            space: &space,
            probe: &probe,
            prf_key: &key,
            iterator_seed: 0,
            rate,
            sender_transports,
            receiver_transport,
            sender_captures: Vec::new(),
            receiver_capture: Box::new(NullCaptureSink),
            output_sink: Box::new(VecOutputSink::default()),
            poll_timeout_ms: 1,
            tick_interval: Duration::from_millis(5),
            external_stop: None,
        };

        let snapshot = run_scan(inputs, |tick| ticks.push(tick)).expect("scan should complete cleanly");

        assert_eq!(snapshot.packets_sent, 50);
        assert!(!ticks.is_empty(), "monitor should have produced at least one tick");
        assert!(ticks.last().unwrap().complete);
    }

    #[test]
    fn mismatched_transport_count_is_rejected_before_any_thread_starts() {
        let config = test_config(3, 10);
        let space = TargetSpace::new_single_port(RangeSetOracle::from_ranges(vec![AddrRange { start: 0, end: 10 }]), 443);
        let probe = TcpSynModule::default();
        let key = PrfKey::from_bytes([1; 16]);
        let rate = RateController::new(1000, config.senders);

        let sender_transports: Vec<Box<dyn Transport>> = vec![Box::new(DryRunTransport::new())];
        let receiver_transport: Box<dyn Transport> = Box::new(DryRunTransport::new());

        let inputs = ScanInputs {
            config: &config,
            space: &space,
            probe: &probe,
            prf_key: &key,
            iterator_seed: 0,
            rate,
            sender_transports,
            receiver_transport,
            sender_captures: Vec::new(),
            receiver_capture: Box::new(NullCaptureSink),
            output_sink: Box::new(VecOutputSink::default()),
            poll_timeout_ms: 1,
            tick_interval: Duration::from_millis(5),
            external_stop: None,
        };

        let err = run_scan(inputs, |_| {}).unwrap_err();
        assert!(err.to_string().contains("expected 3 sender transports"));
    }

    #[test]
    fn external_stop_flag_cuts_the_scan_short() {
        let config = test_config(1, 10);
        // A much larger space than a handful of fast dry-run sends could
        // exhaust in this test's lifetime, so completion only happens via
        // the external stop flag, not the iterator running dry.
        let space = TargetSpace::new_single_port(RangeSetOracle::from_ranges(vec![AddrRange { start: 0, end: 1_000_000 }]), 443);
        let probe = TcpSynModule::default();
        let key = PrfKey::from_bytes([7; 16]);
        let rate = RateController::new(50, config.senders);
        let stop_flag = Arc::new(AtomicBool::new(true));

        let sender_transports: Vec<Box<dyn Transport>> = vec![Box::new(DryRunTransport::new())];
        let receiver_transport: Box<dyn Transport> = Box::new(DryRunTransport::new());

        let inputs = ScanInputs {
            config: &config,
            space: &space,
            probe: &probe,
            prf_key: &key,
            iterator_seed: 0,
            rate,
            sender_transports,
            receiver_transport,
            sender_captures: Vec::new(),
            receiver_capture: Box::new(NullCaptureSink),
            output_sink: Box::new(VecOutputSink::default()),
            poll_timeout_ms: 1,
            tick_interval: Duration::from_millis(5),
            external_stop: Some(stop_flag),
        };

        let snapshot = run_scan(inputs, |_| {}).expect("scan should stop cleanly via the external flag");
        assert!(snapshot.packets_sent < 1_000_000, "scan should have stopped well short of exhausting its track");
    }
}
