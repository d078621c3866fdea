//! Sender thread loop (§4.4): pulls targets from one [`Shard`], builds a
//! probe packet per `(target, packet_stream)` pair, paces transmission
//! through a [`Pacer`], and batches frames before handing them to a
//! [`Transport`].
//!
//! One sender thread owns exactly one `Shard` and one `Transport` for its
//! whole lifetime — there is no cross-thread queue on the send side, which
//! is what lets each thread's [`RateController::pacer`] converge
//! independently on its even share of the aggregate target rate.

use crate::config::{RuntimeKnobs, ScanConfig};
use crate::oracle::BlocklistOracle;
use crate::prf::{prf_v4, PrfKey};
use crate::probe::{MakePacketArgs, ProbeModule};
use crate::rate::RateController;
use crate::shard::{Shard, ShardStatus};
use crate::stats::ScanStats;
use crate::target_space::TargetSpace;
use crate::transport::{CaptureSink, OutgoingFrame, Transport};
use std::net::IpAddr;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

/// Drive one shard to completion (or until `knobs.should_stop()`), sending
/// `config.packet_streams` probes per target through `transport`.
///
/// Returns once the shard reports [`ShardStatus::Complete`] or a stop is
/// requested; any partially filled batch is flushed before returning so no
/// queued frame is silently dropped.
#[allow(clippy::too_many_arguments)]
pub fn run_sender(
    shard: &mut Shard,
    space: &TargetSpace,
    config: &ScanConfig,
    knobs: &RuntimeKnobs,
    stats: &ScanStats,
    prf_key: &PrfKey,
    probe: &dyn ProbeModule,
    rate: &Arc<RateController>,
    transport: &mut dyn Transport,
    capture: &mut dyn CaptureSink,
) {
    let mut thread_state = probe.thread_init();
    let mut pacer = rate.pacer();
    let mut batch: Vec<OutgoingFrame> = Vec::with_capacity(config.batch_size);

    'targets: loop {
        if knobs.should_stop() {
            break;
        }

        let (status, target) = shard.next_target(space, space.oracle());
        if status == ShardStatus::Complete {
            break;
        }
        let Some(target) = target else {
            // Decoded index fell outside the oracle's allowed set (can
            // happen transiently if `count_allowed` and the iterator's `N`
            // disagree at the tail); count it and move on.
            stats.targets_blocklisted.fetch_add(1, Relaxed);
            continue;
        };
        let IpAddr::V4(daddr) = target.ip() else {
            // IPv4-only sender path; see the IPv6 open question in DESIGN.md.
            continue;
        };
        let dport = target.port();

        for probe_num in 0..config.packet_streams {
            if knobs.should_stop() {
                break 'targets;
            }

            let saddr = config.source_ip_for(daddr, probe_num);
            let probe_num_u8 = probe_num as u8;
            let validation = prf_v4(prf_key, saddr, daddr, dport, probe_num_u8);
            let sport = config.source_port_for(validation[1], probe_num);
            let ip_id = validation[3] as u16;

            let mut buf = vec![0u8; probe.max_packet_length()];
            let prepared = match probe.prepare_packet(&mut buf, config.source_mac, config.gateway_mac, thread_state.as_mut()) {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("prepare_packet failed: {}", e);
                    stats.send_errors.fetch_add(1, Relaxed);
                    continue;
                }
            };
            let args = MakePacketArgs {
                saddr: IpAddr::V4(saddr),
                daddr: IpAddr::V4(daddr),
                dport,
                sport,
                ttl: config.probe_ttl,
                validation,
                probe_num: probe_num_u8,
                ip_id,
            };
            let total_len = match probe.make_packet(&mut buf, prepared, &args, thread_state.as_mut()) {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("make_packet failed: {}", e);
                    stats.send_errors.fetch_add(1, Relaxed);
                    continue;
                }
            };
            buf.truncate(total_len);
            let frame = OutgoingFrame { data: buf };
            if let Err(e) = capture.write_sent(now_ns(), &frame) {
                tracing::warn!("capture write_sent failed: {}", e);
            }
            batch.push(frame);

            if batch.len() >= config.batch_size {
                flush_batch(shard, &mut batch, transport, stats, config.retries);
            }
            pacer.pace();
        }

        shard.mark_scanned();
    }

    flush_batch(shard, &mut batch, transport, stats, config.retries);
}

/// Submit everything queued in `batch` via `transport.send_batch`,
/// attributing success/failure to both `stats` and the owning `shard`'s
/// per-packet counters (§4.3 `mark_sent`), then clear the batch.
fn flush_batch(shard: &Shard, batch: &mut Vec<OutgoingFrame>, transport: &mut dyn Transport, stats: &ScanStats, attempts: u32) {
    if batch.is_empty() {
        return;
    }
    let total_bytes: u64 = batch.iter().map(|f| f.data.len() as u64).sum();
    match transport.send_batch(batch, attempts) {
        Ok(accepted) => {
            stats.packets_sent.fetch_add(accepted as u64, Relaxed);
            stats.bytes_sent.fetch_add(total_bytes, Relaxed);
            let failed = batch.len() - accepted;
            if failed > 0 {
                stats.send_errors.fetch_add(failed as u64, Relaxed);
            }
            for i in 0..batch.len() {
                shard.mark_sent(i < accepted);
            }
        }
        Err(e) => {
            tracing::warn!("send_batch failed: {}", e);
            stats.send_errors.fetch_add(batch.len() as u64, Relaxed);
            for _ in 0..batch.len() {
                shard.mark_sent(false);
            }
        }
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{AddrRange, RangeSetOracle};
    use crate::probe::tcp_syn::TcpSynModule;
    use crate::transport::{DryRunTransport, NullCaptureSink};
    use std::time::Duration;

    fn test_config() -> ScanConfig {
        ScanConfig {
            senders: 1,
            shard_num: 0,
            total_shards: 1,
            packet_streams: 2,
            max_targets: None,
            max_packets: None,
            max_runtime: None,
            cooldown: Duration::from_secs(1),
            retries: 2,
            batch_size: 4,
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
    fn sender_emits_packet_streams_times_targets_through_transport() {
        let config = test_config();
        let oracle = RangeSetOracle::from_ranges(vec![AddrRange { start: 0, end: 20 }]);
        let space = TargetSpace::new_single_port(RangeSetOracle::from_ranges(vec![AddrRange { start: 0, end: 20 }]), 443);
        let mut shard = Shard::new(&space, 0, 1);
        let knobs = RuntimeKnobs::new();
        let stats = ScanStats::new();
        let key = PrfKey::from_bytes([7; 16]);
        let probe = TcpSynModule::default();
        // High target rate selects the spin-delay pacer with a cheap
        // starting delay, so the test doesn't block on real sleeps.
        let rate = RateController::new(10_000_000, 1);
        let mut transport = DryRunTransport::new();
        let mut capture = NullCaptureSink;

        run_sender(&mut shard, &space, &config, &knobs, &stats, &key, &probe, &rate, &mut transport, &mut capture);

        let expected = oracle.count_allowed() * config.packet_streams;
        assert_eq!(transport.sent.len() as u64, expected);
        assert_eq!(stats.packets_sent.load(Relaxed), expected);
        assert_eq!(shard.targets_scanned(), oracle.count_allowed());
        assert_eq!(shard.packets_sent(), expected);
    }

    #[test]
    fn sender_stops_promptly_on_stop_request() {
        let config = test_config();
        let space = TargetSpace::new_single_port(RangeSetOracle::full_ipv4_space(), 443);
        let mut shard = Shard::new(&space, 0, 1);
        let knobs = RuntimeKnobs::new();
        knobs.request_stop();
        let stats = ScanStats::new();
        let key = PrfKey::from_bytes([1; 16]);
        let probe = TcpSynModule::default();
        let rate = RateController::new(1_000_000, 1);
        let mut transport = DryRunTransport::new();
        let mut capture = NullCaptureSink;

        run_sender(&mut shard, &space, &config, &knobs, &stats, &key, &probe, &rate, &mut transport, &mut capture);

        assert_eq!(transport.sent.len(), 0);
    }

    #[test]
    fn max_targets_limit_bounds_sender_output() {
        let mut config = test_config();
        config.max_targets = Some(3);
        config.packet_streams = 1;
        let space = TargetSpace::new_single_port(RangeSetOracle::from_ranges(vec![AddrRange { start: 0, end: 1000 }]), 443);
        let mut shard = Shard::with_limits(&space, 0, 1, config.max_targets, config.max_packets);
        let knobs = RuntimeKnobs::new();
        let stats = ScanStats::new();
        let key = PrfKey::from_bytes([2; 16]);
        let probe = TcpSynModule::default();
        let rate = RateController::new(10_000_000, 1);
        let mut transport = DryRunTransport::new();
        let mut capture = NullCaptureSink;

        run_sender(&mut shard, &space, &config, &knobs, &stats, &key, &probe, &rate, &mut transport, &mut capture);

        assert_eq!(transport.sent.len(), 3);
    }
}
