//! xscan — stateless, single-packet Internet-wide network scanner.
//!
//! Run `xscan --help` for usage.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod capture;
mod cli;
mod color;
mod config;
mod monitor;
mod oracle_file;
mod output;
mod transport;

use cli::Cli;
use config::{FileConfig, ResolvedConfig};
use xscan_core::config::ScanConfig;
use xscan_core::lifecycle::{run_scan, ScanInputs};
use xscan_core::prf::PrfKey;
use xscan_core::rate::{bandwidth_to_pps, RateController};
use xscan_core::target_space::TargetSpace;
use xscan_core::transport::NullCaptureSink;

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop_signal(_: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_stop_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_stop_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_stop_signal as *const () as libc::sighandler_t);
    }
}

extern "C" fn handle_sigusr1(_: libc::c_int) {
    if let Some(rate) = RATE_CONTROLLER.get() {
        rate.nudge_percent(0.05);
    }
}

extern "C" fn handle_sigusr2(_: libc::c_int) {
    if let Some(rate) = RATE_CONTROLLER.get() {
        rate.nudge_percent(-0.05);
    }
}

static RATE_CONTROLLER: std::sync::OnceLock<Arc<RateController>> = std::sync::OnceLock::new();

fn install_rate_nudge_handlers(rate: Arc<RateController>) {
    RATE_CONTROLLER.set(rate).ok();
    unsafe {
        libc::signal(libc::SIGUSR1, handle_sigusr1 as *const () as libc::sighandler_t);
        libc::signal(libc::SIGUSR2, handle_sigusr2 as *const () as libc::sighandler_t);
    }
}

fn build_scan_config(resolved: &ResolvedConfig) -> ScanConfig {
    ScanConfig {
        senders: resolved.senders,
        shard_num: resolved.shard_num,
        total_shards: resolved.total_shards,
        packet_streams: resolved.packet_streams,
        max_targets: resolved.max_targets,
        max_packets: resolved.max_packets,
        max_runtime: resolved.max_runtime,
        cooldown: resolved.cooldown,
        retries: resolved.retries,
        batch_size: resolved.batch_size,
        probe_module: resolved.probe_module.clone(),
        source_ips: resolved.source_ips.clone(),
        source_port_first: resolved.source_port_first,
        source_port_last: resolved.source_port_last,
        target_ports: resolved.target_ports.clone(),
        interface: resolved.interface.clone(),
        gateway_mac: resolved.gateway_mac,
        source_mac: resolved.source_mac.unwrap_or([0; 6]),
        probe_ttl: resolved.probe_ttl,
        dryrun: resolved.dryrun,
        validate_source_port_override: resolved.validate_source_port_override,
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = Cli::parse();
    let file_config = FileConfig::load(&cli.config)?;
    let resolved = ResolvedConfig::resolve(&cli, &file_config)?;

    anyhow::ensure!(!(resolved.target_ports.is_empty()), "configuration error: at least one --target-port is required");
    anyhow::ensure!(resolved.rate.is_some() != resolved.bandwidth.is_some(), "configuration error: exactly one of --rate or --bandwidth must be set");

    let probe = xscan_core::probe::by_name(&resolved.probe_module)
        .with_context(|| format!("unknown probe module '{}' (available: {:?})", resolved.probe_module, xscan_core::probe::available_modules()))?;
    probe.global_init(&resolved.probe_args())?;

    let rate_pps = match (resolved.rate, resolved.bandwidth) {
        (Some(r), None) => r,
        (None, Some(bw)) => bandwidth_to_pps(bw, probe.max_packet_length() as u64),
        _ => unreachable!("validated above"),
    };

    let oracle = oracle_file::build_oracle(resolved.allowlist_file.as_ref().map(std::path::Path::new), resolved.blocklist_file.as_ref().map(std::path::Path::new))?;
    let count_allowed = xscan_core::oracle::BlocklistOracle::count_allowed(&oracle);
    let space = TargetSpace::new(oracle, resolved.target_ports.clone());

    let config = build_scan_config(&resolved);
    config.validate(count_allowed, resolved.target_ports.len() as u64)?;

    let prf_key = PrfKey::generate()?;
    let iterator_seed = {
        let mut buf = [0u8; 8];
        std::fs::File::open("/dev/urandom").and_then(|mut f| std::io::Read::read_exact(&mut f, &mut buf)).context("failed to read /dev/urandom for the iterator seed")?;
        u64::from_le_bytes(buf)
    };

    let rate = RateController::new(rate_pps, config.senders * config.packet_streams);
    install_stop_handlers();
    install_rate_nudge_handlers(rate.clone());

    let (sender_transports, sender_captures): (Vec<_>, Vec<_>) = if config.dryrun {
        let transports = (0..config.senders).map(|_| Box::new(transport::DumpingTransport::new()) as Box<dyn xscan_core::transport::Transport>).collect();
        let captures = (0..config.senders).map(|_| Box::new(NullCaptureSink) as Box<dyn xscan_core::transport::CaptureSink>).collect();
        (transports, captures)
    } else {
        let mut transports = Vec::with_capacity(config.senders as usize);
        let mut captures = Vec::with_capacity(config.senders as usize);
        for i in 0..config.senders {
            transports.push(Box::new(transport::AfPacketTransport::open(&config.interface)?) as Box<dyn xscan_core::transport::Transport>);
            captures.push(match &resolved.capture_dir {
                Some(dir) => capture::make_sink(std::path::Path::new(dir), &resolved.capture_format, leak_stem(format!("sender{}", i)), 256, 8)?,
                None => Box::new(NullCaptureSink),
            });
        }
        (transports, captures)
    };

    let receiver_transport: Box<dyn xscan_core::transport::Transport> = if config.dryrun {
        Box::new(xscan_core::transport::DryRunTransport::new())
    } else {
        Box::new(transport::AfPacketTransport::open(&config.interface)?)
    };
    let receiver_capture: Box<dyn xscan_core::transport::CaptureSink> = match (&resolved.capture_dir, config.dryrun) {
        (Some(dir), false) => capture::make_sink(std::path::Path::new(dir), &resolved.capture_format, "receiver", 256, 8)?,
        _ => Box::new(NullCaptureSink),
    };

    let output_path = resolved.output_file.as_ref().map(std::path::Path::new);
    let output_sink = output::make_output_sink(&resolved.output_format, output_path, probe.as_ref())?;

    let mut dashboard = if resolved.dashboard { Some(monitor::Dashboard::new()) } else { None };

    let inputs = ScanInputs {
        config: &config,
        space: &space,
        probe: probe.as_ref(),
        prf_key: &prf_key,
        iterator_seed,
        rate: rate.clone(),
        sender_transports,
        receiver_transport,
        sender_captures,
        receiver_capture,
        output_sink,
        poll_timeout_ms: 200,
        tick_interval: std::time::Duration::from_secs(1),
        external_stop: Some(Arc::new(AtomicBool::new(false))),
    };
    // Bridge the process-wide stop flag into the lifecycle's own atomic —
    // both are simple booleans, so poll ours into the scan's each tick.
    let external_flag = inputs.external_stop.clone().unwrap();

    info!(rate_pps, senders = config.senders, probe_module = %config.probe_module, "starting scan");

    let snapshot = run_scan(inputs, |tick| {
        if STOP_REQUESTED.load(Ordering::Relaxed) {
            external_flag.store(true, Ordering::Relaxed);
            if let Some(d) = &mut dashboard {
                d.close();
            }
        }
        match &mut dashboard {
            Some(d) => d.on_tick(&tick),
            None => monitor::print_tick_line(&tick),
        }
    })?;

    probe.close();

    println!();
    println!(
        "done: sent={} recv={} validated={} successes={} failures={} duplicates={}",
        snapshot.packets_sent, snapshot.packets_received, snapshot.responses_validated, snapshot.successes, snapshot.failures, snapshot.duplicate_responses,
    );
    if snapshot.send_errors > 0 {
        warn!(send_errors = snapshot.send_errors, "some probes failed to transmit");
    }

    Ok(())
}

fn leak_stem(s: String) -> &'static str {
    Box::leak(s.into_boxed_str())
}
