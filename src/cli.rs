//! CLI definitions for xscan.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "xscan",
    version,
    about = "Stateless, single-packet Internet-wide network scanner",
    long_about = None
)]
pub struct Cli {
    /// Path to an xscan.toml config file. CLI flags override values it sets.
    #[clap(long, short, default_value = "xscan.toml")]
    pub config: PathBuf,

    /// Target rate in packets/sec. Mutually exclusive with --bandwidth.
    #[clap(long)]
    pub rate: Option<u64>,

    /// Target bandwidth in bits/sec, converted to pps via the active probe
    /// module's frame size. Mutually exclusive with --rate.
    #[clap(long)]
    pub bandwidth: Option<u64>,

    /// Number of sender threads.
    #[clap(long)]
    pub senders: Option<u64>,

    /// This machine's shard index, in [0, total_shards).
    #[clap(long)]
    pub shard_num: Option<u64>,

    /// Total number of machine-level shards across the whole scan.
    #[clap(long)]
    pub total_shards: Option<u64>,

    /// Number of probes sent per target (distinct probe streams).
    #[clap(long)]
    pub packet_streams: Option<u64>,

    /// Stop this shard after scanning this many distinct targets.
    #[clap(long)]
    pub max_targets: Option<u64>,

    /// Stop this shard after sending this many packets.
    #[clap(long)]
    pub max_packets: Option<u64>,

    /// Stop all senders after this many seconds, independent of progress.
    #[clap(long)]
    pub max_runtime: Option<u64>,

    /// Seconds the receiver keeps recording after the last sender finishes.
    #[clap(long)]
    pub cooldown_secs: Option<u64>,

    /// Transient send-failure retry budget (total attempts = retries + 1).
    #[clap(long)]
    pub retries: Option<u32>,

    /// Number of packets a sender batches before submitting to the transport.
    #[clap(long)]
    pub batch_size: Option<usize>,

    /// Probe module: one of tcp_syn, icmp_echo, udp, dns.
    #[clap(long)]
    pub probe_module: Option<String>,

    /// Module-specific argument, `key=value`. May be repeated.
    #[clap(long = "probe-arg")]
    pub probe_args: Vec<String>,

    /// Source IP(s) to scan from. May be repeated to rotate through a pool.
    #[clap(long = "source-ip")]
    pub source_ips: Vec<String>,

    /// Lower bound of the source port window.
    #[clap(long)]
    pub source_port_first: Option<u16>,

    /// Upper bound of the source port window.
    #[clap(long)]
    pub source_port_last: Option<u16>,

    /// Destination port(s) to probe. May be repeated.
    #[clap(long = "target-port")]
    pub target_ports: Vec<u16>,

    /// File of CIDR ranges/addresses to exclude from scanning.
    #[clap(long)]
    pub blocklist_file: Option<PathBuf>,

    /// File of CIDR ranges/addresses to restrict scanning to.
    #[clap(long)]
    pub allowlist_file: Option<PathBuf>,

    /// Network interface to send/receive on.
    #[clap(long)]
    pub interface: Option<String>,

    /// Gateway MAC address, `aa:bb:cc:dd:ee:ff`.
    #[clap(long)]
    pub gateway_mac: Option<String>,

    /// Source MAC address, `aa:bb:cc:dd:ee:ff`. Defaults to the interface's own.
    #[clap(long)]
    pub source_mac: Option<String>,

    /// IPv6 source address, for probe modules that support v6 (not yet wired
    /// through the sharded iterator — see DESIGN.md's open IPv6 question).
    #[clap(long)]
    pub ipv6_source_ip: Option<String>,

    /// File of IPv6 targets, one per line, scanned sequentially.
    #[clap(long)]
    pub ipv6_target_file: Option<PathBuf>,

    /// IP TTL set on every outgoing probe.
    #[clap(long, default_value = "64")]
    pub probe_ttl: u8,

    /// Don't transmit: print each constructed packet to stdout instead.
    #[clap(long)]
    pub dryrun: bool,

    /// Override the source-port window `validate_packet` checks responses
    /// against, as `lo:hi`, when a NAT/LB rewrites the scanner's outbound port.
    #[clap(long)]
    pub validate_source_port_override: Option<String>,

    /// Directory to write optional packet captures into. Omit to disable capture.
    #[clap(long)]
    pub capture_dir: Option<PathBuf>,

    /// Capture format: pcap, csv, or jsonl.
    #[clap(long, default_value = "pcap")]
    pub capture_format: String,

    /// Output format for response records: csv or jsonl.
    #[clap(long, default_value = "jsonl")]
    pub output_format: String,

    /// Write output records to this file instead of stdout.
    #[clap(long)]
    pub output_file: Option<PathBuf>,

    /// Render a live-updating dashboard on stderr instead of one-shot summary lines.
    #[clap(long)]
    pub dashboard: bool,
}
