//! `xscan.toml` configuration, merged with CLI flags (CLI wins) into the
//! fully-resolved settings `main.rs` needs to build a [`xscan_core::config::ScanConfig`].
//!
//! Mirrors the teacher's `probe.toml` pattern (`ProbeConfig::load`,
//! `#[serde(default = "...")]` per optional field) but every field here is a
//! plain `Option<T>` instead: presence in the file is itself the default,
//! and an absent field simply means "let the CLI (or its own hardcoded
//! default) decide".

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::cli::Cli;

/// Optional `xscan.toml` contents. Every field mirrors a CLI flag; a CLI
/// flag that was actually passed always overrides the file's value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub rate: Option<u64>,
    pub bandwidth: Option<u64>,
    pub senders: Option<u64>,
    pub shard_num: Option<u64>,
    pub total_shards: Option<u64>,
    pub packet_streams: Option<u64>,
    pub max_targets: Option<u64>,
    pub max_packets: Option<u64>,
    pub max_runtime: Option<u64>,
    pub cooldown_secs: Option<u64>,
    pub retries: Option<u32>,
    pub batch_size: Option<usize>,
    pub probe_module: Option<String>,
    #[serde(default)]
    pub probe_args: Vec<String>,
    #[serde(default)]
    pub source_ips: Vec<String>,
    pub source_port_first: Option<u16>,
    pub source_port_last: Option<u16>,
    #[serde(default)]
    pub target_ports: Vec<u16>,
    pub blocklist_file: Option<String>,
    pub allowlist_file: Option<String>,
    pub interface: Option<String>,
    pub gateway_mac: Option<String>,
    pub source_mac: Option<String>,
    pub probe_ttl: Option<u8>,
    pub validate_source_port_override: Option<String>,
    pub capture_dir: Option<String>,
    pub capture_format: Option<String>,
    pub output_format: Option<String>,
    pub output_file: Option<String>,
}

impl FileConfig {
    /// Load `path` if it exists; a missing file is not an error (mirrors
    /// the `--config` default pointing at a file the user hasn't
    /// necessarily created).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse config file: {}", path.display()))
    }
}

/// Everything resolved from CLI + file, before being turned into the
/// typed pieces `main.rs` hands to `xscan_core` (MAC arrays, parsed IPs,
/// a built `ScanConfig`, etc.).
pub struct ResolvedConfig {
    pub rate: Option<u64>,
    pub bandwidth: Option<u64>,
    pub senders: u64,
    pub shard_num: u64,
    pub total_shards: u64,
    pub packet_streams: u64,
    pub max_targets: Option<u64>,
    pub max_packets: Option<u64>,
    pub max_runtime: Option<Duration>,
    pub cooldown: Duration,
    pub retries: u32,
    pub batch_size: usize,
    pub probe_module: String,
    pub probe_args_raw: Vec<String>,
    pub source_ips: Vec<Ipv4Addr>,
    pub source_port_first: u16,
    pub source_port_last: u16,
    pub target_ports: Vec<u16>,
    pub blocklist_file: Option<String>,
    pub allowlist_file: Option<String>,
    pub interface: String,
    pub gateway_mac: [u8; 6],
    pub source_mac: Option<[u8; 6]>,
    pub probe_ttl: u8,
    pub dryrun: bool,
    pub validate_source_port_override: Option<(u16, u16)>,
    pub capture_dir: Option<String>,
    pub capture_format: String,
    pub output_format: String,
    pub output_file: Option<String>,
    pub dashboard: bool,
}

fn pick<T>(cli: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(file).unwrap_or(default)
}

fn pick_list<T>(cli: Vec<T>, file: Vec<T>) -> Vec<T> {
    if !cli.is_empty() {
        cli
    } else {
        file
    }
}

/// Parse `"aa:bb:cc:dd:ee:ff"` into a raw MAC, the format every
/// `--gateway-mac`/`--source-mac` flag and config field uses.
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    anyhow::ensure!(parts.len() == 6, "MAC address '{}' must have 6 colon-separated octets", s);
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).with_context(|| format!("invalid MAC octet '{}' in '{}'", part, s))?;
    }
    Ok(mac)
}

fn parse_port_window(s: &str) -> Result<(u16, u16)> {
    let (lo, hi) = s.split_once(':').with_context(|| format!("port window '{}' must be 'lo:hi'", s))?;
    Ok((lo.parse()?, hi.parse()?))
}

impl ResolvedConfig {
    pub fn resolve(cli: &Cli, file: &FileConfig) -> Result<Self> {
        let gateway_mac_str = cli.gateway_mac.clone().or_else(|| file.gateway_mac.clone());
        let gateway_mac = match gateway_mac_str {
            Some(s) => parse_mac(&s)?,
            None => anyhow::bail!("configuration error: --gateway-mac is required (no ARP resolution in this build)"),
        };
        let source_mac = match cli.source_mac.clone().or_else(|| file.source_mac.clone()) {
            Some(s) => Some(parse_mac(&s)?),
            None => None,
        };

        let source_ip_strs = pick_list(cli.source_ips.clone(), file.source_ips.clone());
        anyhow::ensure!(!source_ip_strs.is_empty(), "configuration error: at least one --source-ip is required");
        let mut source_ips = Vec::with_capacity(source_ip_strs.len());
        for s in &source_ip_strs {
            source_ips.push(s.parse::<Ipv4Addr>().with_context(|| format!("invalid --source-ip '{}'", s))?);
        }

        let validate_override_str = cli.validate_source_port_override.clone().or_else(|| file.validate_source_port_override.clone());
        let validate_source_port_override = match validate_override_str {
            Some(s) => Some(parse_port_window(&s)?),
            None => None,
        };

        let max_runtime = pick(cli.max_runtime, file.max_runtime, 0);
        let cooldown_secs = pick(cli.cooldown_secs, file.cooldown_secs, 8);

        Ok(Self {
            rate: cli.rate.or(file.rate),
            bandwidth: cli.bandwidth.or(file.bandwidth),
            senders: pick(cli.senders, file.senders, 1),
            shard_num: pick(cli.shard_num, file.shard_num, 0),
            total_shards: pick(cli.total_shards, file.total_shards, 1),
            packet_streams: pick(cli.packet_streams, file.packet_streams, 1),
            max_targets: cli.max_targets.or(file.max_targets),
            max_packets: cli.max_packets.or(file.max_packets),
            max_runtime: if max_runtime == 0 { None } else { Some(Duration::from_secs(max_runtime)) },
            cooldown: Duration::from_secs(cooldown_secs),
            retries: pick(cli.retries, file.retries, 10),
            batch_size: pick(cli.batch_size, file.batch_size, 256),
            probe_module: pick(cli.probe_module.clone(), file.probe_module.clone(), "tcp_syn".into()),
            probe_args_raw: pick_list(cli.probe_args.clone(), file.probe_args.clone()),
            source_ips,
            source_port_first: pick(cli.source_port_first, file.source_port_first, 32768),
            source_port_last: pick(cli.source_port_last, file.source_port_last, 61000),
            target_ports: pick_list(cli.target_ports.clone(), file.target_ports.clone()),
            blocklist_file: cli.blocklist_file.as_ref().map(|p| p.display().to_string()).or_else(|| file.blocklist_file.clone()),
            allowlist_file: cli.allowlist_file.as_ref().map(|p| p.display().to_string()).or_else(|| file.allowlist_file.clone()),
            interface: pick(cli.interface.clone(), file.interface.clone(), "eth0".into()),
            gateway_mac,
            source_mac,
            probe_ttl: cli.probe_ttl,
            dryrun: cli.dryrun,
            validate_source_port_override,
            capture_dir: cli.capture_dir.as_ref().map(|p| p.display().to_string()).or_else(|| file.capture_dir.clone()),
            capture_format: pick(Some(cli.capture_format.clone()), file.capture_format.clone(), "pcap".into()),
            output_format: pick(Some(cli.output_format.clone()), file.output_format.clone(), "jsonl".into()),
            output_file: cli.output_file.as_ref().map(|p| p.display().to_string()).or_else(|| file.output_file.clone()),
            dashboard: cli.dashboard,
        })
    }

    /// Parse `key=value` probe args into the core's opaque key/value bag.
    pub fn probe_args(&self) -> xscan_core::probe::ProbeArgs {
        let kv = self
            .probe_args_raw
            .iter()
            .filter_map(|raw| raw.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
            .collect();
        xscan_core::probe::ProbeArgs { kv }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mac_accepts_standard_form() {
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff").unwrap(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn parse_mac_rejects_wrong_octet_count() {
        assert!(parse_mac("aa:bb:cc").is_err());
    }

    #[test]
    fn parse_port_window_splits_on_colon() {
        assert_eq!(parse_port_window("1000:2000").unwrap(), (1000, 2000));
    }

    #[test]
    fn cli_values_override_file_values() {
        let cli = Cli::parse_from([
            "xscan",
            "--senders",
            "4",
            "--gateway-mac",
            "aa:aa:aa:aa:aa:aa",
            "--source-ip",
            "10.0.0.1",
        ]);
        let mut file = FileConfig::default();
        file.senders = Some(99);
        file.gateway_mac = Some("bb:bb:bb:bb:bb:bb".into());
        let resolved = ResolvedConfig::resolve(&cli, &file).unwrap();
        assert_eq!(resolved.senders, 4);
    }

    #[test]
    fn file_values_apply_when_cli_omits_them() {
        use clap::Parser as _;
        let cli = Cli::parse_from(["xscan", "--gateway-mac", "aa:aa:aa:aa:aa:aa", "--source-ip", "10.0.0.1"]);
        let mut file = FileConfig::default();
        file.senders = Some(7);
        let resolved = ResolvedConfig::resolve(&cli, &file).unwrap();
        assert_eq!(resolved.senders, 7);
    }
}
