//! Immutable scan configuration plus the small set of runtime-tunable
//! atomics (§9: "process-wide mutable state... package as an immutable
//! configuration value passed by shared reference, plus a small set of
//! atomics for runtime-tunable knobs. No ambient globals.").
//!
//! `ScanConfig` is built once by the bin crate (from CLI args merged with
//! an optional config file) and handed to the orchestrator by shared
//! reference; nothing in `xscan-core` mutates it.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::time::Duration;

/// Everything the orchestrator needs to run a scan, fixed for its
/// lifetime. Validated once by [`ScanConfig::validate`] before any thread
/// starts (§7 "Configuration error").
#[derive(Debug, Clone)]
pub struct ScanConfig {
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
    pub source_ips: Vec<Ipv4Addr>,
    pub source_port_first: u16,
    pub source_port_last: u16,
    pub target_ports: Vec<u16>,
    pub interface: String,
    pub gateway_mac: [u8; 6],
    pub source_mac: [u8; 6],
    pub probe_ttl: u8,
    pub dryrun: bool,
    /// Overrides `validate_packet`'s source-port-window check with an
    /// explicit window rather than deriving one from `source_port_first/last`
    /// (§6 `validate_source_port_override`) — used when NAT or a load
    /// balancer rewrites the scanner's outbound source port.
    pub validate_source_port_override: Option<(u16, u16)>,
}

impl ScanConfig {
    /// Startup validation (§7). Called once by the orchestrator before
    /// any thread starts; failures here are fatal and non-retriable.
    pub fn validate(&self, count_allowed: u64, num_ports: u64) -> anyhow::Result<()> {
        if self.senders == 0 {
            anyhow::bail!("configuration error: senders must be at least 1");
        }
        if self.total_shards == 0 || self.shard_num >= self.total_shards {
            anyhow::bail!("configuration error: shard_num must be < total_shards");
        }
        if self.packet_streams == 0 {
            anyhow::bail!("configuration error: packet_streams must be at least 1");
        }
        if num_ports == 0 {
            anyhow::bail!("configuration error: at least one destination port is required");
        }
        if self.source_ips.is_empty() {
            anyhow::bail!("configuration error: at least one source IP is required");
        }
        if self.source_port_first > self.source_port_last {
            anyhow::bail!("configuration error: source_port_first must be <= source_port_last");
        }
        let oversubscription = self.senders * self.total_shards;
        let available = count_allowed * num_ports;
        if oversubscription > available {
            anyhow::bail!(
                "configuration error: senders × shards ({}) exceeds allowed probes ({})",
                oversubscription,
                available
            );
        }
        Ok(())
    }

    /// Source IP for probe `i` to destination `d`, per §3: `pool[(ntohl(d)+i) mod |pool|]`.
    pub fn source_ip_for(&self, daddr: Ipv4Addr, probe_index: u64) -> Ipv4Addr {
        let idx = (u32::from(daddr) as u64 + probe_index) % self.source_ips.len() as u64;
        self.source_ips[idx as usize]
    }

    /// Source port for probe `i`, per §3: `P_lo + (V[1]+i) mod (P_hi-P_lo+1)`.
    pub fn source_port_for(&self, v1: u32, probe_index: u64) -> u16 {
        let span = (self.source_port_last - self.source_port_first) as u64 + 1;
        let offset = (v1 as u64 + probe_index) % span;
        self.source_port_first + offset as u16
    }

    pub fn effective_validation_window(&self) -> (u16, u16) {
        self.validate_source_port_override.unwrap_or((self.source_port_first, self.source_port_last))
    }
}

/// Runtime-tunable flags, read and written from multiple threads without
/// locking. This is the entirety of the scan's mutable shared state
/// outside of `ScanStats` and the seen-set.
pub struct RuntimeKnobs {
    pub should_stop: AtomicBool,
    pub receiver_complete: AtomicBool,
    /// Set by the monitor the instant the cooldown window opens (§4.7: all
    /// shards done, waiting out `cooldown_secs` before `receiver_complete`).
    /// The receiver reads this to flag late-but-legitimate responses rather
    /// than recomputing completion state itself.
    pub cooldown_open: AtomicBool,
}

impl RuntimeKnobs {
    pub fn new() -> Self {
        Self {
            should_stop: AtomicBool::new(false),
            receiver_complete: AtomicBool::new(false),
            cooldown_open: AtomicBool::new(false),
        }
    }

    pub fn request_stop(&self) {
        self.should_stop.store(true, Relaxed);
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Relaxed)
    }

    pub fn mark_receiver_complete(&self) {
        self.receiver_complete.store(true, Relaxed);
    }

    pub fn receiver_complete(&self) -> bool {
        self.receiver_complete.load(Relaxed)
    }

    pub fn mark_cooldown_open(&self) {
        self.cooldown_open.store(true, Relaxed);
    }

    /// Whether the scan is currently in its post-completion cooldown window
    /// (§4.7 "Records received during cooldown are emitted with
    /// cooldown=true").
    pub fn cooldown_open(&self) -> bool {
        self.cooldown_open.load(Relaxed)
    }
}

impl Default for RuntimeKnobs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ScanConfig {
        ScanConfig {
            senders: 1,
            shard_num: 0,
            total_shards: 1,
            packet_streams: 1,
            max_targets: None,
            max_packets: None,
            max_runtime: None,
            cooldown: Duration::from_secs(8),
            retries: 2,
            batch_size: 256,
            probe_module: "tcp_syn".into(),
            source_ips: vec!["10.0.0.1".parse().unwrap()],
            source_port_first: 40000,
            source_port_last: 40100,
            target_ports: vec![443],
            interface: "eth0".into(),
            gateway_mac: [0; 6],
            source_mac: [1; 6],
            probe_ttl: 64,
            dryrun: true,
            validate_source_port_override: None,
        }
    }

    #[test]
    fn oversubscription_is_rejected() {
        let mut cfg = base_config();
        cfg.senders = 4;
        cfg.total_shards = 4;
        let err = cfg.validate(8, 1).unwrap_err();
        assert!(err.to_string().contains("exceeds allowed probes"));
    }

    #[test]
    fn well_formed_config_validates() {
        let cfg = base_config();
        assert!(cfg.validate(1000, 1).is_ok());
    }

    #[test]
    fn source_port_for_stays_in_range() {
        let cfg = base_config();
        for i in 0..500u64 {
            let port = cfg.source_port_for(123, i);
            assert!(port >= cfg.source_port_first && port <= cfg.source_port_last);
        }
    }

    #[test]
    fn source_ip_for_cycles_through_pool() {
        let mut cfg = base_config();
        cfg.source_ips = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        let d: Ipv4Addr = "1.2.3.4".parse().unwrap();
        let a = cfg.source_ip_for(d, 0);
        let b = cfg.source_ip_for(d, 1);
        assert_ne!(a, b);
    }
}
