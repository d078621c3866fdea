//! Probe module contract (§4.5): the polymorphic interface every protocol
//! plugin implements, plus the static name → implementation registry.
//!
//! §9 calls this out as function-pointer polymorphism in the source that
//! needs to become a capability trait in Rust; `ProbeModule` is that
//! trait, and [`by_name`] is the "static registry" the design notes ask
//! for — a plain match rather than a runtime plugin loader, since the set
//! of modules is fixed at compile time.

pub mod dns;
pub mod icmp_echo;
pub mod tcp_syn;
pub mod udp;
pub mod util;

use crate::prf::ValidationWords;
use crate::record::{FieldDef, FieldValue};
use std::any::Any;
use std::net::IpAddr;

/// Module-specific CLI arguments (`probe_args`, §6), parsed by the bin
/// crate into an opaque key/value bag. Modules interpret their own keys.
#[derive(Debug, Clone, Default)]
pub struct ProbeArgs {
    pub kv: Vec<(String, String)>,
}

impl ProbeArgs {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.kv.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Per-target fields a sender thread supplies to `make_packet`.
pub struct MakePacketArgs {
    pub saddr: IpAddr,
    pub daddr: IpAddr,
    pub dport: u16,
    pub sport: u16,
    pub ttl: u8,
    pub validation: ValidationWords,
    pub probe_num: u8,
    pub ip_id: u16,
}

/// Destination-port and source-port-window configuration `validate_packet`
/// checks a captured response against (§4.5 "Validation discipline").
pub struct PortsConfig {
    pub source_port_first: u16,
    pub source_port_last: u16,
    pub target_ports: Vec<u16>,
}

impl PortsConfig {
    /// True if `port` falls in the configured source-port window, the
    /// check every module applies to a response's destination port
    /// (our original source port).
    pub fn in_source_window(&self, port: u16) -> bool {
        port >= self.source_port_first && port <= self.source_port_last
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid,
}

/// Result of `process_packet`: classification plus module-specific fields
/// to merge into the system field set before handing off to the output
/// encoder.
pub struct ProcessedPacket {
    pub classification: String,
    pub success: bool,
    pub app_success: bool,
    pub parse_err: bool,
    pub fields: Vec<(&'static str, FieldValue)>,
}

/// The capability interface every protocol implements (§4.5). Methods
/// correspond 1:1 to the spec's C-shaped contract, translated into owned
/// Rust signatures: `thread_init` returns an opaque `Box<dyn Any>` instead
/// of a raw per-thread pointer, and fallible steps return `anyhow::Result`
/// instead of an `ok|err` enum.
pub trait ProbeModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Upper bound on any packet this module builds, used both for
    /// buffer sizing and for the oversized-packet fatal check (§7).
    fn max_packet_length(&self) -> usize;

    /// BPF expression passed through to the capture adapter so only
    /// relevant traffic reaches the receiver.
    fn pcap_filter(&self) -> &'static str;

    /// Whether the destination port varies per target (vs. fixed, e.g.
    /// ICMP echo).
    fn port_args(&self) -> bool;

    fn field_schema(&self) -> &'static [FieldDef];

    /// Parse module-specific args and allocate shared immutable state.
    /// Called once before any thread starts.
    fn global_init(&self, args: &ProbeArgs) -> anyhow::Result<()>;

    /// Allocate per-thread state (e.g. a per-thread RNG for templated
    /// payloads). Called once per sender thread at startup.
    fn thread_init(&self) -> Box<dyn Any + Send>;

    /// Write the invariant prefix — headers that never change per
    /// target — into `buf`. Returns the number of bytes written.
    fn prepare_packet(&self, buf: &mut [u8], src_mac: [u8; 6], gw_mac: [u8; 6], thread_state: &mut dyn Any) -> anyhow::Result<usize>;

    /// Patch per-target fields into the buffer prepared by
    /// `prepare_packet` and recompute checksums. Returns the total
    /// packet length.
    fn make_packet(&self, buf: &mut [u8], prepared_len: usize, args: &MakePacketArgs, thread_state: &mut dyn Any) -> anyhow::Result<usize>;

    /// Decide whether a captured IP packet (`ip_hdr`, link layer already
    /// stripped) is a response to a probe this process sent, by
    /// recomputing validation locally and comparing.
    fn validate_packet(&self, ip_hdr: &[u8], validation: ValidationWords, ports_cfg: &PortsConfig) -> ValidationOutcome;

    /// Extract output fields from a packet already confirmed `Valid`.
    fn process_packet(&self, raw: &[u8], validation: ValidationWords, ts_ns: u64) -> ProcessedPacket;

    fn close(&self) {}
}

/// Static module registry: name (as accepted by `--probe-module`) to a
/// freshly constructed implementation. A plain match rather than a
/// runtime-discovered plugin table, since the module set is fixed at
/// compile time (§9).
pub fn by_name(name: &str) -> Option<Box<dyn ProbeModule>> {
    match name {
        "tcp_syn" => Some(Box::new(tcp_syn::TcpSynModule::default())),
        "icmp_echo" => Some(Box::new(icmp_echo::IcmpEchoModule::default())),
        "udp" => Some(Box::new(udp::UdpModule::default())),
        "dns" => Some(Box::new(dns::DnsModule::default())),
        _ => None,
    }
}

pub fn available_modules() -> &'static [&'static str] {
    &["tcp_syn", "icmp_echo", "udp", "dns"]
}
