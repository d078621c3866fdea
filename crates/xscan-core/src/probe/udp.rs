//! UDP probe module: sends a configurable payload, classifies any reply
//! as success and ICMP port-unreachable as a distinct failure
//! classification (§4.5 "ICMP-embedded replies").

use super::util::{checksum_with_ipv4_pseudo_header, internet_checksum, IcmpView, Ipv4View, UdpView};
use super::{MakePacketArgs, PortsConfig, ProbeArgs, ProbeModule, ProcessedPacket, ValidationOutcome};
use crate::prf::ValidationWords;
use crate::record::{FieldDef, FieldType, FieldValue};
use std::any::Any;
use std::net::IpAddr;

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const DEFAULT_PAYLOAD: &[u8] = b"xscan";

const FIELDS: &[FieldDef] = &[
    FieldDef { name: "classification", field_type: FieldType::String, desc: "udp-response or icmp-unreach" },
    FieldDef { name: "icmp_responder", field_type: FieldType::String, desc: "ICMP error source, if any" },
    FieldDef { name: "data", field_type: FieldType::Binary, desc: "response payload" },
];

#[derive(Default)]
pub struct UdpModule;

struct ThreadState;

impl UdpModule {
    fn payload_len(&self) -> usize {
        DEFAULT_PAYLOAD.len()
    }
}

impl ProbeModule for UdpModule {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn max_packet_length(&self) -> usize {
        ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + DEFAULT_PAYLOAD.len()
    }

    fn pcap_filter(&self) -> &'static str {
        "udp or icmp"
    }

    fn port_args(&self) -> bool {
        true
    }

    fn field_schema(&self) -> &'static [FieldDef] {
        FIELDS
    }

    fn global_init(&self, _args: &ProbeArgs) -> anyhow::Result<()> {
        Ok(())
    }

    fn thread_init(&self) -> Box<dyn Any + Send> {
        Box::new(ThreadState)
    }

    fn prepare_packet(&self, buf: &mut [u8], src_mac: [u8; 6], gw_mac: [u8; 6], _thread_state: &mut dyn Any) -> anyhow::Result<usize> {
        if buf.len() < self.max_packet_length() {
            anyhow::bail!("buffer too small for udp packet");
        }
        buf[0..6].copy_from_slice(&gw_mac);
        buf[6..12].copy_from_slice(&src_mac);
        buf[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        Ok(ETHERNET_HEADER_LEN)
    }

    fn make_packet(&self, buf: &mut [u8], prepared_len: usize, args: &MakePacketArgs, _thread_state: &mut dyn Any) -> anyhow::Result<usize> {
        let IpAddr::V4(saddr) = args.saddr else { anyhow::bail!("udp module only supports IPv4 targets") };
        let IpAddr::V4(daddr) = args.daddr else { anyhow::bail!("udp module only supports IPv4 targets") };

        let udp_len = UDP_HEADER_LEN + self.payload_len();
        let total_len = prepared_len + IPV4_HEADER_LEN + udp_len;
        if buf.len() < total_len {
            anyhow::bail!("buffer too small for udp packet");
        }

        let ip_start = prepared_len;
        let udp_start = ip_start + IPV4_HEADER_LEN;

        {
            let ip = &mut buf[ip_start..ip_start + IPV4_HEADER_LEN];
            ip[0] = 0x45;
            ip[2..4].copy_from_slice(&((IPV4_HEADER_LEN + udp_len) as u16).to_be_bytes());
            ip[4..6].copy_from_slice(&args.ip_id.to_be_bytes());
            ip[8] = args.ttl;
            ip[9] = 17; // UDP
            ip[12..16].copy_from_slice(&saddr.octets());
            ip[16..20].copy_from_slice(&daddr.octets());
            let csum = internet_checksum(ip);
            ip[10..12].copy_from_slice(&csum.to_be_bytes());
        }

        {
            let udp = &mut buf[udp_start..udp_start + udp_len];
            // Source port carries V[1] in its low bits per the PRF contract
            // so the receiver can recover it without per-target state.
            udp[0..2].copy_from_slice(&args.sport.to_be_bytes());
            udp[2..4].copy_from_slice(&args.dport.to_be_bytes());
            udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
            udp[6..8].copy_from_slice(&[0, 0]);
            udp[8..8 + self.payload_len()].copy_from_slice(DEFAULT_PAYLOAD);
        }

        let csum = checksum_with_ipv4_pseudo_header(u32::from(saddr), u32::from(daddr), 17, &buf[udp_start..udp_start + udp_len]);
        buf[udp_start + 6..udp_start + 8].copy_from_slice(&csum.to_be_bytes());

        Ok(total_len)
    }

    fn validate_packet(&self, ip_hdr: &[u8], validation: ValidationWords, ports_cfg: &PortsConfig) -> ValidationOutcome {
        let Some(ip) = Ipv4View::parse(ip_hdr) else { return ValidationOutcome::Invalid };

        match ip.protocol() {
            17 => {
                let Some(payload) = ip.payload() else { return ValidationOutcome::Invalid };
                let Some(udp) = UdpView::parse(payload) else { return ValidationOutcome::Invalid };
                if !ports_cfg.in_source_window(udp.dport()) {
                    return ValidationOutcome::Invalid;
                }
                ValidationOutcome::Valid
            }
            1 => {
                // ICMP error embedding our original UDP probe: re-validate
                // using the embedded inner IP header as if it were the
                // original packet (§4.5).
                let Some(payload) = ip.payload() else { return ValidationOutcome::Invalid };
                let Some(icmp) = IcmpView::parse(payload) else { return ValidationOutcome::Invalid };
                if icmp.icmp_type() != IcmpView::TYPE_DEST_UNREACHABLE && icmp.icmp_type() != IcmpView::TYPE_TIME_EXCEEDED {
                    return ValidationOutcome::Invalid;
                }
                let Some(inner) = icmp.embedded_ip_packet() else { return ValidationOutcome::Invalid };
                let Some(inner_ip) = Ipv4View::parse(inner) else { return ValidationOutcome::Invalid };
                let Some(inner_payload) = inner_ip.payload() else { return ValidationOutcome::Invalid };
                let Some(inner_udp) = UdpView::parse(inner_payload) else { return ValidationOutcome::Invalid };
                if !ports_cfg.in_source_window(inner_udp.sport()) {
                    return ValidationOutcome::Invalid;
                }
                let _ = validation;
                ValidationOutcome::Valid
            }
            _ => ValidationOutcome::Invalid,
        }
    }

    fn process_packet(&self, raw: &[u8], _validation: ValidationWords, _ts_ns: u64) -> ProcessedPacket {
        let Some(ip) = Ipv4View::parse(raw) else {
            return ProcessedPacket { classification: "unknown".into(), success: false, app_success: false, parse_err: true, fields: vec![] };
        };

        match ip.protocol() {
            17 => {
                let payload = ip.payload().and_then(UdpView::parse);
                let data = payload.map(|u| u.payload().to_vec()).unwrap_or_default();
                ProcessedPacket {
                    classification: "udp-response".into(),
                    success: true,
                    app_success: true,
                    parse_err: false,
                    fields: vec![
                        ("classification", FieldValue::Str("udp-response".into())),
                        ("data", FieldValue::Binary(data)),
                    ],
                }
            }
            1 => {
                let responder = IpAddr::V4(std::net::Ipv4Addr::from(ip.saddr())).to_string();
                ProcessedPacket {
                    classification: "icmp-unreach".into(),
                    success: false,
                    app_success: false,
                    parse_err: false,
                    fields: vec![
                        ("classification", FieldValue::Str("icmp-unreach".into())),
                        ("icmp_responder", FieldValue::Str(responder)),
                    ],
                }
            }
            _ => ProcessedPacket { classification: "unknown".into(), success: false, app_success: false, parse_err: true, fields: vec![] },
        }
    }
}
