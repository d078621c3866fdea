//! ICMP Echo probe module: classic ping scan. The destination port
//! concept doesn't apply; the validation word is carried in the ICMP
//! identifier/sequence fields instead of a port window.

use super::util::{internet_checksum, IcmpView, Ipv4View};
use super::{MakePacketArgs, PortsConfig, ProbeArgs, ProbeModule, ProcessedPacket, ValidationOutcome};
use crate::prf::ValidationWords;
use crate::record::{FieldDef, FieldType, FieldValue};
use std::any::Any;
use std::net::IpAddr;

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const ICMP_HEADER_LEN: usize = 8;

const FIELDS: &[FieldDef] = &[FieldDef { name: "classification", field_type: FieldType::String, desc: "echoreply" }];

#[derive(Default)]
pub struct IcmpEchoModule;

struct ThreadState;

impl ProbeModule for IcmpEchoModule {
    fn name(&self) -> &'static str {
        "icmp_echo"
    }

    fn max_packet_length(&self) -> usize {
        ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + ICMP_HEADER_LEN
    }

    fn pcap_filter(&self) -> &'static str {
        "icmp"
    }

    fn port_args(&self) -> bool {
        false
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
            anyhow::bail!("buffer too small for icmp_echo packet");
        }
        buf[0..6].copy_from_slice(&gw_mac);
        buf[6..12].copy_from_slice(&src_mac);
        buf[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        Ok(ETHERNET_HEADER_LEN)
    }

    fn make_packet(&self, buf: &mut [u8], prepared_len: usize, args: &MakePacketArgs, _thread_state: &mut dyn Any) -> anyhow::Result<usize> {
        let IpAddr::V4(saddr) = args.saddr else { anyhow::bail!("icmp_echo only supports IPv4 targets") };
        let IpAddr::V4(daddr) = args.daddr else { anyhow::bail!("icmp_echo only supports IPv4 targets") };

        let total_len = prepared_len + IPV4_HEADER_LEN + ICMP_HEADER_LEN;
        if buf.len() < total_len {
            anyhow::bail!("buffer too small for icmp_echo packet");
        }

        let ip_start = prepared_len;
        let icmp_start = ip_start + IPV4_HEADER_LEN;

        {
            let ip = &mut buf[ip_start..ip_start + IPV4_HEADER_LEN];
            ip[0] = 0x45;
            ip[2..4].copy_from_slice(&((IPV4_HEADER_LEN + ICMP_HEADER_LEN) as u16).to_be_bytes());
            ip[4..6].copy_from_slice(&args.ip_id.to_be_bytes());
            ip[8] = args.ttl;
            ip[9] = 1; // ICMP
            ip[12..16].copy_from_slice(&saddr.octets());
            ip[16..20].copy_from_slice(&daddr.octets());
            let csum = internet_checksum(ip);
            ip[10..12].copy_from_slice(&csum.to_be_bytes());
        }

        {
            let icmp = &mut buf[icmp_start..icmp_start + ICMP_HEADER_LEN];
            icmp[0] = IcmpView::TYPE_ECHO_REQUEST;
            icmp[1] = 0;
            icmp[2..4].copy_from_slice(&[0, 0]); // checksum, filled below
            // Validation words V[0]/V[1] carried in identifier/sequence
            // since ICMP echo has no port fields to smuggle them into.
            icmp[4..6].copy_from_slice(&(args.validation[0] as u16).to_be_bytes());
            icmp[6..8].copy_from_slice(&(args.validation[1] as u16).to_be_bytes());
        }

        let csum = internet_checksum(&buf[icmp_start..icmp_start + ICMP_HEADER_LEN]);
        buf[icmp_start + 2..icmp_start + 4].copy_from_slice(&csum.to_be_bytes());

        Ok(total_len)
    }

    fn validate_packet(&self, ip_hdr: &[u8], validation: ValidationWords, _ports_cfg: &PortsConfig) -> ValidationOutcome {
        let Some(ip) = Ipv4View::parse(ip_hdr) else { return ValidationOutcome::Invalid };
        if ip.protocol() != 1 {
            return ValidationOutcome::Invalid;
        }
        let Some(payload) = ip.payload() else { return ValidationOutcome::Invalid };
        let Some(icmp) = IcmpView::parse(payload) else { return ValidationOutcome::Invalid };
        if icmp.icmp_type() != IcmpView::TYPE_ECHO_REPLY {
            return ValidationOutcome::Invalid;
        }
        if icmp.identifier() != validation[0] as u16 || icmp.sequence() != validation[1] as u16 {
            return ValidationOutcome::Invalid;
        }
        ValidationOutcome::Valid
    }

    fn process_packet(&self, raw: &[u8], _validation: ValidationWords, _ts_ns: u64) -> ProcessedPacket {
        ProcessedPacket {
            classification: "echoreply".into(),
            success: true,
            app_success: true,
            parse_err: raw.is_empty(),
            fields: vec![("classification", FieldValue::Str("echoreply".into()))],
        }
    }
}
