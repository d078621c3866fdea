//! TCP SYN probe module: the classic scanner probe. Sends a bare SYN,
//! classifies the response as open (SYN-ACK) or closed (RST).

use super::util::{checksum_with_ipv4_pseudo_header, internet_checksum, Ipv4View, TcpView};
use super::{MakePacketArgs, PortsConfig, ProbeArgs, ProbeModule, ProcessedPacket, ValidationOutcome};
use crate::prf::ValidationWords;
use crate::record::{FieldDef, FieldType, FieldValue};
use std::any::Any;
use std::net::IpAddr;

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;

const FIELDS: &[FieldDef] = &[
    FieldDef { name: "classification", field_type: FieldType::String, desc: "synack or rst" },
    FieldDef { name: "sport", field_type: FieldType::Int, desc: "response source port" },
    FieldDef { name: "window", field_type: FieldType::Int, desc: "TCP window size of response" },
];

#[derive(Default)]
pub struct TcpSynModule;

struct ThreadState;

impl ProbeModule for TcpSynModule {
    fn name(&self) -> &'static str {
        "tcp_syn"
    }

    fn max_packet_length(&self) -> usize {
        ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN
    }

    fn pcap_filter(&self) -> &'static str {
        "tcp"
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
            anyhow::bail!("buffer too small for tcp_syn packet");
        }
        buf[0..6].copy_from_slice(&gw_mac);
        buf[6..12].copy_from_slice(&src_mac);
        buf[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        Ok(ETHERNET_HEADER_LEN)
    }

    fn make_packet(&self, buf: &mut [u8], prepared_len: usize, args: &MakePacketArgs, _thread_state: &mut dyn Any) -> anyhow::Result<usize> {
        let IpAddr::V4(saddr) = args.saddr else { anyhow::bail!("tcp_syn only supports IPv4 targets") };
        let IpAddr::V4(daddr) = args.daddr else { anyhow::bail!("tcp_syn only supports IPv4 targets") };

        let total_len = prepared_len + IPV4_HEADER_LEN + TCP_HEADER_LEN;
        if buf.len() < total_len {
            anyhow::bail!("buffer too small for tcp_syn packet");
        }

        let ip_start = prepared_len;
        let tcp_start = ip_start + IPV4_HEADER_LEN;

        {
            let ip = &mut buf[ip_start..ip_start + IPV4_HEADER_LEN];
            ip[0] = 0x45;
            ip[1] = 0;
            ip[2..4].copy_from_slice(&((IPV4_HEADER_LEN + TCP_HEADER_LEN) as u16).to_be_bytes());
            ip[4..6].copy_from_slice(&args.ip_id.to_be_bytes());
            ip[6..8].copy_from_slice(&0u16.to_be_bytes());
            ip[8] = args.ttl;
            ip[9] = 6; // TCP
            ip[10..12].copy_from_slice(&[0, 0]);
            ip[12..16].copy_from_slice(&saddr.octets());
            ip[16..20].copy_from_slice(&daddr.octets());
            let csum = internet_checksum(ip);
            ip[10..12].copy_from_slice(&csum.to_be_bytes());
        }

        {
            let tcp = &mut buf[tcp_start..tcp_start + TCP_HEADER_LEN];
            tcp[0..2].copy_from_slice(&args.sport.to_be_bytes());
            tcp[2..4].copy_from_slice(&args.dport.to_be_bytes());
            tcp[4..8].copy_from_slice(&args.validation[0].to_be_bytes()); // seq = V[0]
            tcp[8..12].copy_from_slice(&0u32.to_be_bytes()); // ack_seq
            tcp[12] = 5 << 4; // data offset, no options
            tcp[13] = 0x02; // SYN
            tcp[14..16].copy_from_slice(&65535u16.to_be_bytes()); // window
            tcp[16..18].copy_from_slice(&[0, 0]); // checksum, filled below
            tcp[18..20].copy_from_slice(&0u16.to_be_bytes()); // urgent pointer
        }

        let csum = checksum_with_ipv4_pseudo_header(
            u32::from(saddr),
            u32::from(daddr),
            6,
            &buf[tcp_start..tcp_start + TCP_HEADER_LEN],
        );
        buf[tcp_start + 16..tcp_start + 18].copy_from_slice(&csum.to_be_bytes());

        Ok(total_len)
    }

    fn validate_packet(&self, ip_hdr: &[u8], validation: ValidationWords, ports_cfg: &PortsConfig) -> ValidationOutcome {
        let Some(ip) = Ipv4View::parse(ip_hdr) else { return ValidationOutcome::Invalid };
        if ip.protocol() != 6 {
            return ValidationOutcome::Invalid;
        }
        let Some(payload) = ip.payload() else { return ValidationOutcome::Invalid };
        let Some(tcp) = TcpView::parse(payload) else { return ValidationOutcome::Invalid };

        if tcp.ack_seq().wrapping_sub(1) != validation[0] {
            return ValidationOutcome::Invalid;
        }
        if !ports_cfg.in_source_window(tcp.dport()) {
            return ValidationOutcome::Invalid;
        }
        ValidationOutcome::Valid
    }

    fn process_packet(&self, raw: &[u8], _validation: ValidationWords, _ts_ns: u64) -> ProcessedPacket {
        let ip = Ipv4View::parse(raw);
        let tcp = ip.as_ref().and_then(|ip| ip.payload()).and_then(TcpView::parse);

        match tcp {
            Some(tcp) if tcp.syn() && tcp.ack() => ProcessedPacket {
                classification: "synack".to_string(),
                success: true,
                app_success: true,
                parse_err: false,
                fields: vec![
                    ("classification", FieldValue::Str("synack".to_string())),
                    ("sport", FieldValue::Int(tcp.sport() as i64)),
                    ("window", FieldValue::Int(tcp.window() as i64)),
                ],
            },
            Some(tcp) if tcp.rst() => ProcessedPacket {
                classification: "rst".to_string(),
                success: false,
                app_success: false,
                parse_err: false,
                fields: vec![
                    ("classification", FieldValue::Str("rst".to_string())),
                    ("sport", FieldValue::Int(tcp.sport() as i64)),
                    ("window", FieldValue::Int(tcp.window() as i64)),
                ],
            },
            Some(_) => ProcessedPacket {
                classification: "other".to_string(),
                success: false,
                app_success: false,
                parse_err: false,
                fields: vec![],
            },
            None => ProcessedPacket {
                classification: "unknown".to_string(),
                success: false,
                app_success: false,
                parse_err: true,
                fields: vec![],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_and_validate(ttl: u8, validation: ValidationWords) -> Vec<u8> {
        let module = TcpSynModule::default();
        let mut thread_state = module.thread_init();
        let mut buf = vec![0u8; module.max_packet_length()];
        let prepared = module
            .prepare_packet(&mut buf, [1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1], thread_state.as_mut())
            .unwrap();
        let args = MakePacketArgs {
            saddr: "10.0.0.1".parse().unwrap(),
            daddr: "10.0.0.2".parse().unwrap(),
            dport: 443,
            sport: 40000,
            ttl,
            validation,
            probe_num: 0,
            ip_id: validation[3] as u16,
        };
        let total = module.make_packet(&mut buf, prepared, &args, thread_state.as_mut()).unwrap();
        buf.truncate(total);
        buf
    }

    #[test]
    fn round_trip_validates_as_valid() {
        let validation = [0xDEAD_BEEF, 0x1111, 0x2222, 0x3333];
        let packet = build_and_validate(64, validation);
        let module = TcpSynModule::default();
        let ip_hdr = &packet[ETHERNET_HEADER_LEN..];

        let ports = PortsConfig { source_port_first: 30000, source_port_last: 50000, target_ports: vec![443] };

        // Simulate the response: ack_seq = seq + 1, dest port = our sport.
        let mut response = ip_hdr.to_vec();
        // swap saddr/daddr for the "response" direction
        let (saddr, daddr) = (response[12..16].to_vec(), response[16..20].to_vec());
        response[12..16].copy_from_slice(&daddr);
        response[16..20].copy_from_slice(&saddr);
        let tcp_start = 20;
        // swap ports
        let (sport, dport) = (response[tcp_start..tcp_start + 2].to_vec(), response[tcp_start + 2..tcp_start + 4].to_vec());
        response[tcp_start..tcp_start + 2].copy_from_slice(&dport);
        response[tcp_start + 2..tcp_start + 4].copy_from_slice(&sport);
        response[tcp_start + 8..tcp_start + 12].copy_from_slice(&(validation[0].wrapping_add(1)).to_be_bytes());
        response[tcp_start + 13] = 0x12; // SYN+ACK

        let outcome = module.validate_packet(&response, validation, &ports);
        assert_eq!(outcome, ValidationOutcome::Valid);
    }

    #[test]
    fn mismatched_ack_is_invalid() {
        let validation = [100u32, 200, 300, 400];
        let packet = build_and_validate(64, validation);
        let module = TcpSynModule::default();
        let mut response = packet[ETHERNET_HEADER_LEN..].to_vec();
        let tcp_start = 20;
        response[tcp_start + 8..tcp_start + 12].copy_from_slice(&999u32.to_be_bytes());

        let ports = PortsConfig { source_port_first: 0, source_port_last: 65535, target_ports: vec![443] };
        let outcome = module.validate_packet(&response, validation, &ports);
        assert_eq!(outcome, ValidationOutcome::Invalid);
    }

    #[test]
    fn synack_classifies_as_success() {
        let module = TcpSynModule::default();
        let validation = [1u32, 2, 3, 4];
        let packet = build_and_validate(64, validation);
        let mut ip_hdr = packet[ETHERNET_HEADER_LEN..].to_vec();
        ip_hdr[20 + 13] = 0x12; // SYN+ACK
        ip_hdr[20 + 14..20 + 16].copy_from_slice(&29200u16.to_be_bytes());
        let processed = module.process_packet(&ip_hdr, validation, 0);
        assert!(processed.success);
        assert_eq!(processed.classification, "synack");
        let window = processed.fields.iter().find(|(name, _)| *name == "window").map(|(_, v)| v);
        assert_eq!(window, Some(&FieldValue::Int(29200)));
    }

    #[test]
    fn rst_reports_its_window_too() {
        let module = TcpSynModule::default();
        let validation = [1u32, 2, 3, 4];
        let packet = build_and_validate(64, validation);
        let mut ip_hdr = packet[ETHERNET_HEADER_LEN..].to_vec();
        ip_hdr[20 + 13] = 0x04; // RST
        ip_hdr[20 + 14..20 + 16].copy_from_slice(&0u16.to_be_bytes());
        let processed = module.process_packet(&ip_hdr, validation, 0);
        assert_eq!(processed.classification, "rst");
        let window = processed.fields.iter().find(|(name, _)| *name == "window").map(|(_, v)| v);
        assert_eq!(window, Some(&FieldValue::Int(0)));
    }
}
