//! Output record shape: module-defined fields plus the system field set
//! every response carries regardless of probe module (§6 "Output schema").

use chrono::{DateTime, Utc};
use std::net::IpAddr;

/// A single output value. Mirrors the `fielddef` type universe from §6:
/// `string`, `int`, `bool`, `binary`, `repeated`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Binary(Vec<u8>),
    Repeated(Vec<FieldValue>),
}

/// Declares one field a probe module contributes to the output schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int,
    Bool,
    Binary,
    Repeated,
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: &'static str,
    pub field_type: FieldType,
    pub desc: &'static str,
}

/// A response record handed to the output encoder (§3 "Response record",
/// §4.6 step 6). System fields are fixed; `fields` holds whatever the
/// active probe module's `process_packet` populated.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub saddr: IpAddr,
    pub daddr: IpAddr,
    pub sport: u16,
    pub dport: u16,
    pub ipid: u16,
    pub ttl: u8,
    pub classification: String,
    pub success: bool,
    pub app_success: bool,
    pub repeat: bool,
    pub cooldown: bool,
    /// The responder (or, for an ICMP-embedded reply, the embedded
    /// destination) doesn't decode to a target inside the configured scan
    /// space — spoofed, misrouted, or since excluded by the blocklist.
    /// Distinct from `cooldown`: a record can be both, neither, or either.
    pub out_of_space: bool,
    pub parse_err: bool,
    pub timestamp: DateTime<Utc>,
    pub fields: Vec<(&'static str, FieldValue)>,
}

impl ResponseRecord {
    /// Epoch seconds component of `timestamp`, per §6's `timestamp_ts`.
    pub fn timestamp_secs(&self) -> i64 {
        self.timestamp.timestamp()
    }

    /// Microseconds-of-second component, per §6's `timestamp_us`.
    pub fn timestamp_micros(&self) -> u32 {
        self.timestamp.timestamp_subsec_micros()
    }

    /// ISO-8601 rendering, per §6's `timestamp_str`.
    pub fn timestamp_iso8601(&self) -> String {
        self.timestamp.to_rfc3339()
    }
}

/// Where the receiver hands finished records (§4.6 step 6, §6 output
/// schema). Implemented by the bin crate's CSV/JSON encoders; `xscan-core`
/// only needs the contract, mirroring the `Transport`/`CaptureSink` split.
pub trait OutputSink: Send {
    fn write_record(&mut self, record: &ResponseRecord) -> anyhow::Result<()>;
    fn flush(&mut self) -> anyhow::Result<()>;
}

/// An [`OutputSink`] that discards every record, used for `--dryrun` and
/// for tests that only care about side effects on `ScanStats`.
pub struct NullOutputSink;

impl OutputSink for NullOutputSink {
    fn write_record(&mut self, _record: &ResponseRecord) -> anyhow::Result<()> {
        Ok(())
    }
    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An in-memory [`OutputSink`] for tests.
#[derive(Default)]
pub struct VecOutputSink {
    pub records: Vec<ResponseRecord>,
}

impl OutputSink for VecOutputSink {
    fn write_record(&mut self, record: &ResponseRecord) -> anyhow::Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn timestamp_accessors_agree_with_underlying_datetime() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T12:00:00.500000Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = ResponseRecord {
            saddr: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            daddr: IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)),
            sport: 1234,
            dport: 80,
            ipid: 0,
            ttl: 64,
            classification: "synack".into(),
            success: true,
            app_success: false,
            repeat: false,
            cooldown: false,
            out_of_space: false,
            parse_err: false,
            timestamp: ts,
            fields: vec![],
        };
        assert_eq!(record.timestamp_secs(), ts.timestamp());
        assert_eq!(record.timestamp_micros(), 500_000);
        assert!(record.timestamp_iso8601().starts_with("2024-03-01"));
    }
}
