//! Output encoders: turn each `ResponseRecord` into a CSV row or a JSON
//! line, writing the fixed system field set plus whatever the active
//! probe module's `field_schema()` contributed.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, BufWriter, Stdout, Write};
use xscan_core::probe::ProbeModule;
use xscan_core::record::{FieldValue, OutputSink, ResponseRecord};

fn field_value_to_string(value: &FieldValue) -> String {
    match value {
        FieldValue::Str(s) => s.clone(),
        FieldValue::Int(i) => i.to_string(),
        FieldValue::Bool(b) => b.to_string(),
        FieldValue::Binary(bytes) => {
            let mut s = String::with_capacity(bytes.len() * 2);
            for b in bytes {
                s.push_str(&format!("{:02x}", b));
            }
            s
        }
        FieldValue::Repeated(items) => items.iter().map(field_value_to_string).collect::<Vec<_>>().join(";"),
    }
}

fn field_value_to_json(value: &FieldValue) -> serde_json::Value {
    match value {
        FieldValue::Str(s) => serde_json::Value::String(s.clone()),
        FieldValue::Int(i) => serde_json::Value::from(*i),
        FieldValue::Bool(b) => serde_json::Value::Bool(*b),
        FieldValue::Binary(bytes) => {
            let mut s = String::with_capacity(bytes.len() * 2);
            for b in bytes {
                s.push_str(&format!("{:02x}", b));
            }
            serde_json::Value::String(s)
        }
        FieldValue::Repeated(items) => serde_json::Value::Array(items.iter().map(field_value_to_json).collect()),
    }
}

enum Sink {
    Stdout(Stdout),
    File(BufWriter<File>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Stdout(w) => w.write(buf),
            Sink::File(w) => w.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Stdout(w) => w.flush(),
            Sink::File(w) => w.flush(),
        }
    }
}

/// One line of JSON per response record, with the system fields plus the
/// module's schema fields merged into one flat object (§6 output schema).
pub struct JsonlOutputSink {
    out: Sink,
}

impl JsonlOutputSink {
    pub fn new(path: Option<&std::path::Path>) -> Result<Self> {
        let out = match path {
            Some(p) => Sink::File(BufWriter::new(File::create(p).with_context(|| format!("failed to create output file {}", p.display()))?)),
            None => Sink::Stdout(io::stdout()),
        };
        Ok(Self { out })
    }
}

impl OutputSink for JsonlOutputSink {
    fn write_record(&mut self, record: &ResponseRecord) -> Result<()> {
        let mut obj = serde_json::Map::new();
        obj.insert("saddr".into(), serde_json::Value::String(record.saddr.to_string()));
        obj.insert("daddr".into(), serde_json::Value::String(record.daddr.to_string()));
        obj.insert("sport".into(), serde_json::Value::from(record.sport));
        obj.insert("dport".into(), serde_json::Value::from(record.dport));
        obj.insert("ipid".into(), serde_json::Value::from(record.ipid));
        obj.insert("ttl".into(), serde_json::Value::from(record.ttl));
        obj.insert("classification".into(), serde_json::Value::String(record.classification.clone()));
        obj.insert("success".into(), serde_json::Value::Bool(record.success));
        obj.insert("app_success".into(), serde_json::Value::Bool(record.app_success));
        obj.insert("repeat".into(), serde_json::Value::Bool(record.repeat));
        obj.insert("cooldown".into(), serde_json::Value::Bool(record.cooldown));
        obj.insert("out_of_space".into(), serde_json::Value::Bool(record.out_of_space));
        obj.insert("parse_err".into(), serde_json::Value::Bool(record.parse_err));
        obj.insert("timestamp_str".into(), serde_json::Value::String(record.timestamp_iso8601()));
        obj.insert("timestamp_ts".into(), serde_json::Value::from(record.timestamp_secs()));
        obj.insert("timestamp_us".into(), serde_json::Value::from(record.timestamp_micros()));
        for (name, value) in &record.fields {
            obj.insert((*name).to_string(), field_value_to_json(value));
        }
        writeln!(self.out, "{}", serde_json::Value::Object(obj)).context("failed to write output record")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush().context("failed to flush output sink")
    }
}

/// Flat CSV output, one column per system field plus one column per field
/// the active probe module declares in its `field_schema()` — decided
/// once at startup so the header stays stable for the life of the scan.
pub struct CsvOutputSink {
    writer: csv::Writer<Sink>,
    module_fields: Vec<&'static str>,
}

impl CsvOutputSink {
    pub fn new(path: Option<&std::path::Path>, probe: &dyn ProbeModule) -> Result<Self> {
        let out = match path {
            Some(p) => Sink::File(BufWriter::new(File::create(p).with_context(|| format!("failed to create output file {}", p.display()))?)),
            None => Sink::Stdout(io::stdout()),
        };
        let module_fields: Vec<&'static str> = probe.field_schema().iter().map(|f| f.name).collect();

        let mut writer = csv::Writer::from_writer(out);
        let mut header: Vec<&str> = vec![
            "saddr",
            "daddr",
            "sport",
            "dport",
            "ipid",
            "ttl",
            "classification",
            "success",
            "app_success",
            "repeat",
            "cooldown",
            "out_of_space",
            "parse_err",
            "timestamp_str",
            "timestamp_ts",
            "timestamp_us",
        ];
        header.extend(module_fields.iter());
        writer.write_record(&header).context("failed to write CSV header")?;

        Ok(Self { writer, module_fields })
    }
}

impl OutputSink for CsvOutputSink {
    fn write_record(&mut self, record: &ResponseRecord) -> Result<()> {
        let mut row = vec![
            record.saddr.to_string(),
            record.daddr.to_string(),
            record.sport.to_string(),
            record.dport.to_string(),
            record.ipid.to_string(),
            record.ttl.to_string(),
            record.classification.clone(),
            record.success.to_string(),
            record.app_success.to_string(),
            record.repeat.to_string(),
            record.cooldown.to_string(),
            record.out_of_space.to_string(),
            record.parse_err.to_string(),
            record.timestamp_iso8601(),
            record.timestamp_secs().to_string(),
            record.timestamp_micros().to_string(),
        ];
        for name in &self.module_fields {
            let value = record.fields.iter().find(|(n, _)| n == name).map(|(_, v)| field_value_to_string(v)).unwrap_or_default();
            row.push(value);
        }
        self.writer.write_record(&row).context("failed to write CSV row")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush CSV output")
    }
}

pub fn make_output_sink(format: &str, path: Option<&std::path::Path>, probe: &dyn ProbeModule) -> Result<Box<dyn OutputSink>> {
    match format {
        "csv" => Ok(Box::new(CsvOutputSink::new(path, probe)?)),
        "jsonl" => Ok(Box::new(JsonlOutputSink::new(path)?)),
        other => anyhow::bail!("unknown output format '{}' (expected csv or jsonl)", other),
    }
}
