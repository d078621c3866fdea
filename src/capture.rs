//! Optional packet capture sinks: pcap/csv/jsonl mirrors of every sent and
//! received raw frame, rotated into a ring buffer on disk.
//!
//! Keeps the teacher's `RotationState` ring-buffer bookkeeping essentially
//! verbatim — it's already generic over "a directory, an extension, a
//! byte budget, a ring depth" — but drops the teacher's `build_frame`
//! synthetic-wrapper step entirely: `OutgoingFrame`/`IncomingFrame` here
//! already hold a complete, real Ethernet frame, so there's nothing to
//! reconstruct.

use anyhow::{Context, Result};
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::{DataLink, Endianness, TsResolution};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use xscan_core::transport::{CaptureSink, IncomingFrame, OutgoingFrame};

struct RotationState {
    dir: PathBuf,
    stem: &'static str,
    ext: &'static str,
    max_bytes: u64,
    ring_files: usize,
    current_bytes: u64,
    next_gen: u32,
    ring: VecDeque<PathBuf>,
}

impl RotationState {
    fn new(dir: &Path, stem: &'static str, ext: &'static str, rotate_mb: u64, ring_files: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            stem,
            ext,
            max_bytes: rotate_mb * 1024 * 1024,
            ring_files,
            current_bytes: 0,
            next_gen: 1,
            ring: VecDeque::new(),
        }
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.stem, self.ext))
    }

    fn should_rotate(&self, incoming: usize) -> bool {
        self.max_bytes > 0 && self.current_bytes + incoming as u64 > self.max_bytes
    }

    fn rotate(&mut self) -> io::Result<()> {
        let active = self.active_path();
        let archive = self.dir.join(format!("{}.{}.{}", self.stem, self.ext, self.next_gen));
        if active.exists() {
            fs::rename(&active, &archive)?;
            info!("capture: archived {} -> {}", active.display(), archive.display());
        }
        self.ring.push_back(archive);
        self.next_gen += 1;
        self.current_bytes = 0;

        if self.ring.len() > self.ring_files {
            if let Some(old) = self.ring.pop_front() {
                match fs::remove_file(&old) {
                    Ok(()) => info!("capture: deleted old file {}", old.display()),
                    Err(e) => warn!("capture: delete {} failed: {}", old.display(), e),
                }
            }
        }
        Ok(())
    }

    fn account(&mut self, n: usize) {
        self.current_bytes += n as u64;
    }
}

fn ns_pcap_header() -> PcapHeader {
    PcapHeader {
        version_major: 2,
        version_minor: 4,
        ts_correction: 0,
        ts_accuracy: 0,
        snaplen: 65535,
        datalink: DataLink::ETHERNET,
        ts_resolution: TsResolution::NanoSecond,
        endianness: Endianness::native(),
    }
}

fn open_pcap_writer(path: &Path) -> io::Result<PcapWriter<BufWriter<File>>> {
    let file = File::create(path)?;
    PcapWriter::with_header(BufWriter::new(file), ns_pcap_header()).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

pub struct PcapCaptureSink {
    writer: Option<PcapWriter<BufWriter<File>>>,
    rotation: RotationState,
}

impl PcapCaptureSink {
    pub fn new(dir: &Path, stem: &'static str, rotate_mb: u64, ring_files: usize) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create capture directory {}", dir.display()))?;
        let rotation = RotationState::new(dir, stem, "pcap", rotate_mb, ring_files);
        let writer = open_pcap_writer(&rotation.active_path())?;
        Ok(Self { writer: Some(writer), rotation })
    }

    fn write_frame(&mut self, ts_ns: u64, data: &[u8]) -> io::Result<()> {
        if self.rotation.should_rotate(data.len()) {
            // Dropping the PcapWriter flushes its BufWriter before the rename.
            self.writer = None;
            self.rotation.rotate()?;
            self.writer = Some(open_pcap_writer(&self.rotation.active_path())?);
        }
        let timestamp = Duration::new(ts_ns / 1_000_000_000, (ts_ns % 1_000_000_000) as u32);
        if let Some(w) = &mut self.writer {
            let pkt = PcapPacket::new(timestamp, data.len() as u32, data);
            w.write_packet(&pkt).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        }
        self.rotation.account(data.len());
        Ok(())
    }
}

impl CaptureSink for PcapCaptureSink {
    fn write_sent(&mut self, ts_ns: u64, frame: &OutgoingFrame) -> io::Result<()> {
        self.write_frame(ts_ns, &frame.data)
    }

    fn write_received(&mut self, frame: &IncomingFrame) -> io::Result<()> {
        self.write_frame(frame.ts_ns, &frame.data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Shared row shape for the CSV/JSONL capture sinks: a raw frame is just a
/// direction, a timestamp, and the bytes, encoded verbatim as hex.
fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

pub struct CsvCaptureSink {
    writer: csv::Writer<File>,
    rotation: RotationState,
}

impl CsvCaptureSink {
    pub fn new(dir: &Path, stem: &'static str, rotate_mb: u64, ring_files: usize) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create capture directory {}", dir.display()))?;
        let rotation = RotationState::new(dir, stem, "csv", rotate_mb, ring_files);
        let mut writer = csv::Writer::from_path(rotation.active_path())?;
        writer.write_record(["direction", "ts_ns", "len", "data_hex"])?;
        Ok(Self { writer, rotation })
    }

    fn write_row(&mut self, direction: &str, ts_ns: u64, data: &[u8]) -> io::Result<()> {
        let hex = hex_encode(data);
        let row_len = direction.len() + hex.len() + 32;
        if self.rotation.should_rotate(row_len) {
            self.writer.flush()?;
            self.rotation.rotate()?;
            self.writer = csv::Writer::from_path(self.rotation.active_path())?;
            self.writer.write_record(["direction", "ts_ns", "len", "data_hex"])?;
        }
        self.writer
            .write_record([direction, &ts_ns.to_string(), &data.len().to_string(), &hex])
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.rotation.account(row_len);
        Ok(())
    }
}

impl CaptureSink for CsvCaptureSink {
    fn write_sent(&mut self, ts_ns: u64, frame: &OutgoingFrame) -> io::Result<()> {
        self.write_row("sent", ts_ns, &frame.data)
    }

    fn write_received(&mut self, frame: &IncomingFrame) -> io::Result<()> {
        self.write_row("recv", frame.ts_ns, &frame.data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

pub struct JsonlCaptureSink {
    writer: BufWriter<File>,
    rotation: RotationState,
}

impl JsonlCaptureSink {
    pub fn new(dir: &Path, stem: &'static str, rotate_mb: u64, ring_files: usize) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create capture directory {}", dir.display()))?;
        let rotation = RotationState::new(dir, stem, "jsonl", rotate_mb, ring_files);
        let writer = BufWriter::new(File::create(rotation.active_path())?);
        Ok(Self { writer, rotation })
    }

    fn write_line(&mut self, direction: &str, ts_ns: u64, data: &[u8]) -> io::Result<()> {
        let line = format!("{{\"direction\":\"{}\",\"ts_ns\":{},\"len\":{},\"data_hex\":\"{}\"}}\n", direction, ts_ns, data.len(), hex_encode(data));
        if self.rotation.should_rotate(line.len()) {
            self.writer.flush()?;
            self.rotation.rotate()?;
            self.writer = BufWriter::new(File::create(self.rotation.active_path())?);
        }
        self.writer.write_all(line.as_bytes())?;
        self.rotation.account(line.len());
        Ok(())
    }
}

impl CaptureSink for JsonlCaptureSink {
    fn write_sent(&mut self, ts_ns: u64, frame: &OutgoingFrame) -> io::Result<()> {
        self.write_line("sent", ts_ns, &frame.data)
    }

    fn write_received(&mut self, frame: &IncomingFrame) -> io::Result<()> {
        self.write_line("recv", frame.ts_ns, &frame.data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Build one capture sink per caller (one per sender thread plus one for
/// the receiver), all sharing `stem` so their rotated files are
/// distinguishable on disk (`sender0.pcap`, `sender1.pcap`, `receiver.pcap`, ...).
pub fn make_sink(dir: &Path, format: &str, stem: &'static str, rotate_mb: u64, ring_files: usize) -> Result<Box<dyn CaptureSink>> {
    match format {
        "csv" => Ok(Box::new(CsvCaptureSink::new(dir, stem, rotate_mb, ring_files)?)),
        "jsonl" => Ok(Box::new(JsonlCaptureSink::new(dir, stem, rotate_mb, ring_files)?)),
        "pcap" => Ok(Box::new(PcapCaptureSink::new(dir, stem, rotate_mb, ring_files)?)),
        other => anyhow::bail!("unknown capture format '{}' (expected pcap, csv, or jsonl)", other),
    }
}
