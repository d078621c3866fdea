//! Send/receive and capture-sink trait contracts.
//!
//! `xscan-core` never opens a raw socket itself — the bin crate owns the
//! platform-specific AF_PACKET/BPF socket setup and hands the core a
//! `Transport` implementation. This mirrors the teacher's writer-trait
//! split (`CaptureWriter` in `capture.rs`): the hot path only ever talks to
//! a trait object, so tests can swap in an in-memory fake.

use std::io;

/// A single raw frame queued for transmission by a sender thread.
pub struct OutgoingFrame {
    pub data: Vec<u8>,
}

/// A single raw frame captured off the wire by the receiver thread.
pub struct IncomingFrame {
    pub data: Vec<u8>,
    pub ts_ns: u64,
}

/// Raw packet I/O, implemented once per platform by the bin crate
/// (AF_PACKET on Linux) and once here for tests/dry-run ([`DryRunTransport`]).
pub trait Transport: Send {
    /// Write one raw Ethernet frame. Must not block past the OS socket
    /// buffer; backpressure here shows up as `send_errors`/`send_blocked`
    /// in `ScanStats`, never as a stall in the rate controller.
    fn send(&mut self, frame: &OutgoingFrame) -> io::Result<()>;

    /// Block until a frame arrives or `timeout_ms` elapses, returning
    /// `Ok(None)` on timeout so the receiver loop can check shutdown
    /// flags between polls.
    fn recv(&mut self, timeout_ms: u64) -> io::Result<Option<IncomingFrame>>;

    /// Submit a full batch (§4.4 "Batching"), retrying each frame up to
    /// `attempts` times on a transient error. Returns the number of
    /// frames ultimately accepted; the sender attributes any shortfall
    /// to `packets_failed`. The default implementation sends frames
    /// one at a time — sufficient for the dry-run/test transport and for
    /// any real transport that doesn't expose a true vectorized send.
    fn send_batch(&mut self, frames: &[OutgoingFrame], attempts: u32) -> io::Result<usize> {
        let mut accepted = 0;
        for frame in frames {
            let mut last_err = None;
            for _ in 0..attempts.max(1) {
                match self.send(frame) {
                    Ok(()) => {
                        accepted += 1;
                        last_err = None;
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            if let Some(e) = last_err {
                if e.kind() != io::ErrorKind::WouldBlock {
                    // Non-transient error: stop submitting the rest of the
                    // batch, the caller will retry on the next cycle.
                    break;
                }
            }
        }
        Ok(accepted)
    }
}

/// An optional sink every captured/sent frame is mirrored to, independent
/// of the scan's actual send/recv path (§4.6, "optional packet capture").
/// Implemented by the bin crate's `capture.rs`; `xscan-core` only needs the
/// contract.
pub trait CaptureSink: Send {
    fn write_sent(&mut self, ts_ns: u64, frame: &OutgoingFrame) -> io::Result<()>;
    fn write_received(&mut self, frame: &IncomingFrame) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// A [`CaptureSink`] that discards everything, used when `--capture` isn't
/// requested so the sender/receiver hot paths don't special-case `Option`.
pub struct NullCaptureSink;

impl CaptureSink for NullCaptureSink {
    fn write_sent(&mut self, _ts_ns: u64, _frame: &OutgoingFrame) -> io::Result<()> {
        Ok(())
    }
    fn write_received(&mut self, _frame: &IncomingFrame) -> io::Result<()> {
        Ok(())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory [`Transport`] for `--dryrun` and for tests: records every
/// frame that would have been sent and never produces a received frame
/// unless one is queued via [`DryRunTransport::queue_incoming`].
pub struct DryRunTransport {
    pub sent: Vec<OutgoingFrame>,
    incoming: std::collections::VecDeque<IncomingFrame>,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self { sent: Vec::new(), incoming: std::collections::VecDeque::new() }
    }

    pub fn queue_incoming(&mut self, frame: IncomingFrame) {
        self.incoming.push_back(frame);
    }
}

impl Default for DryRunTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for DryRunTransport {
    fn send(&mut self, frame: &OutgoingFrame) -> io::Result<()> {
        self.sent.push(OutgoingFrame { data: frame.data.clone() });
        Ok(())
    }

    fn recv(&mut self, _timeout_ms: u64) -> io::Result<Option<IncomingFrame>> {
        Ok(self.incoming.pop_front())
    }
}
