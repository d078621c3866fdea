//! Progress reporting: either a live-redrawing dashboard (Ctrl-C closes
//! the view, the scan keeps running through its cooldown) or plain
//! one-shot summary lines per tick, driven by
//! `xscan_core::lifecycle::run_scan`'s `on_tick` callback.
//!
//! The live mode keeps the teacher's cursor-rewrite redraw trick
//! (`\x1b[{n}A\x1b[0J`) almost verbatim; what's rendered each tick is a
//! `ScanStatsSnapshot` instead of a shred-feed JSON blob. Unlike the
//! teacher, this doesn't install its own `SIGINT` handler — `main.rs`
//! already owns the process's one `SIGINT` handler (it has to, to stop
//! the scan), so the dashboard instead closes its view in response to
//! that same stop request, via [`Dashboard::close`].

use crate::color;
use std::io::Write;
use xscan_core::monitor::MonitorTick;

fn format_num(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out.chars().rev().collect()
}

fn format_rate(pps: f64) -> String {
    if pps >= 1_000_000.0 {
        format!("{:.2}M", pps / 1_000_000.0)
    } else if pps >= 1_000.0 {
        format!("{:.1}k", pps / 1_000.0)
    } else {
        format!("{:.0}", pps)
    }
}

fn render_lines(tick: &MonitorTick) -> Vec<String> {
    const W: usize = 84;
    let s = &tick.stats;
    let mut out = Vec::new();

    out.push(color::bold(&"=".repeat(W)));
    out.push(color::bold_cyan(&format!("{:^W$}", format!("  XSCAN  —  {:.0}s elapsed  ", s.elapsed_secs))));
    out.push(color::bold(&"=".repeat(W)));

    out.push(color::bold(&format!("{:<16}  {:>12}  {:>12}  {:>12}", "", "SENT", "RECV", "DUPES")));
    out.push(format!(
        "{:<16}  {:>12}  {:>12}  {:>12}",
        "packets",
        format_num(s.packets_sent),
        format_num(s.packets_received),
        format_num(s.duplicate_responses),
    ));
    out.push(format!(
        "{:<16}  {:>12}  {:>12}  {:>12}",
        "rate (pps)",
        format_rate(s.send_rate_pps),
        format_rate(s.recv_rate_pps),
        "",
    ));
    out.push(color::dim(&"-".repeat(W)));

    let success_pct = if s.responses_validated > 0 { 100.0 * s.successes as f64 / s.responses_validated as f64 } else { 0.0 };
    let success_line = format!(
        "validated {}  unvalidated {}  successes {} ({:.1}%)  failures {}",
        format_num(s.responses_validated),
        format_num(s.responses_unvalidated),
        format_num(s.successes),
        success_pct,
        format_num(s.failures),
    );
    out.push(if success_pct >= 50.0 { color::green(&success_line) } else { color::yellow(&success_line) });

    if s.send_errors > 0 || s.send_blocked > 0 {
        out.push(color::red(&format!("send_errors {}  send_blocked {}", format_num(s.send_errors), format_num(s.send_blocked))));
    }
    out.push(color::dim(&format!(
        "senders done {}/{}{}{}",
        tick.senders_done,
        tick.senders_total,
        if tick.cooldown_open { "  (cooldown open)" } else { "" },
        if tick.complete { "  (complete)" } else { "" },
    )));

    out
}

/// One-shot mode: print a plain summary line per tick, suitable for piping
/// to a log file rather than a TTY.
pub fn print_tick_line(tick: &MonitorTick) {
    let s = &tick.stats;
    println!(
        "t={:.0}s sent={} recv={} validated={} successes={} failures={} rate_send={:.0}pps rate_recv={:.0}pps senders={}/{}{}",
        s.elapsed_secs,
        s.packets_sent,
        s.packets_received,
        s.responses_validated,
        s.successes,
        s.failures,
        s.send_rate_pps,
        s.recv_rate_pps,
        tick.senders_done,
        tick.senders_total,
        if tick.complete { " complete" } else { "" },
    );
}

/// Live-redrawing renderer, holding only the line count from its previous
/// draw so the next one can overwrite it in place.
#[derive(Default)]
pub struct Dashboard {
    lines_drawn: usize,
    closed: bool,
}

impl Dashboard {
    pub fn new() -> Self {
        println!("{}", color::bold("XSCAN DASHBOARD  —  Ctrl-C to close the view (scan keeps running)"));
        println!();
        Self { lines_drawn: 0, closed: false }
    }

    pub fn on_tick(&mut self, tick: &MonitorTick) {
        if self.closed {
            return;
        }
        if self.lines_drawn > 0 {
            print!("\x1b[{}A\x1b[0J", self.lines_drawn);
        }
        let lines = render_lines(tick);
        self.lines_drawn = lines.len();
        for line in &lines {
            println!("{}", line);
        }
        std::io::stdout().flush().ok();
    }

    /// Stop redrawing in place once the process's stop signal has been
    /// seen. Idempotent — `main.rs` calls this every tick once the stop
    /// flag is set, not just on the edge.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        println!("{}", color::dim("(view closed, scan finishing cooldown...)"));
        std::io::stdout().flush().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_num_inserts_thousands_separators() {
        assert_eq!(format_num(1234567), "1,234,567");
        assert_eq!(format_num(42), "42");
    }

    #[test]
    fn format_rate_scales_by_magnitude() {
        assert_eq!(format_rate(500.0), "500");
        assert_eq!(format_rate(12_345.0), "12.3k");
        assert_eq!(format_rate(2_500_000.0), "2.50M");
    }
}
