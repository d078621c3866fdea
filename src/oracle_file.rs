//! Parses blocklist/allowlist files (one CIDR or bare address per line,
//! `#`-prefixed comments and blank lines ignored) into the
//! `AddrRange`/`RangeSetOracle` types `xscan-core` consumes.
//!
//! `xscan-core` deliberately stays file-format-agnostic (its `oracle.rs`
//! doc comment says as much) — this is the bin crate's half of that split.

use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::path::Path;
use xscan_core::oracle::{AddrRange, RangeSetOracle};

fn parse_line(line: &str) -> Result<AddrRange> {
    if let Some((addr, prefix)) = line.split_once('/') {
        let base: Ipv4Addr = addr.trim().parse().with_context(|| format!("invalid address '{}'", addr))?;
        let prefix_len: u32 = prefix.trim().parse().with_context(|| format!("invalid prefix length '{}'", prefix))?;
        anyhow::ensure!(prefix_len <= 32, "prefix length '{}' out of range", prefix_len);
        let base = u32::from(base);
        let host_bits = 32 - prefix_len;
        let mask = if host_bits == 32 { 0 } else { !0u32 << host_bits };
        let start = base & mask;
        let size = if host_bits == 32 { 1u64 << 32 } else { 1u64 << host_bits };
        let end = start as u64 + size;
        Ok(AddrRange { start, end: end.min(u32::MAX as u64 + 1) as u32 })
    } else {
        let addr: Ipv4Addr = line.trim().parse().with_context(|| format!("invalid address '{}'", line))?;
        let v = u32::from(addr);
        Ok(AddrRange { start: v, end: v.saturating_add(1) })
    }
}

/// Read a blocklist/allowlist file into its constituent ranges, skipping
/// blank lines and `#` comments.
pub fn load_ranges(path: &Path) -> Result<Vec<AddrRange>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read range file: {}", path.display()))?;
    let mut ranges = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        ranges.push(parse_line(line).with_context(|| format!("{}:{}", path.display(), lineno + 1))?);
    }
    Ok(ranges)
}

/// Build the final scan oracle from optional allowlist/blocklist files.
/// With neither given, every IPv4 address is in scope.
pub fn build_oracle(allowlist_file: Option<&Path>, blocklist_file: Option<&Path>) -> Result<RangeSetOracle> {
    let allow_ranges = match allowlist_file {
        Some(p) => load_ranges(p)?,
        None => vec![AddrRange { start: 0, end: u32::MAX }],
    };
    let block_ranges = match blocklist_file {
        Some(p) => load_ranges(p)?,
        None => Vec::new(),
    };

    if block_ranges.is_empty() {
        return Ok(RangeSetOracle::from_ranges(allow_ranges));
    }

    let merged_allow = merge(allow_ranges);
    let merged_block = merge(block_ranges);
    let final_ranges = range_difference(&merged_allow, &merged_block);
    Ok(RangeSetOracle::from_ranges(final_ranges))
}

fn merge(mut ranges: Vec<AddrRange>) -> Vec<AddrRange> {
    ranges.retain(|r| !r.is_empty());
    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<AddrRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        if let Some(last) = merged.last_mut() {
            if r.start <= last.end {
                last.end = last.end.max(r.end);
                continue;
            }
        }
        merged.push(r);
    }
    merged
}

/// Compute `allow - block` over two already-sorted, non-overlapping range
/// lists, via a linear sweep (both inputs are small compared to the
/// address space they describe, since they come from hand-maintained
/// files).
fn range_difference(allow: &[AddrRange], block: &[AddrRange]) -> Vec<AddrRange> {
    let mut out = Vec::new();
    let mut bi = 0;
    for a in allow {
        let mut cur_start = a.start;
        while bi < block.len() && block[bi].end <= cur_start {
            bi += 1;
        }
        let mut j = bi;
        while j < block.len() && block[j].start < a.end {
            let b = block[j];
            if b.start > cur_start {
                out.push(AddrRange { start: cur_start, end: b.start });
            }
            cur_start = cur_start.max(b.end);
            if cur_start >= a.end {
                break;
            }
            j += 1;
        }
        if cur_start < a.end {
            out.push(AddrRange { start: cur_start, end: a.end });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use xscan_core::oracle::BlocklistOracle;

    #[test]
    fn parse_line_handles_cidr_and_bare_address() {
        assert_eq!(parse_line("10.0.0.0/24").unwrap(), AddrRange { start: u32::from(Ipv4Addr::new(10, 0, 0, 0)), end: u32::from(Ipv4Addr::new(10, 0, 1, 0)) });
        assert_eq!(parse_line("10.0.0.5").unwrap(), AddrRange { start: u32::from(Ipv4Addr::new(10, 0, 0, 5)), end: u32::from(Ipv4Addr::new(10, 0, 0, 6)) });
    }

    #[test]
    fn range_difference_carves_a_hole() {
        let allow = vec![AddrRange { start: 0, end: 100 }];
        let block = vec![AddrRange { start: 20, end: 30 }];
        let result = range_difference(&allow, &block);
        assert_eq!(result, vec![AddrRange { start: 0, end: 20 }, AddrRange { start: 30, end: 100 }]);
    }

    #[test]
    fn range_difference_with_block_covering_everything_is_empty() {
        let allow = vec![AddrRange { start: 10, end: 20 }];
        let block = vec![AddrRange { start: 0, end: 100 }];
        assert!(range_difference(&allow, &block).is_empty());
    }

    #[test]
    fn build_oracle_without_files_allows_everything() {
        let oracle = build_oracle(None, None).unwrap();
        assert!(oracle.allowed(Ipv4Addr::new(1, 2, 3, 4)));
        assert!(oracle.allowed(Ipv4Addr::new(255, 255, 255, 254)));
    }
}
