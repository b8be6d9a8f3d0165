//! Best-effort host process metrics from `/proc/self/status` and `/proc/self/io`.
//! Absence of either file, or of a field inside it, zeroes the relevant fields —
//! these are complementary numbers for the report, never load-bearing.

use std::fs;

use log::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostMemoryStats {
    pub peak_kb: u64,
    pub rss_kb: u64,
    pub hwm_kb: u64,
    pub data_kb: u64,
    pub stack_kb: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostIoStats {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

pub fn read_memory_stats() -> HostMemoryStats {
    let Ok(contents) = fs::read_to_string("/proc/self/status") else {
        debug!("/proc/self/status unavailable, host memory stats will read zero");
        return HostMemoryStats::default();
    };
    parse_memory_stats(&contents)
}

pub fn read_io_stats() -> HostIoStats {
    let Ok(contents) = fs::read_to_string("/proc/self/io") else {
        debug!("/proc/self/io unavailable, host io stats will read zero");
        return HostIoStats::default();
    };
    parse_io_stats(&contents)
}

fn parse_memory_stats(contents: &str) -> HostMemoryStats {
    let mut stats = HostMemoryStats::default();
    for line in contents.lines() {
        if let Some(v) = field_kb(line, "VmPeak:") {
            stats.peak_kb = v;
        } else if let Some(v) = field_kb(line, "VmRSS:") {
            stats.rss_kb = v;
        } else if let Some(v) = field_kb(line, "VmHWM:") {
            stats.hwm_kb = v;
        } else if let Some(v) = field_kb(line, "VmData:") {
            stats.data_kb = v;
        } else if let Some(v) = field_kb(line, "VmStk:") {
            stats.stack_kb = v;
        }
    }
    stats
}

fn parse_io_stats(contents: &str) -> HostIoStats {
    let mut stats = HostIoStats::default();
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("rchar:") {
            stats.read_bytes = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("wchar:") {
            stats.write_bytes = rest.trim().parse().unwrap_or(0);
        }
    }
    stats
}

/// `line` looks like `"VmPeak:\t  1234 kB"`; extract the numeric field if `prefix` matches.
fn field_kb(line: &str, prefix: &str) -> Option<u64> {
    let rest = line.strip_prefix(prefix)?;
    rest.split_whitespace().next()?.parse().ok()
}
