//! The single JSON record emitted at guest termination.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::procfs::{HostIoStats, HostMemoryStats};

/// Field order here is the JSON key order the report is emitted with —
/// `serde_json` serializes structs in declaration order.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Report {
    pub instructions: u64,
    pub memory_peak_kb: u64,
    pub memory_rss_kb: u64,
    pub memory_hwm_kb: u64,
    pub memory_data_kb: u64,
    pub memory_stack_kb: u64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub guest_mmap_bytes: u64,
    pub guest_mmap_peak: u64,
    pub guest_heap_bytes: u64,
    pub limit_reached: bool,
    pub syscalls: u64,
    pub syscall_cost: u64,
    pub syscall_breakdown: BTreeMap<String, u64>,
}

#[allow(clippy::too_many_arguments)]
impl Report {
    pub fn new(
        instructions: u64,
        memory: HostMemoryStats,
        io: HostIoStats,
        guest_mmap_bytes: u64,
        guest_mmap_peak: u64,
        guest_heap_bytes: u64,
        limit_reached: bool,
        syscalls: u64,
        syscall_cost: u64,
        syscall_breakdown: BTreeMap<String, u64>,
    ) -> Self {
        Self {
            instructions,
            memory_peak_kb: memory.peak_kb,
            memory_rss_kb: memory.rss_kb,
            memory_hwm_kb: memory.hwm_kb,
            memory_data_kb: memory.data_kb,
            memory_stack_kb: memory.stack_kb,
            io_read_bytes: io.read_bytes,
            io_write_bytes: io.write_bytes,
            guest_mmap_bytes,
            guest_mmap_peak,
            guest_heap_bytes,
            limit_reached,
            syscalls,
            syscall_cost,
            syscall_breakdown,
        }
    }

    /// The report text as written to the diagnostic stream: a leading newline
    /// followed by one JSON object.
    pub fn to_diagnostic_string(&self) -> String {
        format!(
            "\n{}\n",
            serde_json::to_string(self).expect("Report serialization cannot fail")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_matches_spec() {
        let report = Report::new(
            1,
            HostMemoryStats::default(),
            HostIoStats::default(),
            0,
            0,
            0,
            false,
            0,
            0,
            BTreeMap::new(),
        );
        // serde_json::Value sorts keys on parse, so check the order in the raw
        // serialized text instead of round-tripping through a `Value`.
        let text = report.to_diagnostic_string();
        let keys = [
            "instructions",
            "memory_peak_kb",
            "memory_rss_kb",
            "memory_hwm_kb",
            "memory_data_kb",
            "memory_stack_kb",
            "io_read_bytes",
            "io_write_bytes",
            "guest_mmap_bytes",
            "guest_mmap_peak",
            "guest_heap_bytes",
            "limit_reached",
            "syscalls",
            "syscall_cost",
            "syscall_breakdown",
        ];
        let positions: Vec<usize> = keys
            .iter()
            .map(|k| text.find(&format!("\"{k}\"")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        let _: serde_json::Value = serde_json::from_str(&text).expect("report must be valid JSON");
    }

    #[test]
    fn diagnostic_string_is_newline_prefixed() {
        let report = Report::new(
            0,
            HostMemoryStats::default(),
            HostIoStats::default(),
            0,
            0,
            0,
            false,
            0,
            0,
            BTreeMap::new(),
        );
        assert!(report.to_diagnostic_string().starts_with('\n'));
    }
}
