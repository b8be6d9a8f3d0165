//! The metering engine: address rebasing (C2), instruction counting (C3), and
//! the syscall observer (C4), combined into a single process-wide [`Engine`].
//!
//! The host shell (the `qplug` cdylib) owns one `Engine` behind a mutex and
//! feeds it the four events below in the order the plugin ABI delivers them:
//! translation, execution, syscall-enter, syscall-exit. `build_report` runs
//! exactly once, at guest exit.

use std::collections::BTreeMap;

use crate::elf::BinaryImage;
use crate::options::Options;
use crate::procfs::{read_io_stats, read_memory_stats};
use crate::report::Report;
use crate::syscalls::{syscall_name, MAX_TRACKED_SYSCALLS, SYS_BRK, SYS_MMAP, SYS_MUNMAP};

/// Exit code signalling "hard limit enforced", a SIGKILL-equivalent convention
/// the host process uses since the plugin has no finer-grained abort primitive.
pub const LIMIT_EXIT_CODE: i32 = 137;

/// A translated block as the engine needs to see it: where it starts, how
/// many instructions it holds, and (only while `counting` is false) the
/// virtual address of each instruction, used to find the counting gate.
pub struct TranslatedBlock<'a> {
    pub vaddr: u64,
    pub n_insns: u64,
    pub insn_vaddrs: &'a [u64],
}

/// What the engine asks the host shell to do after a translation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationAction {
    /// Don't register an execution callback for this block.
    Skip,
    /// Register an execution callback that adds `n_insns` to `insn_count` on
    /// every traversal of this block.
    RegisterExec { n_insns: u64 },
}

/// What the engine asks the host shell to do after any event that might have
/// raised the hard limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitAction {
    Continue,
    Terminate,
}

pub struct Engine {
    image: BinaryImage,
    options: Options,

    need_base: bool,
    runtime_base: u64,
    start_addr: u64,
    counting: bool,

    insn_count: u64,
    insn_limit: u64,
    limit_reached: bool,

    syscall_count: u64,
    syscall_counts: Vec<u64>,

    guest_mmap_bytes: u64,
    guest_mmap_peak: u64,

    guest_brk_base: u64,
    guest_brk_current: u64,
    guest_brk_initialized: bool,

    report_emitted: bool,
}

impl Engine {
    /// Build the engine from install arguments, resolving the counting gate
    /// per §4.2: `from_start` wins outright, else a missing `main` means
    /// "count everything", else PIE binaries defer to the first translation
    /// event, else the gate is already known.
    pub fn new(image: BinaryImage, options: Options) -> Self {
        let mut engine = Engine {
            counting: false,
            need_base: false,
            runtime_base: 0,
            start_addr: image.main_offset,
            insn_limit: options.limit,
            limit_reached: false,
            insn_count: 0,
            syscall_count: 0,
            syscall_counts: vec![0; MAX_TRACKED_SYSCALLS],
            guest_mmap_bytes: 0,
            guest_mmap_peak: 0,
            guest_brk_base: 0,
            guest_brk_current: 0,
            guest_brk_initialized: false,
            report_emitted: false,
            image,
            options,
        };

        if engine.options.from_start {
            engine.counting = true;
        } else if engine.image.main_offset == 0 {
            engine.counting = true;
        } else if engine.image.is_pie {
            engine.need_base = true;
        }
        // else: non-PIE with a resolved main, start_addr is already set.

        engine
    }

    pub fn counting(&self) -> bool {
        self.counting
    }

    pub fn insn_count(&self) -> u64 {
        self.insn_count
    }

    pub fn limit_reached(&self) -> bool {
        self.limit_reached
    }

    /// C2 + C3's translation-time gating. Runs the rebase step if armed, then
    /// decides whether the translated block should get an execution callback.
    pub fn on_translation(&mut self, tb: TranslatedBlock<'_>) -> TranslationAction {
        if self.need_base {
            self.runtime_base = tb.vaddr.wrapping_sub(self.image.entry_offset);
            self.start_addr = self.runtime_base.wrapping_add(self.image.main_offset);
            self.need_base = false;
        }

        if !self.counting {
            let hits_start = tb.insn_vaddrs.iter().any(|&v| v == self.start_addr);
            if !hits_start {
                return TranslationAction::Skip;
            }
            self.counting = true;
        }

        TranslationAction::RegisterExec { n_insns: tb.n_insns }
    }

    /// C3's execution callback: add the block's precomputed instruction count
    /// and enforce the hard limit.
    pub fn on_tb_exec(&mut self, n_insns: u64) -> LimitAction {
        self.insn_count += n_insns;
        self.check_limit()
    }

    /// C4's syscall-enter handler.
    pub fn on_syscall_enter(&mut self, num: i64, a2: u64) -> LimitAction {
        if !self.counting && !self.options.from_start {
            return LimitAction::Continue;
        }

        self.syscall_count += 1;
        if let Ok(idx) = usize::try_from(num) {
            if idx < self.syscall_counts.len() {
                self.syscall_counts[idx] += 1;
            }
        }

        if num == SYS_MMAP {
            self.guest_mmap_bytes += a2;
            self.guest_mmap_peak = self.guest_mmap_peak.max(self.guest_mmap_bytes);
        } else if num == SYS_MUNMAP {
            self.guest_mmap_bytes = self.guest_mmap_bytes.saturating_sub(a2);
        }

        if self.options.syscall_cost > 0 {
            self.insn_count += self.options.syscall_cost;
            return self.check_limit();
        }

        LimitAction::Continue
    }

    /// C4's syscall-exit handler.
    pub fn on_syscall_exit(&mut self, num: i64, ret: i64) {
        if num == SYS_BRK && ret > 0 {
            let new_brk = ret as u64;
            if !self.guest_brk_initialized {
                self.guest_brk_base = new_brk;
                self.guest_brk_initialized = true;
            }
            self.guest_brk_current = new_brk;
        }
    }

    fn check_limit(&mut self) -> LimitAction {
        if self.insn_limit > 0 && self.insn_count >= self.insn_limit {
            self.limit_reached = true;
            return LimitAction::Terminate;
        }
        LimitAction::Continue
    }

    /// Build the exit-time report. Panics if called more than once: spec §3
    /// invariant 6 requires exactly one report per process lifetime, and a
    /// second call would indicate the host shell registered its atexit hook
    /// twice.
    pub fn build_report(&mut self) -> Report {
        assert!(!self.report_emitted, "report already emitted this run");
        self.report_emitted = true;

        let guest_heap_bytes = if self.guest_brk_initialized && self.guest_brk_current > self.guest_brk_base
        {
            self.guest_brk_current - self.guest_brk_base
        } else {
            0
        };

        let mut breakdown = BTreeMap::new();
        for (num, &count) in self.syscall_counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let key = match syscall_name(num as i64) {
                Some(name) => name.to_string(),
                None => format!("sys_{num}"),
            };
            breakdown.insert(key, count);
        }

        Report::new(
            self.insn_count,
            read_memory_stats(),
            read_io_stats(),
            self.guest_mmap_bytes,
            self.guest_mmap_peak,
            guest_heap_bytes,
            self.limit_reached,
            self.syscall_count,
            self.options.syscall_cost,
            breakdown,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn non_pie(main_offset: u64) -> BinaryImage {
        BinaryImage {
            entry_offset: 0x1000,
            main_offset,
            is_pie: false,
        }
    }

    fn pie(entry_offset: u64, main_offset: u64) -> BinaryImage {
        BinaryImage {
            entry_offset,
            main_offset,
            is_pie: true,
        }
    }

    #[test]
    fn non_pie_gate_is_known_immediately() {
        let engine = Engine::new(non_pie(0x1234), Options::default());
        assert!(!engine.counting());
        assert_eq!(engine.start_addr, 0x1234);
    }

    #[test]
    fn missing_main_counts_everything() {
        let engine = Engine::new(non_pie(0), Options::default());
        assert!(engine.counting());
    }

    #[test]
    fn from_start_counts_immediately_regardless_of_pie() {
        let opts = Options {
            from_start: true,
            ..Default::default()
        };
        let engine = Engine::new(pie(0x7f0000, 0x2000), opts);
        assert!(engine.counting());
    }

    #[test]
    fn pie_gate_resolves_on_first_translation() {
        let mut engine = Engine::new(pie(0x1000, 0x2000), Options::default());
        assert!(engine.need_base);

        // First TB is the real entry, at runtime address 0x7f001000.
        let action = engine.on_translation(TranslatedBlock {
            vaddr: 0x7f001000,
            n_insns: 3,
            insn_vaddrs: &[0x7f001000, 0x7f001001, 0x7f001002],
        });
        assert_eq!(action, TranslationAction::Skip);
        assert!(!engine.need_base);
        assert_eq!(engine.start_addr, 0x7f002000);
        assert!(!engine.counting());

        let action = engine.on_translation(TranslatedBlock {
            vaddr: 0x7f002000,
            n_insns: 5,
            insn_vaddrs: &[0x7f002000, 0x7f002001],
        });
        assert_eq!(action, TranslationAction::RegisterExec { n_insns: 5 });
        assert!(engine.counting());
    }

    #[test]
    fn instruction_count_is_monotonic_and_limit_terminates() {
        let mut engine = Engine::new(non_pie(0), Options {
            limit: 100,
            ..Default::default()
        });
        assert_eq!(engine.on_tb_exec(40), LimitAction::Continue);
        assert_eq!(engine.insn_count(), 40);
        assert_eq!(engine.on_tb_exec(40), LimitAction::Continue);
        assert_eq!(engine.on_tb_exec(40), LimitAction::Terminate);
        assert!(engine.limit_reached());
        assert_eq!(engine.insn_count(), 120);
    }

    #[test]
    fn mmap_peak_tracks_maximum_seen() {
        let mut engine = Engine::new(non_pie(0), Options::default());
        engine.on_syscall_enter(9, 1 << 20);
        engine.on_syscall_enter(9, 2 << 20);
        assert_eq!(engine.guest_mmap_bytes, 3 << 20);
        assert_eq!(engine.guest_mmap_peak, 3 << 20);

        engine.on_syscall_enter(11, 1 << 20);
        assert_eq!(engine.guest_mmap_bytes, 2 << 20);
        assert_eq!(engine.guest_mmap_peak, 3 << 20);
    }

    #[test]
    fn munmap_saturates_at_zero() {
        let mut engine = Engine::new(non_pie(0), Options::default());
        engine.on_syscall_enter(9, 100);
        engine.on_syscall_enter(11, 1000);
        assert_eq!(engine.guest_mmap_bytes, 0);
    }

    #[test]
    fn heap_bytes_is_the_growth_since_first_brk() {
        let mut engine = Engine::new(non_pie(0), Options::default());
        engine.on_syscall_exit(12, 0x5000);
        engine.on_syscall_exit(12, 0x6000);
        let report = engine.build_report();
        assert_eq!(report.guest_heap_bytes, 0x1000);
    }

    #[test]
    fn syscall_cost_adds_virtual_instructions_and_can_trip_the_limit() {
        let mut engine = Engine::new(non_pie(0), Options {
            syscall_cost: 50,
            limit: 1000,
            ..Default::default()
        });
        for _ in 0..19 {
            assert_eq!(engine.on_syscall_enter(39, 0), LimitAction::Continue);
        }
        assert_eq!(engine.on_syscall_enter(39, 0), LimitAction::Terminate);
        assert_eq!(engine.insn_count(), 1000);
    }

    #[test]
    fn syscalls_before_counting_gate_are_not_tallied_by_default() {
        let mut engine = Engine::new(non_pie(0x2000), Options::default());
        engine.on_syscall_enter(0, 0);
        let report = engine.build_report();
        assert_eq!(report.syscalls, 0);
    }

    #[test]
    fn from_start_counts_syscalls_that_precede_the_first_tb() {
        let opts = Options {
            from_start: true,
            ..Default::default()
        };
        let mut engine = Engine::new(non_pie(0x2000), opts);
        engine.on_syscall_enter(257, 0); // openat
        let report = engine.build_report();
        assert_eq!(report.syscalls, 1);
        assert_eq!(report.syscall_breakdown.get("openat"), Some(&1));
    }

    #[test]
    fn report_names_known_and_unknown_syscalls() {
        let mut engine = Engine::new(non_pie(0), Options::default());
        engine.on_syscall_enter(231, 0); // exit_group
        engine.on_syscall_enter(336, 0); // unnamed in our table
        let report = engine.build_report();
        assert_eq!(report.syscall_breakdown.get("exit_group"), Some(&1));
        assert_eq!(report.syscall_breakdown.get("sys_336"), Some(&1));
    }

    #[test]
    #[should_panic(expected = "report already emitted")]
    fn report_is_a_singleton() {
        let mut engine = Engine::new(non_pie(0), Options::default());
        let _ = engine.build_report();
        let _ = engine.build_report();
    }
}
