//! ABI-agnostic metering engine for a QEMU TCG plugin that counts guest
//! instructions and syscalls from `main` (or an equivalent start address)
//! onward, and emits a single end-of-run JSON report.
//!
//! This crate knows nothing about the QEMU plugin ABI; the `qplug` crate
//! wires its FFI callbacks to the [`engine::Engine`] here.

pub mod elf;
pub mod engine;
pub mod options;
pub mod procfs;
pub mod report;
pub mod syscalls;

pub use elf::{resolve_binary_image, BinaryImage};
pub use engine::{Engine, LimitAction, TranslatedBlock, TranslationAction, LIMIT_EXIT_CODE};
pub use options::Options;
pub use report::Report;
