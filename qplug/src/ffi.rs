//! Hand-written bindings for the subset of the QEMU TCG plugin ABI
//! (`qemu-plugin.h`) this engine consumes. No published `qemu-plugin-sys`
//! crate exists in the dependency corpus this workspace draws from, so these
//! live in-tree the way the engine's own `third_party/video-sys` bindings do
//! for a vendor C API.

#![allow(non_camel_case_types)]

use std::os::raw::{c_int, c_void};

pub type qemu_plugin_id_t = u64;

/// The plugin-ABI version this crate was built against. Exported as
/// `qemu_plugin_version` so the host can refuse to load a mismatched plugin.
pub const QEMU_PLUGIN_VERSION: c_int = 2;

/// Opaque host-owned handle; this engine never reads its fields directly.
#[repr(C)]
pub struct qemu_info_t {
    _private: [u8; 0],
}

#[repr(C)]
pub struct qemu_plugin_tb {
    _private: [u8; 0],
}

#[repr(C)]
pub struct qemu_plugin_insn {
    _private: [u8; 0],
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum qemu_plugin_cb_flags {
    QEMU_PLUGIN_CB_NO_REGS = 0,
    QEMU_PLUGIN_CB_R_REGS = 1,
    QEMU_PLUGIN_CB_RW_REGS = 2,
}

pub type qemu_plugin_vcpu_tb_trans_cb_t =
    unsafe extern "C" fn(id: qemu_plugin_id_t, tb: *mut qemu_plugin_tb);

pub type qemu_plugin_vcpu_udata_cb_t = unsafe extern "C" fn(vcpu_index: u32, userdata: *mut c_void);

pub type qemu_plugin_vcpu_syscall_cb_t = unsafe extern "C" fn(
    id: qemu_plugin_id_t,
    vcpu_index: u32,
    num: i64,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
    a6: u64,
    a7: u64,
    a8: u64,
);

pub type qemu_plugin_vcpu_syscall_ret_cb_t =
    unsafe extern "C" fn(id: qemu_plugin_id_t, vcpu_index: u32, num: i64, ret: i64);

pub type qemu_plugin_simple_cb_t = unsafe extern "C" fn(id: qemu_plugin_id_t, userdata: *mut c_void);

extern "C" {
    pub fn qemu_plugin_tb_vaddr(tb: *const qemu_plugin_tb) -> u64;
    pub fn qemu_plugin_tb_n_insns(tb: *const qemu_plugin_tb) -> usize;
    pub fn qemu_plugin_tb_get_insn(tb: *const qemu_plugin_tb, idx: usize) -> *mut qemu_plugin_insn;
    pub fn qemu_plugin_insn_vaddr(insn: *const qemu_plugin_insn) -> u64;

    pub fn qemu_plugin_register_vcpu_tb_trans_cb(
        id: qemu_plugin_id_t,
        cb: qemu_plugin_vcpu_tb_trans_cb_t,
    );
    pub fn qemu_plugin_register_vcpu_tb_exec_cb(
        tb: *mut qemu_plugin_tb,
        cb: qemu_plugin_vcpu_udata_cb_t,
        flags: qemu_plugin_cb_flags,
        userdata: *mut c_void,
    );
    pub fn qemu_plugin_register_vcpu_syscall_cb(
        id: qemu_plugin_id_t,
        cb: qemu_plugin_vcpu_syscall_cb_t,
    );
    pub fn qemu_plugin_register_vcpu_syscall_ret_cb(
        id: qemu_plugin_id_t,
        cb: qemu_plugin_vcpu_syscall_ret_cb_t,
    );
    pub fn qemu_plugin_register_atexit_cb(
        id: qemu_plugin_id_t,
        cb: qemu_plugin_simple_cb_t,
        userdata: *mut c_void,
    );
}
