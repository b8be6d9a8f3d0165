//! Thin glue between the QEMU TCG plugin ABI ([`ffi`]) and the ABI-agnostic
//! metering engine in `qplug-core`. Everything here is wiring: decode FFI
//! arguments, forward them to the one global [`Engine`], act on what it
//! returns.

mod ffi;

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::Mutex;

use log::warn;
use once_cell::sync::OnceCell;

use qplug_core::{
    resolve_binary_image, BinaryImage, Engine, LimitAction, Options, TranslatedBlock,
    TranslationAction, LIMIT_EXIT_CODE,
};

use ffi::*;

/// Every plugin must export this so the host can refuse a version mismatch.
#[no_mangle]
pub static qemu_plugin_version: c_int = QEMU_PLUGIN_VERSION;

static ENGINE: OnceCell<Mutex<Engine>> = OnceCell::new();

/// Run `f` against the global engine, if it has been installed. A missing
/// engine (install never ran, or ran twice and lost the race) degrades to a
/// no-op rather than panicking the guest process.
fn with_engine<R>(f: impl FnOnce(&mut Engine) -> R) -> Option<R> {
    let cell = ENGINE.get()?;
    let mut guard = cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    Some(f(&mut guard))
}

fn apply_limit(action: LimitAction) {
    if action == LimitAction::Terminate {
        std::process::exit(LIMIT_EXIT_CODE);
    }
}

unsafe extern "C" fn on_tb_trans(_id: qemu_plugin_id_t, tb: *mut qemu_plugin_tb) {
    let vaddr = qemu_plugin_tb_vaddr(tb);
    let n_insns = qemu_plugin_tb_n_insns(tb) as u64;

    // Once the gate is open, no block needs its per-instruction addresses
    // scanned again, so skip collecting them.
    let already_counting = with_engine(|engine| engine.counting()).unwrap_or(true);
    let insn_vaddrs: Vec<u64> = if already_counting {
        Vec::new()
    } else {
        (0..n_insns as usize)
            .map(|i| qemu_plugin_insn_vaddr(qemu_plugin_tb_get_insn(tb, i)))
            .collect()
    };

    let action = with_engine(|engine| {
        engine.on_translation(TranslatedBlock {
            vaddr,
            n_insns,
            insn_vaddrs: &insn_vaddrs,
        })
    });

    if let Some(TranslationAction::RegisterExec { n_insns }) = action {
        qemu_plugin_register_vcpu_tb_exec_cb(
            tb,
            on_tb_exec,
            qemu_plugin_cb_flags::QEMU_PLUGIN_CB_NO_REGS,
            n_insns as usize as *mut c_void,
        );
    }
}

unsafe extern "C" fn on_tb_exec(_vcpu_index: u32, userdata: *mut c_void) {
    let n_insns = userdata as usize as u64;
    if let Some(action) = with_engine(|engine| engine.on_tb_exec(n_insns)) {
        apply_limit(action);
    }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn on_syscall(
    _id: qemu_plugin_id_t,
    _vcpu_index: u32,
    num: i64,
    _a1: u64,
    a2: u64,
    _a3: u64,
    _a4: u64,
    _a5: u64,
    _a6: u64,
    _a7: u64,
    _a8: u64,
) {
    if let Some(action) = with_engine(|engine| engine.on_syscall_enter(num, a2)) {
        apply_limit(action);
    }
}

unsafe extern "C" fn on_syscall_ret(_id: qemu_plugin_id_t, _vcpu_index: u32, num: i64, ret: i64) {
    with_engine(|engine| engine.on_syscall_exit(num, ret));
}

unsafe extern "C" fn on_exit(_id: qemu_plugin_id_t, _userdata: *mut c_void) {
    if let Some(report) = with_engine(|engine| engine.build_report()) {
        eprint!("{}", report.to_diagnostic_string());
    }
}

/// Decode the host's `argc`/`argv` into owned UTF-8 strings. Non-UTF-8 bytes
/// are replaced, never treated as a parse failure — option parsing downstream
/// already tolerates garbage by falling back to defaults.
unsafe fn decode_args(argc: c_int, argv: *const *const c_char) -> Vec<String> {
    if argv.is_null() {
        return Vec::new();
    }
    (0..argc as isize)
        .filter_map(|i| {
            let ptr = *argv.offset(i);
            (!ptr.is_null()).then(|| CStr::from_ptr(ptr).to_string_lossy().into_owned())
        })
        .collect()
}

#[no_mangle]
pub unsafe extern "C" fn qemu_plugin_install(
    id: qemu_plugin_id_t,
    _info: *const qemu_info_t,
    argc: c_int,
    argv: *const *const c_char,
) -> c_int {
    let _ = env_logger::try_init();

    let args = decode_args(argc, argv);
    let options = Options::parse(args.iter().map(String::as_str));

    let image = match &options.binary {
        Some(path) => resolve_binary_image(path),
        None => {
            warn!("no binary= argument given, counting from the first guest instruction");
            BinaryImage::default()
        }
    };

    if ENGINE.set(Mutex::new(Engine::new(image, options))).is_err() {
        warn!("qemu_plugin_install called more than once, ignoring the second call");
        return 0;
    }

    qemu_plugin_register_vcpu_tb_trans_cb(id, on_tb_trans);
    qemu_plugin_register_vcpu_syscall_cb(id, on_syscall);
    qemu_plugin_register_vcpu_syscall_ret_cb(id, on_syscall_ret);
    qemu_plugin_register_atexit_cb(id, on_exit, std::ptr::null_mut());

    0
}
