//! C-callable surface for the recompiler cores.
//!
//! Host emulators written in other languages construct the cores through
//! these functions and drive them once per scheduler slice. Handles are
//! opaque boxed pointers; the guest state structs are `repr(C)` and shared
//! by layout with the host.
//!
//! Every function is `unsafe` from the Rust side: the host is responsible
//! for passing live pointers created by the corresponding constructors.

use psrec_core::{crc32c, EeBus, EeCore, EeState, JitConfig, VuBus, VuCore, VuState};

/// Creates an EE core over the host interface.
///
/// Returns null when the RWX region cannot be mapped.
///
/// # Safety
///
/// `bus` must point at a fully populated interface table.
#[no_mangle]
pub unsafe extern "C" fn psrec_ee_new(bus: *const EeBus) -> *mut EeCore {
    match EeCore::new(*bus, JitConfig::ee()) {
        Ok(core) => Box::into_raw(Box::new(core)),
        Err(err) => {
            tracing::error!("psrec_ee_new: {err}");
            std::ptr::null_mut()
        }
    }
}

/// Destroys an EE core.
///
/// # Safety
///
/// `core` must come from [`psrec_ee_new`] and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn psrec_ee_delete(core: *mut EeCore) {
    if !core.is_null() {
        drop(Box::from_raw(core));
    }
}

/// Executes until `cycles_to_run` expires; returns cycles consumed by the
/// last block.
///
/// # Safety
///
/// Both pointers must be live; the state must outlive the call.
#[no_mangle]
pub unsafe extern "C" fn psrec_ee_run(core: *mut EeCore, state: *mut EeState) -> u16 {
    (*core).run(&mut *state)
}

/// Resets allocator state; optionally flushes the JIT heap and rebuilds
/// the prologue on the next run.
///
/// # Safety
///
/// `core` must be live.
#[no_mangle]
pub unsafe extern "C" fn psrec_ee_reset(core: *mut EeCore, clear_cache: bool) {
    (*core).reset(clear_cache);
}

/// Creates a VU core over the host interface.
///
/// # Safety
///
/// `bus` must point at a fully populated interface table.
#[no_mangle]
pub unsafe extern "C" fn psrec_vu_new(bus: *const VuBus) -> *mut VuCore {
    match VuCore::new(*bus, JitConfig::vu()) {
        Ok(core) => Box::into_raw(Box::new(core)),
        Err(err) => {
            tracing::error!("psrec_vu_new: {err}");
            std::ptr::null_mut()
        }
    }
}

/// Destroys a VU core.
///
/// # Safety
///
/// `core` must come from [`psrec_vu_new`] and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn psrec_vu_delete(core: *mut VuCore) {
    if !core.is_null() {
        drop(Box::from_raw(core));
    }
}

/// Executes VU code from the state's PC; returns cycles consumed by the
/// last block.
///
/// # Safety
///
/// Both pointers must be live.
#[no_mangle]
pub unsafe extern "C" fn psrec_vu_run(core: *mut VuCore, state: *mut VuState) -> u16 {
    (*core).run(&mut *state)
}

/// Resets VU allocator state; optionally flushes the JIT heap.
///
/// # Safety
///
/// `core` must be live.
#[no_mangle]
pub unsafe extern "C" fn psrec_vu_reset(core: *mut VuCore, clear_cache: bool) {
    (*core).reset(clear_cache);
}

/// Installs the checksum of a freshly uploaded microprogram; a changed
/// value discards allocator state so stale blocks never match.
///
/// # Safety
///
/// `core` must be live.
#[no_mangle]
pub unsafe extern "C" fn psrec_vu_set_current_program(core: *mut VuCore, crc: u32) {
    (*core).set_current_program(crc);
}

/// CRC-32C helper for hosts that upload microprograms: checksums
/// `len` bytes at `data`.
///
/// # Safety
///
/// `data` must be readable for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn psrec_crc32c(data: *const u8, len: usize) -> u32 {
    crc32c(std::slice::from_raw_parts(data, len))
}
