//! Shared test infrastructure.
//!
//! The mock EE bus backs guest memory with a thread-local flat RAM image
//! so the `extern "C"` accessors can reach it without threading a context
//! pointer through the recompiler. Every test runs the core on the thread
//! that owns the image.

use std::cell::RefCell;

use psrec_core::{EeBus, EeState, VuBus, VuState};

/// Flat guest RAM size for EE tests (covers the PCs the scenarios use,
/// mirrored by masking).
pub const RAM_SIZE: usize = 4 * 1024 * 1024;

thread_local! {
    static RAM: RefCell<Vec<u8>> = RefCell::new(vec![0; RAM_SIZE]);
    static SYSCALLS: RefCell<u32> = const { RefCell::new(0) };
    static FALLBACKS: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
}

fn ram_index(addr: u32) -> usize {
    addr as usize & (RAM_SIZE - 1)
}

/// Clears RAM and the call recorders.
pub fn reset_ram() {
    RAM.with(|ram| ram.borrow_mut().fill(0));
    SYSCALLS.with(|counter| *counter.borrow_mut() = 0);
    FALLBACKS.with(|log| log.borrow_mut().clear());
}

/// Writes a guest word into the RAM image.
pub fn poke32(addr: u32, value: u32) {
    RAM.with(|ram| {
        let idx = ram_index(addr);
        ram.borrow_mut()[idx..idx + 4].copy_from_slice(&value.to_le_bytes());
    });
}

/// Reads a guest word back out of the RAM image.
pub fn peek32(addr: u32) -> u32 {
    RAM.with(|ram| {
        let idx = ram_index(addr);
        let bytes: [u8; 4] = ram.borrow()[idx..idx + 4].try_into().unwrap();
        u32::from_le_bytes(bytes)
    })
}

/// Number of syscall-handler invocations since the last reset.
pub fn syscall_count() -> u32 {
    SYSCALLS.with(|counter| *counter.borrow())
}

/// Raw words routed to the interpreter fallback since the last reset.
pub fn fallback_words() -> Vec<u32> {
    FALLBACKS.with(|log| log.borrow().clone())
}

unsafe extern "C" fn read8(_: *mut EeState, addr: u32) -> u8 {
    RAM.with(|ram| ram.borrow()[ram_index(addr)])
}

unsafe extern "C" fn read16(_: *mut EeState, addr: u32) -> u16 {
    RAM.with(|ram| {
        let idx = ram_index(addr);
        u16::from_le_bytes(ram.borrow()[idx..idx + 2].try_into().unwrap())
    })
}

unsafe extern "C" fn read32(_: *mut EeState, addr: u32) -> u32 {
    peek32(addr)
}

unsafe extern "C" fn read64(_: *mut EeState, addr: u32) -> u64 {
    RAM.with(|ram| {
        let idx = ram_index(addr);
        u64::from_le_bytes(ram.borrow()[idx..idx + 8].try_into().unwrap())
    })
}

unsafe extern "C" fn read128(_: *mut EeState, addr: u32, dest: *mut u128) {
    RAM.with(|ram| {
        let idx = ram_index(addr) & !0xF;
        let value = u128::from_le_bytes(ram.borrow()[idx..idx + 16].try_into().unwrap());
        *dest = value;
    });
}

unsafe extern "C" fn write8(_: *mut EeState, addr: u32, value: u8) {
    RAM.with(|ram| ram.borrow_mut()[ram_index(addr)] = value);
}

unsafe extern "C" fn write16(_: *mut EeState, addr: u32, value: u16) {
    RAM.with(|ram| {
        let idx = ram_index(addr);
        ram.borrow_mut()[idx..idx + 2].copy_from_slice(&value.to_le_bytes());
    });
}

unsafe extern "C" fn write32(_: *mut EeState, addr: u32, value: u32) {
    poke32(addr, value);
}

unsafe extern "C" fn write64(_: *mut EeState, addr: u32, value: u64) {
    RAM.with(|ram| {
        let idx = ram_index(addr);
        ram.borrow_mut()[idx..idx + 8].copy_from_slice(&value.to_le_bytes());
    });
}

unsafe extern "C" fn write128(_: *mut EeState, addr: u32, src: *const u128) {
    RAM.with(|ram| {
        let idx = ram_index(addr) & !0xF;
        ram.borrow_mut()[idx..idx + 16].copy_from_slice(&(*src).to_le_bytes());
    });
}

unsafe extern "C" fn syscall_exception(state: *mut EeState) {
    SYSCALLS.with(|counter| *counter.borrow_mut() += 1);
    // Jump to the conventional common-exception vector.
    (*state).pc = 0x8000_0180;
}

unsafe extern "C" fn eret(state: *mut EeState) {
    (*state).pc = 0x0010_0000;
}

unsafe extern "C" fn vu0_wait(_: *mut EeState) -> u8 {
    0
}

unsafe extern "C" fn check_interlock(_: *mut EeState) -> u8 {
    0
}

unsafe extern "C" fn clear_interlock(_: *mut EeState) {}

unsafe extern "C" fn vu0_start_program(_: *mut EeState, _: u32) {}

unsafe extern "C" fn vu0_read_cmsar0(_: *mut EeState) -> u32 {
    0
}

unsafe extern "C" fn fallback(_: *mut EeState, word: u32) {
    FALLBACKS.with(|log| log.borrow_mut().push(word));
}

/// An EE bus wired to the thread-local RAM image.
pub fn test_ee_bus() -> EeBus {
    EeBus {
        read8,
        read16,
        read32,
        read64,
        read128,
        write8,
        write16,
        write32,
        write64,
        write128,
        syscall_exception,
        eret,
        vu0_wait,
        check_interlock,
        clear_interlock,
        vu0_start_program,
        vu0_read_cmsar0,
        fallback,
    }
}

// --- VU harness ----------------------------------------------------------

thread_local! {
    static VU_STOPS: RefCell<u32> = const { RefCell::new(0) };
    static VU_FALLBACKS: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
}

/// Number of stop-handler invocations since the last VU reset.
pub fn vu_stop_count() -> u32 {
    VU_STOPS.with(|counter| *counter.borrow())
}

unsafe extern "C" fn vu_stop(_: *mut VuState) {
    VU_STOPS.with(|counter| *counter.borrow_mut() += 1);
}

unsafe extern "C" fn vu_stop_tbit(state: *mut VuState) {
    vu_stop(state);
}

unsafe extern "C" fn vu_update_xgkick(_: *mut VuState, _: i32) {}

unsafe extern "C" fn vu_clip(_: *mut VuState, _: u32) {}

unsafe extern "C" fn vu_interp_upper(_: *mut VuState, word: u32) {
    VU_FALLBACKS.with(|log| log.borrow_mut().push(word));
}

unsafe extern "C" fn vu_interp_lower(_: *mut VuState, word: u32) {
    VU_FALLBACKS.with(|log| log.borrow_mut().push(word));
}

/// A VU bus with recording no-op handlers.
pub fn test_vu_bus() -> VuBus {
    VU_STOPS.with(|counter| *counter.borrow_mut() = 0);
    VU_FALLBACKS.with(|log| log.borrow_mut().clear());
    VuBus {
        stop: vu_stop,
        stop_tbit: vu_stop_tbit,
        update_xgkick: vu_update_xgkick,
        clip: vu_clip,
        interpreter_upper: vu_interp_upper,
        interpreter_lower: vu_interp_lower,
    }
}

/// VU micro and data memory owned by a test, wired into a state.
pub struct VuMemory {
    /// Instruction memory (16 KiB).
    pub instr: Box<[u8; 0x4000]>,
    /// Data memory (16 KiB).
    pub data: Box<[u8; 0x4000]>,
}

impl VuMemory {
    /// Allocates zeroed VU memories.
    pub fn new() -> Self {
        Self {
            instr: vec![0u8; 0x4000].into_boxed_slice().try_into().unwrap(),
            data: vec![0u8; 0x4000].into_boxed_slice().try_into().unwrap(),
        }
    }

    /// Writes one UPPER/LOWER pair at a byte address.
    pub fn poke_pair(&mut self, addr: usize, upper: u32, lower: u32) {
        self.instr[addr..addr + 4].copy_from_slice(&lower.to_le_bytes());
        self.instr[addr + 4..addr + 8].copy_from_slice(&upper.to_le_bytes());
    }

    /// Builds a VU1-shaped state backed by these memories.
    pub fn state(&mut self) -> Box<VuState> {
        let mut state = VuState::new_boxed(0x3FFF, 1);
        state.instr_mem = self.instr.as_mut_ptr();
        state.data_mem = self.data.as_mut_ptr();
        // vf00 is the architectural constant (0, 0, 0, 1).
        state.gpr[0] = psrec_core::VfReg::from_floats(0.0, 0.0, 0.0, 1.0);
        state
    }
}

impl Default for VuMemory {
    fn default() -> Self {
        Self::new()
    }
}

// --- guest instruction encoding helpers ----------------------------------

/// MIPS I-type encoder.
pub fn mips_itype(op: u32, rs: u32, rt: u32, imm: u16) -> u32 {
    (op << 26) | (rs << 21) | (rt << 16) | u32::from(imm)
}

/// MIPS R-type (SPECIAL) encoder.
pub fn mips_rtype(rs: u32, rt: u32, rd: u32, sa: u32, funct: u32) -> u32 {
    (rs << 21) | (rt << 16) | (rd << 11) | (sa << 6) | funct
}

/// `addiu rt, rs, imm`
pub fn addiu(rt: u32, rs: u32, imm: i16) -> u32 {
    mips_itype(0x09, rs, rt, imm as u16)
}

/// `j target`
pub fn j(target: u32) -> u32 {
    (0x02 << 26) | ((target >> 2) & 0x03FF_FFFF)
}

/// A canonical VU upper NOP.
pub const VU_UPPER_NOP: u32 = 0x0000_02FF;
/// A canonical VU lower NOP (`move vf0, vf0`, discarded by the decoder).
pub const VU_LOWER_NOP: u32 = 0x8000_033C;
/// E-bit flag on an UPPER word.
pub const VU_EBIT: u32 = 1 << 30;
