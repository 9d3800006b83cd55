//! EE end-to-end execution scenarios. These compile guest code to host
//! machine code and run it, so they only build on x86-64 hosts.

use psrec_core::{EeCore, EeState, JitConfig};

use crate::common::{addiu, j, mips_itype, mips_rtype, poke32, reset_ram, test_ee_bus};

fn fresh_core() -> EeCore {
    EeCore::new(test_ee_bus(), JitConfig::ee()).expect("RWX region")
}

fn run_block(core: &mut EeCore, state: &mut EeState) {
    // One block's worth of budget: the dispatcher exits once the first
    // block retires its cycles.
    state.cycles_to_run = 1;
    let cycles = core.run(state);
    assert!(cycles > 0);
}

/// Scenario: basic integer ALU arithmetic through the JIT.
#[test]
fn integer_alu_block_executes() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, addiu(2, 0, 5));
    poke32(base + 4, addiu(3, 0, 3));
    poke32(base + 8, mips_rtype(3, 2, 3, 0, 0x20)); // add $v1, $v1, $v0
    poke32(base + 12, j(base + 0x40));
    poke32(base + 16, 0);

    let mut core = fresh_core();
    let mut state = EeState::new_boxed();
    state.pc = base;
    run_block(&mut core, &mut state);

    assert_eq!(state.gpr64(2), 5);
    assert_eq!(state.gpr64(3), 8);
    assert_eq!(state.pc, base + 0x40);
    assert!(state.cycle_count > 0);
}

/// Scenario: a failed branch-likely skips its delay slot.
#[test]
fn branch_likely_not_taken_skips_delay_slot() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, mips_itype(0x14, 0, 1, 0x0002)); // beql $zero, $at, +2
    poke32(base + 4, addiu(2, 0, 7)); // delay slot, must be skipped
    poke32(base + 8, j(base + 0x40));
    poke32(base + 12, 0);

    let mut core = fresh_core();
    let mut state = EeState::new_boxed();
    state.pc = base;
    state.set_gpr64(1, 1); // $at nonzero: branch fails
    run_block(&mut core, &mut state);

    assert_eq!(state.gpr64(2), 0, "delay slot of a failed likely branch ran");
    assert_eq!(state.pc, base + 8);
}

/// The taken form of the same block runs the delay slot and redirects PC.
#[test]
fn branch_likely_taken_executes_delay_slot() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, mips_itype(0x14, 0, 1, 0x0002)); // beql $zero, $at, +2
    poke32(base + 4, addiu(2, 0, 7));
    poke32(base + 8, j(base + 0x40));
    poke32(base + 12, 0);

    let mut core = fresh_core();
    let mut state = EeState::new_boxed();
    state.pc = base;
    state.set_gpr64(1, 0); // $at zero: branch taken
    run_block(&mut core, &mut state);

    assert_eq!(state.gpr64(2), 7);
    assert_eq!(state.pc, base + 4 + (2 << 2));
}

/// Scenario: heap invalidation through the TLB-modified bit. The slow
/// path must free the page's blocks and recompile.
#[test]
fn tlb_modified_page_invalidates_blocks() {
    reset_ram();
    let base = 0x8004_1000;
    poke32(base, addiu(2, 0, 1));
    poke32(base + 4, j(base + 0x40));
    poke32(base + 8, 0);

    let mut core = fresh_core();
    let mut state = EeState::new_boxed();
    state.pc = base;
    run_block(&mut core, &mut state);
    assert!(core.has_block(base));
    assert!(core.lookup_cache_hit(base));

    // The host reports a write into the page; the next slow-path lookup
    // must invalidate before resolving.
    state.set_tlb_modified(base >> 12);
    // Patch the guest code so a recompile is observable.
    poke32(base, addiu(2, 0, 9));

    state.pc = base;
    let code = core.exec_block(&mut state);
    assert!(!code.is_null());
    assert!(!state.tlb_modified(base >> 12), "flag must be consumed");
    assert!(core.has_block(base));

    state.pc = base;
    run_block(&mut core, &mut state);
    assert_eq!(state.gpr64(2), 9, "stale block survived invalidation");
}

/// Signed division edge cases follow the guest definition, not the host's.
#[test]
fn divide_word_edge_cases() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, mips_rtype(4, 5, 0, 0, 0x1A)); // div $zero, $a0, $a1
    poke32(base + 4, j(base + 0x40));
    poke32(base + 8, 0);

    // INT_MIN / -1 must not fault and produces LO=INT_MIN, HI=0.
    let mut core = fresh_core();
    let mut state = EeState::new_boxed();
    state.pc = base;
    state.set_gpr64(4, 0x8000_0000);
    state.set_gpr64(5, 0xFFFF_FFFF);
    run_block(&mut core, &mut state);
    assert_eq!(state.lo, 0xFFFF_FFFF_8000_0000);
    assert_eq!(state.hi, 0);

    // Divide by zero: LO = -1 for a positive dividend, HI = dividend.
    let mut state = EeState::new_boxed();
    state.pc = base;
    state.set_gpr64(4, 25);
    state.set_gpr64(5, 0);
    let mut core = fresh_core();
    run_block(&mut core, &mut state);
    assert_eq!(state.lo, u64::MAX);
    assert_eq!(state.hi, 25);
}

/// Memory round trip through the accessor ABI path.
#[test]
fn load_store_roundtrip() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, mips_itype(0x23, 4, 2, 0x0000)); // lw $v0, 0($a0)
    poke32(base + 4, mips_itype(0x2B, 4, 2, 0x0010)); // sw $v0, 16($a0)
    poke32(base + 8, j(base + 0x40));
    poke32(base + 12, 0);
    poke32(0x0020_0000, 0xCAFE_F00D);

    let mut core = fresh_core();
    let mut state = EeState::new_boxed();
    state.pc = base;
    state.set_gpr64(4, 0x0020_0000);
    run_block(&mut core, &mut state);

    assert_eq!(state.gpr64(2), 0xFFFF_FFFF_CAFE_F00D, "lw sign-extends");
    assert_eq!(crate::common::peek32(0x0020_0010), 0xCAFE_F00D);
}

/// SYSCALL routes through the host handler and redirects PC.
#[test]
fn syscall_reaches_handler() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, mips_rtype(0, 0, 0, 0, 0x0C));

    let mut core = fresh_core();
    let mut state = EeState::new_boxed();
    state.pc = base;
    run_block(&mut core, &mut state);

    assert_eq!(crate::common::syscall_count(), 1);
    assert_eq!(state.pc, 0x8000_0180);
}

/// Unknown opcodes reach the interpreter fallback with the raw word.
#[test]
fn fallback_interpreter_receives_word() {
    reset_ram();
    let base = 0x0010_0000;
    let bogus = 0x7000_0000;
    poke32(base, bogus);
    poke32(base + 4, j(base + 0x40));
    poke32(base + 8, 0);

    let mut core = fresh_core();
    let mut state = EeState::new_boxed();
    state.pc = base;
    run_block(&mut core, &mut state);

    assert_eq!(crate::common::fallback_words(), vec![bogus]);
}
