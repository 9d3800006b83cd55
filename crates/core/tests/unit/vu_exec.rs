//! VU end-to-end execution scenarios (x86-64 hosts only).

use psrec_core::{JitConfig, VfReg, VuCore};

use crate::common::{test_vu_bus, VuMemory, VU_EBIT, VU_LOWER_NOP, VU_UPPER_NOP};

fn fresh_core() -> VuCore {
    VuCore::new(test_vu_bus(), JitConfig::vu()).expect("RWX region")
}

/// Appends the standard two-pair E-bit epilogue at `addr`.
fn poke_end(mem: &mut VuMemory, addr: usize) {
    mem.poke_pair(addr, VU_UPPER_NOP | VU_EBIT, VU_LOWER_NOP);
    mem.poke_pair(addr + 8, VU_UPPER_NOP, VU_LOWER_NOP);
}

/// Scenario: divide by +0 produces +MAX_FLT in the pending Q instance.
#[test]
fn divide_by_positive_zero_saturates() {
    let mut mem = VuMemory::new();
    // DIV Q, vf0.x, vf0.y with vf0 = (1.0, +0.0, 0, 1)
    let div = 0x8000_03BC | (1 << 23);
    mem.poke_pair(0, VU_UPPER_NOP, div);
    poke_end(&mut mem, 8);

    let mut state = mem.state();
    state.gpr[0] = VfReg::from_floats(1.0, 0.0, 0.0, 1.0);
    let mut core = fresh_core();
    let cycles = core.run(&mut state);

    assert!(cycles > 0);
    assert_eq!(state.new_q_instance.bits[0], 0x7F7F_FFFF);
    // The E-bit drain also surfaced the result in Q.
    assert_eq!(state.q_reg.bits[0], 0x7F7F_FFFF);
}

/// A divide by -0 saturates negative instead.
#[test]
fn divide_by_negative_zero_saturates_negative() {
    let mut mem = VuMemory::new();
    let div = 0x8000_03BC | (1 << 23);
    mem.poke_pair(0, VU_UPPER_NOP, div);
    poke_end(&mut mem, 8);

    let mut state = mem.state();
    state.gpr[0] = VfReg::from_floats(1.0, -0.0, 0.0, 1.0);
    let mut core = fresh_core();
    let _ = core.run(&mut state);

    assert_eq!(state.new_q_instance.bits[0], 0xFF7F_FFFF);
}

/// Scenario: XGKICK while the GIF is busy stalls and exits the block.
#[test]
fn xgkick_stalls_on_busy_gif() {
    let mut mem = VuMemory::new();
    // XGKICK vi5
    let kick = 0x8000_06FC | (5 << 11);
    mem.poke_pair(0, VU_UPPER_NOP, kick);
    poke_end(&mut mem, 8);

    let mut state = mem.state();
    state.int_gpr[5] = 0x0123;
    state.transferring_gif = 1;
    let old_gif_addr = state.gif_addr;
    let mut core = fresh_core();
    let _ = core.run(&mut state);

    assert_eq!(state.xgkick_stall, 1);
    assert_eq!(state.stalled_gif_addr, (0x0123 << 4) & 0x3FFF);
    assert_eq!(state.gif_addr, old_gif_addr, "active transfer must not be clobbered");
    // The block bailed out right after the kick.
    assert_eq!(state.pc, 8);
}

/// With the GIF idle the same kick starts a transfer.
#[test]
fn xgkick_starts_transfer_when_idle() {
    let mut mem = VuMemory::new();
    let kick = 0x8000_06FC | (5 << 11);
    mem.poke_pair(0, VU_UPPER_NOP, kick);
    poke_end(&mut mem, 8);

    let mut state = mem.state();
    state.int_gpr[5] = 0x0040;
    let mut core = fresh_core();
    let _ = core.run(&mut state);

    assert_eq!(state.transferring_gif, 1);
    assert_eq!(state.gif_addr, 0x0040 << 4);
    assert_eq!(state.xgkick_stall, 0);
}

/// Round trip: FTOI4 of ITOF4 is the identity for integers whose scaled
/// float representation is exact.
#[test]
fn fixed_float_roundtrip_scale_4() {
    let mut mem = VuMemory::new();
    // Special-family encoding: op bits [6:2] land in word bits [10:6],
    // op bits [1:0] in the 0x3C-0x3F low group.
    // ITOF4.xyzw vf2, vf1
    let itof4 = (0xF << 21) | (2 << 16) | (1 << 11) | (((0x11 >> 2) & 0x1F) << 6) | 0x3D;
    // FTOI4.xyzw vf3, vf2
    let ftoi4 = (0xF << 21) | (3 << 16) | (2 << 11) | (((0x15 >> 2) & 0x1F) << 6) | 0x3D;
    mem.poke_pair(0, itof4, VU_LOWER_NOP);
    mem.poke_pair(8, ftoi4, VU_LOWER_NOP);
    poke_end(&mut mem, 16);

    let mut state = mem.state();
    let ints = [48i32, -32, 160, 0];
    state.gpr[1] = VfReg {
        bits: [
            ints[0] as u32,
            ints[1] as u32,
            ints[2] as u32,
            ints[3] as u32,
        ],
    };
    let mut core = fresh_core();
    let _ = core.run(&mut state);

    assert_eq!(state.gpr[3].bits, state.gpr[1].bits);
    // And the intermediate floats carry the 1/16 scale.
    assert_eq!(state.gpr[2].lane(0), 3.0);
    assert_eq!(state.gpr[2].lane(1), -2.0);
}

/// Vector add with a field mask only touches the enabled lanes.
#[test]
fn field_mask_preserves_disabled_lanes() {
    let mut mem = VuMemory::new();
    // ADD.xy vf3, vf1, vf2
    let add = (0xC << 21) | (2 << 16) | (1 << 11) | (3 << 6) | 0x28;
    mem.poke_pair(0, add, VU_LOWER_NOP);
    poke_end(&mut mem, 8);

    let mut state = mem.state();
    state.gpr[1] = VfReg::from_floats(1.0, 2.0, 3.0, 4.0);
    state.gpr[2] = VfReg::from_floats(10.0, 20.0, 30.0, 40.0);
    state.gpr[3] = VfReg::from_floats(-1.0, -1.0, -1.0, -1.0);
    let mut core = fresh_core();
    let _ = core.run(&mut state);

    assert_eq!(state.gpr[3].lane(0), 11.0);
    assert_eq!(state.gpr[3].lane(1), 22.0);
    assert_eq!(state.gpr[3].lane(2), -1.0, "masked lane changed");
    assert_eq!(state.gpr[3].lane(3), -1.0, "masked lane changed");
}

/// MAC flags materialize sign and zero bits and reach a flag reader once
/// the 4-deep write-back pipeline has carried them through.
#[test]
fn mac_flags_reach_fmand() {
    let mut mem = VuMemory::new();
    // SUB.xyzw vf3, vf1, vf1: result is all zero lanes.
    let sub = (0xF << 21) | (1 << 16) | (1 << 11) | (3 << 6) | 0x2C;
    // FMAND vi1, vi2
    let fmand = (0x1A << 25) | (1 << 16) | (2 << 11);
    mem.poke_pair(0, sub, VU_LOWER_NOP);
    // Four slots for the write-back queue to drain into the visible
    // flag instance.
    for slot in 1..=4 {
        mem.poke_pair(slot * 8, VU_UPPER_NOP, VU_LOWER_NOP);
    }
    mem.poke_pair(40, VU_UPPER_NOP, fmand);
    poke_end(&mut mem, 48);

    let mut state = mem.state();
    state.gpr[1] = VfReg::from_floats(5.0, 6.0, 7.0, 8.0);
    state.int_gpr[2] = 0xFFFF;
    let mut core = fresh_core();
    let _ = core.run(&mut state);

    // All four zero-flag bits set, no sign bits.
    assert_eq!(state.int_gpr[1], 0x000F);
    assert_eq!(crate::common::vu_stop_count(), 1);
}

/// Re-entry with a different program CRC compiles a separate block.
#[test]
fn program_crc_isolates_blocks() {
    let mut mem = VuMemory::new();
    poke_end(&mut mem, 0);

    let mut state = mem.state();
    let mut core = fresh_core();
    let _ = core.run(&mut state);
    let blocks_before = core.block_count();

    state.pc = 0;
    core.set_current_program(0x1234_5678);
    let _ = core.run(&mut state);
    assert_eq!(core.block_count(), blocks_before + 1);
}
