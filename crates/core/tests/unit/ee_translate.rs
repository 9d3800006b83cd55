//! EE translator tests: decode structure, block termination, dependency
//! bookkeeping, and determinism.

use pretty_assertions::assert_eq;

use psrec_core::ee::EeTranslator;
use psrec_core::ir::{Opcode, Operand};
use psrec_core::EeState;

use crate::common::{addiu, j, mips_itype, mips_rtype, poke32, reset_ram, test_ee_bus};

fn translate_at(pc: u32) -> psrec_core::ir::Block {
    let bus = test_ee_bus();
    let mut state = EeState::new_boxed();
    state.pc = pc;
    EeTranslator::new().translate(&mut state, &bus)
}

#[test]
fn integer_alu_block_shape() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, addiu(2, 0, 5));
    poke32(base + 4, addiu(3, 0, 3));
    poke32(base + 8, mips_rtype(3, 2, 3, 0, 0x20)); // add $v1, $v1, $v0
    poke32(base + 12, j(base + 0x20));
    poke32(base + 16, 0); // delay slot NOP

    let block = translate_at(base);
    let ops: Vec<Opcode> = block.iter().map(|i| i.op).collect();
    assert_eq!(
        ops,
        vec![
            Opcode::AddWordImm,
            Opcode::AddWordImm,
            Opcode::AddWordReg,
            Opcode::Jump,
        ]
    );
    // The block covers five guest slots; dual issue compresses the cycles.
    assert!(block.cycle_count() >= 2);
}

#[test]
fn translation_is_deterministic() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, addiu(2, 0, 5));
    poke32(base + 4, mips_itype(0x0D, 2, 4, 0x1234)); // ori $a0, $v0, 0x1234
    poke32(base + 8, mips_rtype(2, 4, 5, 0, 0x2A)); // slt $a1, $v0, $a0
    poke32(base + 12, j(base));
    poke32(base + 16, addiu(6, 0, -1));

    let first = translate_at(base);
    let second = translate_at(base);
    assert_eq!(first, second);
}

#[test]
fn branch_ends_block_after_delay_slot() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, mips_itype(0x04, 2, 3, 0x0004)); // beq $v0, $v1, +4
    poke32(base + 4, addiu(4, 0, 9)); // delay slot
    poke32(base + 8, addiu(5, 0, 1)); // must not be translated

    let block = translate_at(base);
    let ops: Vec<Opcode> = block.iter().map(|i| i.op).collect();
    assert_eq!(ops, vec![Opcode::BranchEqual, Opcode::AddWordImm]);

    let branch = block.iter().next().unwrap();
    assert_eq!(branch.jump_dest, base + 4 + (4 << 2));
    assert_eq!(branch.jump_fail_dest, base + 8);
    assert!(!branch.is_likely);
}

#[test]
fn likely_branch_sets_flag() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, mips_itype(0x14, 0, 1, 0x0002)); // beql $zero, $at, +2
    poke32(base + 4, addiu(2, 0, 7));

    let block = translate_at(base);
    let branch = block.iter().next().unwrap();
    assert_eq!(branch.op, Opcode::BranchEqualZero);
    assert!(branch.is_likely);
}

#[test]
fn beq_against_zero_uses_zero_form() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, mips_itype(0x04, 7, 0, 0x0001)); // beq $t0, $zero, +1
    poke32(base + 4, 0);

    let block = translate_at(base);
    let branch = block.iter().next().unwrap();
    assert_eq!(branch.op, Opcode::BranchEqualZero);
    assert_eq!(branch.source, Operand::Reg(7));
}

#[test]
fn syscall_terminates_without_delay_slot() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, mips_rtype(0, 0, 0, 0, 0x0C)); // syscall
    poke32(base + 4, addiu(2, 0, 5)); // next block, not this one

    let block = translate_at(base);
    let ops: Vec<Opcode> = block.iter().map(|i| i.op).collect();
    assert_eq!(ops, vec![Opcode::SystemCall]);
}

#[test]
fn unknown_opcode_becomes_fallback() {
    reset_ram();
    let base = 0x0010_0000;
    let bogus = 0x7000_0000; // MMI-adjacent encoding with no native lowering
    poke32(base, bogus);
    poke32(base + 4, j(base));
    poke32(base + 8, 0);

    let block = translate_at(base);
    let first = block.iter().next().unwrap();
    assert_eq!(first.op, Opcode::FallbackInterpreter);
    assert_eq!(first.opcode, bogus);
    assert!(first.fallback.is_some());
}

#[test]
fn jal_links_ra() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, (0x03 << 26) | ((base + 0x40) >> 2)); // jal base+0x40
    poke32(base + 4, 0);

    let block = translate_at(base);
    let jump = block.iter().next().unwrap();
    assert_eq!(jump.op, Opcode::JumpAndLink);
    assert!(jump.is_link);
    assert_eq!(jump.dest, Operand::Reg(31));
    assert_eq!(jump.return_addr, base + 8);
}

#[test]
fn mult_writes_lo_hi_and_rd() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, mips_rtype(4, 5, 6, 0, 0x18)); // mult $a2, $a0, $a1
    poke32(base + 4, j(base));
    poke32(base + 8, 0);

    let block = translate_at(base);
    let mult = block.iter().next().unwrap();
    assert_eq!(mult.op, Opcode::MultiplyWord);
    assert_eq!(mult.dest, Operand::Reg(6));
    assert_eq!(mult.source, Operand::Reg(4));
    assert_eq!(mult.source2, Operand::Reg(5));
}

#[test]
fn zero_destination_writes_vanish() {
    reset_ram();
    let base = 0x0010_0000;
    poke32(base, addiu(0, 4, 100)); // addiu $zero, $a0, 100
    poke32(base + 4, j(base));
    poke32(base + 8, 0);

    let block = translate_at(base);
    let ops: Vec<Opcode> = block.iter().map(|i| i.op).collect();
    assert_eq!(ops, vec![Opcode::Jump]);
}
