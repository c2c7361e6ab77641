//! A32 (ARMv7 with VFP and SDIV) instruction encoding.
//!
//! All instructions are unconditional except branches. PC-relative forms
//! are measured from the instruction address plus 8.

use super::{sign_extend, AluOp, Backend, Cond, Inst, LiteralKind, PatchKind, Reg};
use crate::jit::CodeOffset;

pub const R0: Reg = Reg(0);
pub const R1: Reg = Reg(1);
pub const R2: Reg = Reg(2);
pub const R3: Reg = Reg(3);
pub const R4: Reg = Reg(4);
pub const R5: Reg = Reg(5);
pub const R6: Reg = Reg(6);
pub const IP: Reg = Reg(12);
pub const S0: Reg = Reg(0);

/// Largest displacement of an LDR (literal).
pub const LDR_REACH: i64 = 4095;
/// Largest displacement of a VLDR (literal).
pub const VLDR_REACH: i64 = 1020;

const PC_BIAS: i64 = 8;
const AL: u32 = 0xE000_0000;
const U_BIT: u32 = 1 << 23;

#[derive(Debug, Clone, Copy, Default)]
pub struct Arm32;

/// Encode `value` as an 8-bit immediate rotated right by an even amount.
pub fn rotated_imm(value: u32) -> Option<u32> {
    (0..16u32).find_map(|rot| {
        let imm8 = value.rotate_left(rot * 2);
        (imm8 <= 0xFF).then_some((rot << 8) | imm8)
    })
}

fn rotated_imm_or_panic(value: u32) -> u32 {
    match rotated_imm(value) {
        Some(bits) => bits,
        None => panic!("{:#x} is not an A32 immediate", value),
    }
}

fn pc_offset(at: CodeOffset, target: CodeOffset) -> i64 {
    target as i64 - (at as i64 + PC_BIAS)
}

impl Arm32 {
    // ==================== Data Processing ====================

    /// <op> Rd, Rn, Rm
    fn data_processing(opcode: u32, rd: Reg, rn: Reg, rm: Reg) -> u32 {
        // cccc 000o ooo0 nnnn dddd 0000 0000 mmmm
        AL | (opcode << 21) | (rn.code() << 16) | (rd.code() << 12) | rm.code()
    }

    /// <op> Rd, Rn, #imm
    fn data_processing_imm(opcode: u32, rd: Reg, rn: Reg, imm: u32) -> u32 {
        // cccc 001o ooo0 nnnn dddd rrrr iiii iiii
        AL | (1 << 25)
            | (opcode << 21)
            | (rn.code() << 16)
            | (rd.code() << 12)
            | rotated_imm_or_panic(imm)
    }

    fn alu(op: AluOp, rd: Reg, rn: Reg, rm: Reg) -> u32 {
        match op {
            AluOp::Add => Self::data_processing(0b0100, rd, rn, rm),
            AluOp::Sub => Self::data_processing(0b0010, rd, rn, rm),
            AluOp::And => Self::data_processing(0b0000, rd, rn, rm),
            AluOp::Or => Self::data_processing(0b1100, rd, rn, rm),
            AluOp::Xor => Self::data_processing(0b0001, rd, rn, rm),
            // MUL Rd, Rn, Rm: cccc 0000 000s dddd 0000 mmmm 1001 nnnn
            AluOp::Mul => AL | 0x90 | (rd.code() << 16) | (rm.code() << 8) | rn.code(),
            // SDIV Rd, Rn, Rm: cccc 0111 0001 dddd 1111 mmmm 0001 nnnn
            AluOp::Div => {
                AL | 0x0710_F010 | (rd.code() << 16) | (rm.code() << 8) | rn.code()
            }
        }
    }

    // ==================== Loads and Stores ====================

    /// LDR/STR Rt, [Rn, #imm12]
    fn load_store(load: bool, rt: Reg, rn: Reg, offset: u16) -> u32 {
        // cccc 0101 U00L nnnn tttt iiii iiii iiii
        assert!(offset <= 4095, "A32 word offset {} out of range", offset);
        let base = if load { 0x0590_0000 } else { 0x0580_0000 };
        AL | base | (rn.code() << 16) | (rt.code() << 12) | offset as u32
    }

    /// VSTR Sd, [Rn, #imm8*4]
    fn vstr(ft: Reg, rn: Reg, offset: u16) -> u32 {
        // cccc 1101 UD00 nnnn dddd 1010 iiii iiii
        assert!(offset % 4 == 0 && offset <= 1020, "VSTR offset {} out of range", offset);
        let (vd, d) = (ft.code() >> 1, ft.code() & 1);
        AL | 0x0D00_0A00
            | U_BIT
            | (d << 22)
            | (rn.code() << 16)
            | (vd << 12)
            | (offset as u32 / 4)
    }

    // ==================== PC-relative forms ====================

    /// B<cond> with a byte displacement from pc+8.
    fn branch_word(cond: u32, link: bool, disp: i64) -> Option<u32> {
        // cccc 101L iiii iiii iiii iiii iiii iiii
        if disp % 4 != 0 || !(-(1 << 25)..(1 << 25)).contains(&disp) {
            return None;
        }
        let imm24 = ((disp >> 2) as u32) & 0x00FF_FFFF;
        Some((cond << 28) | 0x0A00_0000 | ((link as u32) << 24) | imm24)
    }

    /// LDR Rt, [PC, #+-imm12]
    fn ldr_literal_word(rt: u32, disp: i64) -> Option<u32> {
        // cccc 0101 U001 1111 tttt iiii iiii iiii
        if disp.abs() > LDR_REACH {
            return None;
        }
        let u = if disp >= 0 { U_BIT } else { 0 };
        Some(AL | 0x051F_0000 | u | (rt << 12) | disp.unsigned_abs() as u32)
    }

    /// VLDR Sd, [PC, #+-imm8*4]
    fn vldr_literal_word(vd: u32, d: u32, disp: i64) -> Option<u32> {
        // cccc 1101 UD01 1111 dddd 1010 iiii iiii
        if disp % 4 != 0 || disp.abs() > VLDR_REACH {
            return None;
        }
        let u = if disp >= 0 { U_BIT } else { 0 };
        Some(AL | 0x0D1F_0A00 | u | (d << 22) | (vd << 12) | (disp.unsigned_abs() as u32 / 4))
    }
}

impl Backend for Arm32 {
    const NAME: &'static str = "arm32";
    const SLOT_SIZE: u16 = 4;

    const CTX: Reg = R4;
    const VSTACK: Reg = R5;
    const LOCALS: Reg = R6;
    const TMP0: Reg = R0;
    const TMP1: Reg = R1;
    const TMP2: Reg = R2;
    const TMP3: Reg = R3;
    const SCRATCH: Reg = IP;
    const FTMP: Reg = S0;

    fn encode(&self, inst: &Inst, at: CodeOffset) -> u32 {
        match *inst {
            // MOV r0, r0
            Inst::Nop => 0xE1A0_0000,
            Inst::Mov { rd, rm } => Self::data_processing(0b1101, rd, Reg(0), rm),
            Inst::MovImm { rd, imm } => match rotated_imm(imm as u32) {
                Some(bits) => AL | 0x03A0_0000 | (rd.code() << 12) | bits,
                // MVN Rd, #~imm
                None => AL | 0x03E0_0000 | (rd.code() << 12) | rotated_imm_or_panic(!(imm as u32)),
            },
            Inst::Alu { op, rd, rn, rm } => Self::alu(op, rd, rn, rm),
            Inst::AddShifted { rd, rn, rm, shift } => {
                // ADD Rd, Rn, Rm, LSL #shift
                Self::data_processing(0b0100, rd, rn, rm) | ((shift as u32 & 0x1F) << 7)
            }
            Inst::AddImm { rd, rn, imm } => Self::data_processing_imm(0b0100, rd, rn, imm as u32),
            Inst::SubImm { rd, rn, imm } => Self::data_processing_imm(0b0010, rd, rn, imm as u32),
            // RSB Rd, Rm, #0
            Inst::Neg { rd, rm } => Self::data_processing_imm(0b0011, rd, rm, 0),
            // CMP Rn, Rm (S bit set, Rd = 0)
            Inst::Cmp { rn, rm } => Self::data_processing(0b1010, Reg(0), rn, rm) | (1 << 20),
            Inst::CmpImm { rn, imm } => {
                Self::data_processing_imm(0b1010, Reg(0), rn, imm as u32) | (1 << 20)
            }
            Inst::Load { rt, rn, offset } => Self::load_store(true, rt, rn, offset),
            Inst::Store { rt, rn, offset } => Self::load_store(false, rt, rn, offset),
            Inst::FStore { ft, rn, offset } => Self::vstr(ft, rn, offset),
            Inst::Branch { cond, target } => {
                match Self::branch_word(cond.bits(), false, pc_offset(at, target)) {
                    Some(word) => word,
                    None => panic!("branch at {} cannot reach {}", at, target),
                }
            }
            Inst::LoadLiteral { kind, rt, target } => {
                let word = match kind {
                    LiteralKind::Word => Self::ldr_literal_word(rt.code(), pc_offset(at, target)),
                    LiteralKind::Float => Self::vldr_literal_word(
                        rt.code() >> 1,
                        rt.code() & 1,
                        pc_offset(at, target),
                    ),
                };
                match word {
                    Some(word) => word,
                    None => panic!("literal load at {} cannot reach {}", at, target),
                }
            }
            // BLX Rm
            Inst::CallReg { rn } => AL | 0x012F_FF30 | rn.code(),
            Inst::Raw(word) => word,
        }
    }

    fn fits_immediate(&self, value: i64) -> bool {
        if value < i32::MIN as i64 || value > i32::MAX as i64 {
            return false;
        }
        let bits = value as i32 as u32;
        rotated_imm(bits).is_some() || rotated_imm(!bits).is_some()
    }

    fn prologue(&self) -> Vec<Inst> {
        vec![
            // PUSH {r4, r5, r6, lr}
            Inst::Raw(0xE92D_4070),
            Inst::Mov { rd: Self::CTX, rm: R0 },
            Inst::Mov { rd: Self::VSTACK, rm: R1 },
            Inst::Mov { rd: Self::LOCALS, rm: R2 },
        ]
    }

    fn epilogue(&self) -> Vec<Inst> {
        // POP {r4, r5, r6, pc}
        vec![Inst::Raw(0xE8BD_8070)]
    }

    fn classify(&self, word: u32) -> Option<PatchKind> {
        if word >> 28 != 0xF && (word & 0x0E00_0000) == 0x0A00_0000 {
            Some(PatchKind::Branch)
        } else if (word & 0x0F7F_0000) == 0x051F_0000 {
            Some(PatchKind::Load)
        } else if (word & 0x0F3F_0F00) == 0x0D1F_0A00 {
            Some(PatchKind::FpLoad)
        } else {
            None
        }
    }

    fn target(&self, kind: PatchKind, word: u32, at: CodeOffset) -> CodeOffset {
        let disp = match kind {
            PatchKind::Branch => sign_extend(word & 0x00FF_FFFF, 24) * 4,
            PatchKind::Load | PatchKind::FpLoad => {
                let magnitude = match kind {
                    PatchKind::Load => (word & 0xFFF) as i64,
                    _ => (word & 0xFF) as i64 * 4,
                };
                if word & U_BIT != 0 { magnitude } else { -magnitude }
            }
        };
        (at as i64 + PC_BIAS + disp) as CodeOffset
    }

    fn retarget(
        &self,
        kind: PatchKind,
        word: u32,
        at: CodeOffset,
        target: CodeOffset,
    ) -> Option<u32> {
        let disp = pc_offset(at, target);
        match kind {
            PatchKind::Branch => {
                let link = word & (1 << 24) != 0;
                Self::branch_word(word >> 28, link, disp)
            }
            PatchKind::Load => Self::ldr_literal_word((word >> 12) & 0xF, disp),
            PatchKind::FpLoad => {
                Self::vldr_literal_word((word >> 12) & 0xF, (word >> 22) & 1, disp)
            }
        }
    }

    fn literal_size(&self, _kind: LiteralKind) -> u32 {
        4
    }

    fn can_reach(&self, kind: LiteralKind, from: CodeOffset, to: CodeOffset) -> bool {
        let disp = pc_offset(from, to);
        match kind {
            LiteralKind::Word => disp.abs() <= LDR_REACH,
            LiteralKind::Float => disp % 4 == 0 && disp.abs() <= VLDR_REACH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotated_imm() {
        assert_eq!(rotated_imm(0xFF), Some(0xFF));
        // 0x3F0 = 0x3F ror 28
        assert_eq!(rotated_imm(0x3F0), Some((14 << 8) | 0x3F));
        assert_eq!(rotated_imm(0x1234_5678), None);
    }

    #[test]
    fn test_fits_immediate() {
        let arm = Arm32;
        assert!(arm.fits_immediate(255));
        assert!(arm.fits_immediate(-1)); // MVN #0
        assert!(arm.fits_immediate(0xFF00_0000u32 as i32 as i64));
        assert!(!arm.fits_immediate(0x1234_5678));
        assert!(!arm.fits_immediate(257));
    }

    #[test]
    fn test_data_processing() {
        let arm = Arm32;
        // ADD r0, r1, r2
        assert_eq!(
            arm.encode(&Inst::Alu { op: AluOp::Add, rd: R0, rn: R1, rm: R2 }, 0),
            0xE081_0002
        );
        // MOV r4, r0
        assert_eq!(arm.encode(&Inst::Mov { rd: R4, rm: R0 }, 0), 0xE1A0_4000);
        // MVN r0, #0
        assert_eq!(arm.encode(&Inst::MovImm { rd: R0, imm: -1 }, 0), 0xE3E0_0000);
        // CMP r1, #0
        assert_eq!(arm.encode(&Inst::CmpImm { rn: R1, imm: 0 }, 0), 0xE351_0000);
        // LDR r0, [r6, #8]
        assert_eq!(arm.encode(&Inst::Load { rt: R0, rn: R6, offset: 8 }, 0), 0xE596_0008);
    }

    #[test]
    fn test_branch_to_next_but_one() {
        let arm = Arm32;
        // B over a single instruction: target = at + 8, raw displacement 0.
        let word = arm.encode(&Inst::Branch { cond: Cond::Al, target: 8 }, 0);
        assert_eq!(word, 0xEA00_0000);
        assert_eq!(arm.classify(word), Some(PatchKind::Branch));
        assert_eq!(arm.target(PatchKind::Branch, word, 0), 8);
    }

    #[test]
    fn test_self_reference_round_trips() {
        let arm = Arm32;
        for kind in [LiteralKind::Word, LiteralKind::Float] {
            let word = arm.encode(&Inst::LoadLiteral { kind, rt: Reg(0), target: 100 }, 100);
            let patch = kind.patch_kind();
            assert_eq!(arm.classify(word), Some(patch));
            assert_eq!(arm.target(patch, word, 100), 100);
        }
    }

    #[test]
    fn test_retarget_preserves_register_and_condition() {
        let arm = Arm32;
        let ldr = arm.encode(&Inst::LoadLiteral { kind: LiteralKind::Word, rt: R3, target: 0 }, 0);
        let patched = arm.retarget(PatchKind::Load, ldr, 0, 4000).unwrap();
        assert_eq!((patched >> 12) & 0xF, 3);
        assert_eq!(arm.target(PatchKind::Load, patched, 0), 4000);

        let bne = arm.encode(&Inst::Branch { cond: Cond::Ne, target: 0 }, 16);
        let patched = arm.retarget(PatchKind::Branch, bne, 16, 64).unwrap();
        assert_eq!(patched >> 28, Cond::Ne.bits());
        assert_eq!(arm.target(PatchKind::Branch, patched, 16), 64);
    }

    #[test]
    fn test_literal_reach() {
        let arm = Arm32;
        assert!(arm.can_reach(LiteralKind::Word, 0, 4103));
        assert!(!arm.can_reach(LiteralKind::Word, 0, 4104));
        assert!(arm.can_reach(LiteralKind::Float, 0, 1028));
        assert!(!arm.can_reach(LiteralKind::Float, 0, 1032));
        assert!(arm.retarget(PatchKind::Load, 0xE51F_0008, 0, 5000).is_none());
    }
}
