//! AArch64 instruction encoding.
//!
//! PC-relative forms are measured from the instruction address itself.

use super::{sign_extend, AluOp, Backend, Cond, Inst, LiteralKind, PatchKind, Reg};
use crate::jit::CodeOffset;

pub const X0: Reg = Reg(0);
pub const X1: Reg = Reg(1);
pub const X2: Reg = Reg(2);
pub const X3: Reg = Reg(3);
pub const X9: Reg = Reg(9);
pub const X19: Reg = Reg(19);
pub const X20: Reg = Reg(20);
pub const X21: Reg = Reg(21);
pub const X22: Reg = Reg(22);
pub const FP: Reg = Reg(29);
pub const LR: Reg = Reg(30);
/// SP or XZR, depending on the instruction.
pub const SP: Reg = Reg(31);
pub const XZR: Reg = Reg(31);
pub const S0: Reg = Reg(0);

/// Reach of the 19-bit word displacement used by B.cond, CBZ and LDR (literal).
const IMM19_REACH: i64 = 1 << 20;
/// Reach of the 26-bit word displacement used by B and BL.
const IMM26_REACH: i64 = 1 << 27;

#[derive(Debug, Clone, Copy, Default)]
pub struct AArch64;

impl AArch64 {
    /// Three-register form: <op> Xd, Xn, Xm
    fn rrr(base: u32, rd: Reg, rn: Reg, rm: Reg) -> u32 {
        base | (rm.code() << 16) | (rn.code() << 5) | rd.code()
    }

    /// ADD/SUB (immediate) and CMP (immediate): imm12 at bit 10.
    fn rri(base: u32, rd: Reg, rn: Reg, imm12: u16) -> u32 {
        assert!(imm12 < 4096, "AArch64 imm12 {} out of range", imm12);
        base | ((imm12 as u32) << 10) | (rn.code() << 5) | rd.code()
    }

    fn alu(op: AluOp, rd: Reg, rn: Reg, rm: Reg) -> u32 {
        match op {
            // 1000 1011 000m mmmm 0000 00nn nnnd dddd
            AluOp::Add => Self::rrr(0x8B00_0000, rd, rn, rm),
            // 1100 1011 000m mmmm 0000 00nn nnnd dddd
            AluOp::Sub => Self::rrr(0xCB00_0000, rd, rn, rm),
            // MADD Xd, Xn, Xm, XZR
            AluOp::Mul => Self::rrr(0x9B00_7C00, rd, rn, rm),
            // 1001 1010 110m mmmm 0000 11nn nnnd dddd
            AluOp::Div => Self::rrr(0x9AC0_0C00, rd, rn, rm),
            AluOp::And => Self::rrr(0x8A00_0000, rd, rn, rm),
            AluOp::Or => Self::rrr(0xAA00_0000, rd, rn, rm),
            AluOp::Xor => Self::rrr(0xCA00_0000, rd, rn, rm),
        }
    }

    /// LDR/STR Xt, [Xn, #imm12*8]
    fn load_store(base: u32, rt: Reg, rn: Reg, offset: u16, scale: u16) -> u32 {
        assert!(
            offset % scale == 0 && offset / scale < 4096,
            "AArch64 offset {} out of range",
            offset
        );
        base | (((offset / scale) as u32) << 10) | (rn.code() << 5) | rt.code()
    }

    /// STP Xt1, Xt2, [SP, #imm]!
    fn stp_pre(rt1: Reg, rt2: Reg, imm: i16) -> u32 {
        let scaled = ((imm / 8) as u32) & 0x7F;
        0xA980_0000 | (scaled << 15) | (rt2.code() << 10) | (SP.code() << 5) | rt1.code()
    }

    /// LDP Xt1, Xt2, [SP], #imm
    fn ldp_post(rt1: Reg, rt2: Reg, imm: i16) -> u32 {
        let scaled = ((imm / 8) as u32) & 0x7F;
        0xA8C0_0000 | (scaled << 15) | (rt2.code() << 10) | (SP.code() << 5) | rt1.code()
    }

    fn imm19(disp: i64) -> Option<u32> {
        if disp % 4 != 0 || !(-IMM19_REACH..IMM19_REACH).contains(&disp) {
            return None;
        }
        Some((((disp >> 2) as u32) & 0x7FFFF) << 5)
    }

    fn imm26(disp: i64) -> Option<u32> {
        if disp % 4 != 0 || !(-IMM26_REACH..IMM26_REACH).contains(&disp) {
            return None;
        }
        Some(((disp >> 2) as u32) & 0x03FF_FFFF)
    }

    fn is_imm26_branch(word: u32) -> bool {
        // B and BL: x001 01ii ...
        (word & 0x7C00_0000) == 0x1400_0000
    }

    fn branch_word(cond: Cond, disp: i64) -> Option<u32> {
        match cond {
            // 0001 01ii iiii iiii iiii iiii iiii iiii
            Cond::Al => Self::imm26(disp).map(|imm| 0x1400_0000 | imm),
            // 0101 0100 iiii iiii iiii iiii iii0 cccc
            _ => Self::imm19(disp).map(|imm| 0x5400_0000 | imm | cond.bits()),
        }
    }
}

impl Backend for AArch64 {
    const NAME: &'static str = "aarch64";
    const SLOT_SIZE: u16 = 8;

    const CTX: Reg = X19;
    const VSTACK: Reg = X20;
    const LOCALS: Reg = X21;
    const TMP0: Reg = X0;
    const TMP1: Reg = X1;
    const TMP2: Reg = X2;
    const TMP3: Reg = X3;
    const SCRATCH: Reg = X9;
    const FTMP: Reg = S0;

    fn encode(&self, inst: &Inst, at: CodeOffset) -> u32 {
        match *inst {
            // 1101 0101 0000 0011 0010 0000 0001 1111
            Inst::Nop => 0xD503_201F,
            // ORR Xd, XZR, Xm
            Inst::Mov { rd, rm } => Self::rrr(0xAA00_0000, rd, XZR, rm),
            Inst::MovImm { rd, imm } => {
                let value = imm as i64;
                if (0..=0xFFFF).contains(&value) {
                    // MOVZ Xd, #imm16
                    0xD280_0000 | ((value as u32) << 5) | rd.code()
                } else {
                    // MOVN Xd, #imm16 yields !imm16
                    let inverted = !value;
                    assert!((0..=0xFFFF).contains(&inverted), "{} is not a MOVZ/MOVN immediate", imm);
                    0x9280_0000 | ((inverted as u32) << 5) | rd.code()
                }
            }
            Inst::Alu { op, rd, rn, rm } => Self::alu(op, rd, rn, rm),
            // ADD Xd, Xn, Xm, LSL #shift
            Inst::AddShifted { rd, rn, rm, shift } => {
                Self::rrr(0x8B00_0000, rd, rn, rm) | ((shift as u32 & 0x3F) << 10)
            }
            Inst::AddImm { rd, rn, imm } => Self::rri(0x9100_0000, rd, rn, imm),
            Inst::SubImm { rd, rn, imm } => Self::rri(0xD100_0000, rd, rn, imm),
            // SUB Xd, XZR, Xm
            Inst::Neg { rd, rm } => Self::rrr(0xCB00_0000, rd, XZR, rm),
            // SUBS XZR, Xn, Xm
            Inst::Cmp { rn, rm } => Self::rrr(0xEB00_0000, XZR, rn, rm),
            Inst::CmpImm { rn, imm } => Self::rri(0xF100_0000, XZR, rn, imm),
            Inst::Load { rt, rn, offset } => Self::load_store(0xF940_0000, rt, rn, offset, 8),
            Inst::Store { rt, rn, offset } => Self::load_store(0xF900_0000, rt, rn, offset, 8),
            // STR St, [Xn, #imm12*4]
            Inst::FStore { ft, rn, offset } => Self::load_store(0xBD00_0000, ft, rn, offset, 4),
            Inst::Branch { cond, target } => {
                match Self::branch_word(cond, target as i64 - at as i64) {
                    Some(word) => word,
                    None => panic!("branch at {} cannot reach {}", at, target),
                }
            }
            Inst::LoadLiteral { kind, rt, target } => {
                // LDR Xt, label: 0101 1000 ...; LDR St, label: 0001 1100 ...
                let base = match kind {
                    LiteralKind::Word => 0x5800_0000,
                    LiteralKind::Float => 0x1C00_0000,
                };
                match Self::imm19(target as i64 - at as i64) {
                    Some(imm) => base | imm | rt.code(),
                    None => panic!("literal load at {} cannot reach {}", at, target),
                }
            }
            // BLR Xn
            Inst::CallReg { rn } => 0xD63F_0000 | (rn.code() << 5),
            Inst::Raw(word) => word,
        }
    }

    fn fits_immediate(&self, value: i64) -> bool {
        (0..=0xFFFF).contains(&value) || (0..=0xFFFF).contains(&!value)
    }

    fn prologue(&self) -> Vec<Inst> {
        vec![
            Inst::Raw(Self::stp_pre(FP, LR, -16)),
            Inst::Raw(Self::stp_pre(X19, X20, -16)),
            Inst::Raw(Self::stp_pre(X21, X22, -16)),
            // MOV FP, SP
            Inst::AddImm { rd: FP, rn: SP, imm: 0 },
            Inst::Mov { rd: Self::CTX, rm: X0 },
            Inst::Mov { rd: Self::VSTACK, rm: X1 },
            Inst::Mov { rd: Self::LOCALS, rm: X2 },
        ]
    }

    fn epilogue(&self) -> Vec<Inst> {
        vec![
            Inst::Raw(Self::ldp_post(X21, X22, 16)),
            Inst::Raw(Self::ldp_post(X19, X20, 16)),
            Inst::Raw(Self::ldp_post(FP, LR, 16)),
            // RET
            Inst::Raw(0xD65F_03C0),
        ]
    }

    fn classify(&self, word: u32) -> Option<PatchKind> {
        if Self::is_imm26_branch(word)
            // B.cond
            || (word & 0xFF00_0010) == 0x5400_0000
            // CBZ/CBNZ
            || (word & 0x7E00_0000) == 0x3400_0000
        {
            Some(PatchKind::Branch)
        } else if (word & 0x3B00_0000) == 0x1800_0000 {
            // LDR (literal); bit 26 selects the SIMD&FP register file
            if word & (1 << 26) != 0 {
                Some(PatchKind::FpLoad)
            } else {
                Some(PatchKind::Load)
            }
        } else {
            None
        }
    }

    fn target(&self, kind: PatchKind, word: u32, at: CodeOffset) -> CodeOffset {
        let words = if kind == PatchKind::Branch && Self::is_imm26_branch(word) {
            sign_extend(word & 0x03FF_FFFF, 26)
        } else {
            sign_extend((word >> 5) & 0x7FFFF, 19)
        };
        (at as i64 + words * 4) as CodeOffset
    }

    fn retarget(
        &self,
        kind: PatchKind,
        word: u32,
        at: CodeOffset,
        target: CodeOffset,
    ) -> Option<u32> {
        let disp = target as i64 - at as i64;
        if kind == PatchKind::Branch && Self::is_imm26_branch(word) {
            Self::imm26(disp).map(|imm| (word & 0xFC00_0000) | imm)
        } else {
            Self::imm19(disp).map(|imm| (word & !(0x7FFFF << 5)) | imm)
        }
    }

    fn literal_size(&self, kind: LiteralKind) -> u32 {
        match kind {
            LiteralKind::Word => 8,
            LiteralKind::Float => 4,
        }
    }

    fn can_reach(&self, _kind: LiteralKind, from: CodeOffset, to: CodeOffset) -> bool {
        Self::imm19(to as i64 - from as i64).is_some()
    }
}
