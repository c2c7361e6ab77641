//! Pluggable instruction encoders.
//!
//! The compiler speaks a small neutral instruction set ([`Inst`]); a
//! [`Backend`] turns each instruction into one 32-bit word and knows how to
//! decode and rewrite the displacement of every instruction class that can
//! refer to a label.

pub mod aarch64;
pub mod arm;

pub use aarch64::AArch64;
pub use arm::Arm32;

use super::CodeOffset;
use std::fmt;

/// A physical register number, as handed out by the register model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

impl Reg {
    pub fn code(self) -> u32 {
        self.0 as u32
    }
}

/// Condition codes. A32 and A64 share the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000, // Equal
    Ne = 0b0001, // Not equal
    Hs = 0b0010, // Unsigned higher or same
    Lo = 0b0011, // Unsigned lower
    Mi = 0b0100, // Negative
    Pl = 0b0101, // Positive or zero
    Ge = 0b1010, // Signed greater than or equal
    Lt = 0b1011, // Signed less than
    Gt = 0b1100, // Signed greater than
    Le = 0b1101, // Signed less than or equal
    Al = 0b1110, // Always
}

impl Cond {
    pub fn bits(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
}

/// Instruction classes that can carry a label reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Conditional and unconditional PC-relative branches.
    Branch,
    /// PC-relative integer load.
    Load,
    /// PC-relative floating-point load.
    FpLoad,
}

/// The register file and width a literal is loaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiteralKind {
    Word,
    Float,
}

impl LiteralKind {
    /// The instruction class that loads this kind of literal.
    pub fn patch_kind(self) -> PatchKind {
        match self {
            LiteralKind::Word => PatchKind::Load,
            LiteralKind::Float => PatchKind::FpLoad,
        }
    }
}

/// Backend-neutral instructions, each encoding to exactly one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inst {
    Nop,
    Mov { rd: Reg, rm: Reg },
    /// `imm` must satisfy [`Backend::fits_immediate`].
    MovImm { rd: Reg, imm: i32 },
    Alu { op: AluOp, rd: Reg, rn: Reg, rm: Reg },
    /// rd = rn + (rm << shift)
    AddShifted { rd: Reg, rn: Reg, rm: Reg, shift: u8 },
    AddImm { rd: Reg, rn: Reg, imm: u16 },
    SubImm { rd: Reg, rn: Reg, imm: u16 },
    Neg { rd: Reg, rm: Reg },
    Cmp { rn: Reg, rm: Reg },
    CmpImm { rn: Reg, imm: u16 },
    /// Word load from [rn + offset].
    Load { rt: Reg, rn: Reg, offset: u16 },
    /// Word store to [rn + offset].
    Store { rt: Reg, rn: Reg, offset: u16 },
    /// Single-precision store from an FP register.
    FStore { ft: Reg, rn: Reg, offset: u16 },
    Branch { cond: Cond, target: CodeOffset },
    LoadLiteral { kind: LiteralKind, rt: Reg, target: CodeOffset },
    CallReg { rn: Reg },
    Raw(u32),
}

/// An instruction-set back end.
pub trait Backend: fmt::Debug + Clone + Default {
    const NAME: &'static str;
    /// Bytes per operand-stack slot, local, and runtime table entry.
    const SLOT_SIZE: u16;

    /// Runtime context (helper table).
    const CTX: Reg;
    /// Operand stack pointer; points at the next free slot.
    const VSTACK: Reg;
    /// Base of the locals array.
    const LOCALS: Reg;
    /// Temporaries; TMP0-TMP3 double as the first four argument registers.
    const TMP0: Reg;
    const TMP1: Reg;
    const TMP2: Reg;
    const TMP3: Reg;
    /// Holds helper addresses across a call sequence.
    const SCRATCH: Reg;
    /// Floating-point temporary.
    const FTMP: Reg;

    /// Encode one instruction located at `at`.
    ///
    /// PC-relative forms must be in range; callers guarantee it.
    fn encode(&self, inst: &Inst, at: CodeOffset) -> u32;

    /// Whether `value` can be materialized with a single `MovImm`.
    fn fits_immediate(&self, value: i64) -> bool;

    /// Save callee-saved registers and set up CTX, VSTACK and LOCALS
    /// from the first three arguments.
    fn prologue(&self) -> Vec<Inst>;

    /// Restore registers and return to the caller.
    fn epilogue(&self) -> Vec<Inst>;

    /// The label-referencing class of `word`, if any.
    fn classify(&self, word: u32) -> Option<PatchKind>;

    /// Decode the absolute target of a label-referencing instruction.
    fn target(&self, kind: PatchKind, word: u32, at: CodeOffset) -> CodeOffset;

    /// Rewrite the displacement so the instruction addresses `target`.
    /// Returns `None` when the displacement does not fit.
    fn retarget(&self, kind: PatchKind, word: u32, at: CodeOffset, target: CodeOffset)
    -> Option<u32>;

    /// Bytes a literal of `kind` occupies in the pool.
    fn literal_size(&self, kind: LiteralKind) -> u32;

    /// Whether a literal load at `from` can address a literal at `to`.
    fn can_reach(&self, kind: LiteralKind, from: CodeOffset, to: CodeOffset) -> bool;
}

/// Sign-extend the low `bits` bits of `value`.
pub(crate) fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 32 - bits;
    (((value << shift) as i32) >> shift) as i64
}
