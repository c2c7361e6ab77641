//! Byte encoding of unit bytecode.
//!
//! Each instruction is one opcode byte followed by fixed-width
//! little-endian operands; `Op::size` gives the total width.

use super::ops::{Bci, Op};
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

/// Error type for bytecode decoding
#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error("unexpected end of code at {0}")]
    UnexpectedEof(Bci),
    #[error("invalid opcode {opcode:#04x} at {at}")]
    InvalidOpcode { opcode: u8, at: Bci },
}

/// Encode a sequence of operations.
pub fn encode(ops: &[Op]) -> Vec<u8> {
    let mut buf = Vec::new();
    for op in ops {
        write_op(&mut buf, op).expect("writing to Vec cannot fail");
    }
    buf
}

/// Decode the instruction starting at `at`.
pub fn decode_at(code: &[u8], at: Bci) -> Result<Op, BytecodeError> {
    let start = at as usize;
    if start >= code.len() {
        return Err(BytecodeError::UnexpectedEof(at));
    }
    let mut cursor = Cursor::new(&code[start..]);
    read_op(&mut cursor, at)
}

/// Decode every instruction, returning each with its offset.
pub fn decode_all(code: &[u8]) -> Result<Vec<(Bci, Op)>, BytecodeError> {
    let mut ops = Vec::new();
    let mut at: Bci = 0;
    while (at as usize) < code.len() {
        let op = decode_at(code, at)?;
        ops.push((at, op));
        at += op.size();
    }
    Ok(ops)
}

pub fn write_op<W: Write>(w: &mut W, op: &Op) -> io::Result<()> {
    match op {
        Op::Nop => w.write_all(&[OP_NOP])?,
        Op::IConst(v) => {
            w.write_all(&[OP_ICONST])?;
            w.write_all(&v.to_le_bytes())?;
        }
        Op::FConst(v) => {
            w.write_all(&[OP_FCONST])?;
            w.write_all(&v.to_bits().to_le_bytes())?;
        }
        Op::Ldc(idx) => {
            w.write_all(&[OP_LDC])?;
            w.write_all(&idx.to_le_bytes())?;
        }
        Op::Load(idx) => {
            w.write_all(&[OP_LOAD])?;
            w.write_all(&idx.to_le_bytes())?;
        }
        Op::Store(idx) => {
            w.write_all(&[OP_STORE])?;
            w.write_all(&idx.to_le_bytes())?;
        }
        Op::Dup => w.write_all(&[OP_DUP])?,
        Op::Pop => w.write_all(&[OP_POP])?,
        Op::Add => w.write_all(&[OP_ADD])?,
        Op::Sub => w.write_all(&[OP_SUB])?,
        Op::Mul => w.write_all(&[OP_MUL])?,
        Op::Div => w.write_all(&[OP_DIV])?,
        Op::And => w.write_all(&[OP_AND])?,
        Op::Or => w.write_all(&[OP_OR])?,
        Op::Xor => w.write_all(&[OP_XOR])?,
        Op::Neg => w.write_all(&[OP_NEG])?,
        Op::Goto(t) => write_branch(w, OP_GOTO, *t)?,
        Op::IfEq(t) => write_branch(w, OP_IFEQ, *t)?,
        Op::IfNe(t) => write_branch(w, OP_IFNE, *t)?,
        Op::IfLt(t) => write_branch(w, OP_IFLT, *t)?,
        Op::IfCmpEq(t) => write_branch(w, OP_IFCMPEQ, *t)?,
        Op::IfCmpLt(t) => write_branch(w, OP_IFCMPLT, *t)?,
        Op::ALoad => w.write_all(&[OP_ALOAD])?,
        Op::AStore => w.write_all(&[OP_ASTORE])?,
        Op::CheckCast(class) => {
            w.write_all(&[OP_CHECKCAST])?;
            w.write_all(&class.to_le_bytes())?;
        }
        Op::MonitorEnter => w.write_all(&[OP_MONITORENTER])?,
        Op::MonitorExit => w.write_all(&[OP_MONITOREXIT])?,
        Op::Invoke { unit, argc } => {
            w.write_all(&[OP_INVOKE])?;
            w.write_all(&unit.to_le_bytes())?;
            w.write_all(&[*argc])?;
        }
        Op::InvokeInline { unit, argc } => {
            w.write_all(&[OP_INVOKE_INLINE])?;
            w.write_all(&unit.to_le_bytes())?;
            w.write_all(&[*argc])?;
        }
        Op::Return => w.write_all(&[OP_RETURN])?,
        Op::VReturn => w.write_all(&[OP_VRETURN])?,
        Op::Throw => w.write_all(&[OP_THROW])?,
    }
    Ok(())
}

fn write_branch<W: Write>(w: &mut W, opcode: u8, target: Bci) -> io::Result<()> {
    w.write_all(&[opcode])?;
    w.write_all(&target.to_le_bytes())
}

fn read_op<R: Read>(r: &mut R, at: Bci) -> Result<Op, BytecodeError> {
    let opcode = read_u8(r, at)?;
    let op = match opcode {
        OP_NOP => Op::Nop,
        OP_ICONST => Op::IConst(read_u32(r, at)? as i32),
        OP_FCONST => Op::FConst(f32::from_bits(read_u32(r, at)?)),
        OP_LDC => Op::Ldc(read_u16(r, at)?),
        OP_LOAD => Op::Load(read_u16(r, at)?),
        OP_STORE => Op::Store(read_u16(r, at)?),
        OP_DUP => Op::Dup,
        OP_POP => Op::Pop,
        OP_ADD => Op::Add,
        OP_SUB => Op::Sub,
        OP_MUL => Op::Mul,
        OP_DIV => Op::Div,
        OP_AND => Op::And,
        OP_OR => Op::Or,
        OP_XOR => Op::Xor,
        OP_NEG => Op::Neg,
        OP_GOTO => Op::Goto(read_u32(r, at)?),
        OP_IFEQ => Op::IfEq(read_u32(r, at)?),
        OP_IFNE => Op::IfNe(read_u32(r, at)?),
        OP_IFLT => Op::IfLt(read_u32(r, at)?),
        OP_IFCMPEQ => Op::IfCmpEq(read_u32(r, at)?),
        OP_IFCMPLT => Op::IfCmpLt(read_u32(r, at)?),
        OP_ALOAD => Op::ALoad,
        OP_ASTORE => Op::AStore,
        OP_CHECKCAST => Op::CheckCast(read_u16(r, at)?),
        OP_MONITORENTER => Op::MonitorEnter,
        OP_MONITOREXIT => Op::MonitorExit,
        OP_INVOKE => Op::Invoke {
            unit: read_u16(r, at)?,
            argc: read_u8(r, at)?,
        },
        OP_INVOKE_INLINE => Op::InvokeInline {
            unit: read_u16(r, at)?,
            argc: read_u8(r, at)?,
        },
        OP_RETURN => Op::Return,
        OP_VRETURN => Op::VReturn,
        OP_THROW => Op::Throw,
        _ => return Err(BytecodeError::InvalidOpcode { opcode, at }),
    };
    Ok(op)
}

// Opcode tags
const OP_NOP: u8 = 0x00;
const OP_ICONST: u8 = 0x01;
const OP_FCONST: u8 = 0x02;
const OP_LDC: u8 = 0x03;
const OP_LOAD: u8 = 0x04;
const OP_STORE: u8 = 0x05;
const OP_DUP: u8 = 0x06;
const OP_POP: u8 = 0x07;
const OP_ADD: u8 = 0x10;
const OP_SUB: u8 = 0x11;
const OP_MUL: u8 = 0x12;
const OP_DIV: u8 = 0x13;
const OP_AND: u8 = 0x14;
const OP_OR: u8 = 0x15;
const OP_XOR: u8 = 0x16;
const OP_NEG: u8 = 0x17;
const OP_GOTO: u8 = 0x20;
const OP_IFEQ: u8 = 0x21;
const OP_IFNE: u8 = 0x22;
const OP_IFLT: u8 = 0x23;
const OP_IFCMPEQ: u8 = 0x24;
const OP_IFCMPLT: u8 = 0x25;
const OP_ALOAD: u8 = 0x30;
const OP_ASTORE: u8 = 0x31;
const OP_CHECKCAST: u8 = 0x32;
const OP_MONITORENTER: u8 = 0x33;
const OP_MONITOREXIT: u8 = 0x34;
const OP_INVOKE: u8 = 0x40;
const OP_INVOKE_INLINE: u8 = 0x41;
const OP_RETURN: u8 = 0x50;
const OP_VRETURN: u8 = 0x51;
const OP_THROW: u8 = 0x52;

fn read_u8<R: Read>(r: &mut R, at: Bci) -> Result<u8, BytecodeError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof(at))?;
    Ok(buf[0])
}

fn read_u16<R: Read>(r: &mut R, at: Bci) -> Result<u16, BytecodeError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof(at))?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R, at: Bci) -> Result<u32, BytecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof(at))?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_match_encoding() {
        let ops = [
            Op::Nop,
            Op::IConst(i32::MIN),
            Op::FConst(1.5),
            Op::Ldc(7),
            Op::Load(300),
            Op::Store(1),
            Op::IfCmpLt(0x1234),
            Op::CheckCast(9),
            Op::Invoke { unit: 513, argc: 3 },
            Op::InvokeInline { unit: 1, argc: 0 },
            Op::VReturn,
        ];
        for op in ops {
            assert_eq!(encode(&[op]).len() as u32, op.size(), "{}", op);
        }
    }

    #[test]
    fn test_decode_all_offsets() {
        let code = encode(&[Op::IConst(1), Op::Store(0), Op::Goto(0)]);
        let ops = decode_all(&code).unwrap();

        assert_eq!(ops[0], (0, Op::IConst(1)));
        assert_eq!(ops[1], (5, Op::Store(0)));
        assert_eq!(ops[2], (8, Op::Goto(0)));
    }

    #[test]
    fn test_invalid_opcode() {
        let result = decode_all(&[0x00, 0xEE]);
        assert!(matches!(
            result,
            Err(BytecodeError::InvalidOpcode { opcode: 0xEE, at: 1 })
        ));
    }

    #[test]
    fn test_truncated_operand() {
        let result = decode_at(&[OP_ICONST, 0x01, 0x02], 0);
        assert!(matches!(result, Err(BytecodeError::UnexpectedEof(0))));
    }
}
