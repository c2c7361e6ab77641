//! The bytecode side of the JIT: compilation units and the program that
//! owns them.

pub mod builder;
pub mod bytecode;
mod ops;
pub mod text;

pub use builder::UnitBuilder;
pub use bytecode::BytecodeError;
pub use ops::{Bci, Op};

use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Stable identity of a compilation unit within its program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub u16);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An entry in a unit's constant table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Int(i32),
    Float(f32),
    /// Address of a heap object plus a byte offset, resolved at install time.
    Object { handle: u32, offset: i32 },
}

/// Errors raised while building or loading units.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("unit '{unit}': {source}")]
    Bytecode {
        unit: String,
        #[source]
        source: BytecodeError,
    },
    #[error("unit '{unit}': branch at {at} targets {target}, which is not an instruction")]
    BadTarget { unit: String, at: Bci, target: Bci },
    #[error("unit '{unit}': control falls off the end of the code")]
    FallsOffEnd { unit: String },
    #[error("unit '{unit}': local {index} at {at} exceeds {max_locals} locals")]
    LocalOutOfRange {
        unit: String,
        at: Bci,
        index: u16,
        max_locals: u16,
    },
    #[error("unit '{unit}': constant {index} at {at} is out of range")]
    ConstantOutOfRange { unit: String, at: Bci, index: u16 },
    #[error("unit '{unit}': undefined label '{label}'")]
    UndefinedLabel { unit: String, label: String },
    #[error("unit '{unit}': duplicate label '{label}'")]
    DuplicateLabel { unit: String, label: String },
    #[error("unknown unit '{0}'")]
    UnknownUnit(String),
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("failed to parse program: {0}")]
    Toml(#[from] toml::de::Error),
}

/// One bytecode-level method being offered to the JIT.
#[derive(Debug, Clone)]
pub struct CompilationUnit {
    id: UnitId,
    name: String,
    max_locals: u16,
    code: Vec<u8>,
    constants: Vec<Constant>,
    /// Decoded instructions in offset order.
    ops: Vec<(Bci, Op)>,
    branch_targets: BTreeSet<Bci>,
    has_loops: bool,
    can_throw: bool,
}

impl CompilationUnit {
    /// Decode and check `code`, computing the metadata the compiler reads.
    pub fn new(
        id: UnitId,
        name: &str,
        max_locals: u16,
        code: Vec<u8>,
        constants: Vec<Constant>,
    ) -> Result<Self, ProgramError> {
        let ops = bytecode::decode_all(&code).map_err(|source| ProgramError::Bytecode {
            unit: name.to_string(),
            source,
        })?;

        let offsets: BTreeSet<Bci> = ops.iter().map(|(at, _)| *at).collect();
        let mut branch_targets = BTreeSet::new();
        let mut has_loops = false;
        let mut can_throw = false;

        for (at, op) in &ops {
            if let Some(target) = op.branch_target() {
                if !offsets.contains(&target) {
                    return Err(ProgramError::BadTarget {
                        unit: name.to_string(),
                        at: *at,
                        target,
                    });
                }
                branch_targets.insert(target);
                has_loops |= target <= *at;
            }
            match op {
                Op::Load(index) | Op::Store(index) if *index >= max_locals => {
                    return Err(ProgramError::LocalOutOfRange {
                        unit: name.to_string(),
                        at: *at,
                        index: *index,
                        max_locals,
                    });
                }
                Op::Ldc(index) if *index as usize >= constants.len() => {
                    return Err(ProgramError::ConstantOutOfRange {
                        unit: name.to_string(),
                        at: *at,
                        index: *index,
                    });
                }
                _ => {}
            }
            can_throw |= op.can_throw();
        }

        match ops.last() {
            Some((_, last)) if last.is_terminal() => {}
            _ => {
                return Err(ProgramError::FallsOffEnd {
                    unit: name.to_string(),
                });
            }
        }

        Ok(Self {
            id,
            name: name.to_string(),
            max_locals,
            code,
            constants,
            ops,
            branch_targets,
            has_loops,
            can_throw,
        })
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_locals(&self) -> u16 {
        self.max_locals
    }

    /// Raw bytecode.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn code_len(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn constant(&self, index: u16) -> Option<Constant> {
        self.constants.get(index as usize).copied()
    }

    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    /// The instruction at `bci` and the offset of the one after it.
    pub fn op_at(&self, bci: Bci) -> Option<(Op, Bci)> {
        let index = self.ops.binary_search_by_key(&bci, |(at, _)| *at).ok()?;
        let op = self.ops[index].1;
        Some((op, bci + op.size()))
    }

    pub fn ops(&self) -> impl Iterator<Item = (Bci, Op)> + '_ {
        self.ops.iter().copied()
    }

    pub fn is_branch_target(&self, bci: Bci) -> bool {
        self.branch_targets.contains(&bci)
    }

    pub fn branch_targets(&self) -> &BTreeSet<Bci> {
        &self.branch_targets
    }

    /// Whether any branch jumps backwards.
    pub fn has_loops(&self) -> bool {
        self.has_loops
    }

    pub fn can_throw(&self) -> bool {
        self.can_throw
    }
}

/// The set of units visible to the JIT, indexed by [`UnitId`].
#[derive(Debug, Clone, Default)]
pub struct Program {
    units: Vec<CompilationUnit>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id the next added unit will receive.
    pub fn next_id(&self) -> UnitId {
        UnitId(self.units.len() as u16)
    }

    /// Add a unit built with [`Program::next_id`].
    pub fn push(&mut self, unit: CompilationUnit) -> UnitId {
        debug_assert_eq!(unit.id(), self.next_id());
        let id = unit.id();
        self.units.push(unit);
        id
    }

    pub fn get(&self, id: UnitId) -> Option<&CompilationUnit> {
        self.units.get(id.0 as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<&CompilationUnit> {
        self.units.iter().find(|unit| unit.name() == name)
    }

    pub fn units(&self) -> &[CompilationUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(ops: &[Op]) -> Result<CompilationUnit, ProgramError> {
        CompilationUnit::new(UnitId(0), "t", 2, bytecode::encode(ops), vec![Constant::Int(7)])
    }

    #[test]
    fn test_metadata() {
        // 0: iconst 0; 5: store 0; 8: load 0; 11: ifeq 8; 16: return
        let u = unit(&[
            Op::IConst(0),
            Op::Store(0),
            Op::Load(0),
            Op::IfEq(8),
            Op::Return,
        ])
        .unwrap();

        assert!(u.has_loops());
        assert!(!u.can_throw());
        assert!(u.is_branch_target(8));
        assert_eq!(u.op_at(11), Some((Op::IfEq(8), 16)));
        assert_eq!(u.op_at(12), None);
    }

    #[test]
    fn test_rejects_bad_target() {
        let err = unit(&[Op::Goto(3), Op::Return]).unwrap_err();
        assert!(matches!(err, ProgramError::BadTarget { target: 3, .. }));
    }

    #[test]
    fn test_rejects_fall_through_end() {
        let err = unit(&[Op::IConst(1), Op::Pop]).unwrap_err();
        assert!(matches!(err, ProgramError::FallsOffEnd { .. }));
    }

    #[test]
    fn test_rejects_local_out_of_range() {
        let err = unit(&[Op::Load(2), Op::VReturn]).unwrap_err();
        assert!(matches!(err, ProgramError::LocalOutOfRange { index: 2, .. }));
    }

    #[test]
    fn test_rejects_constant_out_of_range() {
        let err = unit(&[Op::Ldc(1), Op::VReturn]).unwrap_err();
        assert!(matches!(err, ProgramError::ConstantOutOfRange { index: 1, .. }));
    }
}
