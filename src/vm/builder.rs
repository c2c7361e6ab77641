//! Assembler for unit bytecode with symbolic branch labels.

use super::bytecode::write_op;
use super::{Bci, CompilationUnit, Constant, Op, ProgramError, UnitId};
use std::collections::HashMap;

/// Builds a [`CompilationUnit`] one instruction at a time.
///
/// Branches name a label instead of an offset; labels may be defined
/// before or after the branches that use them.
#[derive(Debug, Clone)]
pub struct UnitBuilder {
    name: String,
    max_locals: u16,
    code: Vec<u8>,
    constants: Vec<Constant>,
    labels: HashMap<String, Bci>,
    /// (operand offset, label) for branches waiting on a label.
    fixups: Vec<(usize, String)>,
    duplicate: Option<String>,
}

impl UnitBuilder {
    pub fn new(name: &str, max_locals: u16) -> Self {
        Self {
            name: name.to_string(),
            max_locals,
            code: Vec::new(),
            constants: Vec::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
            duplicate: None,
        }
    }

    /// Offset the next instruction will be written at.
    pub fn offset(&self) -> Bci {
        self.code.len() as Bci
    }

    /// Append an instruction.
    pub fn op(&mut self, op: Op) -> &mut Self {
        write_op(&mut self.code, &op).expect("writing to Vec cannot fail");
        self
    }

    /// Append several instructions.
    pub fn ops(&mut self, ops: &[Op]) -> &mut Self {
        for op in ops {
            self.op(*op);
        }
        self
    }

    /// Define `name` at the current offset.
    pub fn label(&mut self, name: &str) -> &mut Self {
        let at = self.offset();
        if self.labels.insert(name.to_string(), at).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(name.to_string());
        }
        self
    }

    /// Append a branch built by `make` (e.g. `Op::Goto`) targeting `label`.
    pub fn branch(&mut self, make: fn(Bci) -> Op, label: &str) -> &mut Self {
        let op = make(0);
        debug_assert!(op.branch_target().is_some(), "{} is not a branch", op);
        // Target operand follows the opcode byte.
        self.fixups.push((self.code.len() + 1, label.to_string()));
        self.op(op)
    }

    /// Intern a constant and append an `ldc` for it.
    pub fn ldc(&mut self, constant: Constant) -> &mut Self {
        let index = match self.constants.iter().position(|c| *c == constant) {
            Some(index) => index,
            None => {
                self.constants.push(constant);
                self.constants.len() - 1
            }
        };
        self.op(Op::Ldc(index as u16))
    }

    /// Resolve labels and check the result.
    pub fn build(&self, id: UnitId) -> Result<CompilationUnit, ProgramError> {
        if let Some(label) = &self.duplicate {
            return Err(ProgramError::DuplicateLabel {
                unit: self.name.clone(),
                label: label.clone(),
            });
        }

        let mut code = self.code.clone();
        for (at, label) in &self.fixups {
            let target = self
                .labels
                .get(label)
                .ok_or_else(|| ProgramError::UndefinedLabel {
                    unit: self.name.clone(),
                    label: label.clone(),
                })?;
            code[*at..*at + 4].copy_from_slice(&target.to_le_bytes());
        }

        CompilationUnit::new(id, &self.name, self.max_locals, code, self.constants.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_backward_labels() {
        let mut b = UnitBuilder::new("loop", 1);
        b.op(Op::IConst(3))
            .op(Op::Store(0))
            .label("head")
            .op(Op::Load(0))
            .branch(Op::IfEq, "done")
            .op(Op::Load(0))
            .op(Op::IConst(1))
            .op(Op::Sub)
            .op(Op::Store(0))
            .branch(Op::Goto, "head")
            .label("done")
            .op(Op::Return);
        let unit = b.build(UnitId(0)).unwrap();

        assert_eq!(unit.op_at(11), Some((Op::IfEq(33), 16)));
        assert_eq!(unit.op_at(28), Some((Op::Goto(8), 33)));
        assert!(unit.has_loops());
    }

    #[test]
    fn test_undefined_label() {
        let mut b = UnitBuilder::new("bad", 0);
        b.branch(Op::Goto, "nowhere");
        assert!(matches!(
            b.build(UnitId(0)),
            Err(ProgramError::UndefinedLabel { .. })
        ));
    }

    #[test]
    fn test_ldc_interns_constants() {
        let mut b = UnitBuilder::new("c", 0);
        b.ldc(Constant::Int(0x12345678))
            .ldc(Constant::Int(0x12345678))
            .op(Op::Add)
            .op(Op::VReturn);
        let unit = b.build(UnitId(0)).unwrap();

        assert_eq!(unit.constants().len(), 1);
        assert_eq!(unit.op_at(3), Some((Op::Ldc(0), 6)));
    }
}
