use std::fmt;

/// Byte offset of an instruction within a unit's bytecode.
pub type Bci = u32;

/// Bytecode operations understood by the JIT.
///
/// The operand stack holds one machine word per slot. Branch operands are
/// absolute byte offsets into the same unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Nop,

    // ========================================
    // Constants
    // ========================================
    IConst(i32),
    FConst(f32),
    Ldc(u16), // constant table index

    // ========================================
    // Locals and stack
    // ========================================
    Load(u16),
    Store(u16),
    Dup,
    Pop,

    // ========================================
    // Arithmetic
    // ========================================
    Add,
    Sub,
    Mul,
    Div, // throws on a zero divisor
    And,
    Or,
    Xor,
    Neg,

    // ========================================
    // Control flow
    // ========================================
    Goto(Bci),
    IfEq(Bci), // [v] → [], branch if v == 0
    IfNe(Bci),
    IfLt(Bci),
    IfCmpEq(Bci), // [a, b] → [], branch if a == b
    IfCmpLt(Bci),

    // ========================================
    // Objects
    // ========================================
    ALoad,  // [arr, idx] → [v]
    AStore, // [arr, idx, v] → []
    CheckCast(u16),
    MonitorEnter,
    MonitorExit,

    // ========================================
    // Calls and exits
    // ========================================
    Invoke { unit: u16, argc: u8 },
    InvokeInline { unit: u16, argc: u8 },
    Return,
    VReturn,
    Throw,
}

impl Op {
    /// Encoded size in bytes, opcode included.
    pub fn size(&self) -> u32 {
        match self {
            Op::IConst(_) | Op::FConst(_) => 5,
            Op::Ldc(_) | Op::Load(_) | Op::Store(_) | Op::CheckCast(_) => 3,
            Op::Goto(_)
            | Op::IfEq(_)
            | Op::IfNe(_)
            | Op::IfLt(_)
            | Op::IfCmpEq(_)
            | Op::IfCmpLt(_) => 5,
            Op::Invoke { .. } | Op::InvokeInline { .. } => 4,
            _ => 1,
        }
    }

    /// The branch target, for branching operations.
    pub fn branch_target(&self) -> Option<Bci> {
        match self {
            Op::Goto(t)
            | Op::IfEq(t)
            | Op::IfNe(t)
            | Op::IfLt(t)
            | Op::IfCmpEq(t)
            | Op::IfCmpLt(t) => Some(*t),
            _ => None,
        }
    }

    /// Whether control never falls through to the next instruction.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Op::Goto(_) | Op::Return | Op::VReturn | Op::Throw)
    }

    /// Whether the operation may raise an exception.
    pub fn can_throw(&self) -> bool {
        matches!(
            self,
            Op::Div
                | Op::ALoad
                | Op::AStore
                | Op::CheckCast(_)
                | Op::MonitorEnter
                | Op::MonitorExit
                | Op::Invoke { .. }
                | Op::InvokeInline { .. }
                | Op::Throw
        )
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Nop => "nop",
            Op::IConst(_) => "iconst",
            Op::FConst(_) => "fconst",
            Op::Ldc(_) => "ldc",
            Op::Load(_) => "load",
            Op::Store(_) => "store",
            Op::Dup => "dup",
            Op::Pop => "pop",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::And => "and",
            Op::Or => "or",
            Op::Xor => "xor",
            Op::Neg => "neg",
            Op::Goto(_) => "goto",
            Op::IfEq(_) => "ifeq",
            Op::IfNe(_) => "ifne",
            Op::IfLt(_) => "iflt",
            Op::IfCmpEq(_) => "ifcmpeq",
            Op::IfCmpLt(_) => "ifcmplt",
            Op::ALoad => "aload",
            Op::AStore => "astore",
            Op::CheckCast(_) => "checkcast",
            Op::MonitorEnter => "monitorenter",
            Op::MonitorExit => "monitorexit",
            Op::Invoke { .. } => "invoke",
            Op::InvokeInline { .. } => "invoke.inline",
            Op::Return => "return",
            Op::VReturn => "vreturn",
            Op::Throw => "throw",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.mnemonic();
        match self {
            Op::IConst(v) => write!(f, "{} {}", name, v),
            Op::FConst(v) => write!(f, "{} {}", name, v),
            Op::Ldc(idx) | Op::Load(idx) | Op::Store(idx) | Op::CheckCast(idx) => {
                write!(f, "{} {}", name, idx)
            }
            Op::Invoke { unit, argc } | Op::InvokeInline { unit, argc } => {
                write!(f, "{} #{} {}", name, unit, argc)
            }
            _ => match self.branch_target() {
                Some(target) => write!(f, "{} @{}", name, target),
                None => f.write_str(name),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Op::IConst(-3).to_string(), "iconst -3");
        assert_eq!(Op::IfCmpLt(12).to_string(), "ifcmplt @12");
        assert_eq!(Op::Invoke { unit: 2, argc: 1 }.to_string(), "invoke #2 1");
        assert_eq!(Op::Return.to_string(), "return");
    }

    #[test]
    fn test_terminal_and_throwing() {
        assert!(Op::Goto(0).is_terminal());
        assert!(!Op::IfEq(0).is_terminal());
        assert!(Op::Div.can_throw());
        assert!(!Op::Add.can_throw());
    }
}
