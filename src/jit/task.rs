//! Compilation tasks and the work queue.
//!
//! Each task owns an entry label. It is created when its label is first
//! referenced and emits itself when the driver gets to it. Stubs finish in
//! one step; continuations may take several.

use super::backend::{Backend, Cond, Inst};
use super::label::LabelId;
use super::masm::MacroAssembler;
use super::template::{layout, Continuation};
use super::Failure;
use crate::vm::{Bci, UnitId};
use serde::Serialize;
use std::fmt;

/// Implicit exceptions raised from compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ExceptionKind {
    DivideByZero = 1,
    NullPointer = 2,
    IndexOutOfBounds = 3,
    /// `throw` with an object on the stack.
    Explicit = 4,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionKind::DivideByZero => "divide by zero",
            ExceptionKind::NullPointer => "null pointer",
            ExceptionKind::IndexOutOfBounds => "index out of bounds",
            ExceptionKind::Explicit => "explicit",
        };
        f.write_str(name)
    }
}

/// Calls the throw helper with `(ctx, kind, bci, unit)`. Never returns.
#[derive(Debug, Clone)]
pub struct ExceptionStub {
    pub entry: LabelId,
    pub kind: ExceptionKind,
    pub unit: UnitId,
    pub bci: Bci,
}

/// Enters a running loop: sets up the frame like the method entry, then
/// jumps to the loop header.
#[derive(Debug, Clone)]
pub struct OsrStub {
    pub entry: LabelId,
    pub bci: Bci,
    pub target: LabelId,
}

/// Slow path of `checkcast`: the object is in TMP0 and its class did not
/// match exactly. The helper throws or returns.
#[derive(Debug, Clone)]
pub struct TypeCheckStub {
    pub entry: LabelId,
    pub class: u16,
    pub resume: LabelId,
}

/// Slow path of `monitorenter`/`monitorexit`: the object is in TMP0.
#[derive(Debug, Clone)]
pub struct MonitorStub {
    pub entry: LabelId,
    pub exit: bool,
    pub resume: LabelId,
}

#[derive(Debug, Clone)]
pub enum Task {
    Continuation(Continuation),
    ExceptionStub(ExceptionStub),
    OsrStub(OsrStub),
    TypeCheckStub(TypeCheckStub),
    MonitorStub(MonitorStub),
}

impl Task {
    pub fn entry(&self) -> LabelId {
        match self {
            Task::Continuation(c) => c.entry,
            Task::ExceptionStub(stub) => stub.entry,
            Task::OsrStub(stub) => stub.entry,
            Task::TypeCheckStub(stub) => stub.entry,
            Task::MonitorStub(stub) => stub.entry,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Task::Continuation(_) => "continuation",
            Task::ExceptionStub(_) => "exception stub",
            Task::OsrStub(_) => "osr stub",
            Task::TypeCheckStub(_) => "type check stub",
            Task::MonitorStub(_) => "monitor stub",
        }
    }
}

impl ExceptionStub {
    pub fn emit<B: Backend>(&self, masm: &mut MacroAssembler<B>) -> Result<(), Failure> {
        masm.bind(self.entry);
        masm.emit(Inst::Mov { rd: B::TMP0, rm: B::CTX })?;
        masm.emit(Inst::MovImm { rd: B::TMP1, imm: self.kind as i32 })?;
        masm.mov_imm(B::TMP2, self.bci as i32)?;
        masm.mov_imm(B::TMP3, self.unit.0 as i32)?;
        masm.call_helper(layout::HELPER_THROW)?;
        masm.mark_transfer();
        Ok(())
    }
}

impl OsrStub {
    pub fn emit<B: Backend>(&self, masm: &mut MacroAssembler<B>) -> Result<(), Failure> {
        masm.bind(self.entry);
        let prologue = masm.backend().prologue();
        masm.emit_all(&prologue)?;
        masm.branch(Cond::Al, self.target)
    }
}

impl TypeCheckStub {
    pub fn emit<B: Backend>(&self, masm: &mut MacroAssembler<B>) -> Result<(), Failure> {
        masm.bind(self.entry);
        // (ctx, object, class)
        masm.emit(Inst::Mov { rd: B::TMP1, rm: B::TMP0 })?;
        masm.emit(Inst::Mov { rd: B::TMP0, rm: B::CTX })?;
        masm.mov_imm(B::TMP2, self.class as i32)?;
        masm.call_helper(layout::HELPER_CHECKCAST)?;
        masm.branch(Cond::Al, self.resume)
    }
}

impl MonitorStub {
    pub fn emit<B: Backend>(&self, masm: &mut MacroAssembler<B>) -> Result<(), Failure> {
        masm.bind(self.entry);
        // (ctx, object)
        masm.emit(Inst::Mov { rd: B::TMP1, rm: B::TMP0 })?;
        masm.emit(Inst::Mov { rd: B::TMP0, rm: B::CTX })?;
        let helper = if self.exit {
            layout::HELPER_MONITOR_EXIT
        } else {
            layout::HELPER_MONITOR_ENTER
        };
        masm.call_helper(helper)?;
        masm.branch(Cond::Al, self.resume)
    }
}

/// Pending tasks, newest first.
#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    tasks: Vec<Task>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.tasks.pop()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::backend::{Arm32, PatchKind};
    use crate::jit::codebuf::{BufferLimits, CodeBuffer};
    use crate::jit::label::LabelTable;
    use crate::jit::memory::HeapAllocator;
    use std::sync::Arc;

    fn masm() -> MacroAssembler<Arm32> {
        let limits = BufferLimits {
            max_growths: 2,
            max_code_size: 4096,
        };
        let buffer = CodeBuffer::new(Arc::new(HeapAllocator::new(1 << 16)), 256, limits).unwrap();
        MacroAssembler::new(Arm32, buffer, 8, 64)
    }

    #[test]
    fn test_queue_is_lifo() {
        let mut labels = LabelTable::new();
        let mut queue = WorkQueue::new();
        for bci in [1, 2, 3] {
            queue.push(Task::ExceptionStub(ExceptionStub {
                entry: labels.create(),
                kind: ExceptionKind::NullPointer,
                unit: UnitId(0),
                bci,
            }));
        }

        let order: Vec<Bci> = std::iter::from_fn(|| queue.pop())
            .map(|task| match task {
                Task::ExceptionStub(stub) => stub.bci,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn test_exception_stub_calls_throw_helper() {
        let mut m = masm();
        let stub = ExceptionStub {
            entry: m.new_label(),
            kind: ExceptionKind::DivideByZero,
            unit: UnitId(2),
            bci: 17,
        };
        stub.emit(&mut m).unwrap();

        assert_eq!(m.labels().position(stub.entry), Some(0));
        let out = m.finish().unwrap();
        // mov, mov kind, mov bci, mov unit, ldr helper, blx
        assert_eq!(out.code.len(), 6 * 4);
        assert!(out.literal_offsets.is_empty());
    }

    #[test]
    fn test_type_check_stub_branches_back() {
        let mut m = masm();
        let resume = m.new_label();
        m.bind(resume);
        m.emit(Inst::Nop).unwrap();
        let stub = TypeCheckStub {
            entry: m.new_label(),
            class: 7,
            resume,
        };
        stub.emit(&mut m).unwrap();
        let out = m.finish().unwrap();

        let last = out.code.len() - 4;
        let word = u32::from_le_bytes(out.code[last..].try_into().unwrap());
        assert_eq!(Arm32.classify(word), Some(PatchKind::Branch));
        assert_eq!(Arm32.target(PatchKind::Branch, word, last as u32), 0);
    }
}
