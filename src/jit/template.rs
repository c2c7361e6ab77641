//! Template compilation of bytecode into continuations.
//!
//! Each bytecode expands to a fixed instruction sequence over the in-memory
//! operand stack. A continuation compiles straight-line code from one
//! bytecode offset until it meets code that was already emitted, an
//! unconditional exit, or the end of its increment.
//!
//! Register conventions (see [`Backend`]):
//! - CTX: runtime context, whose first slots hold the helper table
//! - VSTACK: operand stack pointer, pointing at the next free slot
//! - LOCALS: base of the locals array, shared by inlined frames
//! - TMP0-TMP3: temporaries and helper arguments

use super::backend::{AluOp, Backend, Cond, Inst};
use super::label::LabelId;
use super::literal::Literal;
use super::session::CompilerSession;
use super::task::{ExceptionKind, ExceptionStub, MonitorStub, OsrStub, Task, TypeCheckStub};
use super::Failure;
use crate::vm::{Bci, CompilationUnit, Constant, Op, Program, UnitId};
use serde::Serialize;
use tracing::{debug, trace};

/// Runtime layout constants, in slots of [`Backend::SLOT_SIZE`] bytes.
pub mod layout {
    /// Invoke a unit: `(ctx, unit, argc, args) -> result`.
    pub const HELPER_CALL: u16 = 0;
    /// Raise an exception: `(ctx, kind, bci, unit_or_object)`. Never returns.
    pub const HELPER_THROW: u16 = 1;
    /// Full subtype check: `(ctx, object, class)`. Throws on failure.
    pub const HELPER_CHECKCAST: u16 = 2;
    pub const HELPER_MONITOR_ENTER: u16 = 3;
    pub const HELPER_MONITOR_EXIT: u16 = 4;

    pub const CLASS_WORD: u16 = 0;
    /// Zero when unlocked, otherwise the owning context.
    pub const LOCK_WORD: u16 = 1;
    pub const ARRAY_LENGTH: u16 = 2;
    /// First array element.
    pub const ARRAY_HEADER: u16 = 3;
}

/// Largest byte offset a local may sit at.
const MAX_LOCAL_OFFSET: u32 = 4095;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FrameId(pub u32);

impl FrameId {
    pub const ROOT: FrameId = FrameId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A unit being compiled inline, or the root unit itself.
#[derive(Debug, Clone)]
pub struct InlineFrame {
    pub unit: UnitId,
    /// First local slot of this frame in the shared locals array.
    pub locals_base: u32,
    pub depth: u32,
    pub parent: Option<FrameId>,
    /// Returns branch here. `None` for the root frame.
    pub return_label: Option<LabelId>,
}

impl InlineFrame {
    pub fn root(unit: UnitId) -> Self {
        Self {
            unit,
            locals_base: 0,
            depth: 0,
            parent: None,
            return_label: None,
        }
    }
}

/// How a block was first reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reached {
    FallThrough,
    Jump,
}

/// Compiles straight-line bytecode starting at `bci` in `frame`.
#[derive(Debug, Clone)]
pub struct Continuation {
    pub entry: LabelId,
    pub frame: FrameId,
    pub bci: Bci,
    /// Emits the prologue before the first bytecode.
    method_entry: bool,
    started: bool,
}

impl Continuation {
    pub fn method_entry(entry: LabelId) -> Self {
        Self {
            entry,
            frame: FrameId::ROOT,
            bci: 0,
            method_entry: true,
            started: false,
        }
    }

    pub fn at(entry: LabelId, frame: FrameId, bci: Bci) -> Self {
        Self {
            entry,
            frame,
            bci,
            method_entry: false,
            started: false,
        }
    }
}

enum Flow {
    /// Fall through to the next bytecode.
    Next,
    /// The continuation moved into an inlined callee.
    Switched,
    /// Control does not fall through; the continuation is finished.
    Done,
}

impl<B: Backend> CompilerSession<B> {
    /// Emit up to `increment_ops` bytecodes. Returns `true` when finished.
    pub(super) fn compile_continuation(
        &mut self,
        c: &mut Continuation,
        program: &Program,
    ) -> Result<bool, Failure> {
        let mut fresh = false;
        if !c.started {
            if self.masm.is_bound(c.entry) {
                trace!(entry = %c.entry, bci = c.bci, "continuation already emitted");
                return Ok(true);
            }
            self.masm.bind(c.entry);
            if c.method_entry {
                let prologue = self.masm.backend().prologue();
                self.masm.emit_all(&prologue)?;
            }
            if self.block_labels.get(&(c.frame, c.bci)) == Some(&c.entry) {
                self.reached.entry((c.frame, c.bci)).or_insert(Reached::Jump);
            }
            c.started = true;
            fresh = true;
        }

        for _ in 0..self.limits.increment_ops {
            let unit = self.frame_unit(c.frame, program);
            let key = (c.frame, c.bci);

            let starts_here = fresh && self.block_labels.get(&key) == Some(&c.entry);
            if unit.is_branch_target(c.bci) && !starts_here {
                let label = self.block_label(key);
                if self.masm.is_bound(label) {
                    self.masm.branch(Cond::Al, label)?;
                    return Ok(true);
                }
                self.masm.bind(label);
                self.reached.entry(key).or_insert(Reached::FallThrough);
            }
            fresh = false;

            let (op, next) = match unit.op_at(c.bci) {
                Some(decoded) => decoded,
                None => panic!("{} has no instruction at {}", unit.name(), c.bci),
            };
            self.stats.bytecodes += 1;
            match self.emit_op(c, unit, op, next, program)? {
                Flow::Next => c.bci = next,
                Flow::Switched => {}
                Flow::Done => return Ok(true),
            }
        }
        Ok(false)
    }

    fn frame_unit<'p>(&self, frame: FrameId, program: &'p Program) -> &'p CompilationUnit {
        let id = self.frames[frame.index()].unit;
        match program.get(id) {
            Some(unit) => unit,
            None => panic!("frame {:?} refers to unknown unit {}", frame, id),
        }
    }

    /// The label of the block at `key`, without queueing anything.
    fn block_label(&mut self, key: (FrameId, Bci)) -> LabelId {
        if let Some(&label) = self.block_labels.get(&key) {
            return label;
        }
        let label = self.masm.new_label();
        self.block_labels.insert(key, label);
        label
    }

    /// The label of a branch target, queueing a continuation for it the
    /// first time it is seen.
    fn jump_target(&mut self, frame: FrameId, bci: Bci) -> LabelId {
        if let Some(&label) = self.block_labels.get(&(frame, bci)) {
            return label;
        }
        let label = self.block_label((frame, bci));
        self.queue
            .push(Task::Continuation(Continuation::at(label, frame, bci)));
        label
    }

    fn local_offset(&self, frame: FrameId, index: u16) -> Result<u16, Failure> {
        let slot = self.frames[frame.index()].locals_base + index as u32;
        let offset = slot * B::SLOT_SIZE as u32;
        if offset > MAX_LOCAL_OFFSET {
            debug!(slot, "locals exceed the addressable frame");
            return Err(Failure::OutOfStack);
        }
        Ok(offset as u16)
    }

    fn exception_stub(&mut self, kind: ExceptionKind, unit: UnitId, bci: Bci) -> LabelId {
        let entry = self.masm.new_label();
        self.queue.push(Task::ExceptionStub(ExceptionStub {
            entry,
            kind,
            unit,
            bci,
        }));
        entry
    }

    fn branch_to(
        &mut self,
        c: &Continuation,
        unit: &CompilationUnit,
        cond: Cond,
        target: Bci,
    ) -> Result<(), Failure> {
        let label = self.jump_target(c.frame, target);
        if c.frame == FrameId::ROOT && target <= c.bci && unit.has_loops() {
            self.request_osr(target, label);
        }
        self.masm.branch(cond, label)
    }

    fn request_osr(&mut self, bci: Bci, target: LabelId) {
        if self.osr_stubs.contains_key(&bci) {
            return;
        }
        let entry = self.masm.new_label();
        self.osr_stubs.insert(bci, entry);
        self.queue
            .push(Task::OsrStub(OsrStub { entry, bci, target }));
        trace!(bci, "osr entry requested");
    }

    fn push_float(&mut self, value: f32) -> Result<(), Failure> {
        self.masm.load_literal(B::FTMP, Literal::Float(value.to_bits()))?;
        self.masm.emit(Inst::FStore {
            ft: B::FTMP,
            rn: B::VSTACK,
            offset: 0,
        })?;
        self.masm.emit(Inst::AddImm {
            rd: B::VSTACK,
            rn: B::VSTACK,
            imm: B::SLOT_SIZE,
        })
    }

    fn binary(&mut self, op: AluOp) -> Result<(), Failure> {
        self.masm.pop(B::TMP1)?;
        self.masm.pop(B::TMP0)?;
        self.masm.emit(Inst::Alu {
            op,
            rd: B::TMP0,
            rn: B::TMP0,
            rm: B::TMP1,
        })?;
        self.masm.push(B::TMP0)
    }

    /// Branch to a null-pointer stub if `reg` is zero.
    fn null_check(&mut self, reg: super::backend::Reg, unit: UnitId, bci: Bci) -> Result<(), Failure> {
        self.masm.emit(Inst::CmpImm { rn: reg, imm: 0 })?;
        let stub = self.exception_stub(ExceptionKind::NullPointer, unit, bci);
        self.masm.branch(Cond::Eq, stub)
    }

    /// Leave `array` pointing at its element `index`, after null and
    /// bounds checks. Clobbers `scratch`.
    fn element_address(
        &mut self,
        array: super::backend::Reg,
        index: super::backend::Reg,
        scratch: super::backend::Reg,
        unit: UnitId,
        bci: Bci,
    ) -> Result<(), Failure> {
        self.null_check(array, unit, bci)?;
        self.masm.emit(Inst::Load {
            rt: scratch,
            rn: array,
            offset: layout::ARRAY_LENGTH * B::SLOT_SIZE,
        })?;
        self.masm.emit(Inst::Cmp { rn: index, rm: scratch })?;
        let stub = self.exception_stub(ExceptionKind::IndexOutOfBounds, unit, bci);
        self.masm.branch(Cond::Hs, stub)?;
        self.masm.emit(Inst::AddShifted {
            rd: array,
            rn: array,
            rm: index,
            shift: B::SLOT_SIZE.trailing_zeros() as u8,
        })
    }

    fn emit_op(
        &mut self,
        c: &mut Continuation,
        unit: &CompilationUnit,
        op: Op,
        next: Bci,
        program: &Program,
    ) -> Result<Flow, Failure> {
        let bci = c.bci;
        let id = unit.id();
        match op {
            Op::Nop => {}

            // ==================== Constants ====================
            Op::IConst(value) => {
                self.masm.mov_imm(B::TMP0, value)?;
                self.masm.push(B::TMP0)?;
            }
            Op::FConst(value) => self.push_float(value)?,
            Op::Ldc(index) => match unit.constant(index) {
                Some(Constant::Int(value)) => {
                    self.masm.mov_imm(B::TMP0, value)?;
                    self.masm.push(B::TMP0)?;
                }
                Some(Constant::Float(value)) => self.push_float(value)?,
                Some(Constant::Object { handle, offset }) => {
                    self.masm
                        .load_literal(B::TMP0, Literal::Object { handle, offset })?;
                    self.masm.push(B::TMP0)?;
                }
                None => panic!("{} has no constant {}", unit.name(), index),
            },

            // ==================== Locals and stack ====================
            Op::Load(index) => {
                let offset = self.local_offset(c.frame, index)?;
                self.masm.emit(Inst::Load {
                    rt: B::TMP0,
                    rn: B::LOCALS,
                    offset,
                })?;
                self.masm.push(B::TMP0)?;
            }
            Op::Store(index) => {
                let offset = self.local_offset(c.frame, index)?;
                self.masm.pop(B::TMP0)?;
                self.masm.emit(Inst::Store {
                    rt: B::TMP0,
                    rn: B::LOCALS,
                    offset,
                })?;
            }
            Op::Dup => {
                self.masm.peek(B::TMP0, 0)?;
                self.masm.push(B::TMP0)?;
            }
            Op::Pop => {
                self.masm.emit(Inst::SubImm {
                    rd: B::VSTACK,
                    rn: B::VSTACK,
                    imm: B::SLOT_SIZE,
                })?;
            }

            // ==================== Arithmetic ====================
            Op::Add => self.binary(AluOp::Add)?,
            Op::Sub => self.binary(AluOp::Sub)?,
            Op::Mul => self.binary(AluOp::Mul)?,
            Op::And => self.binary(AluOp::And)?,
            Op::Or => self.binary(AluOp::Or)?,
            Op::Xor => self.binary(AluOp::Xor)?,
            Op::Div => {
                self.masm.pop(B::TMP1)?;
                self.masm.pop(B::TMP0)?;
                self.masm.emit(Inst::CmpImm { rn: B::TMP1, imm: 0 })?;
                let stub = self.exception_stub(ExceptionKind::DivideByZero, id, bci);
                self.masm.branch(Cond::Eq, stub)?;
                self.masm.emit(Inst::Alu {
                    op: AluOp::Div,
                    rd: B::TMP0,
                    rn: B::TMP0,
                    rm: B::TMP1,
                })?;
                self.masm.push(B::TMP0)?;
            }
            Op::Neg => {
                self.masm.pop(B::TMP0)?;
                self.masm.emit(Inst::Neg { rd: B::TMP0, rm: B::TMP0 })?;
                self.masm.push(B::TMP0)?;
            }

            // ==================== Control flow ====================
            Op::Goto(target) => {
                self.branch_to(c, unit, Cond::Al, target)?;
                return Ok(Flow::Done);
            }
            Op::IfEq(target) | Op::IfNe(target) | Op::IfLt(target) => {
                self.masm.pop(B::TMP0)?;
                self.masm.emit(Inst::CmpImm { rn: B::TMP0, imm: 0 })?;
                let cond = match op {
                    Op::IfEq(_) => Cond::Eq,
                    Op::IfNe(_) => Cond::Ne,
                    _ => Cond::Lt,
                };
                self.branch_to(c, unit, cond, target)?;
            }
            Op::IfCmpEq(target) | Op::IfCmpLt(target) => {
                self.masm.pop(B::TMP1)?;
                self.masm.pop(B::TMP0)?;
                self.masm.emit(Inst::Cmp { rn: B::TMP0, rm: B::TMP1 })?;
                let cond = if matches!(op, Op::IfCmpEq(_)) { Cond::Eq } else { Cond::Lt };
                self.branch_to(c, unit, cond, target)?;
            }

            // ==================== Objects ====================
            Op::ALoad => {
                self.masm.pop(B::TMP1)?;
                self.masm.pop(B::TMP0)?;
                self.element_address(B::TMP0, B::TMP1, B::TMP2, id, bci)?;
                self.masm.emit(Inst::Load {
                    rt: B::TMP0,
                    rn: B::TMP0,
                    offset: layout::ARRAY_HEADER * B::SLOT_SIZE,
                })?;
                self.masm.push(B::TMP0)?;
            }
            Op::AStore => {
                self.masm.pop(B::TMP2)?;
                self.masm.pop(B::TMP1)?;
                self.masm.pop(B::TMP0)?;
                self.element_address(B::TMP0, B::TMP1, B::TMP3, id, bci)?;
                self.masm.emit(Inst::Store {
                    rt: B::TMP2,
                    rn: B::TMP0,
                    offset: layout::ARRAY_HEADER * B::SLOT_SIZE,
                })?;
            }
            Op::CheckCast(class) => {
                let resume = self.masm.new_label();
                self.masm.peek(B::TMP0, 0)?;
                // null passes any cast
                self.masm.emit(Inst::CmpImm { rn: B::TMP0, imm: 0 })?;
                self.masm.branch(Cond::Eq, resume)?;
                self.masm.emit(Inst::Load {
                    rt: B::TMP1,
                    rn: B::TMP0,
                    offset: layout::CLASS_WORD * B::SLOT_SIZE,
                })?;
                self.masm.mov_imm(B::TMP2, class as i32)?;
                self.masm.emit(Inst::Cmp { rn: B::TMP1, rm: B::TMP2 })?;
                let slow = self.masm.new_label();
                self.masm.branch(Cond::Ne, slow)?;
                self.queue.push(Task::TypeCheckStub(TypeCheckStub {
                    entry: slow,
                    class,
                    resume,
                }));
                self.masm.bind(resume);
            }
            Op::MonitorEnter | Op::MonitorExit => {
                let exit = op == Op::MonitorExit;
                self.masm.pop(B::TMP0)?;
                self.null_check(B::TMP0, id, bci)?;
                self.masm.emit(Inst::Load {
                    rt: B::TMP1,
                    rn: B::TMP0,
                    offset: layout::LOCK_WORD * B::SLOT_SIZE,
                })?;
                if exit {
                    self.masm.emit(Inst::Cmp { rn: B::TMP1, rm: B::CTX })?;
                } else {
                    self.masm.emit(Inst::CmpImm { rn: B::TMP1, imm: 0 })?;
                }
                let slow = self.masm.new_label();
                let resume = self.masm.new_label();
                self.masm.branch(Cond::Ne, slow)?;
                self.queue.push(Task::MonitorStub(MonitorStub {
                    entry: slow,
                    exit,
                    resume,
                }));
                let owner = if exit {
                    self.masm.emit(Inst::MovImm { rd: B::TMP1, imm: 0 })?;
                    B::TMP1
                } else {
                    B::CTX
                };
                self.masm.emit(Inst::Store {
                    rt: owner,
                    rn: B::TMP0,
                    offset: layout::LOCK_WORD * B::SLOT_SIZE,
                })?;
                self.masm.bind(resume);
            }

            // ==================== Calls and exits ====================
            Op::Invoke { unit: callee, argc } | Op::InvokeInline { unit: callee, argc } => {
                let forced = matches!(op, Op::InvokeInline { .. });
                if self.try_inline(c, UnitId(callee), argc, next, forced, program)? {
                    return Ok(Flow::Switched);
                }
                self.call_unit(callee, argc)?;
            }
            Op::Return | Op::VReturn => {
                self.exit_frame(c.frame, op == Op::VReturn)?;
                return Ok(Flow::Done);
            }
            Op::Throw => {
                self.masm.pop(B::TMP3)?;
                self.masm.emit(Inst::Mov { rd: B::TMP0, rm: B::CTX })?;
                self.masm.emit(Inst::MovImm {
                    rd: B::TMP1,
                    imm: ExceptionKind::Explicit as i32,
                })?;
                self.masm.mov_imm(B::TMP2, bci as i32)?;
                self.masm.call_helper(layout::HELPER_THROW)?;
                self.masm.mark_transfer();
                return Ok(Flow::Done);
            }
        }
        Ok(Flow::Next)
    }

    /// Out-of-line call through the runtime. Arguments stay on the operand
    /// stack; the result replaces them.
    fn call_unit(&mut self, callee: u16, argc: u8) -> Result<(), Failure> {
        if argc > 0 {
            self.masm.emit(Inst::SubImm {
                rd: B::VSTACK,
                rn: B::VSTACK,
                imm: argc as u16 * B::SLOT_SIZE,
            })?;
        }
        self.masm.emit(Inst::Mov { rd: B::TMP3, rm: B::VSTACK })?;
        self.masm.emit(Inst::Mov { rd: B::TMP0, rm: B::CTX })?;
        self.masm.mov_imm(B::TMP1, callee as i32)?;
        self.masm.emit(Inst::MovImm {
            rd: B::TMP2,
            imm: argc as i32,
        })?;
        self.masm.call_helper(layout::HELPER_CALL)?;
        self.masm.push(B::TMP0)
    }

    fn exit_frame(&mut self, frame: FrameId, value: bool) -> Result<(), Failure> {
        match self.frames[frame.index()].return_label {
            // The result, if any, stays on the operand stack for the caller.
            Some(label) => self.masm.branch(Cond::Al, label),
            None => {
                if value {
                    self.masm.pop(B::TMP0)?;
                }
                self.masm.ret()
            }
        }
    }

    fn is_recursive(&self, frame: FrameId, callee: UnitId) -> bool {
        let mut cursor = Some(frame);
        while let Some(id) = cursor {
            let frame = &self.frames[id.index()];
            if frame.unit == callee {
                return true;
            }
            cursor = frame.parent;
        }
        false
    }

    /// Inline `callee` into a new frame and move `c` into it. Returns
    /// `false` when the call should go through the runtime instead.
    fn try_inline(
        &mut self,
        c: &mut Continuation,
        callee: UnitId,
        argc: u8,
        next: Bci,
        forced: bool,
        program: &Program,
    ) -> Result<bool, Failure> {
        let Some(target) = program.get(callee) else {
            return Ok(false);
        };
        let caller = self.frames[c.frame.index()].clone();
        let depth = caller.depth + 1;

        if forced {
            if depth > self.limits.max_inline_depth {
                debug!(%callee, depth, "forced inline exceeds nesting limit");
                return Err(Failure::OutOfStack);
            }
        } else if depth > self.limits.max_inline_depth
            || target.code_len() > self.limits.inline_max_bytes
            || self.is_recursive(c.frame, callee)
        {
            return Ok(false);
        }
        if argc as u16 > target.max_locals() {
            return Ok(false);
        }

        let caller_locals = self.frame_unit(c.frame, program).max_locals() as u32;
        let return_label = self.masm.new_label();
        let frame = FrameId(self.frames.len() as u32);
        let locals_base = caller.locals_base + caller_locals;
        self.frames.push(InlineFrame {
            unit: callee,
            locals_base,
            depth,
            parent: Some(c.frame),
            return_label: Some(return_label),
        });
        self.frame_slots = self
            .frame_slots
            .max(locals_base + target.max_locals() as u32);

        // The last argument is on top.
        for index in (0..argc as u16).rev() {
            let offset = self.local_offset(frame, index)?;
            self.masm.pop(B::TMP0)?;
            self.masm.emit(Inst::Store {
                rt: B::TMP0,
                rn: B::LOCALS,
                offset,
            })?;
        }

        self.queue.push(Task::Continuation(Continuation::at(
            return_label,
            c.frame,
            next,
        )));

        let entry = self.masm.new_label();
        self.masm.bind(entry);
        *c = Continuation {
            entry,
            frame,
            bci: 0,
            method_entry: false,
            started: true,
        };
        self.stats.inlined_calls += 1;
        trace!(%callee, depth, locals_base, "inlined call");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::jit::backend::{AArch64, Arm32, PatchKind};
    use crate::jit::budget::Unlimited;
    use crate::jit::code::CompiledCode;
    use crate::jit::memory::HeapAllocator;
    use crate::jit::session::Outcome;
    use crate::vm::UnitBuilder;
    use std::sync::Arc;

    fn compile<B: Backend>(backend: B, program: &Program, config: &JitConfig) -> CompiledCode {
        let unit = program.get(UnitId(0)).unwrap();
        let estimate = CompilerSession::<B>::initial_estimate(unit, config);
        let allocator = Arc::new(HeapAllocator::new(config.scratch_limit));
        let session = CompilerSession::new(backend, unit, config, allocator, estimate).unwrap();
        match session.drive(program, &mut Unlimited).unwrap() {
            Outcome::Finished(code) => code,
            Outcome::Suspended(_) => panic!("unlimited budget suspended"),
        }
    }

    fn program(units: Vec<UnitBuilder>) -> Program {
        let mut program = Program::new();
        for builder in units {
            let unit = builder.build(program.next_id()).unwrap();
            program.push(unit);
        }
        program
    }

    fn countdown() -> UnitBuilder {
        let mut b = UnitBuilder::new("countdown", 1);
        b.op(Op::IConst(10))
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
        b
    }

    #[test]
    fn test_straight_line_unit() {
        let mut b = UnitBuilder::new("add", 2);
        b.ops(&[Op::Load(0), Op::Load(1), Op::Add, Op::VReturn]);
        let code = compile(Arm32, &program(vec![b]), &JitConfig::default());

        assert_eq!(code.entry(), 0);
        assert!(code.osr_entries().is_empty());
        assert!(code.literal_offsets().is_empty());
        // Ends with POP {r4, r5, r6, pc}.
        assert_eq!(code.word(code.len() as u32 - 4), Some(0xE8BD_8070));
    }

    #[test]
    fn test_loop_gets_osr_entry() {
        let code = compile(Arm32, &program(vec![countdown()]), &JitConfig::default());

        assert_eq!(code.osr_entries().len(), 1);
        assert_eq!(code.osr_entries()[0].bci, 8);
        assert!(code.stats().bytecodes >= 10);
    }

    #[test]
    fn test_every_branch_is_resolved() {
        let code = compile(AArch64, &program(vec![countdown()]), &JitConfig::default());
        for (at, word) in code.words() {
            if code.is_literal(at) {
                continue;
            }
            if AArch64.classify(word) == Some(PatchKind::Branch) {
                let target = AArch64.target(PatchKind::Branch, word, at);
                assert!(target != at, "unresolved branch at {}", at);
                assert!((target as usize) < code.len());
            }
        }
    }

    #[test]
    fn test_small_callee_is_inlined() {
        let mut main = UnitBuilder::new("main", 1);
        main.ops(&[Op::Load(0), Op::Invoke { unit: 1, argc: 1 }, Op::VReturn]);
        let mut inc = UnitBuilder::new("inc", 1);
        inc.ops(&[Op::Load(0), Op::IConst(1), Op::Add, Op::VReturn]);
        let code = compile(Arm32, &program(vec![main, inc]), &JitConfig::default());

        assert_eq!(code.stats().inlined_calls, 1);
        assert_eq!(code.frame_slots(), 2);
    }

    #[test]
    fn test_recursive_callee_is_called() {
        let mut main = UnitBuilder::new("fact", 1);
        main.ops(&[Op::Load(0), Op::Invoke { unit: 0, argc: 1 }, Op::VReturn]);
        let code = compile(Arm32, &program(vec![main]), &JitConfig::default());

        assert_eq!(code.stats().inlined_calls, 0);
        assert_eq!(code.frame_slots(), 1);
    }

    #[test]
    fn test_forced_recursive_inline_runs_out_of_stack() {
        let mut main = UnitBuilder::new("loop", 1);
        main.ops(&[Op::Load(0), Op::InvokeInline { unit: 0, argc: 1 }, Op::VReturn]);
        let program = program(vec![main]);
        let config = JitConfig::default();
        let unit = program.get(UnitId(0)).unwrap();
        let estimate = CompilerSession::<Arm32>::initial_estimate(unit, &config);
        let allocator = Arc::new(HeapAllocator::new(config.scratch_limit));
        let session = CompilerSession::new(Arm32, unit, &config, allocator, estimate).unwrap();

        assert!(matches!(
            session.drive(&program, &mut Unlimited),
            Err(Failure::OutOfStack)
        ));
    }

    #[test]
    fn test_checked_ops_queue_stubs() {
        let mut b = UnitBuilder::new("checks", 2);
        b.ops(&[
            Op::Load(0),
            Op::Load(1),
            Op::Div,
            Op::Load(0),
            Op::IConst(0),
            Op::ALoad,
            Op::Add,
            Op::Load(0),
            Op::CheckCast(3),
            Op::MonitorEnter,
            Op::VReturn,
        ]);
        let code = compile(AArch64, &program(vec![b]), &JitConfig::default());
        // continuation + divide, null, bounds, null, type check, monitor stubs
        assert_eq!(code.stats().tasks_completed, 7);
    }
}
