//! Macro assembler: one code buffer, its labels, and its literal pool.
//!
//! Every instruction goes through [`MacroAssembler::emit`] or one of the
//! label-referencing helpers, which first give the literal pool a chance
//! to flush so that no pending literal drifts out of reach.

use super::backend::{Backend, Cond, Inst, Reg};
use super::code::Relocation;
use super::codebuf::CodeBuffer;
use super::label::{LabelChain, LabelId, LabelTable};
use super::literal::{Literal, LiteralPool};
use super::{CodeOffset, Failure};
use tracing::{debug, trace};

#[derive(Debug)]
pub struct MacroAssembler<B: Backend> {
    backend: B,
    buffer: CodeBuffer,
    labels: LabelTable,
    pool: LiteralPool,
    relocations: Vec<Relocation>,
    /// Offsets of every data word written by pool flushes.
    literal_offsets: Vec<CodeOffset>,
    /// The last instruction never falls through.
    after_transfer: bool,
    flush_slack: u32,
    flushes: u32,
}

/// Everything the assembler produced, after the final pool flush.
#[derive(Debug)]
pub struct Assembled {
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub literal_offsets: Vec<CodeOffset>,
    pub flushes: u32,
}

impl<B: Backend> MacroAssembler<B> {
    pub fn new(backend: B, buffer: CodeBuffer, max_pending: usize, flush_slack: u32) -> Self {
        Self {
            backend,
            buffer,
            labels: LabelTable::new(),
            pool: LiteralPool::new(max_pending),
            relocations: Vec::new(),
            literal_offsets: Vec::new(),
            after_transfer: false,
            flush_slack,
            flushes: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn offset(&self) -> CodeOffset {
        self.buffer.offset()
    }

    pub fn headroom(&self) -> u32 {
        self.buffer.headroom()
    }

    pub fn buffer(&self) -> &CodeBuffer {
        &self.buffer
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    pub fn pool(&self) -> &LiteralPool {
        &self.pool
    }

    pub fn flushes(&self) -> u32 {
        self.flushes
    }

    pub fn new_label(&mut self) -> LabelId {
        self.labels.create()
    }

    pub fn is_bound(&self, label: LabelId) -> bool {
        self.labels.is_bound(label)
    }

    /// Bind `label` here and patch everything that referenced it.
    pub fn bind(&mut self, label: LabelId) {
        self.resolve(label);
        self.after_transfer = false;
    }

    fn resolve(&mut self, label: LabelId) {
        let at = self.offset();
        if let Some(head) = self.labels.bind(label, at) {
            let patched = LabelChain::resolve(&mut self.buffer, &self.backend, head, at);
            trace!(%label, at, patched, "bound label");
        }
    }

    /// Flush the pool if the next instruction would leave a literal
    /// unreachable, then return the offset the instruction goes at.
    fn prepare(&mut self) -> Result<CodeOffset, Failure> {
        if self.pool.must_flush_before(self.offset(), &self.backend) {
            self.flush_pool(true)?;
        }
        Ok(self.offset())
    }

    fn put(&mut self, inst: &Inst, at: CodeOffset) -> Result<(), Failure> {
        let word = self.backend.encode(inst, at);
        self.buffer.emit_u32(word)?;
        self.after_transfer = matches!(inst, Inst::Branch { cond: Cond::Al, .. });
        Ok(())
    }

    pub fn emit(&mut self, inst: Inst) -> Result<(), Failure> {
        let at = self.prepare()?;
        self.put(&inst, at)
    }

    pub fn emit_all(&mut self, insts: &[Inst]) -> Result<(), Failure> {
        insts.iter().try_for_each(|inst| self.emit(*inst))
    }

    /// Branch to `label`, bound or not.
    pub fn branch(&mut self, cond: Cond, label: LabelId) -> Result<(), Failure> {
        let at = self.prepare()?;
        let target = self.labels.link(label, at);
        self.put(&Inst::Branch { cond, target }, at)
    }

    /// PC-relative load of `literal` through the pool.
    pub fn load_literal(&mut self, rt: Reg, literal: Literal) -> Result<(), Failure> {
        let at = self.prepare()?;
        let label = self
            .pool
            .find_or_create(literal, at, &self.backend, &mut self.labels);
        let target = self.labels.link(label, at);
        let kind = literal.kind();
        self.put(&Inst::LoadLiteral { kind, rt, target }, at)
    }

    /// Materialize `value` in `rd`, from an immediate when it fits.
    pub fn mov_imm(&mut self, rd: Reg, value: i32) -> Result<(), Failure> {
        if self.backend.fits_immediate(value as i64) {
            self.emit(Inst::MovImm { rd, imm: value })
        } else {
            self.load_literal(rd, Literal::Int(value))
        }
    }

    // ==================== Operand stack ====================

    pub fn push(&mut self, rt: Reg) -> Result<(), Failure> {
        self.emit(Inst::Store { rt, rn: B::VSTACK, offset: 0 })?;
        self.emit(Inst::AddImm { rd: B::VSTACK, rn: B::VSTACK, imm: B::SLOT_SIZE })
    }

    pub fn pop(&mut self, rt: Reg) -> Result<(), Failure> {
        self.emit(Inst::SubImm { rd: B::VSTACK, rn: B::VSTACK, imm: B::SLOT_SIZE })?;
        self.emit(Inst::Load { rt, rn: B::VSTACK, offset: 0 })
    }

    /// Load the slot `depth` below the top without popping.
    pub fn peek(&mut self, rt: Reg, depth: u16) -> Result<(), Failure> {
        let imm = (depth + 1) * B::SLOT_SIZE;
        self.emit(Inst::SubImm { rd: rt, rn: B::VSTACK, imm })?;
        self.emit(Inst::Load { rt, rn: rt, offset: 0 })
    }

    // ==================== Runtime calls ====================

    /// Call the runtime helper in table slot `slot` of the context.
    pub fn call_helper(&mut self, slot: u16) -> Result<(), Failure> {
        self.emit(Inst::Load {
            rt: B::SCRATCH,
            rn: B::CTX,
            offset: slot * B::SLOT_SIZE,
        })?;
        self.emit(Inst::CallReg { rn: B::SCRATCH })
    }

    /// Restore the caller's registers and return.
    pub fn ret(&mut self) -> Result<(), Failure> {
        let epilogue = self.backend.epilogue();
        self.emit_all(&epilogue)?;
        self.after_transfer = true;
        Ok(())
    }

    /// Note that control never returns past this point, e.g. after a call
    /// to a helper that unwinds.
    pub fn mark_transfer(&mut self) {
        self.after_transfer = true;
    }

    // ==================== Literal pool ====================

    /// Write every pending literal here, behind a branch when control
    /// can fall into the pool.
    pub fn flush_pool(&mut self, branch_around: bool) -> Result<(), Failure> {
        if !self.pool.has_pending() {
            return Ok(());
        }

        let skip = if branch_around {
            let skip = self.labels.create();
            let at = self.offset();
            let target = self.labels.link(skip, at);
            self.put(&Inst::Branch { cond: Cond::Al, target }, at)?;
            Some(skip)
        } else {
            None
        };

        let start = self.offset();
        let pending = self.pool.drain_pending();
        for &(literal, label) in &pending {
            let at = self.offset();
            self.resolve(label);
            self.pool.mark_written(label, at);
            if let Literal::Object { handle, offset } = literal {
                self.relocations.push(Relocation {
                    offset: at,
                    handle,
                    addend: offset,
                    width: self.backend.literal_size(literal.kind()),
                });
            }

            let bits = literal.bits();
            self.buffer.emit_u32(bits as u32)?;
            self.literal_offsets.push(at);
            if self.backend.literal_size(literal.kind()) == 8 {
                self.buffer.emit_u32((bits >> 32) as u32)?;
                self.literal_offsets.push(at + 4);
            }
        }

        match skip {
            Some(skip) => self.bind(skip),
            None => self.after_transfer = true,
        }
        self.flushes += 1;
        debug!(
            start,
            literals = pending.len(),
            branch_around,
            "flushed literal pool"
        );
        Ok(())
    }

    /// At a task boundary after an unconditional transfer, write the pool
    /// early when a literal is close to falling out of reach. No branch is
    /// needed there.
    pub fn flush_at_boundary(&mut self) -> Result<bool, Failure> {
        if !self.after_transfer || !self.pool.has_pending() {
            return Ok(false);
        }
        if self.pool.fits_after(self.offset() + self.flush_slack, &self.backend) {
            return Ok(false);
        }
        self.flush_pool(false)?;
        Ok(true)
    }

    /// Write the remaining literals and hand over the code.
    ///
    /// # Panics
    /// If a referenced label was never bound.
    pub fn finish(mut self) -> Result<Assembled, Failure> {
        let branch_around = !self.after_transfer;
        self.flush_pool(branch_around)?;
        if let Some(label) = self.labels.dangling().next() {
            panic!("{} referenced but never bound", label);
        }

        Ok(Assembled {
            code: self.buffer.finish(),
            relocations: self.relocations,
            literal_offsets: self.literal_offsets,
            flushes: self.flushes,
        })
    }
}
