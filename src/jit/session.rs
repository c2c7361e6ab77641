//! The compilation driver.
//!
//! A session owns one code buffer, its literal pool and a LIFO queue of
//! tasks. It drains the queue under a [`Budget`]; when the budget runs out
//! at a task boundary the whole session is handed back as a
//! [`SuspendedSnapshot`], which resumes into exactly the same state.

use super::backend::Backend;
use super::budget::Budget;
use super::code::{CompiledCode, OsrEntry};
use super::codebuf::{BufferLimits, CodeBuffer};
use super::label::LabelId;
use super::masm::MacroAssembler;
use super::memory::CodeAllocator;
use super::snapshot::SuspendedSnapshot;
use super::task::{Task, WorkQueue};
use super::template::{Continuation, FrameId, InlineFrame, Reached};
use super::{CodeOffset, Failure};
use crate::config::JitConfig;
use crate::vm::{Bci, CompilationUnit, Program, UnitId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Progress counters, carried across suspensions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Calls to [`CompilerSession::drive`].
    pub entries: u32,
    pub suspensions: u32,
    pub tasks_completed: u32,
    /// Task steps that left the task unfinished.
    pub increments: u32,
    pub bytecodes: u32,
    pub inlined_calls: u32,
    pub literal_flushes: u32,
    /// Blocks first reached by falling into them.
    pub fall_through_blocks: u32,
    /// Blocks first reached through a branch.
    pub jump_blocks: u32,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct SessionLimits {
    pub increment_ops: u32,
    pub max_inline_depth: u32,
    pub inline_max_bytes: u32,
}

/// Result of driving a session.
#[derive(Debug)]
pub enum Outcome<B: Backend> {
    Finished(CompiledCode),
    Suspended(SuspendedSnapshot<B>),
}

/// One compilation of one unit.
///
/// All state is offsets, label ids and owned values, so moving the session
/// into a snapshot and back preserves it exactly.
#[derive(Debug)]
pub struct CompilerSession<B: Backend> {
    unit: UnitId,
    estimate: u32,
    pub(super) masm: MacroAssembler<B>,
    pub(super) queue: WorkQueue,
    /// A task that took a step without finishing.
    current: Option<Task>,
    pub(super) frames: Vec<InlineFrame>,
    pub(super) block_labels: BTreeMap<(FrameId, Bci), LabelId>,
    pub(super) reached: BTreeMap<(FrameId, Bci), Reached>,
    pub(super) osr_stubs: BTreeMap<Bci, LabelId>,
    osr_entries: Vec<OsrEntry>,
    pub(super) frame_slots: u32,
    pub(super) limits: SessionLimits,
    pub(super) stats: SessionStats,
}

impl<B: Backend> CompilerSession<B> {
    /// Initial buffer size for `unit`: its bytecode size scaled by
    /// `code_size_factor`, clamped to the configured bounds.
    pub fn initial_estimate(unit: &CompilationUnit, config: &JitConfig) -> u32 {
        let scaled = unit.code_len().saturating_mul(config.code_size_factor);
        let clamped = scaled.max(config.min_code_size).min(config.max_code_size);
        clamped.next_multiple_of(4)
    }

    /// Reserve a buffer of `estimate` bytes and queue the method entry.
    pub fn new(
        backend: B,
        unit: &CompilationUnit,
        config: &JitConfig,
        allocator: Arc<dyn CodeAllocator>,
        estimate: u32,
    ) -> Result<Self, Failure> {
        let limits = BufferLimits {
            max_growths: config.max_growths,
            max_code_size: config.max_code_size,
        };
        let buffer = CodeBuffer::new(allocator, estimate, limits).map_err(|err| {
            debug!(unit = %unit.id(), estimate, %err, "buffer reservation failed");
            Failure::ReservationFailed
        })?;

        let mut masm = MacroAssembler::new(
            backend,
            buffer,
            config.max_unbound_literals as usize,
            config.literal_flush_slack,
        );
        let entry = masm.new_label();
        let mut queue = WorkQueue::new();
        queue.push(Task::Continuation(Continuation::method_entry(entry)));

        debug!(unit = %unit.id(), name = unit.name(), estimate, backend = B::NAME, "session started");
        Ok(Self {
            unit: unit.id(),
            estimate,
            masm,
            queue,
            current: None,
            frames: vec![InlineFrame::root(unit.id())],
            block_labels: BTreeMap::new(),
            reached: BTreeMap::new(),
            osr_stubs: BTreeMap::new(),
            osr_entries: Vec::new(),
            frame_slots: unit.max_locals() as u32,
            limits: SessionLimits {
                increment_ops: config.increment_ops,
                max_inline_depth: config.max_inline_depth,
                inline_max_bytes: config.inline_max_bytes,
            },
            stats: SessionStats::default(),
        })
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn estimate(&self) -> u32 {
        self.estimate
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn code_offset(&self) -> CodeOffset {
        self.masm.offset()
    }

    /// Queued tasks plus the partially compiled one, if any.
    pub fn pending_tasks(&self) -> usize {
        self.queue.len() + usize::from(self.current.is_some())
    }

    /// Drain the work queue until it is empty or `budget` runs out.
    ///
    /// Any failure discards the session and its buffer.
    pub fn drive(mut self, program: &Program, budget: &mut dyn Budget) -> Result<Outcome<B>, Failure> {
        self.stats.entries += 1;
        debug!(
            unit = %self.unit,
            offset = self.masm.offset(),
            pending = self.pending_tasks(),
            "driving session"
        );

        while let Some(mut task) = self.current.take().or_else(|| self.queue.pop()) {
            trace!(task = task.name(), entry = %task.entry(), "task step");
            let done = match self.run_task(&mut task, program) {
                Ok(done) => done,
                Err(failure) => {
                    debug!(unit = %self.unit, %failure, offset = self.masm.offset(), "compilation failed");
                    return Err(failure);
                }
            };

            if done {
                self.stats.tasks_completed += 1;
                self.masm.flush_at_boundary()?;
            } else {
                self.stats.increments += 1;
                self.current = Some(task);
            }

            if self.pending_tasks() == 0 {
                break;
            }
            if self.masm.headroom() == 0 {
                debug!(unit = %self.unit, offset = self.masm.offset(), "no room left for more code");
                return Err(Failure::OutOfMemory);
            }
            if budget.exhausted() {
                return Ok(Outcome::Suspended(self.suspend()));
            }
        }

        self.finalize().map(Outcome::Finished)
    }

    fn run_task(&mut self, task: &mut Task, program: &Program) -> Result<bool, Failure> {
        match task {
            Task::Continuation(c) => self.compile_continuation(c, program),
            Task::ExceptionStub(stub) => stub.emit(&mut self.masm).map(|()| true),
            Task::TypeCheckStub(stub) => stub.emit(&mut self.masm).map(|()| true),
            Task::MonitorStub(stub) => stub.emit(&mut self.masm).map(|()| true),
            Task::OsrStub(stub) => {
                stub.emit(&mut self.masm)?;
                if let Some(offset) = self.masm.labels().position(stub.entry) {
                    self.osr_entries.push(OsrEntry {
                        bci: stub.bci,
                        offset,
                    });
                }
                Ok(true)
            }
        }
    }

    /// Freeze the session between two task steps.
    pub fn suspend(mut self) -> SuspendedSnapshot<B> {
        self.stats.suspensions += 1;
        debug!(
            unit = %self.unit,
            offset = self.masm.offset(),
            pending = self.pending_tasks(),
            "session suspended"
        );
        SuspendedSnapshot::new(self)
    }

    /// Discard the session, releasing its buffer.
    pub fn abort(self) {
        debug!(unit = %self.unit, offset = self.masm.offset(), "session aborted");
    }

    fn finalize(mut self) -> Result<CompiledCode, Failure> {
        let assembled = self.masm.finish()?;

        for reached in self.reached.values() {
            match reached {
                Reached::FallThrough => self.stats.fall_through_blocks += 1,
                Reached::Jump => self.stats.jump_blocks += 1,
            }
        }
        self.stats.literal_flushes = assembled.flushes;
        self.osr_entries.sort_by_key(|entry| entry.bci);

        debug!(
            unit = %self.unit,
            size = assembled.code.len(),
            tasks = self.stats.tasks_completed,
            suspensions = self.stats.suspensions,
            "compilation finished"
        );
        Ok(CompiledCode {
            unit: self.unit,
            backend: B::NAME,
            code: assembled.code,
            entry: 0,
            osr_entries: self.osr_entries,
            relocations: assembled.relocations,
            literal_offsets: assembled.literal_offsets,
            frame_slots: self.frame_slots,
            stats: self.stats,
        })
    }
}
