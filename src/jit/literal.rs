//! Literal pool.
//!
//! Constants that do not fit an immediate are loaded PC-relative from a
//! pool placed in the instruction stream. Each pending literal must be
//! written while it is still within reach of its first load.

use super::backend::{Backend, LiteralKind};
use super::label::{LabelId, LabelTable};
use super::CodeOffset;

/// A constant operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Literal {
    Int(i32),
    /// IEEE-754 single bits.
    Float(u32),
    /// Address of a heap object plus a byte offset; relocated at install.
    Object { handle: u32, offset: i32 },
}

impl Literal {
    pub fn kind(self) -> LiteralKind {
        match self {
            Literal::Float(_) => LiteralKind::Float,
            Literal::Int(_) | Literal::Object { .. } => LiteralKind::Word,
        }
    }

    /// Bits written into the pool. Object literals hold their offset until
    /// the relocation is applied.
    pub fn bits(self) -> u64 {
        match self {
            Literal::Int(value) => value as i64 as u64,
            Literal::Float(bits) => bits as u64,
            Literal::Object { offset, .. } => offset as i64 as u64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiteralEntry {
    pub literal: Literal,
    pub label: LabelId,
    /// Offset of the first load referencing this entry.
    pub first_use: CodeOffset,
    /// Offset of the newest load; the next load links back to it.
    pub last_use: CodeOffset,
    pub written_at: Option<CodeOffset>,
}

#[derive(Debug, Clone)]
pub struct LiteralPool {
    entries: Vec<LiteralEntry>,
    /// Indices of unwritten entries, in creation order.
    pending: Vec<usize>,
    max_pending: usize,
}

impl LiteralPool {
    pub fn new(max_pending: usize) -> Self {
        Self {
            entries: Vec::new(),
            pending: Vec::new(),
            max_pending,
        }
    }

    /// The label a load at `at` should reference for `literal`.
    ///
    /// Reuses a written entry within reach, then an unwritten equal entry
    /// whose newest load the chain link from `at` can still reach, and
    /// otherwise appends a new one.
    pub fn find_or_create<B: Backend>(
        &mut self,
        literal: Literal,
        at: CodeOffset,
        backend: &B,
        labels: &mut LabelTable,
    ) -> LabelId {
        let kind = literal.kind();
        let written = self.entries.iter().find(|entry| {
            entry.literal == literal
                && entry
                    .written_at
                    .is_some_and(|written| backend.can_reach(kind, at, written))
        });
        if let Some(entry) = written {
            return entry.label;
        }

        let newest = self
            .pending
            .iter()
            .rev()
            .copied()
            .find(|&index| self.entries[index].literal == literal);
        if let Some(index) = newest {
            let entry = &mut self.entries[index];
            if backend.can_reach(kind, at, entry.last_use) {
                entry.last_use = at;
                return entry.label;
            }
        }

        let label = labels.create();
        self.entries.push(LiteralEntry {
            literal,
            label,
            first_use: at,
            last_use: at,
            written_at: None,
        });
        self.pending.push(self.entries.len() - 1);
        label
    }

    /// Number of literals waiting to be written.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Whether the pool must be written before an instruction at `next`.
    ///
    /// Assumes the worst case: the instruction is emitted, then a branch
    /// around the pool, then every pending literal in order.
    pub fn must_flush_before<B: Backend>(&self, next: CodeOffset, backend: &B) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        if self.pending.len() >= self.max_pending {
            return true;
        }
        !self.fits_after(next + 8, backend)
    }

    /// Whether writing the pool at `start` keeps every pending literal in
    /// reach of its first use.
    pub fn fits_after<B: Backend>(&self, start: CodeOffset, backend: &B) -> bool {
        let mut at = start;
        for &index in &self.pending {
            let entry = &self.entries[index];
            let kind = entry.literal.kind();
            if !backend.can_reach(kind, entry.first_use, at) {
                return false;
            }
            at += backend.literal_size(kind);
        }
        true
    }

    /// Take the pending entries, in order, for writing.
    pub fn drain_pending(&mut self) -> Vec<(Literal, LabelId)> {
        self.pending
            .drain(..)
            .map(|index| (self.entries[index].literal, self.entries[index].label))
            .collect()
    }

    /// Record where the entry owning `label` was written.
    pub fn mark_written(&mut self, label: LabelId, at: CodeOffset) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.label == label) {
            entry.written_at = Some(at);
        }
    }

    pub fn entries(&self) -> &[LiteralEntry] {
        &self.entries
    }
}
