//! Labels and their backpatch chains.
//!
//! An unbound label that has been referenced keeps only the offset of its
//! most recent referrer. Each referrer's displacement field addresses the
//! previous referrer, and the first one addresses itself. Binding walks
//! that chain backwards and rewrites every link.

use super::backend::{Backend, PatchKind};
use super::codebuf::CodeBuffer;
use super::CodeOffset;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LabelId(u32);

impl LabelId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    /// Never referenced, not bound.
    Free,
    /// Referenced; holds the offset of the most recent referrer.
    Linked(CodeOffset),
    /// Bound to its final offset.
    Bound(CodeOffset),
}

/// All labels of one session.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    labels: Vec<Label>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self) -> LabelId {
        self.labels.push(Label::Free);
        LabelId(self.labels.len() as u32 - 1)
    }

    pub fn get(&self, id: LabelId) -> Label {
        self.labels[id.index()]
    }

    pub fn is_bound(&self, id: LabelId) -> bool {
        matches!(self.get(id), Label::Bound(_))
    }

    /// The bound offset, if any.
    pub fn position(&self, id: LabelId) -> Option<CodeOffset> {
        match self.get(id) {
            Label::Bound(at) => Some(at),
            _ => None,
        }
    }

    /// Record a reference from the instruction at `at` and return the
    /// offset its displacement field must encode.
    pub fn link(&mut self, id: LabelId, at: CodeOffset) -> CodeOffset {
        let label = &mut self.labels[id.index()];
        match *label {
            Label::Free => {
                *label = Label::Linked(at);
                at
            }
            Label::Linked(previous) => {
                debug_assert!(previous < at, "{} linked out of order", id);
                *label = Label::Linked(at);
                previous
            }
            Label::Bound(target) => target,
        }
    }

    /// Bind `id` at `at`. Returns the head of the chain to resolve, if any.
    ///
    /// # Panics
    /// If the label is already bound.
    pub fn bind(&mut self, id: LabelId, at: CodeOffset) -> Option<CodeOffset> {
        let label = &mut self.labels[id.index()];
        let head = match *label {
            Label::Free => None,
            Label::Linked(head) => Some(head),
            Label::Bound(previous) => panic!("{} bound twice (at {} and {})", id, previous, at),
        };
        *label = Label::Bound(at);
        head
    }

    /// Labels that were referenced but never bound.
    pub fn dangling(&self) -> impl Iterator<Item = LabelId> + '_ {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, label)| matches!(label, Label::Linked(_)))
            .map(|(i, _)| LabelId(i as u32))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Iterator over the referrers of a linked label, newest first.
///
/// Yields each referrer's offset and class. The walk panics if it meets an
/// instruction that cannot carry a label or a link that does not point
/// strictly backwards.
pub struct LabelChain<'a, B: Backend> {
    buffer: &'a CodeBuffer,
    backend: &'a B,
    next: Option<CodeOffset>,
}

impl<'a, B: Backend> LabelChain<'a, B> {
    pub fn new(buffer: &'a CodeBuffer, backend: &'a B, head: CodeOffset) -> Self {
        Self {
            buffer,
            backend,
            next: Some(head),
        }
    }

    /// Rewrite every referrer of the chain at `head` to address `target`.
    /// Returns the number of instructions patched.
    pub fn resolve(
        buffer: &mut CodeBuffer,
        backend: &B,
        head: CodeOffset,
        target: CodeOffset,
    ) -> usize {
        let links: Vec<(CodeOffset, PatchKind)> = LabelChain::new(buffer, backend, head).collect();
        for &(at, kind) in &links {
            let word = buffer.read_u32(at);
            match backend.retarget(kind, word, at, target) {
                Some(patched) => buffer.write_u32(at, patched),
                None => panic!("{:?} at {} cannot reach {}", kind, at, target),
            }
        }
        links.len()
    }
}

impl<B: Backend> Iterator for LabelChain<'_, B> {
    type Item = (CodeOffset, PatchKind);

    fn next(&mut self) -> Option<Self::Item> {
        let at = self.next?;
        let word = self.buffer.read_u32(at);
        let kind = match self.backend.classify(word) {
            Some(kind) => kind,
            None => panic!("label chain reached non-patchable word {:#010x} at {}", word, at),
        };
        let previous = self.backend.target(kind, word, at);
        self.next = if previous == at {
            None
        } else {
            assert!(previous < at, "label chain at {} does not descend ({})", at, previous);
            Some(previous)
        };
        Some((at, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::backend::{Arm32, Cond, Inst, LiteralKind, Reg};
    use crate::jit::codebuf::BufferLimits;
    use crate::jit::memory::HeapAllocator;
    use std::sync::Arc;

    fn buffer() -> CodeBuffer {
        let limits = BufferLimits {
            max_growths: 4,
            max_code_size: 4096,
        };
        CodeBuffer::new(Arc::new(HeapAllocator::new(1 << 16)), 256, limits).unwrap()
    }

    fn emit(buf: &mut CodeBuffer, labels: &mut LabelTable, id: LabelId, load: bool) {
        let at = buf.offset();
        let target = labels.link(id, at);
        let inst = if load {
            Inst::LoadLiteral { kind: LiteralKind::Word, rt: Reg(1), target }
        } else {
            Inst::Branch { cond: Cond::Ne, target }
        };
        buf.emit_u32(Arm32.encode(&inst, at)).unwrap();
    }

    #[test]
    fn test_link_states() {
        let mut labels = LabelTable::new();
        let l = labels.create();
        assert_eq!(labels.get(l), Label::Free);
        assert_eq!(labels.link(l, 4), 4);
        assert_eq!(labels.link(l, 12), 4);
        assert_eq!(labels.get(l), Label::Linked(12));
        assert_eq!(labels.bind(l, 40), Some(12));
        assert_eq!(labels.link(l, 44), 40);
        assert_eq!(labels.dangling().count(), 0);
    }

    #[test]
    fn test_bind_unreferenced_records_position() {
        let mut labels = LabelTable::new();
        let l = labels.create();
        assert_eq!(labels.bind(l, 8), None);
        assert_eq!(labels.position(l), Some(8));
    }

    #[test]
    #[should_panic(expected = "bound twice")]
    fn test_double_bind_panics() {
        let mut labels = LabelTable::new();
        let l = labels.create();
        labels.bind(l, 0);
        labels.bind(l, 4);
    }

    #[test]
    fn test_chain_walk_and_resolve() {
        let mut buf = buffer();
        let mut labels = LabelTable::new();
        let l = labels.create();

        emit(&mut buf, &mut labels, l, false);
        buf.emit_u32(0xE1A0_0000).unwrap();
        emit(&mut buf, &mut labels, l, true);
        emit(&mut buf, &mut labels, l, false);

        let head = labels.bind(l, buf.offset()).unwrap();
        let walked: Vec<_> = LabelChain::new(&buf, &Arm32, head).collect();
        assert_eq!(
            walked,
            vec![
                (12, PatchKind::Branch),
                (8, PatchKind::Load),
                (0, PatchKind::Branch)
            ]
        );

        assert_eq!(LabelChain::resolve(&mut buf, &Arm32, head, 16), 3);
        for (at, kind) in walked {
            assert_eq!(Arm32.target(kind, buf.read_u32(at), at), 16);
        }
    }

    #[test]
    #[should_panic(expected = "non-patchable")]
    fn test_chain_into_plain_instruction_panics() {
        let mut buf = buffer();
        buf.emit_u32(0xE1A0_0000).unwrap();
        let _ = LabelChain::new(&buf, &Arm32, 0).count();
    }
}
