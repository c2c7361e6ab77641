//! Suspended compilations.

use super::backend::Backend;
use super::session::{CompilerSession, SessionStats};
use super::CodeOffset;
use crate::vm::UnitId;

/// A session frozen between two task steps.
///
/// The snapshot owns the session outright: its buffer, pool, queue and the
/// partially compiled task move in, and [`SuspendedSnapshot::resume`] moves
/// them back out. There is no way to copy a snapshot, so it can only be
/// resumed once.
#[derive(Debug)]
pub struct SuspendedSnapshot<B: Backend> {
    session: CompilerSession<B>,
}

impl<B: Backend> SuspendedSnapshot<B> {
    pub(super) fn new(session: CompilerSession<B>) -> Self {
        Self { session }
    }

    pub fn unit(&self) -> UnitId {
        self.session.unit()
    }

    /// Bytes of code emitted so far.
    pub fn code_offset(&self) -> CodeOffset {
        self.session.code_offset()
    }

    pub fn pending_tasks(&self) -> usize {
        self.session.pending_tasks()
    }

    pub fn stats(&self) -> &SessionStats {
        self.session.stats()
    }

    pub fn resume(self) -> CompilerSession<B> {
        self.session
    }
}
